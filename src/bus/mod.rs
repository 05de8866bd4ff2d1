//! Per-pipeline typed publish/subscribe.
//!
//! Each `Shield` owns its own bus; two pipelines in one process have fully
//! independent event streams. Delivery is synchronous and in emission order,
//! first to subscribers of the event's type, then to "any" subscribers.
//! There is no backpressure: a slow handler slows the emitter.

pub mod events;

pub use events::{EventKind, ShieldEvent};

use std::collections::HashMap;
use std::sync::Mutex;

type Handler = std::sync::Arc<dyn Fn(&ShieldEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    typed: HashMap<EventKind, Vec<Handler>>,
    any: Vec<Handler>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event type.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ShieldEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .typed
            .entry(kind)
            .or_default()
            .push(std::sync::Arc::new(handler));
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&ShieldEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.any.push(std::sync::Arc::new(handler));
    }

    /// Deliver an event to typed subscribers then "any" subscribers.
    ///
    /// Handlers are snapshotted before delivery so a handler may subscribe
    /// or emit without deadlocking.
    pub fn emit(&self, event: &ShieldEvent) {
        let (typed, any) = {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                inner.typed.get(&event.kind()).cloned().unwrap_or_default(),
                inner.any.clone(),
            )
        };
        for handler in &typed {
            handler(event);
        }
        for handler in &any {
            handler(event);
        }
    }
}
