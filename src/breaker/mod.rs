//! Rolling-window spend circuit breaker.
//!
//! A single time-ordered deque of `(timestamp, cost)` backs the hour, day
//! and month windows; each read evicts records older than the widest window
//! and sums the rest per window. The session window is a plain accumulator
//! since construction.

use crate::bus::events::BreakerAlertEvent;
use crate::bus::{EventBus, ShieldEvent};
use crate::config::{BreakerAction, BreakerAlertHook, BreakerConfig, BreakerLimits};
use crate::pricing::CostEstimator;
use crate::utils::{DAY_MS, HOUR_MS, MONTH_MS, now_millis};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Which rolling window a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerWindow {
    Session,
    Hour,
    Day,
    Month,
}

impl BreakerWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn duration_ms(self) -> Option<u64> {
        match self {
            Self::Session => None,
            Self::Hour => Some(HOUR_MS),
            Self::Day => Some(DAY_MS),
            Self::Month => Some(MONTH_MS),
        }
    }
}

const ALL_WINDOWS: [BreakerWindow; 4] = [
    BreakerWindow::Session,
    BreakerWindow::Hour,
    BreakerWindow::Day,
    BreakerWindow::Month,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertLevel {
    Warning,
    Tripped,
}

/// Breaker outcome for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerDecision {
    Allowed,
    /// Allowed, but the caller should degrade (e.g. lower max tokens).
    Throttled { window: BreakerWindow },
    Blocked { window: BreakerWindow, detail: String },
}

impl BreakerDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Point-in-time spend per window with its configured limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub spend: f64,
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStatus {
    pub session: WindowSnapshot,
    pub hour: WindowSnapshot,
    pub day: WindowSnapshot,
    pub month: WindowSnapshot,
    pub action: BreakerAction,
}

struct BreakerInner {
    records: VecDeque<(u64, f64)>,
    session_total: f64,
    limits: BreakerLimits,
    /// Last alert per (window, level); allows exactly one firing per
    /// window crossing.
    fired: HashMap<(BreakerWindow, AlertLevel), u64>,
}

pub struct CostBreaker {
    action: BreakerAction,
    estimator: Arc<CostEstimator>,
    bus: Arc<EventBus>,
    on_warning: Option<BreakerAlertHook>,
    on_tripped: Option<BreakerAlertHook>,
    inner: Mutex<BreakerInner>,
}

impl CostBreaker {
    pub fn new(
        config: &BreakerConfig,
        estimator: Arc<CostEstimator>,
        bus: Arc<EventBus>,
        on_warning: Option<BreakerAlertHook>,
        on_tripped: Option<BreakerAlertHook>,
    ) -> Self {
        Self {
            action: config.action,
            estimator,
            bus,
            on_warning,
            on_tripped,
            inner: Mutex::new(BreakerInner {
                records: VecDeque::new(),
                session_total: 0.0,
                limits: config.limits,
                fired: HashMap::new(),
            }),
        }
    }

    fn limit_for(limits: &BreakerLimits, window: BreakerWindow) -> Option<f64> {
        match window {
            BreakerWindow::Session => limits.per_session,
            BreakerWindow::Hour => limits.per_hour,
            BreakerWindow::Day => limits.per_day,
            BreakerWindow::Month => limits.per_month,
        }
    }

    fn evict_and_sum(inner: &mut BreakerInner, window: BreakerWindow, now: u64) -> f64 {
        // Evict anything older than the widest window
        let month_cutoff = now.saturating_sub(MONTH_MS);
        while inner.records.front().is_some_and(|&(t, _)| t < month_cutoff) {
            inner.records.pop_front();
        }
        match window.duration_ms() {
            None => inner.session_total,
            Some(duration) => {
                let cutoff = now.saturating_sub(duration);
                inner
                    .records
                    .iter()
                    .rev()
                    .take_while(|&&(t, _)| t >= cutoff)
                    .map(|&(_, c)| c)
                    .sum()
            }
        }
    }

    /// Whether this (window, level) alert may fire: at most once until the
    /// window rolls past the previous firing.
    fn may_fire(inner: &BreakerInner, window: BreakerWindow, level: AlertLevel, now: u64) -> bool {
        match inner.fired.get(&(window, level)) {
            None => true,
            Some(&at) => match window.duration_ms() {
                None => false, // session never refires
                Some(duration) => now.saturating_sub(at) >= duration,
            },
        }
    }

    /// Gate a request whose cost is estimated from the given token counts.
    pub fn check(&self, model: &str, est_input_tokens: u32, est_output_tokens: u32) -> BreakerDecision {
        self.check_at(model, est_input_tokens, est_output_tokens, now_millis())
    }

    fn check_at(
        &self,
        model: &str,
        est_input_tokens: u32,
        est_output_tokens: u32,
        now: u64,
    ) -> BreakerDecision {
        let estimated = self
            .estimator
            .estimate_total(model, est_input_tokens, est_output_tokens);

        let mut alerts: Vec<(AlertLevel, BreakerAlertEvent)> = Vec::new();
        let mut worst: Option<(BreakerWindow, f64, f64)> = None;
        {
            let mut inner = self.lock();
            let limits = inner.limits;
            for window in ALL_WINDOWS {
                let Some(limit) = Self::limit_for(&limits, window) else {
                    continue;
                };
                let spend = Self::evict_and_sum(&mut inner, window, now);
                let projected = spend + estimated;
                if projected >= limit {
                    if Self::may_fire(&inner, window, AlertLevel::Tripped, now) {
                        inner.fired.insert((window, AlertLevel::Tripped), now);
                        alerts.push((
                            AlertLevel::Tripped,
                            BreakerAlertEvent {
                                window: window.as_str(),
                                limit,
                                current_spend: spend,
                            },
                        ));
                    }
                    if worst.is_none() {
                        worst = Some((window, limit, spend));
                    }
                } else if projected >= 0.8 * limit
                    && Self::may_fire(&inner, window, AlertLevel::Warning, now)
                {
                    inner.fired.insert((window, AlertLevel::Warning), now);
                    alerts.push((
                        AlertLevel::Warning,
                        BreakerAlertEvent {
                            window: window.as_str(),
                            limit,
                            current_spend: spend,
                        },
                    ));
                }
            }
        }

        for (level, alert) in alerts {
            match level {
                AlertLevel::Warning => {
                    self.bus.emit(&ShieldEvent::BreakerWarning(alert.clone()));
                    if let Some(hook) = &self.on_warning {
                        hook(&alert);
                    }
                }
                AlertLevel::Tripped => {
                    warn!(
                        "spend breaker limit reached: {} window at ${:.4} of ${:.4}",
                        alert.window, alert.current_spend, alert.limit
                    );
                    self.bus.emit(&ShieldEvent::BreakerTripped(alert.clone()));
                    if let Some(hook) = &self.on_tripped {
                        hook(&alert);
                    }
                }
            }
        }

        match worst {
            None => BreakerDecision::Allowed,
            Some((window, limit, spend)) => match self.action {
                BreakerAction::Stop => BreakerDecision::Blocked {
                    window,
                    detail: format!(
                        "{} spend ${:.4} (+${:.4} estimated) reaches the ${:.2} limit",
                        window.as_str(),
                        spend,
                        estimated,
                        limit
                    ),
                },
                BreakerAction::Throttle => BreakerDecision::Throttled { window },
                BreakerAction::Warn => BreakerDecision::Allowed,
            },
        }
    }

    pub fn record_spend(&self, cost: f64, model: &str) {
        self.record_spend_at(cost, model, now_millis());
    }

    fn record_spend_at(&self, cost: f64, _model: &str, now: u64) {
        if cost <= 0.0 {
            return;
        }
        let mut inner = self.lock();
        inner.records.push_back((now, cost));
        inner.session_total += cost;
    }

    /// Replace the limits; alert bookkeeping is kept so crossings don't
    /// refire spuriously.
    pub fn update_limits(&self, limits: BreakerLimits) {
        self.lock().limits = limits;
    }

    /// Copy of the rolling spend records, oldest first, for persistence.
    pub fn snapshot_records(&self) -> Vec<(u64, f64)> {
        self.lock().records.iter().copied().collect()
    }

    /// Merge persisted records back in (time-ordered, month-bounded).
    /// Restored spend counts toward the rolling windows but not the
    /// session total, which is scoped to this process lifetime.
    pub fn restore_records(&self, restored: Vec<(u64, f64)>) {
        let cutoff = now_millis().saturating_sub(MONTH_MS);
        let mut inner = self.lock();
        inner
            .records
            .extend(restored.into_iter().filter(|&(t, _)| t >= cutoff));
        inner
            .records
            .make_contiguous()
            .sort_by_key(|&(t, _)| t);
    }

    /// Drop all spend history and alert state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.records.clear();
        inner.session_total = 0.0;
        inner.fired.clear();
    }

    pub fn status(&self) -> BreakerStatus {
        self.status_at(now_millis())
    }

    fn status_at(&self, now: u64) -> BreakerStatus {
        let mut inner = self.lock();
        let limits = inner.limits;
        let snapshot = |inner: &mut BreakerInner, window: BreakerWindow| WindowSnapshot {
            spend: Self::evict_and_sum(inner, window, now),
            limit: Self::limit_for(&limits, window),
        };
        BreakerStatus {
            session: snapshot(&mut inner, BreakerWindow::Session),
            hour: snapshot(&mut inner, BreakerWindow::Hour),
            day: snapshot(&mut inner, BreakerWindow::Day),
            month: snapshot(&mut inner, BreakerWindow::Month),
            action: self.action,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
