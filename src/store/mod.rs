//! Key-value storage capability.
//!
//! Components persist through this seam so callers can plug in anything from
//! an in-memory map to a durable database. All values are JSON; persisted
//! payloads carry a `schema_version` and readers skip unknown future versions.

mod file;
mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Current on-disk payload schema. Bump when persisted shapes change.
pub const SCHEMA_VERSION: u32 = 1;

/// Asynchronous namespaced key-value storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    async fn del(&self, namespace: &str, key: &str) -> Result<()>;

    async fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    async fn clear(&self, namespace: &str) -> Result<()>;
}

/// Wrap a payload with its schema version for persistence.
pub(crate) fn versioned(payload: Value) -> Value {
    serde_json::json!({ "schema_version": SCHEMA_VERSION, "payload": payload })
}

/// Unwrap a versioned payload. Returns `None` for unknown future versions or
/// malformed envelopes (callers treat both as absent).
pub(crate) fn unversioned(value: Value) -> Option<Value> {
    let obj = value.as_object()?;
    let version = obj.get("schema_version")?.as_u64()? as u32;
    if version > SCHEMA_VERSION {
        return None;
    }
    obj.get("payload").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_roundtrip() {
        let payload = serde_json::json!({"a": 1});
        let wrapped = versioned(payload.clone());
        assert_eq!(unversioned(wrapped), Some(payload));
    }

    #[test]
    fn future_version_skipped() {
        let wrapped = serde_json::json!({"schema_version": 999, "payload": {"a": 1}});
        assert_eq!(unversioned(wrapped), None);
    }

    #[test]
    fn malformed_envelope_skipped() {
        assert_eq!(unversioned(serde_json::json!("not an object")), None);
        assert_eq!(unversioned(serde_json::json!({"payload": 1})), None);
    }
}
