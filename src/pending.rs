//! The pending-message store (spec component 4.3).
//!
//! Three independent maps, each guarded by its own mutex so unrelated
//! transactions and pages never contend on the same lock. Operations are
//! pure set/get/delete with no cross-map ordering, exactly as specified:
//! removal only happens on a successful send or a terminal error response,
//! never speculatively.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;

/// Per-kind maps of in-flight artifacts awaiting delivery or replay.
#[derive(Default)]
pub struct PendingStore {
    io: Mutex<HashMap<String, Value>>,
    layouts: Mutex<HashMap<String, Value>>,
    loading: Mutex<HashMap<String, Value>>,
}

macro_rules! map_ops {
    ($set:ident, $get:ident, $remove:ident, $snapshot:ident, $field:ident) => {
        /// Record the latest payload for `key`, overwriting any prior entry.
        pub async fn $set(&self, key: impl Into<String>, payload: Value) {
            let key = key.into();
            trace!(%key, kind = stringify!($field), "pending artifact recorded");
            self.$field.lock().await.insert(key, payload);
        }

        /// Fetch the current payload for `key`, if any.
        pub async fn $get(&self, key: &str) -> Option<Value> {
            self.$field.lock().await.get(key).cloned()
        }

        /// Remove the entry for `key`. A no-op if it is already absent.
        pub async fn $remove(&self, key: &str) {
            if self.$field.lock().await.remove(key).is_some() {
                trace!(%key, kind = stringify!($field), "pending artifact cleared");
            }
        }

        /// Snapshot every `(key, payload)` pair, for replay on reconnect.
        pub async fn $snapshot(&self) -> Vec<(String, Value)> {
            self.$field
                .lock()
                .await
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
    };
}

impl PendingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    map_ops!(set_io, get_io, remove_io, snapshot_io, io);
    map_ops!(set_layout, get_layout, remove_layout, snapshot_layouts, layouts);
    map_ops!(set_loading, get_loading, remove_loading, snapshot_loading, loading);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_remove_clears_entry() {
        let store = PendingStore::new();
        store.set_io("t1", Value::String("payload".into())).await;
        assert!(store.get_io("t1").await.is_some());
        store.remove_io("t1").await;
        assert!(store.get_io("t1").await.is_none());
    }

    #[tokio::test]
    async fn maps_are_independent() {
        let store = PendingStore::new();
        store.set_io("t1", Value::Bool(true)).await;
        store.set_layout("t1", Value::Bool(false)).await;
        store.remove_io("t1").await;
        assert!(store.get_io("t1").await.is_none());
        assert!(store.get_layout("t1").await.is_some());
    }

    #[tokio::test]
    async fn snapshot_reflects_all_entries() {
        let store = PendingStore::new();
        store.set_io("a", Value::Null).await;
        store.set_io("b", Value::Null).await;
        let snapshot = store.snapshot_io().await;
        assert_eq!(snapshot.len(), 2);
    }
}
