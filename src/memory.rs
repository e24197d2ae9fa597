//! In-memory storage backend.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Use for testing and development only. Clones share the same data and
//! change feed, which makes a clone handed to a second [`Storage`](crate::Storage)
//! behave like another process writing to the same area.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::backend::StorageBackend;
use crate::error::Result;
use crate::watch::{ChangeEvent, ChangeSender, DEFAULT_WATCH_CAPACITY};

#[derive(Default)]
struct CallCounters {
    calls: AtomicU64,
    writes: AtomicU64,
}

/// In-memory implementation of StorageBackend.
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
    watcher: ChangeSender,
    counters: Arc<CallCounters>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Create a backend whose change channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            watcher: ChangeSender::new(capacity),
            counters: Arc::new(CallCounters::default()),
        }
    }

    /// Get the number of entries in the store.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clear all entries without emitting change events.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Total number of backend calls served.
    pub fn call_count(&self) -> u64 {
        self.counters.calls.load(Ordering::SeqCst)
    }

    /// Number of mutating backend calls served.
    pub fn write_count(&self) -> u64 {
        self.counters.writes.load(Ordering::SeqCst)
    }

    fn record_read(&self) {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn record_write(&self) {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Apply writes under one lock, then publish their events.
    fn apply(&self, writes: impl IntoIterator<Item = (String, Option<Value>)>) {
        let mut events = Vec::new();
        {
            let mut data = self.data.write();
            for (key, value) in writes {
                let new_value = value.filter(|v| !v.is_null());
                let old_value = match &new_value {
                    Some(value) => data.insert(key.clone(), value.clone()),
                    None => data.remove(&key),
                };
                events.extend(ChangeEvent::between(key, old_value, new_value));
            }
        }

        for event in events {
            self.watcher.send(event);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.record_read();
        Ok(self.data.read().get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>> {
        self.record_read();
        let data = self.data.read();
        Ok(keys
            .iter()
            .map(|key| (key.clone(), data.get(key).cloned()))
            .collect())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.record_write();
        self.apply([(key.to_string(), Some(value))]);
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.record_write();
        self.apply(entries.into_iter().map(|(key, value)| (key, Some(value))));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.record_write();
        self.apply([(key.to_string(), None)]);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        self.record_write();
        self.apply(keys.iter().map(|key| (key.clone(), None)));
        Ok(())
    }

    async fn enumerate_all(&self) -> Result<Map<String, Value>> {
        self.record_read();
        Ok(self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn overwrite(&self, data: Map<String, Value>) -> Result<()> {
        self.record_write();
        self.apply(data.into_iter().map(|(key, value)| (key, Some(value))));
        Ok(())
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<ChangeEvent>> {
        Ok(self.watcher.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = MemoryBackend::new();

        backend.set("key", json!({"a": 1})).await.unwrap();
        let value = backend.get("key").await.unwrap();
        assert_eq!(value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let backend = MemoryBackend::new();
        assert!(backend.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_null_removes() {
        let backend = MemoryBackend::new();

        backend.set("key", json!(1)).await.unwrap();
        backend.set("key", Value::Null).await.unwrap();
        assert!(!backend.exists("key").await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_remove_nonexistent() {
        let backend = MemoryBackend::new();
        // Should not error
        backend.remove("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_batched_calls_count_once() {
        let backend = MemoryBackend::new();

        backend
            .set_many(vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
                ("c".to_string(), json!(3)),
            ])
            .await
            .unwrap();
        assert_eq!(backend.write_count(), 1);

        let keys = vec!["c".to_string(), "missing".to_string(), "a".to_string()];
        let values = backend.get_many(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![
                ("c".to_string(), Some(json!(3))),
                ("missing".to_string(), None),
                ("a".to_string(), Some(json!(1))),
            ]
        );

        backend.remove_many(&keys).await.unwrap();
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.call_count(), 3);
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_is_partial() {
        let backend = MemoryBackend::new();
        backend.set("keep", json!("old")).await.unwrap();
        backend.set("replace", json!("old")).await.unwrap();

        let mut data = Map::new();
        data.insert("replace".to_string(), json!("new"));
        data.insert("added".to_string(), json!(true));
        backend.overwrite(data).await.unwrap();

        let all = backend.enumerate_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all["keep"], json!("old"));
        assert_eq!(all["replace"], json!("new"));
    }

    #[tokio::test]
    async fn test_events_published() {
        let backend = MemoryBackend::new();
        let mut rx = backend.subscribe().unwrap();

        backend.set("k", json!(1)).await.unwrap();
        backend.set("k", json!(2)).await.unwrap();
        backend.remove("k").await.unwrap();
        backend.remove("k").await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.event_type, EventType::Created);
        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.old_value, Some(json!(1)));
        assert_eq!(updated.new_value, Some(json!(2)));
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Deleted);
        // Removing a missing key publishes nothing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = MemoryBackend::new();
        let other = backend.clone();

        other.set("shared", json!("x")).await.unwrap();
        assert_eq!(backend.get("shared").await.unwrap(), Some(json!("x")));
    }
}
