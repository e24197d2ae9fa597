//! Area drivers wrap the backend of one storage area.
//!
//! The backend is connected lazily: a driver for an area whose host
//! capability is missing constructs fine and only fails, with
//! [`StateError::BackendUnavailable`], when something actually uses it.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::error::{Result, StateError};
use crate::key::Area;
use crate::watch::{ChangeStream, WatchHandle, WatchRegistry};

/// Produces the backend of an area on first use.
pub type BackendFactory =
    Arc<dyn Fn() -> std::result::Result<Arc<dyn StorageBackend>, String> + Send + Sync>;

/// Single- and multi-key access to one area.
///
/// Batched methods issue exactly one backend call; empty batches issue none.
pub struct AreaDriver {
    area: Area,
    connect: BackendFactory,
    backend: Mutex<Option<Arc<dyn StorageBackend>>>,
    registry: WatchRegistry,
}

impl AreaDriver {
    /// Create a driver over an already available backend.
    pub fn new(area: Area, backend: Arc<dyn StorageBackend>) -> Self {
        let connect: BackendFactory = {
            let backend = backend.clone();
            Arc::new(move || Ok(backend.clone()))
        };
        Self {
            area,
            connect,
            backend: Mutex::new(Some(backend)),
            registry: WatchRegistry::new(),
        }
    }

    /// Create a driver that connects through `connect` on first use.
    ///
    /// A failed connection is retried on the next use.
    pub fn lazy<F>(area: Area, connect: F) -> Self
    where
        F: Fn() -> std::result::Result<Arc<dyn StorageBackend>, String> + Send + Sync + 'static,
    {
        Self {
            area,
            connect: Arc::new(connect),
            backend: Mutex::new(None),
            registry: WatchRegistry::new(),
        }
    }

    pub fn area(&self) -> Area {
        self.area
    }

    fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        let mut slot = self.backend.lock();
        if let Some(backend) = slot.as_ref() {
            return Ok(backend.clone());
        }

        let backend = (self.connect)().map_err(|reason| StateError::BackendUnavailable {
            area: self.area,
            reason,
        })?;
        info!(area = %self.area, "connected storage area");
        *slot = Some(backend.clone());
        Ok(backend)
    }

    /// Get one value. Stored `null` reads as absent.
    pub async fn get(&self, local_key: &str) -> Result<Option<Value>> {
        let value = self.backend()?.get(local_key).await?;
        Ok(value.filter(|v| !v.is_null()))
    }

    /// Get several values, aligned with `local_keys`.
    pub async fn get_many(&self, local_keys: &[String]) -> Result<Vec<Option<Value>>> {
        if local_keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(area = %self.area, count = local_keys.len(), "batched get");

        let found: HashMap<String, Value> = self
            .backend()?
            .get_many(local_keys)
            .await?
            .into_iter()
            .filter_map(|(key, value)| value.filter(|v| !v.is_null()).map(|v| (key, v)))
            .collect();

        Ok(local_keys
            .iter()
            .map(|key| found.get(key).cloned())
            .collect())
    }

    /// Store one value. `null` removes the key.
    pub async fn set(&self, local_key: &str, value: Value) -> Result<()> {
        self.backend()?.set(local_key, value).await
    }

    pub async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        debug!(area = %self.area, count = entries.len(), "batched set");
        self.backend()?.set_many(entries).await
    }

    pub async fn remove(&self, local_key: &str) -> Result<()> {
        self.backend()?.remove(local_key).await
    }

    pub async fn remove_many(&self, local_keys: &[String]) -> Result<()> {
        if local_keys.is_empty() {
            return Ok(());
        }
        debug!(area = %self.area, count = local_keys.len(), "batched remove");
        self.backend()?.remove_many(local_keys).await
    }

    /// The area's full key/value space, metadata shadow keys included.
    pub async fn snapshot(&self) -> Result<Map<String, Value>> {
        self.backend()?.enumerate_all().await
    }

    /// Write every entry of `data`. Keys missing from `data` are untouched.
    pub async fn restore_snapshot(&self, data: Map<String, Value>) -> Result<()> {
        debug!(area = %self.area, count = data.len(), "restoring snapshot");
        self.backend()?.overwrite(data).await
    }

    /// Effective changes to one local key, as a stream.
    pub fn changes(&self, local_key: &str) -> Result<ChangeStream> {
        Ok(ChangeStream::new(self.backend()?.subscribe()?, local_key))
    }

    /// Call `callback(new_value, old_value)` whenever `local_key` changes.
    ///
    /// Fails with `RuntimeUnavailable` outside a Tokio runtime.
    pub fn watch<F>(&self, local_key: &str, callback: F) -> Result<WatchHandle>
    where
        F: Fn(Option<Value>, Option<Value>) + Send + Sync + 'static,
    {
        let stream = self.changes(local_key)?;
        self.registry.register(stream, callback)
    }

    /// Drop every watcher registered on this area.
    pub fn unwatch(&self) -> usize {
        let removed = self.registry.clear();
        if removed > 0 {
            debug!(area = %self.area, removed, "removed watchers");
        }
        removed
    }

    /// Number of live watchers on this area.
    pub fn watcher_count(&self) -> usize {
        self.registry.len()
    }
}

/// The configured drivers, one per area.
#[derive(Default)]
pub struct AreaDrivers {
    drivers: BTreeMap<Area, Arc<AreaDriver>>,
}

impl AreaDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous driver for its area.
    pub fn insert(&mut self, driver: AreaDriver) {
        self.drivers.insert(driver.area(), Arc::new(driver));
    }

    /// The driver of `area`, or `InvalidArea` when it is not configured.
    pub fn get(&self, area: Area) -> Result<&Arc<AreaDriver>> {
        self.drivers
            .get(&area)
            .ok_or_else(|| StateError::InvalidArea(format!("{area} (not configured)")))
    }

    pub fn areas(&self) -> impl Iterator<Item = Area> + '_ {
        self.drivers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AreaDriver>> {
        self.drivers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn driver() -> (AreaDriver, MemoryBackend) {
        let backend = MemoryBackend::new();
        (AreaDriver::new(Area::Local, Arc::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn test_batched_forms_make_one_call() {
        let (driver, backend) = driver();

        let entries = (0..10).map(|i| (format!("k{i}"), json!(i))).collect();
        driver.set_many(entries).await.unwrap();
        assert_eq!(backend.call_count(), 1);

        let keys: Vec<String> = (0..10).rev().map(|i| format!("k{i}")).collect();
        let values = driver.get_many(&keys).await.unwrap();
        assert_eq!(backend.call_count(), 2);
        assert_eq!(values[0], Some(json!(9)));
        assert_eq!(values[9], Some(json!(0)));

        driver.remove_many(&keys).await.unwrap();
        assert_eq!(backend.call_count(), 3);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batches_skip_backend() {
        let (driver, backend) = driver();

        assert!(driver.get_many(&[]).await.unwrap().is_empty());
        driver.set_many(Vec::new()).await.unwrap();
        driver.remove_many(&[]).await.unwrap();
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_and_partial_restore() {
        let (driver, _backend) = driver();
        driver.set("a", json!(1)).await.unwrap();
        driver.set("b", json!(2)).await.unwrap();

        let snapshot = driver.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        driver.set("a", json!(100)).await.unwrap();
        driver.set("c", json!(3)).await.unwrap();

        let mut partial = Map::new();
        partial.insert("a".to_string(), snapshot["a"].clone());
        driver.restore_snapshot(partial).await.unwrap();

        assert_eq!(driver.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(driver.get("c").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_backend_unavailable_is_lazy() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let driver = AreaDriver::lazy(Area::Managed, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("permission denied".to_string())
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        let err = driver.get("policy").await.unwrap_err();
        assert!(matches!(
            err,
            StateError::BackendUnavailable {
                area: Area::Managed,
                ..
            }
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lazy_connection_is_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let backend = MemoryBackend::new();
        let driver = AreaDriver::lazy(Area::Session, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(backend.clone()) as Arc<dyn StorageBackend>)
        });

        driver.set("a", json!(1)).await.unwrap();
        driver.get("a").await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_and_unwatch() {
        let (driver, _backend) = driver();
        let (tx, mut rx) = mpsc::unbounded_channel();

        driver
            .watch("k", move |new, old| {
                let _ = tx.send((new, old));
            })
            .unwrap();
        assert_eq!(driver.watcher_count(), 1);

        driver.set("k", json!("v")).await.unwrap();
        let (new, old) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(new, Some(json!("v")));
        assert!(old.is_none());

        assert_eq!(driver.unwatch(), 1);
        assert_eq!(driver.watcher_count(), 0);
    }
}
