//! Defined items: typed, versioned handles bound to one key.
//!
//! Defining an item that is versioned starts its migration attempt right
//! away. Every read and write through the handle waits for that attempt to
//! finish first. A failed startup migration is logged and leaves the item
//! serving its pre-migration value; the failure is cached and not retried
//! until [`DefinedItem::migrate`] is called explicitly.
//!
//! Items with an initializer write the initial value at most once per
//! handle, even under concurrent first access.

use futures::future::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::driver::AreaDriver;
use crate::error::{Result, StateError};
use crate::key::{meta_key, Area, StorageKey};
use crate::meta::{self, Meta};
use crate::migrate::{
    open_gate, run_migrations, start_gate, write_versioned, MigrationOutcome, MigrationState,
    Migrations, ReadyFuture,
};
use crate::options::{InitFn, ItemOptions, Storable};
use crate::watch::WatchHandle;

/// State shared between a handle and its startup task.
struct ItemCore<T> {
    key: String,
    local_key: String,
    driver: Arc<AreaDriver>,
    version: u32,
    versioned: bool,
    migrations: Migrations,
    init: Option<InitFn<T>>,
    init_lock: tokio::sync::Mutex<()>,
    state: Mutex<MigrationState>,
}

impl<T: Storable> ItemCore<T> {
    fn set_state(&self, state: MigrationState) {
        *self.state.lock() = state;
    }

    async fn startup(self: Arc<Self>) {
        if self.versioned {
            self.set_state(MigrationState::Migrating);
            match self.migrate_once().await {
                Ok(_) => self.set_state(MigrationState::Ready),
                Err(err) => {
                    error!(key = %self.key, error = %err, "startup migration failed");
                    self.set_state(MigrationState::Failed(err.to_string()));
                }
            }
        } else {
            self.set_state(MigrationState::Ready);
        }

        if self.init.is_some() {
            if let Err(err) = self.get_or_init().await {
                error!(key = %self.key, error = %err, "item initialization failed");
            }
        }
    }

    async fn migrate_once(&self) -> Result<MigrationOutcome> {
        run_migrations(
            &self.driver,
            &self.key,
            &self.local_key,
            self.version,
            &self.migrations,
        )
        .await
    }

    /// Read the stored value, writing the initial value first if needed.
    async fn get_or_init(&self) -> Result<Option<Value>> {
        let Some(init) = &self.init else {
            return self.driver.get(&self.local_key).await;
        };

        let _guard = self.init_lock.lock().await;
        if let Some(value) = self.driver.get(&self.local_key).await? {
            return Ok(Some(value));
        }

        let value = serde_json::to_value(init().await?)?;
        self.write(value.clone()).await?;
        debug!(key = %self.key, "initialized item");
        Ok(Some(value).filter(|v| !v.is_null()))
    }

    /// Write a value, recording the target version alongside it.
    async fn write(&self, value: Value) -> Result<()> {
        if !self.versioned || value.is_null() {
            return self.driver.set(&self.local_key, value).await;
        }
        write_versioned(&self.driver, &self.key, &self.local_key, value, self.version).await
    }
}

fn decode<T: Storable>(raw: Option<Value>, fallback: &Option<T>) -> Result<Option<T>> {
    match raw.filter(|v| !v.is_null()) {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(fallback.clone()),
    }
}

/// A typed handle bound to one namespaced key.
#[derive(Clone)]
pub struct DefinedItem<T> {
    core: Arc<ItemCore<T>>,
    area: Area,
    fallback: Option<T>,
    fallback_value: Option<Value>,
    ready: ReadyFuture,
}

impl<T: Storable> DefinedItem<T> {
    pub(crate) fn define(key: StorageKey, driver: Arc<AreaDriver>, options: ItemOptions<T>) -> Result<Self> {
        let version = options.version.unwrap_or(1);
        if version < 1 {
            return Err(StateError::InvalidVersion(version));
        }
        if let Some(latest) = options.migrations.latest().filter(|latest| *latest > version) {
            warn!(key = %key, latest, target = version, "migration steps above target version are ignored");
        }

        let fallback_value = options
            .fallback
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let core = Arc::new(ItemCore {
            key: key.to_string(),
            local_key: key.local_key.clone(),
            driver,
            version,
            versioned: options.is_versioned(),
            migrations: options.migrations,
            init: options.init,
            init_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(MigrationState::Uninitialized),
        });
        let ready = Self::start(core.clone());

        Ok(Self {
            core,
            area: key.area,
            fallback: options.fallback,
            fallback_value,
            ready,
        })
    }

    /// Kick off the startup attempt on the ambient runtime, if any.
    fn start(core: Arc<ItemCore<T>>) -> ReadyFuture {
        if !core.versioned && core.init.is_none() {
            core.set_state(MigrationState::Ready);
            return open_gate();
        }
        start_gate(core.startup().boxed())
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn area(&self) -> Area {
        self.area
    }

    pub fn fallback(&self) -> Option<&T> {
        self.fallback.as_ref()
    }

    /// Target schema version.
    pub fn version(&self) -> u32 {
        self.core.version
    }

    pub fn migration_state(&self) -> MigrationState {
        self.core.state.lock().clone()
    }

    pub(crate) fn fallback_value(&self) -> Option<Value> {
        self.fallback_value.clone()
    }

    pub(crate) fn ready(&self) -> ReadyFuture {
        self.ready.clone()
    }

    /// The version recorded with every write, for versioned items.
    pub(crate) fn stamped_version(&self) -> Option<u32> {
        self.core.versioned.then_some(self.core.version)
    }

    /// The stored value, or the fallback when nothing is stored.
    pub async fn get_value(&self) -> Result<Option<T>> {
        self.ready().await;
        let raw = self.core.get_or_init().await?;
        decode(raw, &self.fallback)
    }

    pub async fn set_value(&self, value: &T) -> Result<()> {
        self.ready().await;
        self.core.write(serde_json::to_value(value)?).await
    }

    /// Remove the value, and its metadata too when `remove_meta` is set.
    pub async fn remove_value(&self, remove_meta: bool) -> Result<()> {
        self.ready().await;
        let local_key = &self.core.local_key;
        if remove_meta {
            self.core
                .driver
                .remove_many(&[local_key.clone(), meta_key(local_key)])
                .await
        } else {
            self.core.driver.remove(local_key).await
        }
    }

    pub async fn get_meta(&self) -> Result<Meta> {
        self.ready().await;
        meta::get_meta(&self.core.driver, &self.core.local_key).await
    }

    pub async fn set_meta(&self, fields: Meta) -> Result<()> {
        self.ready().await;
        meta::set_meta(&self.core.driver, &self.core.local_key, fields).await
    }

    pub async fn remove_meta(&self, fields: Option<&[&str]>) -> Result<()> {
        self.ready().await;
        meta::remove_meta(&self.core.driver, &self.core.local_key, fields).await
    }

    /// Call `callback(new_value, old_value)` on every effective change.
    ///
    /// Absent values are replaced by the fallback. Changes that do not decode
    /// as `T` are logged and skipped.
    pub fn watch<F>(&self, callback: F) -> Result<WatchHandle>
    where
        F: Fn(Option<T>, Option<T>) + Send + Sync + 'static,
    {
        let key = self.core.key.clone();
        let fallback = self.fallback.clone();
        self.core
            .driver
            .watch(&self.core.local_key, move |new, old| {
                match (decode(new, &fallback), decode(old, &fallback)) {
                    (Ok(new), Ok(old)) => callback(new, old),
                    (Err(err), _) | (_, Err(err)) => {
                        warn!(key = %key, error = %err, "skipping undecodable change");
                    }
                }
            })
    }

    /// Run the migration now and report its outcome.
    ///
    /// Waits for the startup attempt first, so the two never overlap.
    pub async fn migrate(&self) -> Result<MigrationOutcome> {
        self.ready().await;
        let outcome = self.core.migrate_once().await?;
        self.core.set_state(MigrationState::Ready);
        Ok(outcome)
    }
}

impl<T> fmt::Debug for DefinedItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefinedItem")
            .field("key", &self.core.key)
            .field("version", &self.core.version)
            .field("migrations", &self.core.migrations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
    }

    fn driver() -> (Arc<AreaDriver>, MemoryBackend) {
        let backend = MemoryBackend::new();
        (
            Arc::new(AreaDriver::new(Area::Local, Arc::new(backend.clone()))),
            backend,
        )
    }

    fn define<T: Storable>(driver: &Arc<AreaDriver>, options: ItemOptions<T>) -> DefinedItem<T> {
        DefinedItem::define(StorageKey::parse("local:item").unwrap(), driver.clone(), options).unwrap()
    }

    #[tokio::test]
    async fn test_fallback_when_unset() {
        let (driver, _) = driver();
        let item = define(
            &driver,
            ItemOptions::new().fallback(Settings {
                theme: "light".to_string(),
            }),
        );

        assert_eq!(item.get_value().await.unwrap().unwrap().theme, "light");

        item.set_value(&Settings {
            theme: "dark".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(item.get_value().await.unwrap().unwrap().theme, "dark");

        item.remove_value(false).await.unwrap();
        assert_eq!(item.get_value().await.unwrap().unwrap().theme, "light");
    }

    #[tokio::test]
    async fn test_version_zero_rejected() {
        let (driver, _) = driver();
        let result = DefinedItem::<u32>::define(
            StorageKey::parse("local:item").unwrap(),
            driver,
            ItemOptions::new().version(0),
        );
        assert!(matches!(result, Err(StateError::InvalidVersion(0))));
    }

    #[tokio::test]
    async fn test_startup_migration_gates_reads() {
        let (driver, _) = driver();
        driver.set("item", json!({"x": 1})).await.unwrap();

        let item: DefinedItem<Value> = define(
            &driver,
            ItemOptions::new()
                .version(2)
                .migration(2, |mut v| {
                    v["y"] = json!(2);
                    Ok(v)
                }),
        );

        assert_eq!(item.get_value().await.unwrap(), Some(json!({"x": 1, "y": 2})));
        assert_eq!(item.migration_state(), MigrationState::Ready);
        assert_eq!(item.get_meta().await.unwrap()["v"], json!(2));
    }

    #[tokio::test]
    async fn test_failed_startup_serves_old_value() {
        let (driver, _) = driver();
        driver.set("item", json!({"x": 1})).await.unwrap();

        let item: DefinedItem<Value> = define(
            &driver,
            ItemOptions::new()
                .version(2)
                .migration(2, |_| Err(StateError::SerializationError("boom".to_string()))),
        );

        assert_eq!(item.get_value().await.unwrap(), Some(json!({"x": 1})));
        assert!(matches!(item.migration_state(), MigrationState::Failed(_)));

        let err = item.migrate().await.unwrap_err();
        assert!(matches!(err, StateError::Migration { version: 2, .. }));
    }

    #[tokio::test]
    async fn test_set_value_stamps_version() {
        let (driver, _) = driver();
        let item: DefinedItem<u32> = define(&driver, ItemOptions::new().version(3));

        let mut fields = Meta::new();
        fields.insert("owner".to_string(), json!("me"));
        item.set_meta(fields).await.unwrap();
        item.set_value(&7).await.unwrap();

        assert_eq!(driver.get("item$").await.unwrap(), Some(json!({"owner": "me", "v": 3})));
        assert_eq!(item.migrate().await.unwrap(), MigrationOutcome::UpToDate { version: 3 });
    }

    #[tokio::test]
    async fn test_set_value_refuses_downgrade() {
        let (driver, _) = driver();
        driver.set("item", json!(1)).await.unwrap();
        driver.set("item$", json!({"v": 5})).await.unwrap();

        let item: DefinedItem<u32> = define(&driver, ItemOptions::new().version(2));
        let err = item.set_value(&2).await.unwrap_err();
        assert!(matches!(err, StateError::VersionDowngrade { stored: 5, .. }));
        assert_eq!(driver.get("item").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_init_runs_once() {
        let (driver, backend) = driver();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let item: DefinedItem<u32> = define(
            &driver,
            ItemOptions::new().init(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(42)
                }
            }),
        );

        // The startup attempt initializes once; clear it so both readers
        // below find the key empty and contend for the init lock.
        assert_eq!(item.get_value().await.unwrap(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        item.remove_value(false).await.unwrap();
        let writes = backend.write_count();

        let (a, b) = tokio::join!(item.get_value(), item.get_value());
        assert_eq!(a.unwrap(), Some(42));
        assert_eq!(b.unwrap(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.write_count(), writes + 1);
    }

    #[tokio::test]
    async fn test_remove_value_with_meta() {
        let (driver, backend) = driver();
        let item: DefinedItem<u32> = define(&driver, ItemOptions::new());

        item.set_value(&1).await.unwrap();
        let mut fields = Meta::new();
        fields.insert("a".to_string(), json!(true));
        item.set_meta(fields).await.unwrap();
        assert_eq!(backend.len(), 2);

        item.remove_value(true).await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_watch_applies_fallback() {
        let (driver, _) = driver();
        let item: DefinedItem<u32> = define(&driver, ItemOptions::new().fallback(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        item.watch(move |new, old| {
            let _ = tx.send((new, old));
        })
        .unwrap();

        item.set_value(&5).await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, (Some(5), Some(0)));
    }
}
