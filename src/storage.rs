//! The area-agnostic storage surface.
//!
//! [`Storage`] routes namespaced keys to their area driver. Single-key
//! operations make one driver call; batched operations go through the
//! [`batch`](crate::batch) aggregator.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::StorageBackend;
use crate::batch;
use crate::config::StorageConfig;
use crate::driver::{AreaDriver, AreaDrivers};
use crate::error::Result;
use crate::item::DefinedItem;
use crate::key::{meta_key, Area, StorageKey};
use crate::memory::MemoryBackend;
use crate::meta::{self, Meta};
use crate::options::{ItemOptions, Storable};
use crate::request::{GetRequest, ItemMeta, ItemRef, ItemValue, RemoveRequest};
use crate::watch::{WatchCallback, WatchHandle};

/// A key resolved to its area and driver.
pub struct ResolvedKey<'a> {
    pub area: Area,
    pub local_key: String,
    pub driver: &'a Arc<AreaDriver>,
}

/// Assembles a [`Storage`] from per-area backends.
#[derive(Default)]
pub struct StorageBuilder {
    drivers: AreaDrivers,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `area` from `backend`.
    pub fn area(self, area: Area, backend: impl StorageBackend + 'static) -> Self {
        self.shared_area(area, Arc::new(backend))
    }

    /// Serve `area` from a backend shared with other owners.
    pub fn shared_area(mut self, area: Area, backend: Arc<dyn StorageBackend>) -> Self {
        self.drivers.insert(AreaDriver::new(area, backend));
        self
    }

    /// Serve `area` from a backend connected on first use.
    pub fn lazy_area<F>(mut self, area: Area, connect: F) -> Self
    where
        F: Fn() -> std::result::Result<Arc<dyn StorageBackend>, String> + Send + Sync + 'static,
    {
        self.drivers.insert(AreaDriver::lazy(area, connect));
        self
    }

    pub fn build(self) -> Storage {
        Storage {
            drivers: self.drivers,
        }
    }
}

/// Typed, versioned key-value storage over independent areas.
pub struct Storage {
    drivers: AreaDrivers,
}

impl Storage {
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    /// Every area backed by its own in-memory backend.
    pub fn in_memory() -> Self {
        Area::ALL
            .into_iter()
            .fold(Self::builder(), |builder, area| {
                builder.area(area, MemoryBackend::new())
            })
            .build()
    }

    /// In-memory areas as described by `config`.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        Ok(config
            .areas
            .iter()
            .fold(Self::builder(), |builder, area| {
                builder.area(*area, MemoryBackend::with_capacity(config.watch_capacity))
            })
            .build())
    }

    /// Configured areas.
    pub fn areas(&self) -> Vec<Area> {
        self.drivers.areas().collect()
    }

    pub fn driver(&self, area: Area) -> Result<&Arc<AreaDriver>> {
        self.drivers.get(area)
    }

    /// Resolve a namespaced key without touching any backend.
    pub fn resolve(&self, key: &str) -> Result<ResolvedKey<'_>> {
        let parsed = StorageKey::parse(key)?;
        let driver = self.drivers.get(parsed.area)?;
        Ok(ResolvedKey {
            area: parsed.area,
            local_key: parsed.local_key,
            driver,
        })
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let resolved = self.resolve(key)?;
        resolved.driver.get(&resolved.local_key).await
    }

    /// The stored value, or `fallback` when nothing is stored.
    pub async fn get_item_or(&self, key: &str, fallback: Value) -> Result<Value> {
        Ok(self.get_item(key).await?.unwrap_or(fallback))
    }

    /// Get a value and deserialize it.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_item(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a value. `null` removes the key.
    pub async fn set_item(&self, key: &str, value: Value) -> Result<()> {
        let resolved = self.resolve(key)?;
        resolved.driver.set(&resolved.local_key, value).await
    }

    /// Serialize and store a value.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set_item(key, value).await
    }

    /// Remove a value, and its metadata too when `remove_meta` is set.
    pub async fn remove_item(&self, key: &str, remove_meta: bool) -> Result<()> {
        let resolved = self.resolve(key)?;
        if remove_meta {
            let keys = [resolved.local_key.clone(), meta_key(&resolved.local_key)];
            resolved.driver.remove_many(&keys).await
        } else {
            resolved.driver.remove(&resolved.local_key).await
        }
    }

    pub async fn get_meta(&self, key: &str) -> Result<Meta> {
        let resolved = self.resolve(key)?;
        meta::get_meta(resolved.driver, &resolved.local_key).await
    }

    /// Merge metadata fields into a key's metadata. `null` fields are deleted.
    pub async fn set_meta(&self, key: &str, fields: Meta) -> Result<()> {
        let resolved = self.resolve(key)?;
        meta::set_meta(resolved.driver, &resolved.local_key, fields).await
    }

    /// Remove all of a key's metadata, or only the named fields.
    pub async fn remove_meta(&self, key: &str, fields: Option<&[&str]>) -> Result<()> {
        let resolved = self.resolve(key)?;
        meta::remove_meta(resolved.driver, &resolved.local_key, fields).await
    }

    pub async fn get_items<I, R>(&self, requests: I) -> Result<Vec<ItemValue>>
    where
        I: IntoIterator<Item = R>,
        R: Into<GetRequest>,
    {
        batch::get_items(&self.drivers, requests.into_iter().map(Into::into).collect()).await
    }

    pub async fn set_items<I, R>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (R, Value)>,
        R: Into<ItemRef>,
    {
        let entries = entries.into_iter().map(|(r, v)| (r.into(), v)).collect();
        batch::set_items(&self.drivers, entries).await
    }

    pub async fn get_item_metas<I, R>(&self, targets: I) -> Result<Vec<ItemMeta>>
    where
        I: IntoIterator<Item = R>,
        R: Into<ItemRef>,
    {
        batch::get_item_metas(&self.drivers, targets.into_iter().map(Into::into).collect()).await
    }

    pub async fn set_item_metas<I, R>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (R, Meta)>,
        R: Into<ItemRef>,
    {
        let entries = entries.into_iter().map(|(r, m)| (r.into(), m)).collect();
        batch::set_item_metas(&self.drivers, entries).await
    }

    pub async fn remove_items<I, R>(&self, requests: I) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: Into<RemoveRequest>,
    {
        batch::remove_items(&self.drivers, requests.into_iter().map(Into::into).collect()).await
    }

    /// Call `callback(new_value, old_value)` whenever `key` changes.
    ///
    /// Writes that leave the value deep-equal do not fire. Fails with
    /// `RuntimeUnavailable` outside a Tokio runtime.
    pub fn watch<F>(&self, key: &str, callback: F) -> Result<WatchHandle>
    where
        F: Fn(Option<Value>, Option<Value>) + Send + Sync + 'static,
    {
        let resolved = self.resolve(key)?;
        resolved.driver.watch(&resolved.local_key, callback)
    }

    /// Register one watcher per key, returning a handle per key.
    ///
    /// Every key is resolved before any watcher is registered.
    pub fn watch_many(&self, callbacks: HashMap<String, WatchCallback>) -> Result<HashMap<String, WatchHandle>> {
        let resolved = callbacks
            .into_iter()
            .map(|(key, callback)| {
                let parsed = StorageKey::parse(&key)?;
                let driver = self.drivers.get(parsed.area)?.clone();
                Ok((key, parsed.local_key, driver, callback))
            })
            .collect::<Result<Vec<_>>>()?;

        resolved
            .into_iter()
            .map(|(key, local_key, driver, callback)| {
                let handle = driver.watch(&local_key, callback)?;
                Ok((key, handle))
            })
            .collect()
    }

    /// Remove every watcher in every area.
    pub fn unwatch(&self) -> usize {
        let removed: usize = self.drivers.iter().map(|driver| driver.unwatch()).sum();
        debug!(removed, "removed all watchers");
        removed
    }

    /// Everything stored in `area`, minus `exclude_keys` and their metadata.
    pub async fn snapshot(&self, area: Area, exclude_keys: &[&str]) -> Result<Map<String, Value>> {
        let mut data = self.drivers.get(area)?.snapshot().await?;
        for key in exclude_keys {
            data.remove(*key);
            data.remove(&meta_key(key));
        }
        Ok(data)
    }

    /// Write a snapshot back. Keys not in `data` are left untouched.
    pub async fn restore_snapshot(&self, area: Area, data: Map<String, Value>) -> Result<()> {
        self.drivers.get(area)?.restore_snapshot(data).await
    }

    /// Define a typed item bound to `key`.
    ///
    /// A versioned item starts migrating immediately when called within a
    /// Tokio runtime, and otherwise on its first use.
    pub fn define_item<T: Storable>(&self, key: &str, options: ItemOptions<T>) -> Result<DefinedItem<T>> {
        let parsed = StorageKey::parse(key)?;
        let driver = self.drivers.get(parsed.area)?.clone();
        DefinedItem::define(parsed, driver, options)
    }
}
