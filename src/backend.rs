//! StorageBackend trait - the capability every storage area is built on.
//!
//! A backend durably stores JSON values under opaque string keys and
//! publishes a change event for every write. Setting a key to `null` is the
//! same as removing it. Concrete durable backends live outside this crate;
//! [`MemoryBackend`](crate::MemoryBackend) is the in-process implementation
//! used for tests and development.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::watch::ChangeEvent;

/// The storage capability behind one area.
///
/// Batched methods must complete in a single round-trip to the underlying
/// store; callers rely on them to avoid interleaving with other writers.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Get several values at once, in the order of `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Option<Value>)>>;

    /// Store `value` under `key`. `null` removes the key.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Store several values at once. `null` values remove their key.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove several keys at once.
    async fn remove_many(&self, keys: &[String]) -> Result<()>;

    /// Every key/value pair in the store.
    async fn enumerate_all(&self) -> Result<Map<String, Value>>;

    /// Write every entry of `data`, leaving other keys untouched.
    async fn overwrite(&self, data: Map<String, Value>) -> Result<()>;

    /// Subscribe to change events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> Result<broadcast::Receiver<ChangeEvent>>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
