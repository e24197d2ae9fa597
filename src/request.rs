//! Entries and results of batched operations.
//!
//! A batch entry names either a bare namespaced key or a [`DefinedItem`].
//! Entries built from an item carry its fallback, its migration gate and,
//! for versioned items, the schema version stamped on every write.

use serde_json::Value;

use crate::item::DefinedItem;
use crate::meta::Meta;
use crate::migrate::ReadyFuture;
use crate::options::Storable;

/// A key in a batch: either a bare namespaced key or a defined item.
#[derive(Clone)]
pub struct ItemRef {
    pub(crate) key: String,
    pub(crate) item_fallback: Option<Value>,
    pub(crate) ready: Option<ReadyFuture>,
    pub(crate) version: Option<u32>,
}

impl ItemRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            item_fallback: None,
            ready: None,
            version: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Schema version written alongside values, for versioned items.
    pub fn version(&self) -> Option<u32> {
        self.version
    }
}

impl From<&str> for ItemRef {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ItemRef {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl<T: Storable> From<&DefinedItem<T>> for ItemRef {
    fn from(item: &DefinedItem<T>) -> Self {
        Self {
            key: item.key().to_string(),
            item_fallback: item.fallback_value(),
            ready: Some(item.ready()),
            version: item.stamped_version(),
        }
    }
}

/// One entry of a batched read, with an optional call-site fallback.
#[derive(Clone)]
pub struct GetRequest {
    pub(crate) target: ItemRef,
    fallback: Option<Value>,
}

impl GetRequest {
    pub fn new(target: impl Into<ItemRef>) -> Self {
        Self {
            target: target.into(),
            fallback: None,
        }
    }

    /// Fallback for this entry; takes precedence over the item's own.
    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub(crate) fn resolve_missing(self) -> Value {
        self.fallback
            .or(self.target.item_fallback)
            .unwrap_or(Value::Null)
    }
}

impl From<&str> for GetRequest {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for GetRequest {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl<T: Storable> From<&DefinedItem<T>> for GetRequest {
    fn from(item: &DefinedItem<T>) -> Self {
        Self::new(item)
    }
}

/// One entry of a batched removal.
#[derive(Clone)]
pub struct RemoveRequest {
    pub(crate) target: ItemRef,
    pub(crate) remove_meta: bool,
}

impl RemoveRequest {
    pub fn new(target: impl Into<ItemRef>) -> Self {
        Self {
            target: target.into(),
            remove_meta: false,
        }
    }

    /// Also remove the entry's metadata.
    pub fn with_meta(mut self) -> Self {
        self.remove_meta = true;
        self
    }
}

impl From<&str> for RemoveRequest {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RemoveRequest {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl<T: Storable> From<&DefinedItem<T>> for RemoveRequest {
    fn from(item: &DefinedItem<T>) -> Self {
        Self::new(item)
    }
}

/// A value returned by a batched read. Missing values are `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    pub key: String,
    pub value: Value,
}

/// Metadata returned by a batched metadata read.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMeta {
    pub key: String,
    pub meta: Meta,
}
