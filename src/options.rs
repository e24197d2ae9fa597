//! Options for defining items.

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::migrate::Migrations;

/// Values that can be stored in a defined item.
pub trait Storable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Storable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Produces an item's initial value.
pub type InitFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Options recognized when defining an item.
pub struct ItemOptions<T> {
    pub(crate) fallback: Option<T>,
    pub(crate) init: Option<InitFn<T>>,
    pub(crate) version: Option<u32>,
    pub(crate) migrations: Migrations,
}

impl<T> Default for ItemOptions<T> {
    fn default() -> Self {
        Self {
            fallback: None,
            init: None,
            version: None,
            migrations: Migrations::new(),
        }
    }
}

impl<T: Storable> ItemOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value returned while nothing is stored.
    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    /// Producer of the initial value, run at most once when nothing is stored.
    pub fn init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.init = Some(Arc::new(move || init().boxed()));
        self
    }

    /// Target schema version, starting at 1.
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Register the step that produces `version`.
    pub fn migration<F>(mut self, version: u32, migrate: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.migrations = self.migrations.step(version, migrate);
        self
    }

    pub fn migrations(mut self, migrations: Migrations) -> Self {
        self.migrations = migrations;
        self
    }

    /// Whether items defined with these options record a schema version.
    pub fn is_versioned(&self) -> bool {
        self.version.is_some() || !self.migrations.is_empty()
    }
}

impl<T> fmt::Debug for ItemOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemOptions")
            .field("version", &self.version)
            .field("migrations", &self.migrations)
            .field("has_fallback", &self.fallback.is_some())
            .field("has_init", &self.init.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_versioned_by_version_or_steps() {
        assert!(!ItemOptions::<u32>::new().fallback(1).is_versioned());
        assert!(ItemOptions::<u32>::new().version(2).is_versioned());
        assert!(ItemOptions::<Value>::new()
            .migration(2, |v| Ok(v))
            .is_versioned());
    }

    #[tokio::test]
    async fn test_init_is_boxed() {
        let options = ItemOptions::new().init(|| async { Ok(json!({"a": 1})) });
        let init = options.init.clone().unwrap();
        assert_eq!(init().await.unwrap(), json!({"a": 1}));
        assert!(format!("{options:?}").contains("has_init: true"));
    }
}
