//! # univrs-items
//!
//! Typed, versioned key-value items over independent storage areas.
//!
//! Keys are namespaced by area (`local:`, `session:`, `sync:`, `managed:`)
//! and each area is served by its own [`StorageBackend`]. On top of plain
//! values the crate provides:
//!
//! - **Metadata**: a per-key JSON object merged field by field
//! - **Batching**: multi-key reads and writes, one backend call per area
//! - **Watchers**: change callbacks that skip no-op writes
//! - **Defined items**: typed handles with fallbacks, initializers and
//!   schema migrations
//!
//! ## Backends
//!
//! - [`MemoryBackend`]: In-memory backend (testing and development)
//!
//! Durable backends implement [`StorageBackend`] and are plugged in per area
//! through [`StorageBuilder`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use univrs_items::Storage;
//!
//! #[tokio::main]
//! async fn main() -> univrs_items::Result<()> {
//!     let storage = Storage::in_memory();
//!
//!     storage.set_item("local:theme", json!("dark")).await?;
//!     let theme = storage.get_item("local:theme").await?;
//!     println!("Theme: {:?}", theme);
//!
//!     // Batched reads keep the caller's order across areas
//!     let values = storage.get_items(["session:token", "local:theme"]).await?;
//!     for item in values {
//!         println!("{} = {}", item.key, item.value);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Defined Items
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use univrs_items::{ItemOptions, Storage};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Settings {
//!     theme: String,
//!     font_size: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> univrs_items::Result<()> {
//!     let storage = Storage::in_memory();
//!
//!     let settings = storage.define_item(
//!         "sync:settings",
//!         ItemOptions::new()
//!             .fallback(Settings {
//!                 theme: "light".to_string(),
//!                 font_size: 14,
//!             })
//!             .version(2)
//!             .migration(2, |mut value| {
//!                 value["font_size"] = serde_json::json!(14);
//!                 Ok(value)
//!             }),
//!     )?;
//!
//!     let current = settings.get_value().await?;
//!     println!("{:?}", current);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Watching
//!
//! ```rust,no_run
//! use univrs_items::Storage;
//!
//! #[tokio::main]
//! async fn main() -> univrs_items::Result<()> {
//!     let storage = Storage::in_memory();
//!
//!     let handle = storage.watch("local:theme", |new, old| {
//!         println!("theme changed from {:?} to {:?}", old, new);
//!     })?;
//!
//!     storage.set_item("local:theme", serde_json::json!("dark")).await?;
//!     handle.unwatch();
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod driver;
pub mod error;
pub mod item;
pub mod key;
pub mod memory;
pub mod meta;
pub mod migrate;
pub mod options;
pub mod request;
pub mod storage;
pub mod watch;

// Re-exports
pub use backend::StorageBackend;
pub use config::StorageConfig;
pub use driver::{AreaDriver, AreaDrivers};
pub use error::{Result, StateError};
pub use item::DefinedItem;
pub use key::{Area, StorageKey};
pub use memory::MemoryBackend;
pub use meta::Meta;
pub use migrate::{MigrationOutcome, MigrationState, Migrations};
pub use options::{ItemOptions, Storable};
pub use request::{GetRequest, ItemMeta, ItemRef, ItemValue, RemoveRequest};
pub use storage::{ResolvedKey, Storage, StorageBuilder};
pub use watch::{ChangeEvent, ChangeStream, EventType, WatchCallback, WatchHandle};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Result, StateError};
    pub use crate::item::DefinedItem;
    pub use crate::key::Area;
    pub use crate::memory::MemoryBackend;
    pub use crate::options::ItemOptions;
    pub use crate::request::{GetRequest, RemoveRequest};
    pub use crate::storage::Storage;
    pub use crate::watch::WatchHandle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_storage_basic() {
        let storage = Storage::in_memory();

        storage.set_item("local:test", json!("value")).await.unwrap();
        let value = storage.get_item("local:test").await.unwrap().unwrap();
        assert_eq!(value, json!("value"));
    }

    #[tokio::test]
    async fn test_storage_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<Storage>();
        assert_send_sync::<MemoryBackend>();
        assert_send_sync::<DefinedItem<String>>();
    }
}
