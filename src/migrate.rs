//! Versioned value migrations.
//!
//! An item's schema version is stored in the `v` field of its metadata. A
//! value without a recorded version is version 1. Migrating reads the value
//! and its metadata in one batched call, applies every registered step above
//! the stored version up to the target in ascending order, and commits the
//! new value together with the new version in one batched write.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::driver::AreaDriver;
use crate::error::{Result, StateError};
use crate::key::meta_key;
use crate::meta::{self, Meta};

/// Metadata field holding the stored schema version.
pub const VERSION_FIELD: &str = "v";

/// A transform from the previous schema version to the next.
pub type MigrationFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Migration steps keyed by the version they produce.
///
/// Versions without a step pass the value through unchanged.
#[derive(Clone, Default)]
pub struct Migrations {
    steps: BTreeMap<u32, MigrationFn>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step that produces `version`.
    pub fn step<F>(mut self, version: u32, migrate: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(migrate));
        self
    }

    pub fn get(&self, version: u32) -> Option<&MigrationFn> {
        self.steps.get(&version)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Highest version any step produces.
    pub fn latest(&self) -> Option<u32> {
        self.steps.keys().next_back().copied()
    }
}

impl fmt::Debug for Migrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.steps.keys()).finish()
    }
}

/// Where a defined item is in its migration lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Uninitialized,
    Migrating,
    Ready,
    /// The startup attempt failed; the item serves its pre-migration value.
    Failed(String),
}

/// What a migration run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Nothing is stored, so there is nothing to migrate.
    NoValue,
    /// The stored value is already at the target version.
    UpToDate { version: u32 },
    Migrated { from: u32, to: u32 },
}

/// Read the stored version from metadata, defaulting to 1.
///
/// Versions start at 1; anything else is unreadable and treated as 1.
pub fn stored_version(meta: &Meta) -> u32 {
    match meta.get(VERSION_FIELD) {
        None | Some(Value::Null) => 1,
        Some(value) => match value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
        {
            Some(version) => version,
            None => {
                warn!(%value, "unreadable stored version, assuming v1");
                1
            }
        },
    }
}

/// Metadata with the version field set to `version`, other fields kept.
pub fn with_version(mut meta: Meta, version: u32) -> Meta {
    meta.insert(VERSION_FIELD.to_string(), Value::from(version));
    meta
}

/// Stamp `target` into metadata, refusing to move a stored version backwards.
pub fn stamp_version(meta: Meta, key: &str, target: u32) -> Result<Meta> {
    let stored = stored_version(&meta);
    if stored > target {
        return Err(StateError::VersionDowngrade {
            key: key.to_string(),
            stored,
            target,
        });
    }
    Ok(with_version(meta, target))
}

/// Write `value` together with its schema version in one batched call.
pub async fn write_versioned(
    driver: &AreaDriver,
    key: &str,
    local_key: &str,
    value: Value,
    target: u32,
) -> Result<()> {
    let existing = meta::get_meta(driver, local_key).await?;
    let stamped = stamp_version(existing, key, target)?;
    driver
        .set_many(vec![
            (local_key.to_string(), value),
            (meta_key(local_key), Value::Object(stamped)),
        ])
        .await
}

/// Resolves once an item's startup attempt has finished.
pub(crate) type ReadyFuture = Shared<BoxFuture<'static, ()>>;

/// A gate that is already open.
pub(crate) fn open_gate() -> ReadyFuture {
    future::ready(()).boxed().shared()
}

/// Start `startup` on the ambient runtime and gate on its completion.
///
/// Without a runtime the attempt runs on the first await of the gate.
pub(crate) fn start_gate(startup: BoxFuture<'static, ()>) -> ReadyFuture {
    match Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(startup);
            async move {
                if let Err(err) = task.await {
                    error!(error = %err, "item startup task aborted");
                }
            }
            .boxed()
            .shared()
        }
        Err(_) => startup.shared(),
    }
}

/// Bring the value stored under `local_key` up to `target`.
///
/// `key` is the namespaced key, used for errors and logs.
pub async fn run_migrations(
    driver: &AreaDriver,
    key: &str,
    local_key: &str,
    target: u32,
    migrations: &Migrations,
) -> Result<MigrationOutcome> {
    let shadow = meta_key(local_key);
    let mut stored = driver
        .get_many(&[local_key.to_string(), shadow.clone()])
        .await?
        .into_iter();
    let value = stored.next().flatten();
    let meta = meta::normalize(stored.next().flatten());

    let Some(mut value) = value else {
        debug!(key, "no stored value, skipping migration");
        return Ok(MigrationOutcome::NoValue);
    };

    let current = stored_version(&meta);
    if current > target {
        return Err(StateError::VersionDowngrade {
            key: key.to_string(),
            stored: current,
            target,
        });
    }
    if current == target {
        return Ok(MigrationOutcome::UpToDate { version: current });
    }

    for version in (current + 1)..=target {
        if let Some(step) = migrations.get(version) {
            value = step(value).map_err(|source| StateError::Migration {
                key: key.to_string(),
                version,
                source: Box::new(source),
            })?;
        }
    }

    driver
        .set_many(vec![
            (local_key.to_string(), value),
            (shadow, Value::Object(with_version(meta, target))),
        ])
        .await
        .map_err(|source| StateError::Migration {
            key: key.to_string(),
            version: target,
            source: Box::new(source),
        })?;

    info!(key, from = current, to = target, "migrated item");
    Ok(MigrationOutcome::Migrated {
        from: current,
        to: target,
    })
}
