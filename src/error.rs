//! Error types for item storage operations.
//!
//! Routing errors (`InvalidArea`, `MalformedKey`) are produced while resolving
//! a key, before any backend is touched. Backend errors propagate unchanged.
//! Migration errors are reported to whoever asked for the migration and
//! logged for implicit startup migrations.

use thiserror::Error;

use crate::key::Area;

/// Errors that can occur during item storage operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The area token is unknown or the area is not configured.
    #[error("invalid area: {0}")]
    InvalidArea(String),

    /// The key is not of the form `area:local-key`.
    #[error("malformed key {key:?}: {reason}")]
    MalformedKey { key: String, reason: String },

    /// The backend for an area cannot be reached (missing permission or host capability).
    #[error("backend unavailable for area {area}: {reason}")]
    BackendUnavailable { area: Area, reason: String },

    /// The stored schema version is newer than the item's target version.
    #[error("version downgrade detected for {key}: stored v{stored}, target v{target}")]
    VersionDowngrade { key: String, stored: u32, target: u32 },

    /// A migration step raised, or the migrated value could not be committed.
    #[error("migration of {key} to v{version} failed: {source}")]
    Migration {
        key: String,
        version: u32,
        #[source]
        source: Box<StateError>,
    },

    /// An item was defined with an unusable target version.
    #[error("invalid item version {0}: versions start at 1")]
    InvalidVersion(u32),

    /// Watchers were registered outside a Tokio runtime.
    #[error("no runtime available: {0}")]
    RuntimeUnavailable(String),

    /// The storage configuration is unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for item storage operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Shorthand for a malformed key error.
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error was raised while resolving a key.
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            StateError::InvalidArea(_) | StateError::MalformedKey { .. }
        )
    }

    /// Returns true if this error came out of the migration engine.
    pub fn is_migration_error(&self) -> bool {
        matches!(
            self,
            StateError::VersionDowngrade { .. } | StateError::Migration { .. }
        )
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::SerializationError(err.to_string())
    }
}
