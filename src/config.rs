//! Storage configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::key::Area;
use crate::watch::DEFAULT_WATCH_CAPACITY;

/// Which areas exist and how their change feeds are sized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Areas to configure. Keys in any other area fail to resolve.
    pub areas: Vec<Area>,
    /// Buffered change events per area before slow watchers lag.
    pub watch_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            areas: Area::ALL.to_vec(),
            watch_capacity: DEFAULT_WATCH_CAPACITY,
        }
    }
}

impl StorageConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch_capacity == 0 {
            return Err(StateError::InvalidConfig(
                "watch_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
