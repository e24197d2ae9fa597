//! Key routing: namespaced keys, areas and per-area partitioning.
//!
//! Every key addressed through [`Storage`](crate::Storage) has the form
//! `area:local-key`. The key is split at the first `:` only, so local keys
//! may themselves contain colons (`local:a:b` has local key `a:b`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StateError};

/// Delimiter between the area and the local key.
pub const AREA_DELIMITER: char = ':';

/// Suffix appended to a local key to form its metadata shadow key.
pub const META_SUFFIX: &str = "$";

/// An independently backed storage region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    /// Durable, device-local storage.
    Local,
    /// Transient storage cleared when the session ends.
    Session,
    /// Storage synchronized across devices.
    Sync,
    /// Storage provisioned by an administrator.
    Managed,
}

impl Area {
    /// Every known area, in routing order.
    pub const ALL: [Area; 4] = [Area::Local, Area::Session, Area::Sync, Area::Managed];

    /// Stable string name used in keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Session => "session",
            Self::Sync => "sync",
            Self::Managed => "managed",
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Area {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "session" => Ok(Self::Session),
            "sync" => Ok(Self::Sync),
            "managed" => Ok(Self::Managed),
            other => Err(StateError::InvalidArea(other.to_string())),
        }
    }
}

/// A parsed `area:local-key` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub area: Area,
    pub local_key: String,
}

impl StorageKey {
    /// Parse a namespaced key, splitting at the first delimiter.
    pub fn parse(key: &str) -> Result<Self> {
        let (area, local_key) = key
            .split_once(AREA_DELIMITER)
            .ok_or_else(|| StateError::malformed(key, "missing area delimiter ':'"))?;
        let area: Area = area.parse()?;

        if local_key.is_empty() {
            return Err(StateError::malformed(key, "missing local key"));
        }
        if local_key.ends_with(META_SUFFIX) {
            return Err(StateError::malformed(
                key,
                format!("local keys may not end with reserved suffix {META_SUFFIX:?}"),
            ));
        }

        Ok(Self {
            area,
            local_key: local_key.to_string(),
        })
    }

    /// The shadow key holding this key's metadata.
    pub fn meta_key(&self) -> String {
        meta_key(&self.local_key)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.area, AREA_DELIMITER, self.local_key)
    }
}

impl FromStr for StorageKey {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Shadow key for a local key's metadata.
pub fn meta_key(local_key: &str) -> String {
    format!("{local_key}{META_SUFFIX}")
}

/// One entry of a partitioned request.
#[derive(Debug, Clone)]
pub struct Routed<T> {
    /// Position of the entry in the caller's request.
    pub index: usize,
    /// The full namespaced key as supplied by the caller.
    pub key: String,
    pub local_key: String,
    pub payload: T,
}

/// A request grouped by area, remembering the caller's ordering.
#[derive(Debug)]
pub struct Partition<T> {
    groups: BTreeMap<Area, Vec<Routed<T>>>,
    len: usize,
}

impl<T> Partition<T> {
    /// Number of entries in the original request.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Areas touched by this request.
    pub fn areas(&self) -> impl Iterator<Item = Area> + '_ {
        self.groups.keys().copied()
    }

    /// Consume the partition, yielding each area's entries in request order.
    pub fn into_groups(self) -> BTreeMap<Area, Vec<Routed<T>>> {
        self.groups
    }
}

/// Group `(key, payload)` entries by area.
///
/// Every key is parsed up front, so a malformed key fails the whole request
/// before anything is dispatched.
pub fn partition_by_area<T>(entries: impl IntoIterator<Item = (String, T)>) -> Result<Partition<T>> {
    let mut groups: BTreeMap<Area, Vec<Routed<T>>> = BTreeMap::new();
    let mut len = 0;

    for (index, (key, payload)) in entries.into_iter().enumerate() {
        let parsed = StorageKey::parse(&key)?;
        groups.entry(parsed.area).or_default().push(Routed {
            index,
            key,
            local_key: parsed.local_key,
            payload,
        });
        len = index + 1;
    }

    Ok(Partition { groups, len })
}

/// Put per-area results back into the caller's order.
pub fn reassemble<R>(len: usize, results: impl IntoIterator<Item = (usize, R)>) -> Vec<R> {
    let mut slots: Vec<Option<R>> = (0..len).map(|_| None).collect();
    for (index, result) in results {
        slots[index] = Some(result);
    }
    debug_assert!(slots.iter().all(Option::is_some));
    slots.into_iter().flatten().collect()
}
