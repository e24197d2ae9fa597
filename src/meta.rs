//! Metadata colocated with values.
//!
//! Each value key `k` may have a shadow key `k$` holding a JSON object of
//! metadata fields. The shadow key lives independently of the value: writing
//! the value never touches it, and removing the value only removes it when
//! asked to.
//!
//! # Known race
//!
//! [`set_meta`] and [`remove_meta`] with field names are read-modify-write
//! sequences over two backend calls. They are not atomic against another
//! writer of the same shadow key, whether in this process or another one:
//! concurrent merges race and the last write wins for the whole map.

use serde_json::{Map, Value};
use tracing::warn;

use crate::driver::AreaDriver;
use crate::error::Result;
use crate::key::meta_key;

/// Metadata fields of one value.
pub type Meta = Map<String, Value>;

/// Shape of a loaded shadow key.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaShape {
    Object(Meta),
    NotObject,
}

impl MetaShape {
    /// Classify a stored shadow value.
    pub fn classify(stored: Option<Value>) -> Self {
        match stored {
            Some(Value::Object(fields)) => Self::Object(fields),
            Some(Value::Null) | None => Self::Object(Meta::new()),
            Some(other) => {
                warn!(shape = json_kind(&other), "ignoring non-object metadata");
                Self::NotObject
            }
        }
    }

    /// Anything that is not an object reads as empty metadata.
    pub fn into_meta(self) -> Meta {
        match self {
            Self::Object(fields) => fields,
            Self::NotObject => Meta::new(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Normalize a stored shadow value into metadata.
pub fn normalize(stored: Option<Value>) -> Meta {
    MetaShape::classify(stored).into_meta()
}

/// Merge `fields` into `existing`. `null` fields delete, others overwrite.
pub fn merge(mut existing: Meta, fields: Meta) -> Meta {
    for (name, value) in fields {
        if value.is_null() {
            existing.remove(&name);
        } else {
            existing.insert(name, value);
        }
    }
    existing
}

/// The value to persist for a metadata map; empty maps remove the shadow key.
pub fn stored_form(meta: Meta) -> Value {
    if meta.is_empty() {
        Value::Null
    } else {
        Value::Object(meta)
    }
}

pub async fn get_meta(driver: &AreaDriver, local_key: &str) -> Result<Meta> {
    Ok(normalize(driver.get(&meta_key(local_key)).await?))
}

/// Merge `fields` into the stored metadata of `local_key`.
pub async fn set_meta(driver: &AreaDriver, local_key: &str, fields: Meta) -> Result<()> {
    let shadow = meta_key(local_key);
    let existing = normalize(driver.get(&shadow).await?);
    driver.set(&shadow, stored_form(merge(existing, fields))).await
}

/// Remove all metadata of `local_key`, or only the named fields.
pub async fn remove_meta(driver: &AreaDriver, local_key: &str, fields: Option<&[&str]>) -> Result<()> {
    let shadow = meta_key(local_key);
    let Some(fields) = fields else {
        return driver.remove(&shadow).await;
    };

    let mut existing = normalize(driver.get(&shadow).await?);
    for field in fields {
        existing.remove(*field);
    }
    driver.set(&shadow, stored_form(existing)).await
}
