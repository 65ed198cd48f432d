//! Remote record representation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Column holding the entity ID.
pub const ID_COLUMN: &str = "id";
/// Column holding the entity version.
pub const VERSION_COLUMN: &str = "version";
/// Column holding the tombstone flag.
pub const DELETED_COLUMN: &str = "deleted";
/// Column holding the last-modified time in Unix milliseconds.
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// A flat column-name to value map, as sent to and received from the backend.
///
/// Serializes as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord {
    columns: Map<String, Value>,
}

impl RemoteRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Sets a column, returning the previous value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.columns.insert(column.into(), value.into())
    }

    /// Removes a column.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.columns.remove(column)
    }

    /// Returns a column value.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Returns true if the column is present (even if null).
    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Iterates over all columns.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the record has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The `id` column, if it is a string.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get(ID_COLUMN).and_then(Value::as_str)
    }

    /// The `version` column, if it is a non-negative integer.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.get(VERSION_COLUMN).and_then(Value::as_u64)
    }

    /// The `deleted` column. Missing or null reads as live.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.get(DELETED_COLUMN)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `updated_at` column, if present.
    #[must_use]
    pub fn updated_at(&self) -> Option<u64> {
        self.get(UPDATED_AT_COLUMN).and_then(Value::as_u64)
    }

    /// Consumes the record, returning the underlying map.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.columns
    }
}

impl From<Map<String, Value>> for RemoteRecord {
    fn from(columns: Map<String, Value>) -> Self {
        Self { columns }
    }
}

/// The `(id, version, deleted)` projection used for cheap version comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStamp {
    /// Entity ID.
    pub id: String,
    /// Version.
    pub version: u64,
    /// Tombstone flag.
    pub deleted: bool,
}

impl VersionStamp {
    /// Extracts the projection from a record.
    ///
    /// Returns `None` if `id` or `version` is missing.
    #[must_use]
    pub fn from_record(record: &RemoteRecord) -> Option<Self> {
        Some(Self {
            id: record.id()?.to_owned(),
            version: record.version()?,
            deleted: record.is_deleted(),
        })
    }

    /// Builds a projection-only record, e.g. to adopt a tombstone.
    #[must_use]
    pub fn to_record(&self) -> RemoteRecord {
        RemoteRecord::new()
            .with(ID_COLUMN, self.id.clone())
            .with(VERSION_COLUMN, self.version)
            .with(DELETED_COLUMN, self.deleted)
    }
}

/// Returns true if a value counts as empty for `reject_if_empty` fields:
/// null, an empty string, an empty array or an empty object.
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
