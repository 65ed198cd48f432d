//! Remote backend abstraction.
//!
//! The engine talks to the server through a narrow, synchronous interface:
//! upsert a row, optionally upsert a batch, and select rows with a simple
//! filter. Hosts wrap their HTTP/database client in a [`RemoteBackend`] and
//! report failures as [`BackendError`]s; the engine classifies them into
//! transient and permanent [`SyncError`](crate::SyncError)s.

use crate::record::{RemoteRecord, ID_COLUMN};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// A failure reported by the remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The request never reached the server or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("status {status}: {message}")]
    Status {
        /// HTTP-style status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The server's version guard rejected the write because the stored row
    /// is newer than (or conflicts with) the incoming version.
    #[error("version conflict (remote version {remote_version:?})")]
    VersionConflict {
        /// Stored version, if the server reports it.
        remote_version: Option<u64>,
    },

    /// The server refused to change an immutable column.
    #[error("immutable column {column}")]
    ImmutableField {
        /// Column name.
        column: String,
    },

    /// The server already stores this exact version.
    #[error("version {version} already stored")]
    SameVersion {
        /// The shared version.
        version: u64,
    },
}

/// Which columns a select should return.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Columns {
    /// Every column.
    #[default]
    All,
    /// Only the named columns.
    Only(Vec<String>),
}

impl Columns {
    /// Selects the named columns.
    pub fn only<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(columns.into_iter().map(Into::into).collect())
    }

    /// Returns true if `column` is included.
    #[must_use]
    pub fn includes(&self, column: &str) -> bool {
        match self {
            Columns::All => true,
            Columns::Only(columns) => columns.iter().any(|c| c == column),
        }
    }
}

/// A single filter condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
}

/// A conjunction of conditions. An empty filter matches every row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Matches every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality condition.
    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column.into(), value.into()));
        self
    }

    /// Adds an `IN` condition.
    #[must_use]
    pub fn any_of<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.conditions.push(Condition::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Filter on `id IN (ids)`.
    #[must_use]
    pub fn ids(ids: &[String]) -> Self {
        Self::all().any_of(ID_COLUMN, ids.iter().cloned())
    }

    /// The conditions, in insertion order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Evaluates the filter against a record. Backends that filter
    /// client-side can use this directly.
    #[must_use]
    pub fn matches(&self, record: &RemoteRecord) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(column, value) => record.get(column) == Some(value),
            Condition::In(column, values) => record
                .get(column)
                .is_some_and(|actual| values.contains(actual)),
        })
    }
}

/// The remote table store.
///
/// # Contract
///
/// - `upsert` inserts or updates a row keyed by `id`. Servers are expected to
///   guard writes with the `version` column and reject stale or duplicate
///   versions with [`BackendError::VersionConflict`] or
///   [`BackendError::SameVersion`].
/// - A successful call returns the HTTP-style status; anything outside
///   `200..300` is treated like a [`BackendError::Status`].
/// - Implementations must be `Send + Sync`; the engine may call them from
///   several threads for distinct entities.
pub trait RemoteBackend: Send + Sync {
    /// Inserts or updates a single row.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] describing why the write failed.
    fn upsert(&self, table: &str, record: &RemoteRecord) -> Result<u16, BackendError>;

    /// Whether [`upsert_batch`](Self::upsert_batch) is a real bulk call.
    fn supports_batch_upsert(&self) -> bool {
        false
    }

    /// Upserts several rows, returning a result per row in input order.
    ///
    /// The outer error means the whole call failed; inner errors are per row.
    /// The default calls [`upsert`](Self::upsert) once per record.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the batch as a whole failed.
    fn upsert_batch(
        &self,
        table: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<Result<u16, BackendError>>, BackendError> {
        Ok(records.iter().map(|r| self.upsert(table, r)).collect())
    }

    /// Selects rows matching `filter`, returning only `columns`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] if the read failed.
    fn select(
        &self,
        table: &str,
        columns: &Columns,
        filter: &Filter,
    ) -> Result<Vec<RemoteRecord>, BackendError>;
}

impl<B: RemoteBackend + ?Sized> RemoteBackend for Arc<B> {
    fn upsert(&self, table: &str, record: &RemoteRecord) -> Result<u16, BackendError> {
        (**self).upsert(table, record)
    }

    fn supports_batch_upsert(&self) -> bool {
        (**self).supports_batch_upsert()
    }

    fn upsert_batch(
        &self,
        table: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<Result<u16, BackendError>>, BackendError> {
        (**self).upsert_batch(table, records)
    }

    fn select(
        &self,
        table: &str,
        columns: &Columns,
        filter: &Filter,
    ) -> Result<Vec<RemoteRecord>, BackendError> {
        (**self).select(table, columns, filter)
    }
}

pub(crate) fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::all().matches(&RemoteRecord::new()));
    }

    #[test]
    fn eq_and_in_conditions() {
        let record = RemoteRecord::new().with(ID_COLUMN, "a").with("folder_id", "f1");

        assert!(Filter::all().eq("folder_id", "f1").matches(&record));
        assert!(!Filter::all().eq("folder_id", "f2").matches(&record));
        assert!(Filter::ids(&["b".to_string(), "a".to_string()]).matches(&record));
        assert!(!Filter::ids(&["b".to_string()]).matches(&record));
        assert!(!Filter::all().eq("missing", json!(null)).matches(&record));
    }

    #[test]
    fn column_selection() {
        let columns = Columns::only(["id", "version"]);
        assert!(columns.includes("id"));
        assert!(!columns.includes("title"));
        assert!(Columns::All.includes("title"));
    }
}
