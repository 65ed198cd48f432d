//! Queued operation type.

use crate::record::RemoteRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a queued operation does remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create or update a live row.
    Upsert,
    /// Write a tombstone (`deleted = true`).
    Tombstone,
}

impl OperationType {
    /// Lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Tombstone => "tombstone",
        }
    }

    /// The operation type that pushes `record`.
    #[must_use]
    pub fn for_record(record: &RemoteRecord) -> Self {
        if record.is_deleted() {
            Self::Tombstone
        } else {
            Self::Upsert
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push that failed transiently and waits for the next queue drain.
///
/// The record is a snapshot taken at enqueue time (encrypted columns already
/// sealed), so a later drain pushes exactly what the failed push would have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Position in the queue, assigned on enqueue. Strictly increasing.
    pub seq: u64,
    /// Upsert or tombstone.
    pub operation_type: OperationType,
    /// Entity ID.
    pub entity_id: String,
    /// Remote table.
    pub table_name: String,
    /// The record to push.
    pub record_snapshot: RemoteRecord,
    /// Enqueue time in Unix milliseconds.
    pub enqueued_at: u64,
    /// How many drains have failed on this operation.
    pub retry_count: u32,
}

impl PendingOperation {
    /// Creates an operation; the queue assigns `seq` on enqueue.
    pub fn new(
        table_name: impl Into<String>,
        entity_id: impl Into<String>,
        record_snapshot: RemoteRecord,
        enqueued_at: u64,
    ) -> Self {
        Self {
            seq: 0,
            operation_type: OperationType::for_record(&record_snapshot),
            entity_id: entity_id.into(),
            table_name: table_name.into(),
            record_snapshot,
            enqueued_at,
            retry_count: 0,
        }
    }

    /// The version carried by the snapshot.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.record_snapshot.version().unwrap_or_default()
    }

    /// Returns true if this operation targets `table`/`entity_id`.
    #[must_use]
    pub fn targets(&self, table: &str, entity_id: &str) -> bool {
        self.table_name == table && self.entity_id == entity_id
    }
}
