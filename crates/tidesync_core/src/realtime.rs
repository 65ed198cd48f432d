//! Realtime change events pushed by the server.

use crate::record::RemoteRecord;

/// Kind of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated (soft deletes arrive as updates).
    Update,
    /// A row was hard-deleted. Ignored; only soft deletes propagate.
    Delete,
}

/// One change notification from the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    /// Remote table.
    pub table: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// The row after the change (for deletes, whatever the channel sent).
    pub record: RemoteRecord,
}

impl RealtimeEvent {
    /// Creates an insert event.
    pub fn insert(table: impl Into<String>, record: RemoteRecord) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            record,
        }
    }

    /// Creates an update event.
    pub fn update(table: impl Into<String>, record: RemoteRecord) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            record,
        }
    }

    /// Creates a hard-delete event.
    pub fn delete(table: impl Into<String>, record: RemoteRecord) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            record,
        }
    }
}

/// What handling a realtime event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeOutcome {
    /// The event echoed a push of ours and was dropped.
    EchoSuppressed,
    /// The remote version was merged into the local entity.
    Applied {
        /// The entity should be re-pushed under the current key.
        needs_healing: bool,
    },
    /// A new local entity was created from the event.
    Materialized {
        /// The entity should be re-pushed under the current key.
        needs_healing: bool,
    },
    /// The local copy already had this state.
    Unchanged,
    /// The local copy is newer; it was pushed back to correct the remote.
    LocalNewer,
    /// The event was ignored (hard delete).
    Ignored,
    /// The event could not be handled; a `MergeFailed` notification was sent.
    Failed,
}
