//! Durable FIFO queue of pushes that failed transiently.
//!
//! Every mutation of the queue is appended to a [`LogBackend`] as a framed
//! log entry and synced before the call returns, so a queued operation
//! survives a crash or restart. Opening a queue replays the log and cuts it
//! at the first torn or corrupt frame; what was cut is reported through
//! [`OfflineQueue::recovery`]. When the queue drains completely the log is
//! compacted back to empty.

mod log;
mod operation;

pub use log::{
    compute_crc32, frames_after_damage, scan_log, EntryType, LogDamage, LogEntry, LogRecovery,
    LogScan, QUEUE_FORMAT_VERSION, QUEUE_MAGIC,
};
pub use operation::{OperationType, PendingOperation};

use crate::error::SyncResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tidesync_storage::{InMemoryBackend, LogBackend};
use tracing::{debug, info, warn};

/// Result of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
    /// Live operations rewritten.
    pub live_operations: usize,
}

struct QueueInner {
    backend: Box<dyn LogBackend>,
    pending: VecDeque<PendingOperation>,
    next_seq: u64,
}

impl QueueInner {
    fn append(&mut self, entry: &LogEntry) -> SyncResult<()> {
        let frame = entry.encode_frame()?;
        self.backend.append(&frame)?;
        self.backend.sync()?;
        Ok(())
    }

    fn position(&self, seq: u64) -> Option<usize> {
        self.pending.iter().position(|op| op.seq == seq)
    }
}

/// Durable, ordered queue of [`PendingOperation`]s.
///
/// Sequence numbers are assigned on enqueue and strictly increase for as
/// long as the log holds operations, so they order the queue across restarts.
pub struct OfflineQueue {
    inner: Mutex<QueueInner>,
    recovery: Option<LogRecovery>,
}

impl OfflineQueue {
    /// Opens a queue over `backend`, replaying whatever it already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or a damaged tail cannot
    /// be truncated.
    pub fn open(mut backend: Box<dyn LogBackend>) -> SyncResult<Self> {
        let data = backend.read_all()?;
        let scan = scan_log(&data);

        let recovery = LogRecovery::assess(&data, &scan);
        if let Some(recovery) = &recovery {
            warn!(
                offset = recovery.damage.offset(),
                dropped_bytes = recovery.dropped_bytes,
                dropped_frames = recovery.dropped_frames,
                dropped_operations = recovery.dropped_operations,
                damage = ?recovery.damage,
                "offline queue log damaged; truncating to last valid frame"
            );
            backend.truncate(scan.valid_len)?;
        }

        let pending: VecDeque<PendingOperation> = scan.live_operations().into();
        let next_seq = scan.max_seq().map_or(1, |seq| seq + 1);
        info!(pending = pending.len(), next_seq, "offline queue opened");

        Ok(Self {
            inner: Mutex::new(QueueInner {
                backend,
                pending,
                next_seq,
            }),
            recovery,
        })
    }

    /// Creates an empty queue that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                backend: Box::new(InMemoryBackend::new()),
                pending: VecDeque::new(),
                next_seq: 1,
            }),
            recovery: None,
        }
    }

    /// What opening the queue cut from a damaged log, if anything.
    ///
    /// `dropped_operations` counts queued pushes found intact after a
    /// corrupt frame; they are lost and their entities need reconciling.
    pub fn recovery(&self) -> Option<&LogRecovery> {
        self.recovery.as_ref()
    }

    /// Appends `op` and returns its assigned sequence number.
    ///
    /// The operation is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails; the queue is unchanged.
    pub fn enqueue(&self, mut op: PendingOperation) -> SyncResult<u64> {
        let mut inner = self.inner.lock();
        op.seq = inner.next_seq;

        inner.append(&LogEntry::Enqueue(op.clone()))?;
        inner.next_seq += 1;

        debug!(
            seq = op.seq,
            table = %op.table_name,
            entity_id = %op.entity_id,
            operation = %op.operation_type,
            "enqueued"
        );
        let seq = op.seq;
        inner.pending.push_back(op);
        Ok(seq)
    }

    /// Returns the oldest operation without removing it.
    pub fn dequeue_next(&self) -> Option<PendingOperation> {
        self.inner.lock().pending.front().cloned()
    }

    /// Removes the operation with `seq`. Returns false if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails; the queue is unchanged.
    pub fn remove(&self, seq: u64) -> SyncResult<bool> {
        let mut inner = self.inner.lock();
        let Some(index) = inner.position(seq) else {
            return Ok(false);
        };
        inner.append(&LogEntry::Remove { seq })?;
        inner.pending.remove(index);
        Ok(true)
    }

    /// Removes every operation for `table`/`entity_id` at or below
    /// `version`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails; operations removed before
    /// the failure stay removed.
    pub fn remove_superseded(&self, table: &str, entity_id: &str, version: u64) -> SyncResult<usize> {
        let mut inner = self.inner.lock();
        let superseded: Vec<u64> = inner
            .pending
            .iter()
            .filter(|op| op.targets(table, entity_id) && op.version() <= version)
            .map(|op| op.seq)
            .collect();

        for &seq in &superseded {
            inner.append(&LogEntry::Remove { seq })?;
            inner.pending.retain(|op| op.seq != seq);
        }
        if !superseded.is_empty() {
            debug!(table, entity_id, version, removed = superseded.len(), "superseded operations removed");
        }
        Ok(superseded.len())
    }

    /// Increments the retry count of `seq`, returning the new count.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails; the queue is unchanged.
    pub fn mark_retried(&self, seq: u64) -> SyncResult<Option<u32>> {
        let mut inner = self.inner.lock();
        let Some(index) = inner.position(seq) else {
            return Ok(None);
        };
        inner.append(&LogEntry::Retry { seq })?;
        let op = &mut inner.pending[index];
        op.retry_count = op.retry_count.saturating_add(1);
        Ok(Some(op.retry_count))
    }

    /// Returns a copy of every queued operation, oldest first.
    pub fn snapshot(&self) -> Vec<PendingOperation> {
        self.inner.lock().pending.iter().cloned().collect()
    }

    /// Returns true if any operation targets `table`/`entity_id`.
    pub fn contains_entity(&self, table: &str, entity_id: &str) -> bool {
        self.inner
            .lock()
            .pending
            .iter()
            .any(|op| op.targets(table, entity_id))
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn log_size(&self) -> SyncResult<u64> {
        Ok(self.inner.lock().backend.size()?)
    }

    /// Rewrites the log so it holds only the live operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails; the old log stays in place.
    pub fn compact(&self) -> SyncResult<CompactionStats> {
        let mut inner = self.inner.lock();
        let bytes_before = inner.backend.size()?;

        let mut data = Vec::new();
        for op in &inner.pending {
            data.extend(LogEntry::Enqueue(op.clone()).encode_frame()?);
        }
        inner.backend.replace(&data)?;

        let stats = CompactionStats {
            bytes_before,
            bytes_after: data.len() as u64,
            live_operations: inner.pending.len(),
        };
        debug!(?stats, "offline queue compacted");
        Ok(stats)
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OfflineQueue")
            .field("pending", &inner.pending.len())
            .field("next_seq", &inner.next_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RemoteRecord, DELETED_COLUMN, ID_COLUMN, VERSION_COLUMN};

    fn op(id: &str, version: u64) -> PendingOperation {
        let record = RemoteRecord::new()
            .with(ID_COLUMN, id)
            .with(VERSION_COLUMN, version);
        PendingOperation::new("notes", id, record, 1_000)
    }

    fn reopen(log: &InMemoryBackend) -> OfflineQueue {
        OfflineQueue::open(Box::new(log.clone())).unwrap()
    }

    #[test]
    fn fifo_order_and_sequence_numbers() {
        let queue = OfflineQueue::in_memory();
        assert_eq!(queue.enqueue(op("a", 1)).unwrap(), 1);
        assert_eq!(queue.enqueue(op("b", 1)).unwrap(), 2);
        assert_eq!(queue.enqueue(op("a", 2)).unwrap(), 3);

        let ids: Vec<_> = queue.snapshot().into_iter().map(|o| o.entity_id).collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
        assert_eq!(queue.dequeue_next().unwrap().seq, 1);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn remove_and_retry() {
        let queue = OfflineQueue::in_memory();
        let first = queue.enqueue(op("a", 1)).unwrap();
        let second = queue.enqueue(op("b", 1)).unwrap();

        assert_eq!(queue.mark_retried(second).unwrap(), Some(1));
        assert_eq!(queue.mark_retried(second).unwrap(), Some(2));
        assert!(queue.remove(first).unwrap());
        assert!(!queue.remove(first).unwrap());
        assert_eq!(queue.mark_retried(99).unwrap(), None);

        let head = queue.dequeue_next().unwrap();
        assert_eq!(head.seq, second);
        assert_eq!(head.retry_count, 2);
    }

    #[test]
    fn operation_type_follows_snapshot() {
        let live = op("a", 1);
        assert_eq!(live.operation_type, OperationType::Upsert);

        let record = RemoteRecord::new()
            .with(ID_COLUMN, "a")
            .with(VERSION_COLUMN, 2)
            .with(DELETED_COLUMN, true);
        let tombstone = PendingOperation::new("notes", "a", record, 0);
        assert_eq!(tombstone.operation_type, OperationType::Tombstone);
        assert_eq!(tombstone.version(), 2);
    }

    #[test]
    fn state_survives_reopen() {
        let log = InMemoryBackend::new();
        {
            let queue = reopen(&log);
            queue.enqueue(op("a", 1)).unwrap();
            let b = queue.enqueue(op("b", 1)).unwrap();
            queue.enqueue(op("c", 1)).unwrap();
            queue.mark_retried(b).unwrap();
            queue.remove(1).unwrap();
        }

        let queue = reopen(&log);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].entity_id, "b");
        assert_eq!(snapshot[0].retry_count, 1);
        assert_eq!(snapshot[1].entity_id, "c");

        assert_eq!(queue.enqueue(op("d", 1)).unwrap(), 4);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let log = InMemoryBackend::new();
        {
            let queue = reopen(&log);
            queue.enqueue(op("a", 1)).unwrap();
        }
        let good_len = log.data().len();
        let mut torn = log.clone();
        let frame = LogEntry::Enqueue(op("b", 1)).encode_frame().unwrap();
        torn.append(&frame[..frame.len() / 2]).unwrap();

        let queue = reopen(&log);
        assert_eq!(queue.len(), 1);
        assert_eq!(log.data().len(), good_len);

        queue.enqueue(op("c", 1)).unwrap();
        assert_eq!(reopen(&log).len(), 2);
    }

    #[test]
    fn compaction_keeps_live_operations() {
        let log = InMemoryBackend::new();
        let queue = reopen(&log);
        for i in 0..10 {
            queue.enqueue(op(&format!("n{i}"), 1)).unwrap();
        }
        for seq in 1..=8 {
            queue.remove(seq).unwrap();
        }

        let stats = queue.compact().unwrap();
        assert_eq!(stats.live_operations, 2);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(queue.log_size().unwrap(), stats.bytes_after);

        let reopened = reopen(&log);
        let ids: Vec<_> = reopened.snapshot().into_iter().map(|o| o.seq).collect();
        assert_eq!(ids, vec![9, 10]);
        assert_eq!(reopened.enqueue(op("next", 1)).unwrap(), 11);
    }

    #[test]
    fn empty_compaction_clears_log() {
        let log = InMemoryBackend::new();
        let queue = reopen(&log);
        let seq = queue.enqueue(op("a", 1)).unwrap();
        queue.remove(seq).unwrap();

        queue.compact().unwrap();
        assert!(log.data().is_empty());
    }

    #[test]
    fn remove_superseded_keeps_newer_and_unrelated_operations() {
        let log = InMemoryBackend::new();
        let queue = reopen(&log);
        queue.enqueue(op("a", 1)).unwrap();
        queue.enqueue(op("b", 1)).unwrap();
        queue.enqueue(op("a", 2)).unwrap();
        queue.enqueue(op("a", 3)).unwrap();

        assert_eq!(queue.remove_superseded("notes", "a", 2).unwrap(), 2);
        assert_eq!(queue.remove_superseded("folders", "a", 9).unwrap(), 0);

        let remaining: Vec<_> = reopen(&log).snapshot().into_iter().map(|o| o.seq).collect();
        assert_eq!(remaining, vec![2, 4]);
    }

    #[test]
    fn recovery_is_reported_for_damaged_logs_only() {
        let log = InMemoryBackend::new();
        reopen(&log).enqueue(op("a", 1)).unwrap();
        assert!(reopen(&log).recovery().is_none());

        let mut torn = log.clone();
        torn.append(b"TSQL").unwrap();
        let queue = reopen(&log);
        let recovery = queue.recovery().unwrap();
        assert_eq!(recovery.dropped_bytes, 4);
        assert_eq!(recovery.dropped_operations, 0);
        assert!(OfflineQueue::in_memory().recovery().is_none());
    }

    #[test]
    fn contains_entity() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue(op("a", 1)).unwrap();
        assert!(queue.contains_entity("notes", "a"));
        assert!(!queue.contains_entity("notes", "b"));
        assert!(!queue.contains_entity("folders", "a"));
    }
}
