//! Log backend trait definition.

use crate::error::StorageResult;

/// A durable, append-only byte log.
///
/// # Invariants
///
/// - `append` writes at the current end and returns the offset it wrote at
/// - `read_all` returns every byte appended since the last `replace`/`truncate`
/// - `replace` is atomic: after a crash the log holds either the old or the new contents
/// - Backends must be `Send + Sync`; callers serialize mutation through `&mut self`
pub trait LogBackend: Send + Sync {
    /// Reads the entire log.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends `data` to the end of the log and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the current log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Forces appended data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the log back to `new_size` bytes.
    ///
    /// Used to drop a torn tail frame found during replay.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is larger than the log or on I/O failure.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole log with `data`.
    ///
    /// Used by compaction.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure. On error the previous contents remain intact.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
