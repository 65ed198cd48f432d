//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod inspect;
pub mod verify;

use std::path::Path;
use tidesync_storage::{FileBackend, LogBackend};

/// Reads the whole queue log at `path` without modifying it.
pub(crate) fn read_log(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("Queue log not found at {}", path.display()).into());
    }
    let backend = FileBackend::open(path)?;
    Ok(backend.read_all()?)
}
