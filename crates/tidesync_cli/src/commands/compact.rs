//! Compact command implementation.

use super::read_log;
use std::path::Path;
use tidesync_core::queue::{scan_log, LogEntry};
use tidesync_core::OfflineQueue;
use tidesync_storage::FileBackend;
use tracing::info;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting queue log at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let data = read_log(path)?;
    let scan = scan_log(&data);
    let live = scan.live_operations();

    let mut projected = 0u64;
    for op in &live {
        projected += LogEntry::Enqueue(op.clone()).encode_frame()?.len() as u64;
    }
    let before = data.len() as u64;

    println!("Compaction Analysis:");
    println!("  Frames:          {}", scan.entries.len());
    println!("  Live operations: {}", live.len());
    if let Some(damage) = &scan.damage {
        println!("  Damaged tail at: {}", damage.offset());
    }
    println!();
    println!("  Size before: {before} bytes");
    println!("  Size after:  {projected} bytes");
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        before.saturating_sub(projected),
        if before > 0 {
            (before.saturating_sub(projected) as f64 / before as f64) * 100.0
        } else {
            0.0
        }
    );

    if dry_run {
        return Ok(());
    }
    if projected >= before && scan.damage.is_none() {
        println!();
        println!("No compaction needed - log holds only live operations");
        return Ok(());
    }

    println!();
    println!("Performing compaction...");
    let queue = OfflineQueue::open(Box::new(FileBackend::open(path)?))?;
    let stats = queue.compact()?;
    info!(?stats, "queue log compacted");
    println!("✓ Compaction complete ({} bytes)", stats.bytes_after);

    Ok(())
}
