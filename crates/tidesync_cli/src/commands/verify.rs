//! Verify command implementation.

use super::read_log;
use std::path::Path;
use tidesync_core::queue::{scan_log, LogDamage, LogRecovery};

/// Runs the verify command.
///
/// Never modifies the log; a damaged tail is reported, not truncated.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying queue log at {}", path.display());
    println!();

    let data = read_log(path)?;
    let scan = scan_log(&data);
    let live = scan.live_operations();

    println!("  Frames checked:  {}", scan.entries.len());
    println!("  Valid bytes:     {} of {}", scan.valid_len, data.len());
    println!("  Live operations: {}", live.len());
    println!();

    match &scan.damage {
        None => {
            println!("✓ Queue log verification passed");
            Ok(())
        }
        Some(LogDamage::TornTail { offset }) => {
            println!(
                "✗ Torn frame at offset {offset} ({} trailing bytes)",
                data.len() as u64 - offset
            );
            println!("  Opening the queue will truncate it.");
            Err("Verification failed".into())
        }
        Some(LogDamage::Corrupt { offset, reason }) => {
            println!("✗ Corrupt frame at offset {offset}: {reason}");
            if let Some(recovery) = LogRecovery::assess(&data, &scan) {
                println!(
                    "  Opening the queue will drop {} bytes: {} intact frames, {} queued operations.",
                    recovery.dropped_bytes, recovery.dropped_frames, recovery.dropped_operations
                );
            }
            Err("Verification failed".into())
        }
    }
}
