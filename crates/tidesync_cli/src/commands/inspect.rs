//! Inspect command implementation.

use super::read_log;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tidesync_core::queue::{scan_log, LogEntry};
use tidesync_core::OperationType;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Log path.
    pub path: String,
    /// Log size in bytes.
    pub log_size: u64,
    /// Number of valid frames.
    pub frame_count: usize,
    /// Enqueue frames.
    pub enqueue_frames: usize,
    /// Remove frames.
    pub remove_frames: usize,
    /// Retry frames.
    pub retry_frames: usize,
    /// Operations still queued.
    pub live_operations: usize,
    /// Live operations that are tombstones.
    pub tombstones: usize,
    /// Highest retry count among live operations.
    pub max_retry_count: u32,
    /// Enqueue time of the oldest live operation, Unix ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_enqueued_at: Option<u64>,
    /// Offset of a damaged tail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damaged_at: Option<u64>,
    /// Per-table breakdown (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableStats>>,
}

/// Live operations of one table.
#[derive(Debug, Default, Serialize)]
pub struct TableStats {
    /// Remote table name.
    pub table: String,
    /// Live operations.
    pub operations: usize,
    /// Distinct entities.
    pub entities: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_tables: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let data = read_log(path)?;
    let result = inspect(path, &data, show_tables);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn inspect(path: &Path, data: &[u8], show_tables: bool) -> InspectResult {
    let scan = scan_log(data);
    let live = scan.live_operations();

    let mut result = InspectResult {
        path: path.display().to_string(),
        log_size: data.len() as u64,
        frame_count: scan.entries.len(),
        enqueue_frames: 0,
        remove_frames: 0,
        retry_frames: 0,
        live_operations: live.len(),
        tombstones: live
            .iter()
            .filter(|op| op.operation_type == OperationType::Tombstone)
            .count(),
        max_retry_count: live.iter().map(|op| op.retry_count).max().unwrap_or(0),
        oldest_enqueued_at: live.iter().map(|op| op.enqueued_at).min(),
        damaged_at: scan.damage.as_ref().map(|d| d.offset()),
        tables: None,
    };

    for (_, entry) in &scan.entries {
        match entry {
            LogEntry::Enqueue(_) => result.enqueue_frames += 1,
            LogEntry::Remove { .. } => result.remove_frames += 1,
            LogEntry::Retry { .. } => result.retry_frames += 1,
        }
    }

    if show_tables {
        let mut by_table: BTreeMap<&str, (usize, Vec<&str>)> = BTreeMap::new();
        for op in &live {
            let slot = by_table.entry(op.table_name.as_str()).or_default();
            slot.0 += 1;
            if !slot.1.contains(&op.entity_id.as_str()) {
                slot.1.push(op.entity_id.as_str());
            }
        }
        result.tables = Some(
            by_table
                .into_iter()
                .map(|(table, (operations, entities))| TableStats {
                    table: table.to_owned(),
                    operations,
                    entities: entities.len(),
                })
                .collect(),
        );
    }

    result
}

fn print_text_output(result: &InspectResult) {
    println!("Queue log: {}", result.path);
    println!("  Size:            {} bytes", result.log_size);
    println!(
        "  Frames:          {} ({} enqueue, {} remove, {} retry)",
        result.frame_count, result.enqueue_frames, result.remove_frames, result.retry_frames
    );
    println!("  Live operations: {}", result.live_operations);
    println!("  Tombstones:      {}", result.tombstones);
    println!("  Max retries:     {}", result.max_retry_count);
    if let Some(oldest) = result.oldest_enqueued_at {
        println!("  Oldest enqueued: {oldest}");
    }
    if let Some(offset) = result.damaged_at {
        println!("  Damaged tail at: {offset} (run `verify` for details)");
    }

    if let Some(tables) = &result.tables {
        println!();
        println!("Tables:");
        for stats in tables {
            println!(
                "  {:<24} {:>6} ops {:>6} entities",
                stats.table, stats.operations, stats.entities
            );
        }
    }
}
