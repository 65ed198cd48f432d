//! Dump command implementation.

use super::read_log;
use serde::Serialize;
use std::path::Path;
use tidesync_core::queue::{scan_log, LogEntry};
use tidesync_core::PendingOperation;

/// One frame (or live operation) for output.
#[derive(Debug, Serialize)]
pub struct FrameInfo {
    /// Offset of the frame in the log; absent for `--live` output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Frame type.
    pub entry_type: &'static str,
    /// Sequence number the frame refers to.
    pub seq: u64,
    /// Remote table (enqueue frames only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Entity ID (enqueue frames only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Upsert or tombstone (enqueue frames only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Version carried by the snapshot (enqueue frames only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Retry count (live output only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl FrameInfo {
    fn operation(offset: Option<u64>, op: &PendingOperation) -> Self {
        Self {
            offset,
            entry_type: "ENQUEUE",
            seq: op.seq,
            table: Some(op.table_name.clone()),
            entity_id: Some(op.entity_id.clone()),
            operation: Some(op.operation_type.to_string()),
            version: Some(op.version()),
            retry_count: offset.is_none().then_some(op.retry_count),
        }
    }

    fn marker(offset: u64, entry_type: &'static str, seq: u64) -> Self {
        Self {
            offset: Some(offset),
            entry_type,
            seq,
            table: None,
            entity_id: None,
            operation: None,
            version: None,
            retry_count: None,
        }
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    live: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = read_log(path)?;
    let frames = collect(&data, limit, live);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&frames)?),
        _ => print_text_output(&frames),
    }
    Ok(())
}

fn collect(data: &[u8], limit: Option<usize>, live: bool) -> Vec<FrameInfo> {
    let scan = scan_log(data);
    let max = limit.unwrap_or(usize::MAX);

    if live {
        return scan
            .live_operations()
            .iter()
            .take(max)
            .map(|op| FrameInfo::operation(None, op))
            .collect();
    }

    scan.entries
        .iter()
        .take(max)
        .map(|(offset, entry)| match entry {
            LogEntry::Enqueue(op) => FrameInfo::operation(Some(*offset), op),
            LogEntry::Remove { seq } => FrameInfo::marker(*offset, "REMOVE", *seq),
            LogEntry::Retry { seq } => FrameInfo::marker(*offset, "RETRY", *seq),
        })
        .collect()
}

fn print_text_output(frames: &[FrameInfo]) {
    if frames.is_empty() {
        println!("(empty)");
        return;
    }
    for frame in frames {
        let offset = frame
            .offset
            .map_or_else(|| "-".to_owned(), |o| format!("{o:08x}"));
        print!("{offset} {:<8} seq={}", frame.entry_type, frame.seq);
        if let (Some(table), Some(id)) = (&frame.table, &frame.entity_id) {
            print!(" {table}/{id}");
        }
        if let Some(operation) = &frame.operation {
            print!(" {operation}");
        }
        if let Some(version) = frame.version {
            print!(" v{version}");
        }
        if let Some(retries) = frame.retry_count {
            print!(" retries={retries}");
        }
        println!();
    }
    println!();
    println!("{} frame(s)", frames.len());
}
