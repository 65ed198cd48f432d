//! On-disk format of the offline queue.
//!
//! The queue is an append-only log of frames:
//!
//! ```text
//! | magic "TSQL" (4) | version u16 LE | type u8 | len u32 LE | CBOR payload | crc32 u32 LE |
//! ```
//!
//! The CRC covers the header and payload. Replaying the log in order
//! reconstructs the live queue; a short or corrupt frame marks the end of
//! the usable log.

use crate::error::{SyncError, SyncResult};
use crate::queue::operation::PendingOperation;
use std::collections::BTreeMap;

/// Magic bytes identifying a queue frame.
pub const QUEUE_MAGIC: [u8; 4] = *b"TSQL";

/// Current queue log format version.
pub const QUEUE_FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Type byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// A new pending operation.
    Enqueue = 1,
    /// An operation left the queue.
    Remove = 2,
    /// An operation's retry count went up by one.
    Retry = 3,
}

impl EntryType {
    /// Converts a byte to an entry type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Enqueue),
            2 => Some(Self::Remove),
            3 => Some(Self::Retry),
            _ => None,
        }
    }

    /// Converts the entry type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One logical change to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// Append an operation.
    Enqueue(PendingOperation),
    /// Drop the operation with this sequence number.
    Remove {
        /// Sequence number.
        seq: u64,
    },
    /// Increment the retry count of the operation with this sequence number.
    Retry {
        /// Sequence number.
        seq: u64,
    },
}

impl LogEntry {
    /// The frame type byte for this entry.
    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Enqueue(_) => EntryType::Enqueue,
            Self::Remove { .. } => EntryType::Remove,
            Self::Retry { .. } => EntryType::Retry,
        }
    }

    /// Serializes the payload to CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueCodec`] if serialization fails.
    pub fn encode_payload(&self) -> SyncResult<Vec<u8>> {
        let mut buf = Vec::new();
        let result = match self {
            Self::Enqueue(op) => ciborium::into_writer(op, &mut buf),
            Self::Remove { seq } | Self::Retry { seq } => ciborium::into_writer(seq, &mut buf),
        };
        result.map_err(|e| SyncError::QueueCodec(e.to_string()))?;
        Ok(buf)
    }

    /// Deserializes a payload of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueCodec`] if the payload is not valid CBOR
    /// for that type.
    pub fn decode_payload(entry_type: EntryType, payload: &[u8]) -> SyncResult<Self> {
        let codec = |e: ciborium::de::Error<std::io::Error>| SyncError::QueueCodec(e.to_string());
        Ok(match entry_type {
            EntryType::Enqueue => Self::Enqueue(ciborium::from_reader(payload).map_err(codec)?),
            EntryType::Remove => Self::Remove {
                seq: ciborium::from_reader(payload).map_err(codec)?,
            },
            EntryType::Retry => Self::Retry {
                seq: ciborium::from_reader(payload).map_err(codec)?,
            },
        })
    }

    /// Encodes the entry as a complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueCodec`] if the payload cannot be encoded or
    /// exceeds 4 GiB.
    pub fn encode_frame(&self) -> SyncResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SyncError::QueueCodec("queue frame payload too large".into()))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&QUEUE_MAGIC);
        frame.extend_from_slice(&QUEUE_FORMAT_VERSION.to_le_bytes());
        frame.push(self.entry_type().as_byte());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Why a scan stopped before the end of the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDamage {
    /// The last frame is incomplete, as after a crash mid-append.
    TornTail {
        /// Offset of the incomplete frame.
        offset: u64,
    },
    /// A frame failed validation.
    Corrupt {
        /// Offset of the bad frame.
        offset: u64,
        /// What failed.
        reason: String,
    },
}

impl LogDamage {
    /// Offset where the usable log ends.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::TornTail { offset } | Self::Corrupt { offset, .. } => *offset,
        }
    }
}

/// Result of scanning a queue log.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Decoded entries with their frame offsets.
    pub entries: Vec<(u64, LogEntry)>,
    /// Length of the valid prefix in bytes.
    pub valid_len: u64,
    /// Set if the scan stopped early.
    pub damage: Option<LogDamage>,
}

impl LogScan {
    /// Replays the entries into the live queue, in sequence order.
    ///
    /// `Remove`/`Retry` for unknown sequence numbers are ignored.
    #[must_use]
    pub fn live_operations(&self) -> Vec<PendingOperation> {
        let mut live: BTreeMap<u64, PendingOperation> = BTreeMap::new();
        for (_, entry) in &self.entries {
            match entry {
                LogEntry::Enqueue(op) => {
                    live.insert(op.seq, op.clone());
                }
                LogEntry::Remove { seq } => {
                    live.remove(seq);
                }
                LogEntry::Retry { seq } => {
                    if let Some(op) = live.get_mut(seq) {
                        op.retry_count = op.retry_count.saturating_add(1);
                    }
                }
            }
        }
        live.into_values().collect()
    }

    /// Highest sequence number ever enqueued, live or not.
    #[must_use]
    pub fn max_seq(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| match entry {
                LogEntry::Enqueue(op) => Some(op.seq),
                _ => None,
            })
            .max()
    }
}

/// Scans `data` frame by frame, stopping at the first incomplete or invalid frame.
#[must_use]
pub fn scan_log(data: &[u8]) -> LogScan {
    let mut scan = LogScan::default();
    let mut pos = 0usize;

    while pos < data.len() {
        match read_frame(&data[pos..], pos as u64) {
            Ok((entry, frame_len)) => {
                scan.entries.push((pos as u64, entry));
                pos += frame_len;
            }
            Err(damage) => {
                scan.damage = Some(damage);
                break;
            }
        }
    }

    scan.valid_len = pos as u64;
    scan
}

/// What a damaged log loses when it is truncated to its valid prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecovery {
    /// Where the usable log ended.
    pub damage: LogDamage,
    /// Bytes cut off.
    pub dropped_bytes: u64,
    /// Intact frames found after the damage and cut off with it.
    pub dropped_frames: usize,
    /// Operations enqueued by those frames and not removed again within them.
    pub dropped_operations: usize,
}

impl LogRecovery {
    /// Summarizes what truncating `data` to `scan.valid_len` discards.
    /// Returns `None` for an undamaged scan.
    #[must_use]
    pub fn assess(data: &[u8], scan: &LogScan) -> Option<Self> {
        let damage = scan.damage.clone()?;
        let lost = frames_after_damage(data, &damage);

        let mut enqueued: Vec<u64> = Vec::new();
        for entry in &lost {
            match entry {
                LogEntry::Enqueue(op) => enqueued.push(op.seq),
                LogEntry::Remove { seq } => enqueued.retain(|s| s != seq),
                LogEntry::Retry { .. } => {}
            }
        }

        Some(Self {
            dropped_bytes: (data.len() as u64).saturating_sub(scan.valid_len),
            dropped_frames: lost.len(),
            dropped_operations: enqueued.len(),
            damage,
        })
    }
}

/// Decodes the intact frames that follow a damaged one, resynchronizing on
/// the frame magic. A torn tail has nothing after it.
#[must_use]
pub fn frames_after_damage(data: &[u8], damage: &LogDamage) -> Vec<LogEntry> {
    let LogDamage::Corrupt { offset, .. } = damage else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    let mut pos = usize::try_from(*offset).map_or(data.len(), |offset| offset + 1);
    while pos < data.len() {
        let Some(found) = data[pos..]
            .windows(QUEUE_MAGIC.len())
            .position(|window| window == QUEUE_MAGIC)
        else {
            break;
        };
        let start = pos + found;
        match read_frame(&data[start..], start as u64) {
            Ok((entry, frame_len)) => {
                entries.push(entry);
                pos = start + frame_len;
            }
            Err(_) => pos = start + 1,
        }
    }
    entries
}

fn read_frame(data: &[u8], offset: u64) -> Result<(LogEntry, usize), LogDamage> {
    if data.len() < HEADER_SIZE {
        return Err(LogDamage::TornTail { offset });
    }

    let header = &data[..HEADER_SIZE];
    let corrupt = |reason: String| LogDamage::Corrupt { offset, reason };

    if header[0..4] != QUEUE_MAGIC {
        return Err(corrupt("invalid magic".into()));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > QUEUE_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }

    let type_byte = header[6];
    let entry_type =
        EntryType::from_byte(type_byte).ok_or_else(|| corrupt(format!("unknown entry type {type_byte}")))?;

    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
    if data.len() < total_len {
        return Err(LogDamage::TornTail { offset });
    }

    let payload_end = HEADER_SIZE + payload_len;
    let stored_crc = u32::from_le_bytes([
        data[payload_end],
        data[payload_end + 1],
        data[payload_end + 2],
        data[payload_end + 3],
    ]);
    let computed_crc = compute_crc32(&data[..payload_end]);
    if stored_crc != computed_crc {
        return Err(corrupt(format!(
            "checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let entry = LogEntry::decode_payload(entry_type, &data[HEADER_SIZE..payload_end])
        .map_err(|e| corrupt(e.to_string()))?;
    Ok((entry, total_len))
}

/// Computes the CRC-32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RemoteRecord, ID_COLUMN, VERSION_COLUMN};

    fn op(seq: u64, id: &str) -> PendingOperation {
        let record = RemoteRecord::new()
            .with(ID_COLUMN, id)
            .with(VERSION_COLUMN, 2)
            .with("title", "draft");
        let mut op = PendingOperation::new("notes", id, record, 1_700_000_000_000);
        op.seq = seq;
        op
    }

    fn log_of(entries: &[LogEntry]) -> Vec<u8> {
        entries
            .iter()
            .flat_map(|e| e.encode_frame().unwrap())
            .collect()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn entry_type_bytes() {
        for t in [EntryType::Enqueue, EntryType::Remove, EntryType::Retry] {
            assert_eq!(EntryType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(EntryType::from_byte(0), None);
    }

    #[test]
    fn frame_layout() {
        let frame = LogEntry::Remove { seq: 9 }.encode_frame().unwrap();
        assert_eq!(&frame[0..4], b"TSQL");
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), QUEUE_FORMAT_VERSION);
        assert_eq!(frame[6], EntryType::Remove.as_byte());
        let len = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]) as usize;
        assert_eq!(frame.len(), HEADER_SIZE + len + CRC_SIZE);
    }

    #[test]
    fn scan_replays_entries() {
        let data = log_of(&[
            LogEntry::Enqueue(op(1, "a")),
            LogEntry::Enqueue(op(2, "b")),
            LogEntry::Retry { seq: 2 },
            LogEntry::Remove { seq: 1 },
        ]);
        let scan = scan_log(&data);

        assert!(scan.damage.is_none());
        assert_eq!(scan.valid_len, data.len() as u64);
        assert_eq!(scan.entries.len(), 4);
        assert_eq!(scan.max_seq(), Some(2));

        let live = scan.live_operations();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].entity_id, "b");
        assert_eq!(live[0].retry_count, 1);
        assert_eq!(live[0].record_snapshot.get("title"), Some(&"draft".into()));
    }

    #[test]
    fn torn_tail_is_reported() {
        let mut data = log_of(&[LogEntry::Enqueue(op(1, "a"))]);
        let good = data.len();
        let second = LogEntry::Enqueue(op(2, "b")).encode_frame().unwrap();
        data.extend_from_slice(&second[..second.len() - 3]);

        let scan = scan_log(&data);
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.valid_len, good as u64);
        assert_eq!(scan.damage, Some(LogDamage::TornTail { offset: good as u64 }));
    }

    #[test]
    fn corrupt_frame_stops_scan() {
        let mut data = log_of(&[LogEntry::Enqueue(op(1, "a")), LogEntry::Enqueue(op(2, "b"))]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let scan = scan_log(&data);
        assert_eq!(scan.entries.len(), 1);
        assert!(matches!(scan.damage, Some(LogDamage::Corrupt { .. })));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let scan = scan_log(b"NOPE-this-is-not-a-queue-log");
        assert!(scan.entries.is_empty());
        assert_eq!(scan.valid_len, 0);
        assert!(matches!(scan.damage, Some(LogDamage::Corrupt { offset: 0, .. })));
    }

    #[test]
    fn recovery_counts_what_follows_a_corrupt_frame() {
        let first = LogEntry::Enqueue(op(1, "a")).encode_frame().unwrap();
        let mut second = LogEntry::Enqueue(op(2, "b")).encode_frame().unwrap();
        let last = second.len() - 1;
        second[last] ^= 0xFF;
        let rest = log_of(&[
            LogEntry::Enqueue(op(3, "c")),
            LogEntry::Enqueue(op(4, "d")),
            LogEntry::Remove { seq: 4 },
        ]);
        let data = [first.as_slice(), second.as_slice(), rest.as_slice()].concat();

        let scan = scan_log(&data);
        let recovery = LogRecovery::assess(&data, &scan).unwrap();

        assert_eq!(recovery.damage.offset(), first.len() as u64);
        assert_eq!(recovery.dropped_bytes, (second.len() + rest.len()) as u64);
        assert_eq!(recovery.dropped_frames, 3);
        assert_eq!(recovery.dropped_operations, 1);
    }

    #[test]
    fn torn_tail_recovery_drops_no_frames() {
        let mut data = log_of(&[LogEntry::Enqueue(op(1, "a"))]);
        data.extend_from_slice(b"TSQL\x01");

        let scan = scan_log(&data);
        let recovery = LogRecovery::assess(&data, &scan).unwrap();
        assert_eq!(recovery.dropped_bytes, 5);
        assert_eq!(recovery.dropped_frames, 0);
        assert_eq!(recovery.dropped_operations, 0);

        let clean = log_of(&[LogEntry::Enqueue(op(1, "a"))]);
        assert!(LogRecovery::assess(&clean, &scan_log(&clean)).is_none());
    }

    #[test]
    fn unknown_sequence_numbers_are_ignored() {
        let data = log_of(&[LogEntry::Remove { seq: 42 }, LogEntry::Retry { seq: 7 }]);
        assert!(scan_log(&data).live_operations().is_empty());
    }
}
