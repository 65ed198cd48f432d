//! # tidesync storage
//!
//! Append-only byte log backends used to make the offline queue durable.
//!
//! Backends are **opaque byte logs**. They know nothing about queue frames,
//! operations or CBOR; `tidesync_core` owns the log format and only asks the
//! backend to append, read back, truncate a torn tail, or atomically replace
//! the whole log during compaction.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and hosts that do not need restart durability
//! - [`FileBackend`] - Persistent log file using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tidesync_storage::{InMemoryBackend, LogBackend};
//!
//! let mut log = InMemoryBackend::new();
//! log.append(b"frame-1").unwrap();
//! log.append(b"frame-2").unwrap();
//! assert_eq!(log.read_all().unwrap(), b"frame-1frame-2");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::LogBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
