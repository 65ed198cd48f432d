//! # tidesync testkit
//!
//! Test utilities for tidesync.
//!
//! This crate provides:
//! - [`MemoryStore`], an in-memory [`LocalStore`](tidesync_core::LocalStore)
//! - [`MockBackend`], a scriptable remote that enforces version guards
//! - [`ManualClock`] for deterministic echo-window tests
//! - Fixture entity types (notebook / folder / note) and a ready harness
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidesync_testkit::prelude::*;
//!
//! #[test]
//! fn pushes_new_note() {
//!     let h = TestHarness::new();
//!     let mut note = Note::new("n1", "hello");
//!     h.sync.persist_new(&mut note).unwrap();
//!     assert_eq!(h.remote.row(NOTES, "n1").unwrap().version(), Some(0));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod clock;
pub mod fixtures;
pub mod generators;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::clock::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::store::*;
}

pub use backend::*;
pub use clock::*;
pub use fixtures::*;
pub use generators::*;
pub use store::*;
