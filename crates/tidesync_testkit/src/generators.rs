//! Property-based test generators using proptest.

use crate::fixtures::Note;
use proptest::prelude::*;
use tidesync_core::{RemoteRecord, VersionStamp};

/// Strategy for entity IDs (short lowercase strings, never empty).
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for free text, including the empty string.
pub fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[ -~]{0,24}").expect("Invalid regex")
}

/// Strategy for a local note with id `"n"`.
pub fn note_strategy() -> impl Strategy<Value = Note> {
    (0u64..50, any::<bool>(), text_strategy(), text_strategy()).prop_map(
        |(version, deleted, title, content)| Note {
            id: "n".into(),
            version,
            deleted,
            title,
            content,
            ..Note::default()
        },
    )
}

/// Strategy for a plaintext remote note row with id `"n"`.
pub fn note_row_strategy() -> impl Strategy<Value = RemoteRecord> {
    (0u64..50, any::<bool>(), text_strategy(), text_strategy()).prop_map(
        |(version, deleted, title, content)| {
            RemoteRecord::new()
                .with("id", "n")
                .with("version", version)
                .with("deleted", deleted)
                .with("title", title)
                .with("content", content)
        },
    )
}

/// Strategy for a set of version stamps with distinct IDs drawn from a
/// small pool, so local and remote sets overlap.
pub fn stamps_strategy() -> impl Strategy<Value = Vec<VersionStamp>> {
    prop::collection::btree_map(0u8..12, (0u64..6, any::<bool>()), 0..10).prop_map(|stamps| {
        stamps
            .into_iter()
            .map(|(id, (version, deleted))| VersionStamp {
                id: format!("e{id}"),
                version,
                deleted,
            })
            .collect()
    })
}
