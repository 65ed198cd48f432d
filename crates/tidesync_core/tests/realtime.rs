//! Realtime event handling: echo suppression, merge, materialize, healing.

use std::time::Duration;
use tidesync_core::{
    EncryptionKey, EncryptionService, Notification, PersistOutcome, RealtimeEvent,
    RealtimeOutcome, RemoteRecord, CIPHERTEXT_PREFIX,
};
use tidesync_testkit::prelude::*;

#[test]
fn own_push_is_suppressed_until_the_window_closes() {
    let h = TestHarness::new();
    let mut note = Note::new("n1", "mine").with_content("body");
    h.sync.persist_new(&mut note).unwrap();

    let echo = RealtimeEvent::update(NOTES, h.remote.row(NOTES, "n1").unwrap());
    assert_eq!(h.sync.handle_realtime_event(&echo), RealtimeOutcome::EchoSuppressed);

    h.clock.advance(Duration::from_secs(6));
    let rx = h.sync.subscribe();
    let edit = RealtimeEvent::update(NOTES, note_row("n1", 1, "server edit"));

    assert_eq!(
        h.sync.handle_realtime_event(&edit),
        RealtimeOutcome::Applied {
            needs_healing: false
        }
    );
    let local = h.local.get_as::<Note>(NOTES, "n1").unwrap();
    assert_eq!(local.version, 1);
    assert_eq!(local.title, "server edit");
    assert_eq!(local.content, "body");
    assert_eq!(
        rx.try_recv().unwrap(),
        Notification::EntityChanged {
            table: NOTES.into(),
            entity_id: "n1".into()
        }
    );
}

#[test]
fn unknown_entity_is_materialized() {
    let h = TestHarness::new();
    let event = RealtimeEvent::insert(NOTES, note_row("x", 2, "from elsewhere"));

    assert_eq!(
        h.sync.handle_realtime_event(&event),
        RealtimeOutcome::Materialized {
            needs_healing: false
        }
    );
    let note = h.local.get_as::<Note>(NOTES, "x").unwrap();
    assert_eq!(note.version, 2);
    assert_eq!(note.title, "from elsewhere");
}

#[test]
fn plaintext_secret_is_flagged_and_healed() {
    let h = TestHarness::new();
    let rx = h.sync.subscribe();
    let row = note_row("x", 2, "legacy").with("secret", "plain pin");
    h.remote.insert_row(NOTES, row.clone());

    let outcome = h.sync.handle_realtime_event(&RealtimeEvent::insert(NOTES, row));
    assert_eq!(
        outcome,
        RealtimeOutcome::Materialized {
            needs_healing: true
        }
    );
    let notes: Vec<_> = rx.try_iter().collect();
    assert!(notes
        .iter()
        .any(|n| matches!(n, Notification::NeedsHealing { entity_id, .. } if entity_id == "x")));

    assert_eq!(h.sync.heal(NOTES, "x").unwrap(), PersistOutcome::Synced);

    let healed = h.remote.row(NOTES, "x").unwrap();
    assert_eq!(healed.version(), Some(3));
    let sealed = healed.get("secret").and_then(|v| v.as_str()).unwrap();
    assert!(sealed.starts_with(CIPHERTEXT_PREFIX));
    let opened = EncryptionService::new(test_key()).decrypt("secret", sealed).unwrap();
    assert_eq!(opened.value, "plain pin");
}

#[test]
fn heal_of_unknown_entity_fails() {
    let h = TestHarness::new();
    assert!(h.sync.heal(NOTES, "ghost").is_err());
}

#[test]
fn stale_event_pushes_local_copy_back() {
    let h = TestHarness::new();
    h.local.put(
        NOTES,
        Note {
            version: 5,
            ..Note::new("n1", "local")
        },
    );
    h.remote.insert_row(NOTES, note_row("n1", 3, "stale"));

    let event = RealtimeEvent::update(NOTES, note_row("n1", 3, "stale"));
    assert_eq!(h.sync.handle_realtime_event(&event), RealtimeOutcome::LocalNewer);

    let row = h.remote.row(NOTES, "n1").unwrap();
    assert_eq!(row.version(), Some(5));
    assert_eq!(row.get("title").and_then(|v| v.as_str()), Some("local"));
    assert_eq!(h.local.get_as::<Note>(NOTES, "n1").unwrap().title, "local");
}

#[test]
fn same_version_event_changes_nothing() {
    let h = TestHarness::new();
    h.local.put(
        NOTES,
        Note {
            version: 3,
            ..Note::new("n1", "local")
        },
    );
    let event = RealtimeEvent::update(NOTES, note_row("n1", 3, "other"));

    assert_eq!(h.sync.handle_realtime_event(&event), RealtimeOutcome::Unchanged);
    assert_eq!(h.local.get_as::<Note>(NOTES, "n1").unwrap().title, "local");
    assert_eq!(h.remote.upsert_count(), 0);
}

#[test]
fn hard_delete_is_ignored() {
    let h = TestHarness::new();
    h.local.put(NOTES, Note::new("n1", "keep me"));

    let event = RealtimeEvent::delete(NOTES, RemoteRecord::new().with("id", "n1"));
    assert_eq!(h.sync.handle_realtime_event(&event), RealtimeOutcome::Ignored);
    assert!(h.local.get_as::<Note>(NOTES, "n1").is_some());
}

#[test]
fn bad_events_fail_with_a_notification() {
    let h = TestHarness::new();
    let rx = h.sync.subscribe();

    let anonymous = RealtimeEvent::update(NOTES, RemoteRecord::new().with("version", 1u64));
    assert_eq!(h.sync.handle_realtime_event(&anonymous), RealtimeOutcome::Failed);

    let unknown = RealtimeEvent::update("widgets", note_row("w1", 1, "t"));
    assert_eq!(h.sync.handle_realtime_event(&unknown), RealtimeOutcome::Failed);

    let notes: Vec<_> = rx.try_iter().collect();
    assert_eq!(notes.len(), 2);
    assert!(matches!(
        &notes[0],
        Notification::MergeFailed { entity_id: None, .. }
    ));
    assert_eq!(notes[1].table(), "widgets");
    assert_eq!(notes[1].entity_id(), Some("w1"));
}

#[test]
fn undecryptable_event_leaves_local_copy_alone() {
    let h = TestHarness::new();
    h.local.put(
        NOTES,
        Note {
            version: 1,
            ..Note::new("n1", "before")
        },
    );
    let foreign = EncryptionService::new(EncryptionKey::generate());
    let sealed = foreign.encrypt("secret", &"x".into()).unwrap();

    let event = RealtimeEvent::update(NOTES, note_row("n1", 2, "after").with("secret", sealed));
    assert_eq!(h.sync.handle_realtime_event(&event), RealtimeOutcome::Failed);

    let local = h.local.get_as::<Note>(NOTES, "n1").unwrap();
    assert_eq!(local.version, 1);
    assert_eq!(local.title, "before");
}
