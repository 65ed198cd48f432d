//! Outbound record building, echo marking and failure classification.

use std::sync::Arc;
use std::time::Duration;
use tidesync_core::{
    BackendError, EchoTracker, EncryptionService, PushEngine, SyncError, SyncableEntity,
    CIPHERTEXT_PREFIX,
};
use tidesync_testkit::prelude::*;

struct Rig {
    push: PushEngine<MockBackend>,
    remote: Arc<MockBackend>,
    echo: Arc<EchoTracker>,
    crypto: Arc<EncryptionService>,
    clock: Arc<ManualClock>,
}

fn rig(remote: MockBackend) -> Rig {
    let remote = Arc::new(remote);
    let clock = Arc::new(ManualClock::new());
    let echo = Arc::new(EchoTracker::new(Duration::from_secs(5), clock.clone()));
    let crypto = Arc::new(EncryptionService::new(test_key()));
    let push = PushEngine::new(
        Arc::clone(&remote),
        Arc::clone(&echo),
        Arc::clone(&crypto),
        2,
    );
    Rig {
        push,
        remote,
        echo,
        crypto,
        clock,
    }
}

#[test]
fn record_carries_sync_columns_and_sealed_fields() {
    let r = rig(MockBackend::new());
    let note = Note {
        version: 3,
        updated_at: 99,
        ..Note::new("n1", "title")
            .with_content("body")
            .with_secret("hunter2")
            .in_folder("f1")
    };

    let record = r.push.build_record(&note, &note_config()).unwrap();

    assert_eq!(record.id(), Some("n1"));
    assert_eq!(record.version(), Some(3));
    assert!(!record.is_deleted());
    assert_eq!(record.updated_at(), Some(99));
    assert_eq!(record.get("title").and_then(|v| v.as_str()), Some("title"));
    assert_eq!(record.get("folder_id").and_then(|v| v.as_str()), Some("f1"));

    let secret = record.get("secret").and_then(|v| v.as_str()).unwrap();
    assert!(secret.starts_with(CIPHERTEXT_PREFIX));
    assert!(!secret.contains("hunter2"));
    let opened = r.crypto.decrypt("secret", secret).unwrap();
    assert_eq!(opened.value, "hunter2");
}

#[test]
fn null_secret_stays_null() {
    let r = rig(MockBackend::new());
    let record = r.push.build_record(&Note::new("n1", "t"), &note_config()).unwrap();
    assert_eq!(record.get("secret"), Some(&serde_json::Value::Null));
}

#[test]
fn empty_id_is_rejected() {
    let r = rig(MockBackend::new());
    let result = r.push.push(&Note::new("", "t"), &note_config());
    assert!(matches!(result, Err(SyncError::InvalidEntity { .. })));
    assert_eq!(r.remote.upsert_count(), 0);
}

#[test]
fn push_marks_echo_even_when_offline() {
    let r = rig(MockBackend::new());
    r.remote.set_online(false);

    let error = r.push.push(&Note::new("n1", "t"), &note_config()).unwrap_err();

    assert!(error.is_retryable());
    assert!(r.echo.was_recently_pushed("n1", NOTES));
    assert!(!r.echo.was_recently_pushed("n1", FOLDERS));

    r.clock.advance(Duration::from_secs(6));
    assert!(!r.echo.was_recently_pushed("n1", NOTES));
}

#[test]
fn failures_are_classified() {
    let r = rig(MockBackend::new());
    let config = note_config();
    let note = Note::new("n1", "t");

    let cases = [
        (BackendError::Timeout, "transient"),
        (
            BackendError::Status {
                status: 503,
                message: "unavailable".into(),
            },
            "transient",
        ),
        (
            BackendError::Status {
                status: 429,
                message: "slow down".into(),
            },
            "transient",
        ),
        (
            BackendError::Status {
                status: 422,
                message: "bad row".into(),
            },
            "rejected",
        ),
        (
            BackendError::VersionConflict {
                remote_version: Some(9),
            },
            "regression",
        ),
        (
            BackendError::ImmutableField {
                column: "folder_id".into(),
            },
            "immutable",
        ),
        (BackendError::SameVersion { version: 0 }, "noop"),
    ];

    for (backend_error, expected) in cases {
        r.remote.fail_next(backend_error.clone());
        let error = r.push.push(&note, &config).unwrap_err();
        let kind = match error {
            SyncError::TransientNetwork { .. } => "transient",
            SyncError::ServerRejected { status: 422, .. } => "rejected",
            SyncError::VersionRegression {
                remote: Some(9),
                attempted: 0,
                ..
            } => "regression",
            SyncError::ImmutableFieldViolation { .. } => "immutable",
            SyncError::SameVersionNoop { .. } => "noop",
            ref other => panic!("unexpected {other:?} for {backend_error:?}"),
        };
        assert_eq!(kind, expected, "{backend_error:?}");
        assert_eq!(error.is_retryable(), expected == "transient");
    }
}

#[test]
fn batch_push_uses_bulk_upsert_in_chunks() {
    let r = rig(MockBackend::new().with_batch_upsert());
    r.remote.insert_row(NOTES, note_row("b", 5, "ahead"));

    let notes = [Note::new("a", "1"), Note::new("b", "2"), Note::new("c", "3")];
    let refs: Vec<&dyn SyncableEntity> = notes.iter().map(|n| n as &dyn SyncableEntity).collect();

    let reports = r.push.push_batch(&refs, &note_config());

    // batch size 2 -> two bulk calls
    assert_eq!(r.remote.batch_call_count(), 2);
    assert_eq!(reports.len(), 3);
    assert!(reports[0].result.is_ok());
    assert!(matches!(
        reports[1].result,
        Err(SyncError::VersionRegression { .. })
    ));
    assert!(reports[2].result.is_ok());
    for id in ["a", "b", "c"] {
        assert!(r.echo.was_recently_pushed(id, NOTES));
    }
}

#[test]
fn batch_push_falls_back_to_sequential() {
    let r = rig(MockBackend::new());
    let notes = [Note::new("a", "1"), Note::new("", "bad"), Note::new("c", "3")];
    let refs: Vec<&dyn SyncableEntity> = notes.iter().map(|n| n as &dyn SyncableEntity).collect();

    let reports = r.push.push_batch(&refs, &note_config());

    assert_eq!(r.remote.batch_call_count(), 0);
    assert_eq!(r.remote.upsert_count(), 2);
    assert_eq!(reports.len(), 3);
    let failed: Vec<_> = reports.iter().filter(|r| r.result.is_err()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_id, "");
}

#[test]
fn offline_bulk_push_fails_every_entity_transiently() {
    let r = rig(MockBackend::new().with_batch_upsert());
    r.remote.set_online(false);
    let notes = [Note::new("a", "1"), Note::new("b", "2")];
    let refs: Vec<&dyn SyncableEntity> = notes.iter().map(|n| n as &dyn SyncableEntity).collect();

    let reports = r.push.push_batch(&refs, &note_config());
    assert!(reports
        .iter()
        .all(|report| matches!(report.result, Err(ref e) if e.is_retryable())));
}
