//! Property tests for merge and reconciliation planning.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tidesync_core::{EncryptionService, PullEngine, ReconcilePlan};
use tidesync_testkit::prelude::*;

fn engine() -> PullEngine<MockBackend> {
    PullEngine::new(
        Arc::new(MockBackend::new()),
        Arc::new(EncryptionService::new(test_key())),
        100,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn merge_is_idempotent(local in note_strategy(), remote in note_row_strategy()) {
        let pull = engine();
        let config = note_config();

        let mut once = local.clone();
        pull.merge_into(&remote, &mut once, &config).unwrap();
        let mut twice = once.clone();
        let second = pull.merge_into(&remote, &mut twice, &config).unwrap();

        prop_assert!(!second.was_modified);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_never_lowers_the_version(local in note_strategy(), remote in note_row_strategy()) {
        let pull = engine();
        let mut merged = local.clone();
        pull.merge_into(&remote, &mut merged, &note_config()).unwrap();

        let remote_version = remote.version().unwrap();
        prop_assert_eq!(merged.version, local.version.max(remote_version));
    }

    #[test]
    fn tombstone_is_never_revived(local in note_strategy(), remote in note_row_strategy()) {
        let pull = engine();
        let mut merged = local.clone();
        pull.merge_into(&remote, &mut merged, &note_config()).unwrap();

        let remote_version = remote.version().unwrap();
        if local.deleted && remote_version <= local.version {
            prop_assert!(merged.deleted);
        }
        if remote.is_deleted() && remote_version >= local.version {
            prop_assert!(merged.deleted);
        }
    }

    #[test]
    fn persist_change_bumps_monotonically(edits in prop::collection::vec(text_strategy(), 1..8)) {
        let h = TestHarness::new();
        let mut note = Note::new("n", "start");
        h.sync.persist_new(&mut note).unwrap();

        for (i, title) in edits.iter().enumerate() {
            note.title = title.clone();
            h.sync.persist_change(&mut note).unwrap();
            prop_assert_eq!(note.version, i as u64 + 1);
        }
        prop_assert_eq!(h.remote.row(NOTES, "n").unwrap().version(), Some(edits.len() as u64));
    }

    #[test]
    fn plan_classifies_every_id_once(local in stamps_strategy(), remote in stamps_strategy()) {
        let plan = ReconcilePlan::compute(&local, &remote);

        let mut seen = BTreeSet::new();
        let classified = plan
            .adopt_tombstones
            .iter()
            .map(|s| s.id.clone())
            .chain(plan.pull_ids.iter().cloned())
            .chain(plan.push_ids.iter().cloned())
            .chain(plan.reassert_tombstones.iter().cloned())
            .chain(plan.unchanged_ids.iter().cloned());
        for id in classified {
            prop_assert!(seen.insert(id.clone()), "{} classified twice", id);
        }

        let expected: BTreeSet<String> = local
            .iter()
            .chain(remote.iter())
            .map(|s| s.id.clone())
            .collect();
        prop_assert_eq!(seen, expected);
    }
}

#[test]
fn entity_ids_are_valid_for_persist() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&entity_id_strategy(), |id| {
            let h = TestHarness::new();
            let mut note = Note::new(&id, "t");
            prop_assert!(h.sync.persist_new(&mut note).is_ok());
            Ok(())
        })
        .unwrap();
}
