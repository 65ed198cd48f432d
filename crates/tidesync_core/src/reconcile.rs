//! Version-vector reconciliation between local and remote copies of a table.
//!
//! A pass compares `(id, version, deleted)` stamps from both sides, then
//! applies the differences in a fixed order: tombstones first, then pulls,
//! then pushes. Adopting tombstones first means a pull or push in the same
//! pass can never resurrect a row the other side already deleted.
//!
//! | local        | remote       | action                                  |
//! |--------------|--------------|-----------------------------------------|
//! | v            | w > v, dead  | adopt tombstone                         |
//! | v            | w > v, live  | pull                                    |
//! | v            | w < v        | push                                    |
//! | v, live      | v, dead      | adopt tombstone                         |
//! | v, dead      | v, live      | bump local to v + 1 and push            |
//! | v            | v, same flag | nothing                                 |
//! | missing      | dead         | adopt tombstone (materialize)           |
//! | missing      | live         | pull (materialize)                      |
//! | present      | missing      | push                                    |

use crate::backend::{BackendError, RemoteBackend};
use crate::clock::Clock;
use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use crate::notify::{Notification, Notifier};
use crate::pull::{MergeResult, PullEngine};
use crate::push::PushEngine;
use crate::queue::OfflineQueue;
use crate::record::{RemoteRecord, VersionStamp};
use crate::registry::EntityConfig;
use crate::state::{EntitySyncState, StateTable};
use crate::store::{LocalStore, StagedWrite};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// How thorough a pass is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Compare version stamps only.
    #[default]
    Versions,
    /// Also fetch full rows for entities whose stamps match and re-push any
    /// whose encrypted columns are plaintext or sealed with a retired key.
    /// Run this after a key rotation.
    Deep,
}

/// The actions a pass will take, computed from the two stamp sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Remote tombstones to adopt locally.
    pub adopt_tombstones: Vec<VersionStamp>,
    /// Rows to pull in full.
    pub pull_ids: Vec<String>,
    /// Local entities to push as they are.
    pub push_ids: Vec<String>,
    /// Local tombstones to bump by one and push over a live remote row.
    pub reassert_tombstones: Vec<String>,
    /// Entities whose stamps already match.
    pub unchanged_ids: Vec<String>,
}

impl ReconcilePlan {
    /// Classifies every ID present on either side. Output lists are sorted by ID.
    #[must_use]
    pub fn compute(local: &[VersionStamp], remote: &[VersionStamp]) -> Self {
        let local: BTreeMap<&str, &VersionStamp> =
            local.iter().map(|s| (s.id.as_str(), s)).collect();
        let remote: BTreeMap<&str, &VersionStamp> =
            remote.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut plan = Self::default();

        for (id, remote_stamp) in &remote {
            match local.get(id) {
                None if remote_stamp.deleted => plan.adopt_tombstones.push((*remote_stamp).clone()),
                None => plan.pull_ids.push((*id).to_owned()),
                Some(local_stamp) => plan.classify(local_stamp, remote_stamp),
            }
        }

        for id in local.keys().filter(|id| !remote.contains_key(*id)) {
            plan.push_ids.push((*id).to_owned());
        }
        plan.push_ids.sort();

        plan
    }

    fn classify(&mut self, local: &VersionStamp, remote: &VersionStamp) {
        let id = remote.id.clone();
        if remote.version > local.version {
            if remote.deleted {
                self.adopt_tombstones.push(remote.clone());
            } else {
                self.pull_ids.push(id);
            }
        } else if remote.version < local.version {
            self.push_ids.push(id);
        } else {
            match (local.deleted, remote.deleted) {
                (false, true) => self.adopt_tombstones.push(remote.clone()),
                (true, false) => self.reassert_tombstones.push(id),
                _ => self.unchanged_ids.push(id),
            }
        }
    }

    /// Returns true if the pass has nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.adopt_tombstones.is_empty()
            && self.pull_ids.is_empty()
            && self.push_ids.is_empty()
            && self.reassert_tombstones.is_empty()
    }
}

/// Phase a reconciliation failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    /// Adopting a remote tombstone.
    Tombstone,
    /// Merging or materializing a pulled row.
    Pull,
    /// Checking or bumping an entity before it is pushed.
    Prepare,
    /// Pushing.
    Push,
}

/// One entity that could not be reconciled.
#[derive(Debug)]
pub struct ReconcileFailure {
    /// Entity ID.
    pub entity_id: String,
    /// Where it failed.
    pub phase: ReconcilePhase,
    /// The error.
    pub error: SyncError,
}

/// Summary of a reconciliation pass.
///
/// Per-entity failures do not abort the pass; they are collected here.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Table that was reconciled.
    pub table: String,
    /// Remote tombstones adopted locally.
    pub tombstoned: usize,
    /// Pulled rows that changed or created a local entity.
    pub pulled: usize,
    /// Local entities created from remote-only rows (tombstones included).
    pub materialized: usize,
    /// Entities pushed successfully.
    pub pushed: usize,
    /// Entities re-pushed to replace plaintext or stale ciphertext.
    pub healed: usize,
    /// Entities whose stamps already matched.
    pub unchanged: usize,
    /// Queued operations made redundant by this pass's pushes and removed
    /// from the offline queue.
    pub superseded: usize,
    /// Per-entity failures.
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// Returns true if every entity reconciled without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail_chunk(&mut self, ids: &[String], phase: ReconcilePhase, error: &BackendError) {
        for id in ids {
            let error = SyncError::from_read_failure(error.clone(), &self.table);
            self.fail(id, phase, error);
        }
    }

    fn fail(&mut self, entity_id: impl Into<String>, phase: ReconcilePhase, error: SyncError) {
        let entity_id = entity_id.into();
        warn!(table = %self.table, entity_id = %entity_id, ?phase, error = %error, "reconcile failure");
        self.failures.push(ReconcileFailure {
            entity_id,
            phase,
            error,
        });
    }
}

/// Borrowed engine parts a pass works with.
pub(crate) struct ReconcileContext<'a, B, L> {
    pub push: &'a PushEngine<B>,
    pub pull: &'a PullEngine<B>,
    pub store: &'a L,
    pub queue: &'a OfflineQueue,
    pub states: &'a StateTable,
    pub writer: &'a Mutex<()>,
    pub notifier: &'a Notifier,
    pub clock: &'a dyn Clock,
}

/// Runs reconciliation passes, at most one per table at a time.
#[derive(Debug, Default)]
pub struct ReconciliationService {
    in_flight: Mutex<HashSet<String>>,
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    table: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.table);
    }
}

impl ReconciliationService {
    /// Creates an idle service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a pass for `table` is running.
    pub fn is_running(&self, table: &str) -> bool {
        self.in_flight.lock().contains(table)
    }

    fn begin(&self, table: &str) -> SyncResult<InFlight<'_>> {
        if !self.in_flight.lock().insert(table.to_owned()) {
            return Err(SyncError::ReconcileInProgress {
                table: table.to_owned(),
            });
        }
        Ok(InFlight {
            set: &self.in_flight,
            table: table.to_owned(),
        })
    }

    /// Runs one pass over `config`'s table.
    ///
    /// Fails as a whole only if the pass cannot start: another pass is
    /// running, or the version stamps cannot be read. A chunk of rows that
    /// cannot be pulled is reported once per ID and the pass continues.
    ///
    /// A successful push supersedes queued operations for the entity at or
    /// below the pushed version; they are removed from the offline queue.
    pub(crate) fn run<B, L>(
        &self,
        ctx: &ReconcileContext<'_, B, L>,
        config: &EntityConfig,
        mode: ReconcileMode,
    ) -> SyncResult<ReconcileReport>
    where
        B: RemoteBackend,
        L: LocalStore,
    {
        let table = config.table();
        let _in_flight = self.begin(table)?;

        let remote = ctx.pull.pull_versions(config)?;
        let local: Vec<VersionStamp> = ctx
            .store
            .fetch(table, None)?
            .iter()
            .map(|entity| local_stamp(entity.as_ref()))
            .collect();

        let plan = ReconcilePlan::compute(&local, &remote);
        info!(
            table,
            local = local.len(),
            remote = remote.len(),
            tombstones = plan.adopt_tombstones.len(),
            pulls = plan.pull_ids.len(),
            pushes = plan.push_ids.len() + plan.reassert_tombstones.len(),
            ?mode,
            "reconciliation started"
        );

        let mut report = ReconcileReport {
            table: table.to_owned(),
            unchanged: plan.unchanged_ids.len(),
            ..ReconcileReport::default()
        };

        for stamp in &plan.adopt_tombstones {
            match adopt_tombstone(ctx, config, stamp) {
                Ok(Applied { changed: false, .. }) => {}
                Ok(applied) => {
                    report.tombstoned += 1;
                    report.materialized += usize::from(applied.materialized);
                    notify_changed(ctx, table, &stamp.id);
                }
                Err(e) => report.fail(&stamp.id, ReconcilePhase::Tombstone, e),
            }
        }

        let mut heal_ids = Vec::new();
        for (chunk, pulled) in ctx.pull.pull_chunks(config, &plan.pull_ids) {
            let records = match pulled {
                Ok(records) => records,
                Err(e) => {
                    report.fail_chunk(chunk, ReconcilePhase::Pull, &e);
                    continue;
                }
            };
            for record in records {
                let id = record.id().unwrap_or_default().to_owned();
                match apply_pulled(ctx, config, &record) {
                    Ok(applied) => {
                        if applied.changed {
                            report.pulled += 1;
                            report.materialized += usize::from(applied.materialized);
                            notify_changed(ctx, table, &id);
                        }
                        if applied.needs_healing {
                            heal_ids.push(id);
                        }
                    }
                    Err(e) => report.fail(id, ReconcilePhase::Pull, e),
                }
            }
        }

        if mode == ReconcileMode::Deep && config.has_encrypted_fields() {
            for (chunk, pulled) in ctx.pull.pull_chunks(config, &plan.unchanged_ids) {
                let records = match pulled {
                    Ok(records) => records,
                    Err(e) => {
                        report.fail_chunk(chunk, ReconcilePhase::Prepare, &e);
                        continue;
                    }
                };
                for record in records {
                    let id = record.id().unwrap_or_default().to_owned();
                    match ctx.pull.needs_healing(&record, config) {
                        Ok(true) => heal_ids.push(id),
                        Ok(false) => {}
                        Err(e) => report.fail(id, ReconcilePhase::Prepare, e),
                    }
                }
            }
        }

        let mut push_ids = plan.push_ids.clone();
        for id in &plan.reassert_tombstones {
            match bump_local(ctx, config, id, Some(true)) {
                Ok(true) => push_ids.push(id.clone()),
                Ok(false) => debug!(table, entity_id = %id, "tombstone changed during pass; skipped"),
                Err(e) => report.fail(id, ReconcilePhase::Prepare, e),
            }
        }
        let mut healing: HashSet<String> = HashSet::new();
        for id in heal_ids {
            match bump_local(ctx, config, &id, None) {
                Ok(true) => {
                    healing.insert(id.clone());
                    push_ids.push(id);
                }
                Ok(false) => {}
                Err(e) => report.fail(id, ReconcilePhase::Prepare, e),
            }
        }

        let mut records: Vec<RemoteRecord> = Vec::with_capacity(push_ids.len());
        for id in &push_ids {
            let built = ctx
                .store
                .get(table, id)
                .map_err(SyncError::from)
                .and_then(|entity| {
                    entity.ok_or_else(|| SyncError::invalid_entity(format!("{id} vanished locally")))
                })
                .and_then(|entity| ctx.push.build_record(entity.as_ref(), config));
            match built {
                Ok(record) => records.push(record),
                Err(e) => report.fail(id, ReconcilePhase::Prepare, e),
            }
        }

        let versions: HashMap<String, u64> = records
            .iter()
            .filter_map(|record| Some((record.id()?.to_owned(), record.version()?)))
            .collect();
        for pushed in ctx.push.push_records(table, &records) {
            match pushed.result {
                Ok(()) => {
                    report.pushed += 1;
                    report.healed += usize::from(healing.contains(&pushed.entity_id));
                    let version = versions.get(&pushed.entity_id).copied().unwrap_or_default();
                    match settle_pushed(ctx, table, &pushed.entity_id, version) {
                        Ok(removed) => report.superseded += removed,
                        Err(e) => report.fail(pushed.entity_id, ReconcilePhase::Push, e),
                    }
                }
                Err(e) => {
                    if e.is_version_regression() {
                        ctx.notifier.emit(Notification::VersionRegressionDetected {
                            table: table.to_owned(),
                            entity_id: pushed.entity_id.clone(),
                        });
                    }
                    report.fail(pushed.entity_id, ReconcilePhase::Push, e);
                }
            }
        }

        info!(
            table,
            superseded = report.superseded,
            tombstoned = report.tombstoned,
            pulled = report.pulled,
            pushed = report.pushed,
            healed = report.healed,
            failures = report.failures.len(),
            "reconciliation finished"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Applied {
    changed: bool,
    materialized: bool,
    needs_healing: bool,
}

impl From<MergeResult> for Applied {
    fn from(result: MergeResult) -> Self {
        Self {
            changed: result.was_modified,
            materialized: false,
            needs_healing: result.needs_healing,
        }
    }
}

fn local_stamp(entity: &dyn SyncableEntity) -> VersionStamp {
    VersionStamp {
        id: entity.id().to_owned(),
        version: entity.version(),
        deleted: entity.is_deleted(),
    }
}

fn adopt_tombstone<B, L>(
    ctx: &ReconcileContext<'_, B, L>,
    config: &EntityConfig,
    stamp: &VersionStamp,
) -> SyncResult<Applied>
where
    B: RemoteBackend,
    L: LocalStore,
{
    apply_pulled(ctx, config, &stamp.to_record())
}

/// Merges `record` into the local copy, or materializes it, under the writer lock.
fn apply_pulled<B, L>(
    ctx: &ReconcileContext<'_, B, L>,
    config: &EntityConfig,
    record: &RemoteRecord,
) -> SyncResult<Applied>
where
    B: RemoteBackend,
    L: LocalStore,
{
    let table = config.table();
    let id = record
        .id()
        .ok_or_else(|| SyncError::malformed(table, "record has no id"))?;

    let _writer = ctx.writer.lock();
    match ctx.store.get(table, id)? {
        Some(mut local) => {
            let result = ctx.pull.merge_into(record, local.as_mut(), config)?;
            if result.was_modified {
                ctx.store.save(vec![StagedWrite::new(table, local)])?;
            }
            Ok(result.into())
        }
        None => {
            let (entity, result) = ctx.pull.materialize(record, config)?;
            ctx.store.insert(table, entity)?;
            Ok(Applied {
                materialized: true,
                ..result.into()
            })
        }
    }
}

/// Bumps the local version by one so the next push supersedes the remote row.
///
/// With `expect_deleted`, the bump only happens if the tombstone flag still
/// matches; returns false when skipped.
fn bump_local<B, L>(
    ctx: &ReconcileContext<'_, B, L>,
    config: &EntityConfig,
    id: &str,
    expect_deleted: Option<bool>,
) -> SyncResult<bool>
where
    B: RemoteBackend,
    L: LocalStore,
{
    let table = config.table();
    let _writer = ctx.writer.lock();
    let Some(mut local) = ctx.store.get(table, id)? else {
        return Ok(false);
    };
    if expect_deleted.is_some_and(|deleted| deleted != local.is_deleted()) {
        return Ok(false);
    }

    local.set_version(local.version() + 1);
    local.set_updated_at(ctx.clock.unix_millis());
    ctx.store.save(vec![StagedWrite::new(table, local)])?;
    Ok(true)
}

fn notify_changed<B, L>(ctx: &ReconcileContext<'_, B, L>, table: &str, id: &str) {
    ctx.notifier.emit(Notification::EntityChanged {
        table: table.to_owned(),
        entity_id: id.to_owned(),
    });
}

/// Drops queued operations the push just made redundant and marks the
/// entity synced unless newer ones remain. Returns how many were dropped.
fn settle_pushed<B, L>(
    ctx: &ReconcileContext<'_, B, L>,
    table: &str,
    id: &str,
    version: u64,
) -> SyncResult<usize> {
    let removed = ctx.queue.remove_superseded(table, id, version)?;
    if ctx.queue.contains_entity(table, id) {
        ctx.states.set(table, id, EntitySyncState::QueuedOffline);
    } else {
        ctx.states.set(table, id, EntitySyncState::Synced);
    }
    Ok(removed)
}
