//! The sync coordinator: single entry point for local mutations.

use crate::backend::RemoteBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::crypto::{EncryptionKey, EncryptionService};
use crate::echo::EchoTracker;
use crate::entity::{SyncFields, SyncableEntity};
use crate::error::{SyncError, SyncResult};
use crate::notify::{Notification, Notifier, SubscriptionId};
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::queue::{CompactionStats, OfflineQueue, PendingOperation};
use crate::realtime::{ChangeKind, RealtimeEvent, RealtimeOutcome};
use crate::reconcile::{ReconcileContext, ReconcileMode, ReconcileReport, ReconciliationService};
use crate::record::RemoteRecord;
use crate::registry::{EntityConfig, ParentRelation, Registry};
use crate::state::{EntitySyncState, StateTable};
use crate::store::{LocalStore, StagedWrite};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tidesync_storage::FileBackend;
use tracing::{debug, info, warn};

/// What a successful mutation did remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Pushed and accepted.
    Synced,
    /// The push failed transiently (or earlier operations for the entity
    /// are still queued); it will go out with the next queue drain.
    QueuedOffline {
        /// Queue sequence number.
        seq: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    New,
    Change,
    Delete,
    Undelete,
}

struct Ancestor {
    config: Arc<EntityConfig>,
    entity: Box<dyn SyncableEntity>,
    record: RemoteRecord,
}

/// Orchestrates local saves, pushes, the offline queue, inbound merges and
/// reconciliation for one local store and one remote backend.
///
/// Local mutations and inbound merges run one at a time behind a writer
/// lock. Network calls happen after that lock is released.
///
/// ```rust,ignore
/// let sync = SyncCoordinator::builder(backend, store)
///     .queue_file("sync/queue.log")
///     .encryption_key(key)
///     .build()?;
/// sync.register(note_config())?;
///
/// let mut note = Note::new("hello");
/// sync.persist_new(&mut note)?;
/// note.title = "hello, world".into();
/// sync.persist_change(&mut note)?;
/// ```
pub struct SyncCoordinator<B, L> {
    config: SyncConfig,
    registry: Registry,
    store: L,
    push: PushEngine<B>,
    pull: PullEngine<B>,
    queue: OfflineQueue,
    echo: Arc<EchoTracker>,
    crypto: Arc<EncryptionService>,
    reconciler: ReconciliationService,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    writer: Mutex<()>,
    drain_lock: Mutex<()>,
    states: StateTable,
}

impl<B: RemoteBackend, L: LocalStore> SyncCoordinator<B, L> {
    /// Starts building a coordinator over `backend` and `store`.
    pub fn builder(backend: B, store: L) -> SyncCoordinatorBuilder<B, L> {
        SyncCoordinatorBuilder::new(backend, store)
    }

    /// Registers an entity type.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateRegistration`] if the type or its table
    /// is already registered.
    pub fn register(&self, config: EntityConfig) -> SyncResult<()> {
        self.registry.register(config)
    }

    /// The type registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The local store.
    pub fn store(&self) -> &L {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Saves a new entity and pushes it.
    ///
    /// The entity must have a non-empty ID and version 0; the version is
    /// not bumped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] for a bad ID or version,
    /// [`SyncError::Persistence`] if the local save fails, or the permanent
    /// push failure. Transient push failures are queued and reported as
    /// [`PersistOutcome::QueuedOffline`].
    pub fn persist_new<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PersistOutcome> {
        self.persist(entity, Mutation::New)
    }

    /// Bumps the version by one, saves the entity (and its bumped ancestors)
    /// and pushes it.
    ///
    /// On error before or during the local save the entity's sync fields
    /// are restored to what they were on entry. Once the save succeeds the
    /// bumped ancestors are pushed or queued even if the entity's own push
    /// is rejected.
    ///
    /// # Errors
    ///
    /// See [`persist_new`](Self::persist_new).
    pub fn persist_change<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PersistOutcome> {
        self.persist(entity, Mutation::Change)
    }

    /// Marks the entity deleted, bumps its version and pushes the tombstone.
    ///
    /// # Errors
    ///
    /// See [`persist_new`](Self::persist_new).
    pub fn delete<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PersistOutcome> {
        self.persist(entity, Mutation::Delete)
    }

    /// Brings a tombstoned entity back.
    ///
    /// The caller must already have raised the version to at least the
    /// stored version plus the configured undelete bump, so the revival
    /// beats any tombstone other clients may still push.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidUndelete`] if there is no stored
    /// tombstone or the version is too low, otherwise as
    /// [`persist_new`](Self::persist_new).
    pub fn undelete<E: SyncableEntity>(&self, entity: &mut E) -> SyncResult<PersistOutcome> {
        self.persist(entity, Mutation::Undelete)
    }

    /// Bumps an entity by one and pushes it, re-sealing encrypted fields
    /// under the current key. Use after a `NeedsHealing` notification.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] if the entity is not stored
    /// locally, otherwise as [`persist_new`](Self::persist_new).
    pub fn heal(&self, table: &str, entity_id: &str) -> SyncResult<PersistOutcome> {
        let config = self.registry.resolve_table(table)?;
        let record = {
            let _writer = self.writer.lock();
            let mut entity = self.store.get(table, entity_id)?.ok_or_else(|| {
                SyncError::invalid_entity(format!("{table}/{entity_id} is not stored locally"))
            })?;
            entity.set_version(entity.version() + 1);
            entity.set_updated_at(self.clock.unix_millis());
            let record = self.push.build_record(entity.as_ref(), &config)?;
            self.store.save(vec![StagedWrite::new(table, entity)])?;
            record
        };
        info!(table, entity_id, "healing entity");
        self.set_state(table, entity_id, EntitySyncState::Dirty);
        self.push_or_queue(table, entity_id, record)
    }

    fn persist<E: SyncableEntity>(
        &self,
        entity: &mut E,
        mutation: Mutation,
    ) -> SyncResult<PersistOutcome> {
        let config = self.registry.resolve::<E>()?;
        let entity: &mut dyn SyncableEntity = entity;
        if entity.id().is_empty() {
            return Err(SyncError::invalid_entity("entity ID must not be empty"));
        }

        let (record, ancestors) = {
            let _writer = self.writer.lock();
            let before = SyncFields::capture(entity);
            match self.stage(entity, &config, mutation) {
                Ok(staged) => staged,
                Err(e) => {
                    before.restore(entity);
                    return Err(e);
                }
            }
        };

        let table = config.table();
        let entity_id = entity.id();
        debug!(
            table,
            entity_id,
            version = entity.version(),
            ?mutation,
            ancestors = ancestors.len(),
            "saved locally"
        );
        self.set_state(table, entity_id, EntitySyncState::Dirty);
        // Ancestor bumps are already saved, so they go out even if the
        // child's push fails.
        let outcome = self.push_or_queue(table, entity_id, record);

        for ancestor in ancestors {
            let ancestor_table = ancestor.config.table();
            let ancestor_id = ancestor.entity.id();
            self.set_state(ancestor_table, ancestor_id, EntitySyncState::Dirty);
            if let Err(e) = self.push_or_queue(ancestor_table, ancestor_id, ancestor.record) {
                self.notifier.emit(Notification::PushRejected {
                    table: ancestor_table.to_owned(),
                    entity_id: ancestor_id.to_owned(),
                    reason: e.to_string(),
                });
            }
        }

        outcome
    }

    /// Applies `mutation`, bumps ancestors and saves everything in one batch.
    /// Runs under the writer lock; the caller restores `entity` on error.
    fn stage(
        &self,
        entity: &mut dyn SyncableEntity,
        config: &EntityConfig,
        mutation: Mutation,
    ) -> SyncResult<(RemoteRecord, Vec<Ancestor>)> {
        match mutation {
            Mutation::New => {
                if entity.version() != 0 {
                    return Err(SyncError::invalid_entity(format!(
                        "new entity {} must start at version 0, found {}",
                        entity.id(),
                        entity.version()
                    )));
                }
            }
            Mutation::Change => entity.set_version(entity.version() + 1),
            Mutation::Delete => {
                entity.set_deleted(true);
                entity.set_version(entity.version() + 1);
            }
            Mutation::Undelete => {
                self.check_undelete(entity, config)?;
                entity.set_deleted(false);
            }
        }
        entity.set_updated_at(self.clock.unix_millis());

        let record = self.push.build_record(entity, config)?;
        let ancestors = self.stage_ancestors(entity, config)?;

        let mut writes = Vec::with_capacity(ancestors.len() + 1);
        writes.push(StagedWrite::new(config.table(), entity.clone_entity()));
        for ancestor in &ancestors {
            writes.push(StagedWrite::new(
                ancestor.config.table(),
                ancestor.entity.clone_entity(),
            ));
        }
        self.store.save(writes)?;

        Ok((record, ancestors))
    }

    fn check_undelete(&self, entity: &dyn SyncableEntity, config: &EntityConfig) -> SyncResult<()> {
        let invalid = |reason: String| SyncError::InvalidUndelete {
            entity_id: entity.id().to_owned(),
            reason,
        };

        let stored = self
            .store
            .get(config.table(), entity.id())?
            .ok_or_else(|| invalid("no stored copy".into()))?;
        if !stored.is_deleted() {
            return Err(invalid("stored copy is not deleted".into()));
        }

        let required = stored.version().saturating_add(self.config.undelete_bump);
        if entity.version() < required {
            return Err(invalid(format!(
                "version {} is below required {required} (stored {} + {})",
                entity.version(),
                stored.version(),
                self.config.undelete_bump
            )));
        }
        Ok(())
    }

    /// Walks the parent chain, bumping each ancestor once.
    ///
    /// The walk stops at a root, at a parent missing locally, or on a cycle.
    fn stage_ancestors(
        &self,
        child: &dyn SyncableEntity,
        config: &EntityConfig,
    ) -> SyncResult<Vec<Ancestor>> {
        let mut visited = HashSet::from([(config.type_id(), child.id().to_owned())]);
        let mut ancestors = Vec::new();
        let mut next = parent_of(config, child);
        let now = self.clock.unix_millis();

        while let Some((parent_type, parent_name, parent_id)) = next.take() {
            if !visited.insert((parent_type, parent_id.clone())) {
                warn!(parent_id = %parent_id, parent_type = parent_name, "parent cycle; stopping");
                break;
            }

            let parent_config = self.registry.resolve_type(parent_type, parent_name)?;
            let Some(mut parent) = self.store.get(parent_config.table(), &parent_id)? else {
                warn!(
                    table = parent_config.table(),
                    parent_id = %parent_id,
                    "parent not stored locally; stopping"
                );
                break;
            };

            next = parent_of(&parent_config, parent.as_ref());
            parent.set_version(parent.version() + 1);
            parent.set_updated_at(now);
            let record = self.push.build_record(parent.as_ref(), &parent_config)?;
            ancestors.push(Ancestor {
                config: parent_config,
                entity: parent,
                record,
            });
        }

        Ok(ancestors)
    }

    /// Pushes `record`, or queues it if the push fails transiently or the
    /// entity already has queued operations.
    fn push_or_queue(
        &self,
        table: &str,
        entity_id: &str,
        record: RemoteRecord,
    ) -> SyncResult<PersistOutcome> {
        if self.queue.contains_entity(table, entity_id) {
            debug!(table, entity_id, "earlier operations queued; queueing behind them");
            return self.enqueue(table, entity_id, record);
        }

        self.set_state(table, entity_id, EntitySyncState::Pushing);
        match self.push.push_record(table, &record) {
            Ok(()) => {
                self.set_state(table, entity_id, EntitySyncState::Synced);
                Ok(PersistOutcome::Synced)
            }
            Err(e) if e.is_retryable() => {
                info!(table, entity_id, error = %e, "push failed transiently; queueing");
                self.enqueue(table, entity_id, record)
            }
            Err(e) => {
                self.set_state(table, entity_id, EntitySyncState::PermanentlyFailed);
                if e.is_version_regression() {
                    self.notifier.emit(Notification::VersionRegressionDetected {
                        table: table.to_owned(),
                        entity_id: entity_id.to_owned(),
                    });
                }
                Err(e)
            }
        }
    }

    fn enqueue(
        &self,
        table: &str,
        entity_id: &str,
        record: RemoteRecord,
    ) -> SyncResult<PersistOutcome> {
        let op = PendingOperation::new(table, entity_id, record, self.clock.unix_millis());
        let seq = self.queue.enqueue(op)?;
        self.set_state(table, entity_id, EntitySyncState::QueuedOffline);
        Ok(PersistOutcome::QueuedOffline { seq })
    }

    /// Replays queued operations oldest first and returns how many were
    /// pushed successfully.
    ///
    /// Permanent failures are removed and reported through
    /// [`Notification::OperationDropped`]. Transient failures stay queued
    /// with their retry count bumped, and later operations for the same
    /// entity wait for the next drain. The log is compacted once the queue
    /// is empty.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue log cannot be written.
    pub fn process_offline_queue(&self) -> SyncResult<usize> {
        let _drain = self.drain_lock.lock();
        let pending = self.queue.snapshot();
        if pending.is_empty() {
            return Ok(0);
        }
        info!(pending = pending.len(), "draining offline queue");

        let mut held: HashSet<(String, String)> = HashSet::new();
        let mut drained = 0;

        for op in pending {
            let key = (op.table_name.clone(), op.entity_id.clone());
            if held.contains(&key) {
                continue;
            }

            match self.push.push_record(&op.table_name, &op.record_snapshot) {
                Ok(()) => {
                    self.queue.remove(op.seq)?;
                    drained += 1;
                    if !self.queue.contains_entity(&op.table_name, &op.entity_id) {
                        self.set_state(&op.table_name, &op.entity_id, EntitySyncState::Synced);
                    }
                }
                Err(e) if e.is_retryable() => {
                    let retries = self.queue.mark_retried(op.seq)?;
                    debug!(seq = op.seq, retries, error = %e, "queued push still failing");
                    held.insert(key);
                }
                Err(e) => {
                    if !self.queue.remove(op.seq)? {
                        debug!(seq = op.seq, error = %e, "operation superseded during drain");
                        continue;
                    }
                    warn!(
                        seq = op.seq,
                        table = %op.table_name,
                        entity_id = %op.entity_id,
                        error = %e,
                        "dropping queued operation"
                    );
                    self.set_state(&op.table_name, &op.entity_id, EntitySyncState::PermanentlyFailed);
                    if e.is_version_regression() {
                        self.notifier.emit(Notification::VersionRegressionDetected {
                            table: op.table_name.clone(),
                            entity_id: op.entity_id.clone(),
                        });
                    }
                    self.notifier.emit(Notification::OperationDropped {
                        table: op.table_name,
                        entity_id: op.entity_id,
                        seq: op.seq,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if self.queue.is_empty() {
            self.queue.compact()?;
        }
        info!(drained, remaining = self.queue.len(), "offline queue drain finished");
        Ok(drained)
    }

    /// Handles one change from the realtime channel.
    ///
    /// Never fails: problems are reported as [`Notification::MergeFailed`]
    /// and [`RealtimeOutcome::Failed`].
    pub fn handle_realtime_event(&self, event: &RealtimeEvent) -> RealtimeOutcome {
        let table = event.table.as_str();
        let Some(entity_id) = event.record.id().filter(|id| !id.is_empty()) else {
            self.merge_failed(table, None, "realtime record has no id".into());
            return RealtimeOutcome::Failed;
        };

        if self.echo.was_recently_pushed(entity_id, table) {
            debug!(table, entity_id, "echo suppressed");
            return RealtimeOutcome::EchoSuppressed;
        }
        if event.kind == ChangeKind::Delete {
            debug!(table, entity_id, "hard delete ignored");
            return RealtimeOutcome::Ignored;
        }

        match self.apply_inbound(table, entity_id, &event.record) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.merge_failed(table, Some(entity_id.to_owned()), e.to_string());
                RealtimeOutcome::Failed
            }
        }
    }

    fn apply_inbound(
        &self,
        table: &str,
        entity_id: &str,
        record: &RemoteRecord,
    ) -> SyncResult<RealtimeOutcome> {
        let config = self.registry.resolve_table(table)?;

        let (outcome, correction) = {
            let _writer = self.writer.lock();
            match self.store.get(table, entity_id)? {
                Some(mut local) => {
                    let local_version = local.version();
                    let result = self.pull.merge_into(record, local.as_mut(), &config)?;
                    if result.was_modified {
                        self.store.save(vec![StagedWrite::new(table, local)])?;
                        let outcome = RealtimeOutcome::Applied {
                            needs_healing: result.needs_healing,
                        };
                        (outcome, None)
                    } else if record.version().is_some_and(|v| v < local_version) {
                        let correction = self.push.build_record(local.as_ref(), &config)?;
                        (RealtimeOutcome::LocalNewer, Some(correction))
                    } else {
                        (RealtimeOutcome::Unchanged, None)
                    }
                }
                None => {
                    let (entity, result) = self.pull.materialize(record, &config)?;
                    self.store.insert(table, entity)?;
                    let outcome = RealtimeOutcome::Materialized {
                        needs_healing: result.needs_healing,
                    };
                    (outcome, None)
                }
            }
        };

        match outcome {
            RealtimeOutcome::Applied { needs_healing }
            | RealtimeOutcome::Materialized { needs_healing } => {
                debug!(table, entity_id, ?outcome, "realtime change applied");
                self.set_state(table, entity_id, EntitySyncState::Synced);
                self.notifier.emit(Notification::EntityChanged {
                    table: table.to_owned(),
                    entity_id: entity_id.to_owned(),
                });
                if needs_healing {
                    self.notifier.emit(Notification::NeedsHealing {
                        table: table.to_owned(),
                        entity_id: entity_id.to_owned(),
                    });
                }
            }
            _ => {}
        }

        if let Some(correction) = correction {
            debug!(table, entity_id, "local copy is newer; pushing it back");
            if let Err(e) = self.push_or_queue(table, entity_id, correction) {
                self.notifier.emit(Notification::PushRejected {
                    table: table.to_owned(),
                    entity_id: entity_id.to_owned(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(outcome)
    }

    fn merge_failed(&self, table: &str, entity_id: Option<String>, reason: String) {
        warn!(table, entity_id = ?entity_id, reason = %reason, "realtime merge failed");
        self.notifier.emit(Notification::MergeFailed {
            table: table.to_owned(),
            entity_id,
            reason,
        });
    }

    /// Reconciles every entity of type `E` against the remote table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ReconcileInProgress`] if a pass for the table is
    /// running, or the read failure that kept the pass from starting.
    pub fn reconcile<E: SyncableEntity>(&self) -> SyncResult<ReconcileReport> {
        let config = self.registry.resolve::<E>()?;
        self.run_reconcile(&config, ReconcileMode::Versions)
    }

    /// Like [`reconcile`](Self::reconcile), but also re-pushes rows whose
    /// encrypted columns are plaintext or sealed with a retired key.
    ///
    /// # Errors
    ///
    /// See [`reconcile`](Self::reconcile).
    pub fn reconcile_deep<E: SyncableEntity>(&self) -> SyncResult<ReconcileReport> {
        let config = self.registry.resolve::<E>()?;
        self.run_reconcile(&config, ReconcileMode::Deep)
    }

    /// Reconciles a table by name.
    ///
    /// # Errors
    ///
    /// See [`reconcile`](Self::reconcile).
    pub fn reconcile_table(&self, table: &str, mode: ReconcileMode) -> SyncResult<ReconcileReport> {
        let config = self.registry.resolve_table(table)?;
        self.run_reconcile(&config, mode)
    }

    fn run_reconcile(&self, config: &EntityConfig, mode: ReconcileMode) -> SyncResult<ReconcileReport> {
        let ctx = ReconcileContext {
            push: &self.push,
            pull: &self.pull,
            store: &self.store,
            queue: &self.queue,
            states: &self.states,
            writer: &self.writer,
            notifier: &self.notifier,
            clock: self.clock.as_ref(),
        };
        self.reconciler.run(&ctx, config, mode)
    }

    /// Installs a new master key. The old key is kept for decryption; follow
    /// up with [`reconcile_deep`](Self::reconcile_deep) to re-seal stored rows.
    pub fn rotate_encryption_key(&self, key: EncryptionKey) {
        let key_id = key.key_id();
        self.crypto.update_master_key(key);
        info!(key_id = %key_id, retired = self.crypto.retired_key_count(), "encryption key rotated");
    }

    /// Snapshot of the queued operations, oldest first.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.snapshot()
    }

    /// Number of queued operations.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// How long the host should wait before the next drain, based on how
    /// often the oldest operation has failed. `None` when nothing is queued.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        self.queue
            .dequeue_next()
            .map(|op| self.config.retry.delay_for_attempt(op.retry_count))
    }

    /// Current lifecycle state of an entity.
    ///
    /// Only the most recent [`SyncConfig::settled_state_capacity`] synced
    /// entities are remembered; older ones read as
    /// [`EntitySyncState::Clean`].
    pub fn sync_state(&self, table: &str, entity_id: &str) -> EntitySyncState {
        self.states.get(table, entity_id)
    }

    /// Number of entities whose lifecycle state is currently tracked.
    pub fn tracked_state_count(&self) -> usize {
        self.states.len()
    }

    fn set_state(&self, table: &str, entity_id: &str, state: EntitySyncState) {
        self.states.set(table, entity_id, state);
    }

    /// The notification hub.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Registers a notification callback.
    pub fn on_notification<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.notifier.on_notification(callback)
    }

    /// Returns a channel receiving every future notification.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// The echo tracker shared with the push engine.
    pub fn echo_tracker(&self) -> &EchoTracker {
        &self.echo
    }

    /// The offline queue.
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Compacts the queue log and drops the coordinator.
    ///
    /// # Errors
    ///
    /// Returns an error if compaction fails; queued operations are still
    /// on disk either way.
    pub fn close(self) -> SyncResult<CompactionStats> {
        let stats = self.queue.compact()?;
        info!(pending = stats.live_operations, "sync coordinator closed");
        Ok(stats)
    }
}

impl<B, L> std::fmt::Debug for SyncCoordinator<B, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("registry", &self.registry)
            .field("queue", &self.queue)
            .field("crypto", &self.crypto)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn parent_of(
    config: &EntityConfig,
    entity: &dyn SyncableEntity,
) -> Option<(TypeId, &'static str, String)> {
    let (parent_type, parent_id) = config.parent_link(entity)?;
    let parent_name = config
        .parent()
        .map_or("<unknown parent>", ParentRelation::parent_type_name);
    Some((parent_type, parent_name, parent_id))
}

/// Builder for [`SyncCoordinator`].
pub struct SyncCoordinatorBuilder<B, L> {
    backend: B,
    store: L,
    config: SyncConfig,
    queue: Option<OfflineQueue>,
    queue_path: Option<PathBuf>,
    key: Option<EncryptionKey>,
    clock: Option<Arc<dyn Clock>>,
}

impl<B: RemoteBackend, L: LocalStore> SyncCoordinatorBuilder<B, L> {
    fn new(backend: B, store: L) -> Self {
        Self {
            backend,
            store,
            config: SyncConfig::default(),
            queue: None,
            queue_path: None,
            key: None,
            clock: None,
        }
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an already-open queue.
    pub fn queue(mut self, queue: OfflineQueue) -> Self {
        self.queue = Some(queue);
        self.queue_path = None;
        self
    }

    /// Opens (or creates) the queue log at `path` on build.
    pub fn queue_file(mut self, path: impl AsRef<Path>) -> Self {
        self.queue_path = Some(path.as_ref().to_path_buf());
        self.queue = None;
        self
    }

    /// Enables field encryption with `key`.
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Overrides the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the coordinator.
    ///
    /// Without a queue or queue file the offline queue lives in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue log cannot be opened or replayed.
    pub fn build(self) -> SyncResult<SyncCoordinator<B, L>> {
        let queue = match (self.queue, self.queue_path) {
            (Some(queue), _) => queue,
            (None, Some(path)) => {
                OfflineQueue::open(Box::new(FileBackend::open_with_create_dirs(&path)?))?
            }
            (None, None) => OfflineQueue::in_memory(),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let crypto = Arc::new(match self.key {
            Some(key) => EncryptionService::new(key),
            None => EncryptionService::disabled(),
        });
        let echo = Arc::new(EchoTracker::new(self.config.echo_window, Arc::clone(&clock)));
        let backend = Arc::new(self.backend);

        let push = PushEngine::new(
            Arc::clone(&backend),
            Arc::clone(&echo),
            Arc::clone(&crypto),
            self.config.push_batch_size,
        );
        let pull = PullEngine::new(backend, Arc::clone(&crypto), self.config.pull_chunk_size);

        info!(
            pending = queue.len(),
            encrypted = crypto.is_enabled(),
            "sync coordinator ready"
        );

        let states = StateTable::new(self.config.settled_state_capacity);
        Ok(SyncCoordinator {
            config: self.config,
            registry: Registry::new(),
            store: self.store,
            push,
            pull,
            queue,
            echo,
            crypto,
            reconciler: ReconciliationService::new(),
            notifier: Notifier::new(),
            clock,
            writer: Mutex::new(()),
            drain_lock: Mutex::new(()),
            states,
        })
    }
}
