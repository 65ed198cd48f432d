//! # tidesync core
//!
//! Offline-first sync engine for client applications.
//!
//! The host owns its entity types and its local database; tidesync keeps
//! them in step with a remote table store. This crate provides:
//! - A per-type registry of table names, field mappings and parent relations
//! - Versioned push with failure classification (transient vs. permanent)
//! - Merge of inbound rows with tombstone-wins and protected fields
//! - A durable offline queue replayed on demand
//! - Echo suppression for realtime notifications caused by our own pushes
//! - Per-field AES-256-GCM encryption with key rotation and healing
//! - Version-vector reconciliation of a whole table
//!
//! ## Architecture
//!
//! [`SyncCoordinator`] is the single entry point for local mutations:
//! bump version, save locally (with ancestors) in one batch, push, and
//! queue the push if the network is down. Inbound data arrives either as
//! realtime events or through reconciliation passes.
//!
//! ## Key Invariants
//!
//! - Versions only grow; a push at or below the remote version is rejected
//! - A tombstone wins over a live row at the same version
//! - Transient failures are queued, permanent failures are not
//! - Per-entity push order is preserved across queue drains

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod clock;
mod config;
mod coordinator;
mod crypto;
mod echo;
mod entity;
mod error;
mod notify;
mod pull;
mod push;
pub mod queue;
mod realtime;
mod reconcile;
mod record;
mod registry;
mod state;
mod store;

pub use backend::{BackendError, Columns, Condition, Filter, RemoteBackend};
pub use clock::{Clock, SystemClock};
pub use config::{RetryConfig, SyncConfig, DEFAULT_ECHO_WINDOW, DEFAULT_UNDELETE_BUMP};
pub use coordinator::{PersistOutcome, SyncCoordinator, SyncCoordinatorBuilder};
pub use crypto::{
    Decrypted, EncryptionKey, EncryptionService, KeyId, CIPHERTEXT_PREFIX, KEY_SIZE, NONCE_SIZE,
    TAG_SIZE,
};
pub use echo::EchoTracker;
pub use entity::{new_entity_id, EntityAny, SyncableEntity};
pub use error::{SyncError, SyncResult};
pub use notify::{Notification, Notifier, SubscriptionId};
pub use pull::{MergeResult, PullEngine};
pub use push::{PushEngine, PushReport};
pub use queue::{CompactionStats, OfflineQueue, OperationType, PendingOperation};
pub use realtime::{ChangeKind, RealtimeEvent, RealtimeOutcome};
pub use reconcile::{
    ReconcileFailure, ReconcileMode, ReconcilePhase, ReconcilePlan, ReconcileReport,
    ReconciliationService,
};
pub use record::{
    is_empty_value, RemoteRecord, VersionStamp, DELETED_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN,
    VERSION_COLUMN,
};
pub use registry::{EntityConfig, EntityConfigBuilder, FieldMapping, ParentRelation, Registry};
pub use state::{EntitySyncState, DEFAULT_SETTLED_STATE_CAPACITY};
pub use store::{EntityPredicate, LocalStore, StagedWrite, StoreError, StoreResult};

pub use tidesync_storage::{FileBackend, InMemoryBackend, LogBackend, StorageError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
