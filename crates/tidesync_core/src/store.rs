//! Local store abstraction.

use crate::entity::SyncableEntity;
use std::sync::Arc;
use thiserror::Error;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a [`LocalStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transaction was rejected and nothing was written.
    #[error("save rejected: {0}")]
    Rejected(String),

    /// The store holds an entity of a different type under this table.
    #[error("entity {id} in table {table} has an unexpected type")]
    TypeMismatch {
        /// Table name.
        table: String,
        /// Entity ID.
        id: String,
    },

    /// The store cannot be used right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An entity staged for an atomic save.
#[derive(Debug, Clone)]
pub struct StagedWrite {
    /// Table the entity belongs to.
    pub table: String,
    /// The entity's new state.
    pub entity: Box<dyn SyncableEntity>,
}

impl StagedWrite {
    /// Stages `entity` for `table`.
    pub fn new(table: impl Into<String>, entity: Box<dyn SyncableEntity>) -> Self {
        Self {
            table: table.into(),
            entity,
        }
    }
}

/// Predicate used by [`LocalStore::fetch`].
pub type EntityPredicate<'a> = &'a dyn Fn(&dyn SyncableEntity) -> bool;

/// The host's local persistence layer.
///
/// Entities are grouped by remote table name. `save` must be atomic: either
/// every staged write lands or none does.
pub trait LocalStore: Send + Sync {
    /// Returns every entity in `table` matching `predicate` (all if `None`),
    /// tombstones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn fetch(
        &self,
        table: &str,
        predicate: Option<EntityPredicate<'_>>,
    ) -> StoreResult<Vec<Box<dyn SyncableEntity>>>;

    /// Looks up one entity by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, table: &str, id: &str) -> StoreResult<Option<Box<dyn SyncableEntity>>> {
        let matches_id = |entity: &dyn SyncableEntity| entity.id() == id;
        Ok(self.fetch(table, Some(&matches_id))?.into_iter().next())
    }

    /// Inserts a new entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn insert(&self, table: &str, entity: Box<dyn SyncableEntity>) -> StoreResult<()> {
        self.save(vec![StagedWrite::new(table, entity)])
    }

    /// Atomically writes every staged change, inserting or replacing by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written.
    fn save(&self, changes: Vec<StagedWrite>) -> StoreResult<()>;
}

impl<L: LocalStore + ?Sized> LocalStore for Arc<L> {
    fn fetch(
        &self,
        table: &str,
        predicate: Option<EntityPredicate<'_>>,
    ) -> StoreResult<Vec<Box<dyn SyncableEntity>>> {
        (**self).fetch(table, predicate)
    }

    fn get(&self, table: &str, id: &str) -> StoreResult<Option<Box<dyn SyncableEntity>>> {
        (**self).get(table, id)
    }

    fn insert(&self, table: &str, entity: Box<dyn SyncableEntity>) -> StoreResult<()> {
        (**self).insert(table, entity)
    }

    fn save(&self, changes: Vec<StagedWrite>) -> StoreResult<()> {
        (**self).save(changes)
    }
}
