//! In-memory local store.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tidesync_core::{EntityPredicate, LocalStore, StagedWrite, StoreError, StoreResult, SyncableEntity};

type Table = BTreeMap<String, Box<dyn SyncableEntity>>;

/// A [`LocalStore`] backed by per-table maps.
///
/// Saves are atomic because the whole batch is applied under one write lock.
/// `set_fail_saves(true)` makes every save fail without writing anything.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent saves fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Inserts an entity directly, bypassing the failure switch and counter.
    pub fn put<E: SyncableEntity>(&self, table: &str, entity: E) {
        self.tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert(entity.id().to_owned(), Box::new(entity));
    }

    /// Returns a typed copy of a stored entity.
    pub fn get_as<E: SyncableEntity + Clone>(&self, table: &str, id: &str) -> Option<E> {
        self.tables
            .read()
            .get(table)?
            .get(id)?
            .downcast_ref::<E>()
            .cloned()
    }

    /// Number of entities in `table`, tombstones included.
    pub fn count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// IDs in `table`, sorted.
    pub fn ids(&self, table: &str) -> Vec<String> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl LocalStore for MemoryStore {
    fn fetch(
        &self,
        table: &str,
        predicate: Option<EntityPredicate<'_>>,
    ) -> StoreResult<Vec<Box<dyn SyncableEntity>>> {
        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|entity| predicate.map_or(true, |matches| matches(entity.as_ref())))
            .cloned()
            .collect())
    }

    fn get(&self, table: &str, id: &str) -> StoreResult<Option<Box<dyn SyncableEntity>>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    fn save(&self, changes: Vec<StagedWrite>) -> StoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("save failure injected".into()));
        }

        let mut tables = self.tables.write();
        for change in changes {
            tables
                .entry(change.table)
                .or_default()
                .insert(change.entity.id().to_owned(), change.entity);
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Note, NOTES};

    #[test]
    fn save_fetch_and_predicate() {
        let store = MemoryStore::new();
        store
            .save(vec![
                StagedWrite::new(NOTES, Box::new(Note::new("a", "alpha"))),
                StagedWrite::new(NOTES, Box::new(Note::new("b", "beta"))),
            ])
            .unwrap();

        assert_eq!(store.count(NOTES), 2);
        assert_eq!(store.save_count(), 1);

        let only_b = |e: &dyn SyncableEntity| e.id() == "b";
        let found = store.fetch(NOTES, Some(&only_b)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.get_as::<Note>(NOTES, "a").unwrap().title, "alpha");
    }

    #[test]
    fn injected_failure_writes_nothing() {
        let store = MemoryStore::new();
        store.set_fail_saves(true);
        let result = store.save(vec![StagedWrite::new(NOTES, Box::new(Note::new("a", "x")))]);
        assert!(result.is_err());
        assert_eq!(store.count(NOTES), 0);
    }
}
