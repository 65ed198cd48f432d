//! Per-entity sync lifecycle tracking.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// Default number of `Synced` entries remembered before the oldest fall back to `Clean`.
pub const DEFAULT_SETTLED_STATE_CAPACITY: usize = 4096;

/// Where an entity is in its local-to-remote lifecycle.
///
/// ```text
/// Clean -> Dirty -> Pushing -> Synced
///                           -> QueuedOffline -> (drain) -> Synced
///                                                       -> PermanentlyFailed
///                           -> PermanentlyFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitySyncState {
    /// No local mutation seen by this coordinator, or synced long enough
    /// ago that the entry was evicted.
    Clean,
    /// Saved locally, push not started.
    Dirty,
    /// Push in flight.
    Pushing,
    /// The remote accepted the latest local version.
    Synced,
    /// Waiting in the offline queue.
    QueuedOffline,
    /// The remote rejected the push; reconcile to recover.
    PermanentlyFailed,
}

impl EntitySyncState {
    /// Returns true if nothing is outstanding for the entity.
    pub fn is_settled(&self) -> bool {
        matches!(self, EntitySyncState::Clean | EntitySyncState::Synced)
    }
}

type StateKey = (String, String);

#[derive(Debug, Default)]
struct StateInner {
    states: HashMap<StateKey, (EntitySyncState, u64)>,
    settled: VecDeque<(StateKey, u64)>,
    generation: u64,
}

/// Lifecycle state of every entity with outstanding work.
///
/// Unsettled states are kept until they change. `Synced` entries are kept
/// for the most recent `capacity` entities only; older ones are evicted
/// and read back as [`EntitySyncState::Clean`].
#[derive(Debug)]
pub(crate) struct StateTable {
    capacity: usize,
    inner: RwLock<StateInner>,
}

impl StateTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(StateInner::default()),
        }
    }

    pub(crate) fn get(&self, table: &str, entity_id: &str) -> EntitySyncState {
        self.inner
            .read()
            .states
            .get(&(table.to_owned(), entity_id.to_owned()))
            .map_or(EntitySyncState::Clean, |(state, _)| *state)
    }

    pub(crate) fn set(&self, table: &str, entity_id: &str, state: EntitySyncState) {
        let mut inner = self.inner.write();
        inner.generation += 1;
        let generation = inner.generation;
        let key = (table.to_owned(), entity_id.to_owned());

        if state == EntitySyncState::Synced {
            inner.settled.push_back((key.clone(), generation));
        }
        inner.states.insert(key, (state, generation));

        while inner.settled.len() > self.capacity {
            let Some((key, generation)) = inner.settled.pop_front() else {
                break;
            };
            // Stale when the entity changed state after this entry was recorded.
            if inner.states.get(&key).is_some_and(|(_, current)| *current == generation) {
                inner.states.remove(&key);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_is_clean() {
        let table = StateTable::new(4);
        assert_eq!(table.get("notes", "n1"), EntitySyncState::Clean);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn oldest_synced_entries_are_evicted() {
        let table = StateTable::new(2);
        for id in ["a", "b", "c"] {
            table.set("notes", id, EntitySyncState::Synced);
        }

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("notes", "a"), EntitySyncState::Clean);
        assert_eq!(table.get("notes", "b"), EntitySyncState::Synced);
        assert_eq!(table.get("notes", "c"), EntitySyncState::Synced);
    }

    #[test]
    fn unsettled_entries_are_never_evicted() {
        let table = StateTable::new(1);
        table.set("notes", "a", EntitySyncState::Synced);
        table.set("notes", "a", EntitySyncState::QueuedOffline);
        table.set("notes", "b", EntitySyncState::Synced);
        table.set("notes", "c", EntitySyncState::Synced);

        assert_eq!(table.get("notes", "a"), EntitySyncState::QueuedOffline);
        assert_eq!(table.get("notes", "b"), EntitySyncState::Clean);
        assert_eq!(table.get("notes", "c"), EntitySyncState::Synced);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn resynced_entity_keeps_its_newest_entry() {
        let table = StateTable::new(2);
        table.set("notes", "a", EntitySyncState::Synced);
        table.set("notes", "b", EntitySyncState::Synced);
        table.set("notes", "a", EntitySyncState::Synced);

        assert_eq!(table.get("notes", "a"), EntitySyncState::Synced);
        assert_eq!(table.get("notes", "b"), EntitySyncState::Synced);
    }

    #[test]
    fn settled_states() {
        assert!(EntitySyncState::Clean.is_settled());
        assert!(EntitySyncState::Synced.is_settled());
        assert!(!EntitySyncState::QueuedOffline.is_settled());
        assert!(!EntitySyncState::PermanentlyFailed.is_settled());
    }
}
