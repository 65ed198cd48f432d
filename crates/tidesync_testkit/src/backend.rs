//! Scriptable in-memory remote.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tidesync_core::{BackendError, Columns, Filter, RemoteBackend, RemoteRecord};

#[derive(Debug)]
struct MockState {
    tables: HashMap<String, BTreeMap<String, RemoteRecord>>,
    online: bool,
    batch: bool,
    scripted: VecDeque<BackendError>,
    select_failures: BTreeMap<usize, BackendError>,
    immutable: HashMap<String, HashSet<String>>,
    upserts: usize,
    batch_calls: usize,
    selects: usize,
}

/// A remote table store that behaves like a version-guarded server.
///
/// Upserts are accepted when the incoming version is strictly greater than
/// the stored one (or the row is new). A lower version is rejected with
/// [`BackendError::VersionConflict`]; an equal version is
/// [`BackendError::SameVersion`] if the row is identical and a conflict
/// otherwise.
///
/// Offline mode fails every call with [`BackendError::Network`].
/// [`fail_next`](Self::fail_next) scripts failures for upcoming upserts,
/// [`fail_select`](Self::fail_select) for a chosen upcoming select.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Creates an online backend with empty tables and no batch support.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                tables: HashMap::new(),
                online: true,
                batch: false,
                scripted: VecDeque::new(),
                select_failures: BTreeMap::new(),
                immutable: HashMap::new(),
                upserts: 0,
                batch_calls: 0,
                selects: 0,
            }),
        }
    }

    /// Enables bulk upserts.
    pub fn with_batch_upsert(self) -> Self {
        self.state.lock().batch = true;
        self
    }

    /// Switches the network on or off.
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Makes the next upsert fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: BackendError) {
        self.state.lock().scripted.push_back(error);
    }

    /// Makes the `call`-th select from now (1-based) fail with `error`.
    pub fn fail_select(&self, call: usize, error: BackendError) {
        let mut state = self.state.lock();
        let at = state.selects + call;
        state.select_failures.insert(at, error);
    }

    /// Rejects upserts that change `column` of an existing row.
    pub fn mark_immutable(&self, table: &str, column: &str) {
        self.state
            .lock()
            .immutable
            .entry(table.to_owned())
            .or_default()
            .insert(column.to_owned());
    }

    /// Stores a row directly, bypassing every check.
    pub fn insert_row(&self, table: &str, record: RemoteRecord) {
        let id = record.id().unwrap_or_default().to_owned();
        self.state
            .lock()
            .tables
            .entry(table.to_owned())
            .or_default()
            .insert(id, record);
    }

    /// Returns a stored row.
    pub fn row(&self, table: &str, id: &str) -> Option<RemoteRecord> {
        self.state.lock().tables.get(table)?.get(id).cloned()
    }

    /// All rows of `table`, sorted by ID.
    pub fn rows(&self, table: &str) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Upsert attempts so far, including each row of a bulk upsert.
    pub fn upsert_count(&self) -> usize {
        self.state.lock().upserts
    }

    /// Bulk upsert calls so far.
    pub fn batch_call_count(&self) -> usize {
        self.state.lock().batch_calls
    }

    /// Select calls so far.
    pub fn select_count(&self) -> usize {
        self.state.lock().selects
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn upsert(&mut self, table: &str, record: &RemoteRecord) -> Result<u16, BackendError> {
        self.upserts += 1;
        if !self.online {
            return Err(BackendError::Network("offline".into()));
        }
        if let Some(error) = self.scripted.pop_front() {
            return Err(error);
        }

        let (Some(id), Some(version)) = (record.id(), record.version()) else {
            return Err(BackendError::Status {
                status: 400,
                message: "id and version are required".into(),
            });
        };

        let immutable = self.immutable.get(table);
        let rows = self.tables.entry(table.to_owned()).or_default();
        let Some(existing) = rows.get(id) else {
            rows.insert(id.to_owned(), record.clone());
            return Ok(201);
        };

        let stored = existing.version().unwrap_or_default();
        if version < stored || (version == stored && existing != record) {
            return Err(BackendError::VersionConflict {
                remote_version: Some(stored),
            });
        }
        if version == stored {
            return Err(BackendError::SameVersion { version });
        }
        if let Some(column) = immutable.and_then(|columns| {
            columns
                .iter()
                .find(|column| existing.get(column) != record.get(column))
        }) {
            return Err(BackendError::ImmutableField {
                column: column.clone(),
            });
        }

        rows.insert(id.to_owned(), record.clone());
        Ok(200)
    }
}

impl RemoteBackend for MockBackend {
    fn upsert(&self, table: &str, record: &RemoteRecord) -> Result<u16, BackendError> {
        self.state.lock().upsert(table, record)
    }

    fn supports_batch_upsert(&self) -> bool {
        self.state.lock().batch
    }

    fn upsert_batch(
        &self,
        table: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<Result<u16, BackendError>>, BackendError> {
        let mut state = self.state.lock();
        state.batch_calls += 1;
        if !state.online {
            return Err(BackendError::Network("offline".into()));
        }
        Ok(records
            .iter()
            .map(|record| state.upsert(table, record))
            .collect())
    }

    fn select(
        &self,
        table: &str,
        columns: &Columns,
        filter: &Filter,
    ) -> Result<Vec<RemoteRecord>, BackendError> {
        let mut state = self.state.lock();
        state.selects += 1;
        if !state.online {
            return Err(BackendError::Network("offline".into()));
        }
        let call = state.selects;
        if let Some(error) = state.select_failures.remove(&call) {
            return Err(error);
        }

        let Some(rows) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|row| filter.matches(row))
            .map(|row| match columns {
                Columns::All => row.clone(),
                Columns::Only(_) => row
                    .iter()
                    .filter(|(column, _)| columns.includes(column))
                    .fold(RemoteRecord::new(), |projected, (column, value)| {
                        projected.with(column.clone(), value.clone())
                    }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: u64, title: &str) -> RemoteRecord {
        RemoteRecord::new()
            .with("id", id)
            .with("version", version)
            .with("title", title)
    }

    #[test]
    fn version_guard() {
        let remote = MockBackend::new();
        assert_eq!(remote.upsert("t", &record("a", 1, "x")), Ok(201));
        assert_eq!(remote.upsert("t", &record("a", 2, "y")), Ok(200));
        assert_eq!(
            remote.upsert("t", &record("a", 1, "z")),
            Err(BackendError::VersionConflict {
                remote_version: Some(2)
            })
        );
        assert_eq!(
            remote.upsert("t", &record("a", 2, "y")),
            Err(BackendError::SameVersion { version: 2 })
        );
        assert!(matches!(
            remote.upsert("t", &record("a", 2, "other")),
            Err(BackendError::VersionConflict { .. })
        ));
    }

    #[test]
    fn offline_and_scripted_failures() {
        let remote = MockBackend::new();
        remote.set_online(false);
        assert!(matches!(
            remote.upsert("t", &record("a", 0, "x")),
            Err(BackendError::Network(_))
        ));

        remote.set_online(true);
        remote.fail_next(BackendError::Timeout);
        assert_eq!(remote.upsert("t", &record("a", 0, "x")), Err(BackendError::Timeout));
        assert_eq!(remote.upsert("t", &record("a", 0, "x")), Ok(201));
        assert_eq!(remote.upsert_count(), 3);
    }

    #[test]
    fn immutable_columns() {
        let remote = MockBackend::new();
        remote.mark_immutable("t", "title");
        remote.upsert("t", &record("a", 0, "x")).unwrap();
        assert_eq!(
            remote.upsert("t", &record("a", 1, "y")),
            Err(BackendError::ImmutableField {
                column: "title".into()
            })
        );
    }

    #[test]
    fn select_filters_and_projects() {
        let remote = MockBackend::new();
        remote.insert_row("t", record("a", 1, "x"));
        remote.insert_row("t", record("b", 2, "y"));

        let rows = remote
            .select("t", &Columns::only(["id", "version"]), &Filter::ids(&["b".to_owned()]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version(), Some(2));
        assert!(!rows[0].contains("title"));
    }

    #[test]
    fn scripted_select_failure_hits_only_that_call() {
        let remote = MockBackend::new();
        remote.insert_row("t", record("a", 1, "x"));
        remote.fail_select(2, BackendError::Timeout);

        assert!(remote.select("t", &Columns::All, &Filter::all()).is_ok());
        assert_eq!(
            remote.select("t", &Columns::All, &Filter::all()),
            Err(BackendError::Timeout)
        );
        assert_eq!(remote.select("t", &Columns::All, &Filter::all()).unwrap().len(), 1);
    }
}
