//! Fixture entity types and a ready-to-use coordinator harness.
//!
//! The fixtures form a three-level hierarchy:
//! `Notebook <- Folder <- Note`. Notes carry a protected `content` column
//! (`reject_if_empty`) and an encrypted `secret` column.

use crate::backend::MockBackend;
use crate::clock::ManualClock;
use crate::store::MemoryStore;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tidesync_core::{
    EncryptionKey, EntityConfig, FieldMapping, OfflineQueue, RemoteRecord, SyncConfig,
    SyncCoordinator, SyncableEntity,
};
use tidesync_storage::FileBackend;

/// Notebooks table.
pub const NOTEBOOKS: &str = "notebooks";
/// Folders table.
pub const FOLDERS: &str = "folders";
/// Notes table.
pub const NOTES: &str = "notes";

macro_rules! impl_syncable {
    ($ty:ty) => {
        impl SyncableEntity for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn version(&self) -> u64 {
                self.version
            }
            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
            fn is_deleted(&self) -> bool {
                self.deleted
            }
            fn set_deleted(&mut self, deleted: bool) {
                self.deleted = deleted;
            }
            fn updated_at(&self) -> u64 {
                self.updated_at
            }
            fn set_updated_at(&mut self, millis: u64) {
                self.updated_at = millis;
            }
        }
    };
}

/// Root of the hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notebook {
    /// ID.
    pub id: String,
    /// Version.
    pub version: u64,
    /// Tombstone flag.
    pub deleted: bool,
    /// Last local change, Unix ms.
    pub updated_at: u64,
    /// Display name.
    pub name: String,
}

/// Child of a notebook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Folder {
    /// ID.
    pub id: String,
    /// Version.
    pub version: u64,
    /// Tombstone flag.
    pub deleted: bool,
    /// Last local change, Unix ms.
    pub updated_at: u64,
    /// Owning notebook.
    pub notebook_id: String,
    /// Display name.
    pub name: String,
}

/// Leaf of the hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Note {
    /// ID.
    pub id: String,
    /// Version.
    pub version: u64,
    /// Tombstone flag.
    pub deleted: bool,
    /// Last local change, Unix ms.
    pub updated_at: u64,
    /// Owning folder, if filed.
    pub folder_id: Option<String>,
    /// Title.
    pub title: String,
    /// Body; never blanked by inbound data.
    pub content: String,
    /// Encrypted at rest on the server.
    pub secret: Option<String>,
}

impl_syncable!(Notebook);
impl_syncable!(Folder);
impl_syncable!(Note);

impl Notebook {
    /// A live notebook at version 0.
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Folder {
    /// A live folder at version 0.
    pub fn new(id: &str, notebook_id: &str, name: &str) -> Self {
        Self {
            id: id.into(),
            notebook_id: notebook_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Note {
    /// A live, unfiled note at version 0.
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// Files the note under `folder_id`.
    pub fn in_folder(mut self, folder_id: &str) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    /// Sets the body.
    pub fn with_content(mut self, content: &str) -> Self {
        self.content = content.into();
        self
    }

    /// Sets the secret.
    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Registration for [`Notebook`].
pub fn notebook_config() -> EntityConfig {
    EntityConfig::builder::<Notebook>(NOTEBOOKS)
        .field(FieldMapping::text(
            "name",
            |n: &Notebook| n.name.clone(),
            |n: &mut Notebook, v| n.name = v,
        ))
        .factory(|record| Some(Notebook::new(record.id()?, "")))
        .build()
}

/// Registration for [`Folder`].
pub fn folder_config() -> EntityConfig {
    EntityConfig::builder::<Folder>(FOLDERS)
        .field(FieldMapping::text(
            "notebook_id",
            |f: &Folder| f.notebook_id.clone(),
            |f: &mut Folder, v| f.notebook_id = v,
        ))
        .field(FieldMapping::text(
            "name",
            |f: &Folder| f.name.clone(),
            |f: &mut Folder, v| f.name = v,
        ))
        .parent::<Notebook, _>(|f| Some(f.notebook_id.clone()))
        .factory(|record| Some(Folder::new(record.id()?, "", "")))
        .build()
}

/// Registration for [`Note`].
pub fn note_config() -> EntityConfig {
    EntityConfig::builder::<Note>(NOTES)
        .field(FieldMapping::new(
            "folder_id",
            |n: &Note| n.folder_id.clone().map_or(Value::Null, Value::String),
            |n: &mut Note, v: Value| n.folder_id = v.as_str().map(str::to_owned),
        ))
        .field(FieldMapping::text(
            "title",
            |n: &Note| n.title.clone(),
            |n: &mut Note, v| n.title = v,
        ))
        .field(
            FieldMapping::text(
                "content",
                |n: &Note| n.content.clone(),
                |n: &mut Note, v| n.content = v,
            )
            .reject_if_empty(),
        )
        .field(
            FieldMapping::new(
                "secret",
                |n: &Note| n.secret.clone().map_or(Value::Null, Value::String),
                |n: &mut Note, v: Value| n.secret = v.as_str().map(str::to_owned),
            )
            .encrypted(),
        )
        .parent::<Folder, _>(|n| n.folder_id.clone())
        .factory(|record| Some(Note::new(record.id()?, "")))
        .build()
}

/// The coordinator type the harness builds.
pub type TestCoordinator = SyncCoordinator<Arc<MockBackend>, Arc<MemoryStore>>;

/// A coordinator wired to a mock remote, an in-memory store and a manual
/// clock, with the fixture types registered.
pub struct TestHarness {
    /// The coordinator.
    pub sync: TestCoordinator,
    /// The remote it pushes to.
    pub remote: Arc<MockBackend>,
    /// The local store.
    pub local: Arc<MemoryStore>,
    /// The clock driving echo windows and timestamps.
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    /// Harness with an in-memory queue and encryption enabled.
    pub fn new() -> Self {
        Self::build(MockBackend::new(), OfflineQueue::in_memory(), SyncConfig::default())
    }

    /// Harness over `remote`, `queue` and `config`.
    pub fn build(remote: MockBackend, queue: OfflineQueue, config: SyncConfig) -> Self {
        let remote = Arc::new(remote);
        let local = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());

        let sync = SyncCoordinator::builder(Arc::clone(&remote), Arc::clone(&local))
            .config(config)
            .queue(queue)
            .encryption_key(test_key())
            .clock(clock.clone())
            .build()
            .expect("Failed to build coordinator");
        sync.register(notebook_config()).expect("register notebooks");
        sync.register(folder_config()).expect("register folders");
        sync.register(note_config()).expect("register notes");

        Self {
            sync,
            remote,
            local,
            clock,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// The key [`TestHarness`] encrypts with.
pub fn test_key() -> EncryptionKey {
    EncryptionKey::derive_from_secret(b"tidesync test secret", b"tidesync test salt")
        .expect("Failed to derive test key")
}

/// A temporary directory holding a queue log file.
pub struct TempQueueDir {
    dir: TempDir,
}

impl TempQueueDir {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the queue log inside the directory.
    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("queue.log")
    }

    /// Opens (or reopens) the queue stored in the directory.
    pub fn open(&self) -> OfflineQueue {
        let backend =
            FileBackend::open_with_create_dirs(&self.log_path()).expect("Failed to open queue log");
        OfflineQueue::open(Box::new(backend)).expect("Failed to replay queue log")
    }
}

impl Default for TempQueueDir {
    fn default() -> Self {
        Self::new()
    }
}

/// A remote note row with the sync columns and plaintext fields set.
pub fn note_row(id: &str, version: u64, title: &str) -> RemoteRecord {
    RemoteRecord::new()
        .with("id", id)
        .with("version", version)
        .with("deleted", false)
        .with("title", title)
}
