//! Error types for the sync engine.

use crate::backend::BackendError;
use crate::store::StoreError;
use thiserror::Error;
use tidesync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The backend could not be reached, timed out, or failed with a 5xx.
    #[error("transient network error: {message}")]
    TransientNetwork {
        /// Error message.
        message: String,
    },

    /// The remote row has moved past the version this push was based on.
    #[error("version regression on {table}/{entity_id}: attempted version {attempted} is behind remote")]
    VersionRegression {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
        /// Version carried by the rejected push.
        attempted: u64,
        /// Remote version, when the backend reported it.
        remote: Option<u64>,
    },

    /// An undelete did not meet the required version bump, or the entity was not deleted.
    #[error("invalid undelete of {entity_id}: {reason}")]
    InvalidUndelete {
        /// Entity ID.
        entity_id: String,
        /// What was wrong with the request.
        reason: String,
    },

    /// The push tried to change a column the backend treats as immutable.
    #[error("immutable column {column} changed on {table}/{entity_id}")]
    ImmutableFieldViolation {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
        /// Offending column.
        column: String,
    },

    /// The remote already holds this exact version.
    #[error("{table}/{entity_id} is already at version {version} remotely")]
    SameVersionNoop {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
        /// The version both sides share.
        version: u64,
    },

    /// The backend rejected the request with a 4xx status.
    #[error("server rejected request with status {status}: {message}")]
    ServerRejected {
        /// HTTP-style status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// A ciphertext-shaped value could not be decrypted with any known key.
    #[error("decryption failed: {message}")]
    DecryptionFailure {
        /// Error message.
        message: String,
    },

    /// A value could not be encrypted.
    #[error("encryption failed: {message}")]
    EncryptionFailure {
        /// Error message.
        message: String,
    },

    /// Key material had the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKey {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// No configuration is registered for a Rust type.
    #[error("no entity configuration registered for type {type_name}")]
    UnregisteredType {
        /// Type name.
        type_name: &'static str,
    },

    /// No configuration is registered for a remote table.
    #[error("no entity configuration registered for table {table}")]
    UnregisteredTable {
        /// Remote table.
        table: String,
    },

    /// A type or table was registered twice.
    #[error("duplicate registration of {type_name} for table {table}")]
    DuplicateRegistration {
        /// Type name.
        type_name: &'static str,
        /// Remote table.
        table: String,
    },

    /// A remote-only row needs to be created locally but the type has no factory.
    #[error("no factory registered for table {table}")]
    FactoryMissing {
        /// Remote table.
        table: String,
    },

    /// A remote row is missing required columns or has the wrong shape.
    #[error("malformed record in {table}: {reason}")]
    MalformedRecord {
        /// Remote table.
        table: String,
        /// What was wrong.
        reason: String,
    },

    /// The entity handed to the engine is not in a valid state for the operation.
    #[error("invalid entity: {reason}")]
    InvalidEntity {
        /// What was wrong.
        reason: String,
    },

    /// A reconciliation pass for this table is already running.
    #[error("reconciliation already in progress for {table}")]
    ReconcileInProgress {
        /// Remote table.
        table: String,
    },

    /// The local store failed to save or load.
    #[error("local persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// The offline queue log could not be read or written.
    #[error("offline queue storage error: {0}")]
    QueueStorage(#[from] StorageError),

    /// A queue log frame could not be encoded or decoded.
    #[error("offline queue codec error: {0}")]
    QueueCodec(String),
}

impl SyncError {
    /// Creates a transient network error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Creates an invalid-entity error.
    pub fn invalid_entity(reason: impl Into<String>) -> Self {
        Self::InvalidEntity {
            reason: reason.into(),
        }
    }

    /// Creates a malformed-record error.
    pub fn malformed(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Classifies a backend failure for a push of `entity_id` at `attempted`.
    ///
    /// Network failures, timeouts and 5xx/408/429 statuses are transient.
    /// Everything else is permanent and maps to its own variant.
    pub fn from_backend(error: BackendError, table: &str, entity_id: &str, attempted: u64) -> Self {
        match error {
            BackendError::Network(message) => Self::TransientNetwork { message },
            BackendError::Timeout => Self::transient("request timed out"),
            BackendError::Status { status, message } if is_transient_status(status) => {
                Self::TransientNetwork {
                    message: format!("status {status}: {message}"),
                }
            }
            BackendError::Status { status, message } => Self::ServerRejected { status, message },
            BackendError::VersionConflict { remote_version } => Self::VersionRegression {
                table: table.to_owned(),
                entity_id: entity_id.to_owned(),
                attempted,
                remote: remote_version,
            },
            BackendError::ImmutableField { column } => Self::ImmutableFieldViolation {
                table: table.to_owned(),
                entity_id: entity_id.to_owned(),
                column,
            },
            BackendError::SameVersion { version } => Self::SameVersionNoop {
                table: table.to_owned(),
                entity_id: entity_id.to_owned(),
                version,
            },
        }
    }

    /// Classifies a backend failure that is not tied to a single entity (reads).
    pub fn from_read_failure(error: BackendError, table: &str) -> Self {
        Self::from_backend(error, table, "", 0)
    }

    /// Returns true if this error can be retried.
    ///
    /// Only retryable push failures are enqueued for offline replay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork { .. })
    }

    /// Returns true if this is a version regression.
    pub fn is_version_regression(&self) -> bool {
        matches!(self, SyncError::VersionRegression { .. })
    }
}

fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
