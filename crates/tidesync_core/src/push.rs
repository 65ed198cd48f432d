//! Outbound side: entity to record, then version-guarded upsert.

use crate::backend::{is_success, BackendError, RemoteBackend};
use crate::crypto::EncryptionService;
use crate::echo::EchoTracker;
use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use crate::record::{RemoteRecord, DELETED_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN, VERSION_COLUMN};
use crate::registry::EntityConfig;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-entity outcome of a batch push.
#[derive(Debug)]
pub struct PushReport {
    /// Entity ID.
    pub entity_id: String,
    /// Version that was pushed.
    pub version: u64,
    /// Whether the upsert was accepted.
    pub result: SyncResult<()>,
}

/// Serializes entities and upserts them.
///
/// Every push marks the entity in the [`EchoTracker`] *before* the request
/// goes out, so the realtime echo can't race ahead of the bookkeeping.
pub struct PushEngine<B> {
    backend: Arc<B>,
    echo: Arc<EchoTracker>,
    crypto: Arc<EncryptionService>,
    batch_size: usize,
}

impl<B: RemoteBackend> PushEngine<B> {
    /// Creates a push engine.
    pub fn new(
        backend: Arc<B>,
        echo: Arc<EchoTracker>,
        crypto: Arc<EncryptionService>,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            echo,
            crypto,
            batch_size: batch_size.max(1),
        }
    }

    /// Serializes `entity` into a remote record: the sync columns plus every
    /// mapped field, with encrypted fields sealed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidEntity`] for an empty ID or a type that
    /// does not match `config`, and [`SyncError::EncryptionFailure`] if an
    /// encrypted field cannot be sealed.
    pub fn build_record(
        &self,
        entity: &dyn SyncableEntity,
        config: &EntityConfig,
    ) -> SyncResult<RemoteRecord> {
        if entity.id().is_empty() {
            return Err(SyncError::invalid_entity("entity ID must not be empty"));
        }

        let mut record = RemoteRecord::new()
            .with(ID_COLUMN, entity.id())
            .with(VERSION_COLUMN, entity.version())
            .with(DELETED_COLUMN, entity.is_deleted())
            .with(UPDATED_AT_COLUMN, entity.updated_at());

        for field in config.fields() {
            let value = field.read(entity)?;
            let value = if field.is_encrypted() {
                self.crypto.encrypt(field.column(), &value)?
            } else {
                value
            };
            record.insert(field.column(), value);
        }

        Ok(record)
    }

    /// Builds and pushes `entity`.
    ///
    /// # Errors
    ///
    /// See [`build_record`](Self::build_record) and [`push_record`](Self::push_record).
    pub fn push(&self, entity: &dyn SyncableEntity, config: &EntityConfig) -> SyncResult<()> {
        let record = self.build_record(entity, config)?;
        self.push_record(config.table(), &record)
    }

    /// Upserts an already-built record.
    ///
    /// # Errors
    ///
    /// Returns the classified backend failure. Only
    /// [`SyncError::TransientNetwork`] is retryable.
    pub fn push_record(&self, table: &str, record: &RemoteRecord) -> SyncResult<()> {
        let (entity_id, version) = record_identity(table, record)?;

        self.echo.mark_as_pushed(entity_id, table);
        let result = self
            .backend
            .upsert(table, record)
            .and_then(check_status);

        match result {
            Ok(()) => {
                debug!(table, entity_id, version, "pushed");
                Ok(())
            }
            Err(e) => {
                let error = SyncError::from_backend(e, table, entity_id, version);
                warn!(table, entity_id, version, error = %error, "push failed");
                Err(error)
            }
        }
    }

    /// Builds and pushes several entities of one type.
    ///
    /// Entities that fail to serialize get their error in the report and are
    /// not sent.
    pub fn push_batch(
        &self,
        entities: &[&dyn SyncableEntity],
        config: &EntityConfig,
    ) -> Vec<PushReport> {
        let mut reports = Vec::with_capacity(entities.len());
        let mut records = Vec::with_capacity(entities.len());

        for entity in entities {
            match self.build_record(*entity, config) {
                Ok(record) => records.push(record),
                Err(error) => reports.push(PushReport {
                    entity_id: entity.id().to_owned(),
                    version: entity.version(),
                    result: Err(error),
                }),
            }
        }

        reports.extend(self.push_records(config.table(), &records));
        reports
    }

    /// Pushes already-built records, using the backend's bulk upsert when it
    /// has one. Records are sent in chunks of the configured batch size.
    pub fn push_records(&self, table: &str, records: &[RemoteRecord]) -> Vec<PushReport> {
        if !self.backend.supports_batch_upsert() {
            return records
                .iter()
                .map(|record| self.report_single(table, record))
                .collect();
        }

        let mut reports = Vec::with_capacity(records.len());
        for chunk in records.chunks(self.batch_size) {
            reports.extend(self.push_chunk(table, chunk));
        }
        reports
    }

    fn report_single(&self, table: &str, record: &RemoteRecord) -> PushReport {
        PushReport {
            entity_id: record.id().unwrap_or_default().to_owned(),
            version: record.version().unwrap_or_default(),
            result: self.push_record(table, record),
        }
    }

    fn push_chunk(&self, table: &str, chunk: &[RemoteRecord]) -> Vec<PushReport> {
        for record in chunk {
            if let Some(id) = record.id() {
                self.echo.mark_as_pushed(id, table);
            }
        }

        let outcome = self.backend.upsert_batch(table, chunk);
        debug!(table, records = chunk.len(), ok = outcome.is_ok(), "batch upsert");

        chunk
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let entity_id = record.id().unwrap_or_default().to_owned();
                let version = record.version().unwrap_or_default();
                let row = match &outcome {
                    Ok(rows) => rows.get(i).cloned().unwrap_or_else(|| {
                        Err(BackendError::Network("batch response missing row".into()))
                    }),
                    Err(e) => Err(e.clone()),
                };
                let result = if entity_id.is_empty() {
                    Err(SyncError::malformed(table, "record has no id"))
                } else {
                    row.and_then(check_status)
                        .map_err(|e| SyncError::from_backend(e, table, &entity_id, version))
                };
                PushReport {
                    entity_id,
                    version,
                    result,
                }
            })
            .collect()
    }
}

fn check_status(status: u16) -> Result<(), BackendError> {
    if is_success(status) {
        Ok(())
    } else {
        Err(BackendError::Status {
            status,
            message: "unexpected upsert status".into(),
        })
    }
}

fn record_identity<'a>(table: &str, record: &'a RemoteRecord) -> SyncResult<(&'a str, u64)> {
    let id = record
        .id()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SyncError::malformed(table, "record has no id"))?;
    let version = record
        .version()
        .ok_or_else(|| SyncError::malformed(table, "record has no version"))?;
    Ok((id, version))
}
