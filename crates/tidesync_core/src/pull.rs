//! Inbound side: fetch remote rows and merge them into local entities.
//!
//! # Merge rules
//!
//! Given a remote record and the local copy of the same entity:
//!
//! 1. remote version > local version: adopt the remote version, tombstone
//!    flag, timestamp and every mapped field present in the record
//! 2. remote version < local version: change nothing
//! 3. equal versions: only a remote tombstone is adopted (deletion wins)
//!
//! Encrypted fields are decrypted before anything is written, so a
//! decryption failure leaves the local entity untouched. `reject_if_empty`
//! fields ignore null, empty strings and empty collections.

use crate::backend::{BackendError, Columns, Filter, RemoteBackend};
use crate::crypto::EncryptionService;
use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use crate::record::{
    is_empty_value, RemoteRecord, VersionStamp, DELETED_COLUMN, ID_COLUMN, VERSION_COLUMN,
};
use crate::registry::EntityConfig;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    /// The local entity changed and should be saved.
    pub was_modified: bool,
    /// Some inbound encrypted field was plaintext or sealed with a retired
    /// key; the entity should be re-pushed.
    pub needs_healing: bool,
}

/// Decoded inbound field values, ready to apply.
struct DecodedFields {
    values: Vec<(usize, Value)>,
    needs_healing: bool,
}

/// Fetches and merges remote rows.
pub struct PullEngine<B> {
    backend: Arc<B>,
    crypto: Arc<EncryptionService>,
    chunk_size: usize,
}

impl<B: RemoteBackend> PullEngine<B> {
    /// Creates a pull engine. `chunk_size` bounds `id IN (...)` lists.
    pub fn new(backend: Arc<B>, crypto: Arc<EncryptionService>, chunk_size: usize) -> Self {
        Self {
            backend,
            crypto,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Merges `remote` into `local` following the merge rules.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedRecord`] if the record has no version or
    /// a different ID, and [`SyncError::DecryptionFailure`] if an encrypted
    /// column cannot be opened. `local` is unchanged on error.
    pub fn merge_into(
        &self,
        remote: &RemoteRecord,
        local: &mut dyn SyncableEntity,
        config: &EntityConfig,
    ) -> SyncResult<MergeResult> {
        if local.as_any().type_id() != config.type_id() {
            return Err(SyncError::invalid_entity(format!(
                "entity {} is not a {}",
                local.id(),
                config.type_name()
            )));
        }
        let remote_version = self.check_identity(remote, local.id(), config)?;
        let local_version = local.version();

        if remote_version > local_version {
            let decoded = self.decode_fields(remote, config)?;
            apply_sync_columns(remote, local, remote_version);
            apply_fields(decoded.values, local, config)?;
            return Ok(MergeResult {
                was_modified: true,
                needs_healing: decoded.needs_healing,
            });
        }

        if remote_version == local_version && remote.is_deleted() && !local.is_deleted() {
            local.set_deleted(true);
            return Ok(MergeResult {
                was_modified: true,
                needs_healing: false,
            });
        }

        Ok(MergeResult::default())
    }

    /// Creates a local entity for a row that only exists remotely.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::FactoryMissing`] if the type has no factory, plus
    /// the errors of [`merge_into`](Self::merge_into).
    pub fn materialize(
        &self,
        remote: &RemoteRecord,
        config: &EntityConfig,
    ) -> SyncResult<(Box<dyn SyncableEntity>, MergeResult)> {
        let id = remote
            .id()
            .ok_or_else(|| SyncError::malformed(config.table(), "record has no id"))?;
        let mut entity = config.instantiate(remote)?;
        let remote_version = self.check_identity(remote, id, config)?;
        if entity.id() != id {
            return Err(SyncError::malformed(
                config.table(),
                format!("factory produced id {} for record {id}", entity.id()),
            ));
        }

        let decoded = self.decode_fields(remote, config)?;
        apply_sync_columns(remote, entity.as_mut(), remote_version);
        apply_fields(decoded.values, entity.as_mut(), config)?;

        debug!(table = config.table(), entity_id = id, version = remote_version, "materialized");
        Ok((
            entity,
            MergeResult {
                was_modified: true,
                needs_healing: decoded.needs_healing,
            },
        ))
    }

    /// Reports whether any encrypted column of `remote` is plaintext or
    /// sealed with a retired key, without touching a local entity.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DecryptionFailure`] if a column cannot be opened.
    pub fn needs_healing(&self, remote: &RemoteRecord, config: &EntityConfig) -> SyncResult<bool> {
        Ok(self.decode_fields(remote, config)?.needs_healing)
    }

    /// Fetches every row of the type's table, optionally filtered.
    ///
    /// # Errors
    ///
    /// Returns the classified backend failure.
    pub fn pull_all(
        &self,
        config: &EntityConfig,
        filter: Option<&Filter>,
    ) -> SyncResult<Vec<RemoteRecord>> {
        let filter = filter.cloned().unwrap_or_default();
        self.select(config, &Columns::All, &filter)
    }

    /// Fetches the `(id, version, deleted)` projection of every row.
    ///
    /// # Errors
    ///
    /// Returns the classified backend failure, or
    /// [`SyncError::MalformedRecord`] if a row lacks an id or version.
    pub fn pull_versions(&self, config: &EntityConfig) -> SyncResult<Vec<VersionStamp>> {
        let columns = Columns::only([ID_COLUMN, VERSION_COLUMN, DELETED_COLUMN]);
        self.select(config, &columns, &Filter::all())?
            .iter()
            .map(|record| {
                VersionStamp::from_record(record).ok_or_else(|| {
                    SyncError::malformed(config.table(), "version projection lacks id or version")
                })
            })
            .collect()
    }

    /// Fetches full rows for `ids`, in chunks.
    ///
    /// # Errors
    ///
    /// Returns the classified backend failure of the first failing chunk.
    pub fn pull_by_ids(&self, config: &EntityConfig, ids: &[String]) -> SyncResult<Vec<RemoteRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.chunk_size) {
            records.extend(self.select(config, &Columns::All, &Filter::ids(chunk))?);
        }
        Ok(records)
    }

    /// Fetches full rows for `ids` one chunk at a time, yielding each
    /// chunk's IDs with its own result so a failed read leaves the other
    /// chunks usable.
    pub fn pull_chunks<'a>(
        &'a self,
        config: &'a EntityConfig,
        ids: &'a [String],
    ) -> impl Iterator<Item = (&'a [String], Result<Vec<RemoteRecord>, BackendError>)> + 'a {
        ids.chunks(self.chunk_size).map(move |chunk| {
            let rows = self
                .backend
                .select(config.table(), &Columns::All, &Filter::ids(chunk));
            if let Err(e) = &rows {
                warn!(table = config.table(), ids = chunk.len(), error = %e, "chunk pull failed");
            }
            (chunk, rows)
        })
    }

    fn select(
        &self,
        config: &EntityConfig,
        columns: &Columns,
        filter: &Filter,
    ) -> SyncResult<Vec<RemoteRecord>> {
        let rows = self
            .backend
            .select(config.table(), columns, filter)
            .map_err(|e| SyncError::from_read_failure(e, config.table()))?;
        debug!(table = config.table(), rows = rows.len(), "pulled");
        Ok(rows)
    }

    fn check_identity(
        &self,
        remote: &RemoteRecord,
        expected_id: &str,
        config: &EntityConfig,
    ) -> SyncResult<u64> {
        match remote.id() {
            Some(id) if id == expected_id => {}
            other => {
                return Err(SyncError::malformed(
                    config.table(),
                    format!("record id {other:?} does not match entity {expected_id}"),
                ))
            }
        }
        remote
            .version()
            .ok_or_else(|| SyncError::malformed(config.table(), "record has no version"))
    }

    fn decode_fields(&self, remote: &RemoteRecord, config: &EntityConfig) -> SyncResult<DecodedFields> {
        let mut decoded = DecodedFields {
            values: Vec::with_capacity(config.fields().len()),
            needs_healing: false,
        };

        for (index, field) in config.fields().iter().enumerate() {
            // Absent columns (e.g. projections) keep the local value.
            let Some(raw) = remote.get(field.column()) else {
                continue;
            };

            let value = if field.is_encrypted() {
                self.open_field(field.column(), raw, &mut decoded.needs_healing)?
            } else {
                raw.clone()
            };

            if field.rejects_empty() && is_empty_value(&value) {
                continue;
            }
            decoded.values.push((index, value));
        }

        Ok(decoded)
    }

    fn open_field(&self, column: &str, raw: &Value, needs_healing: &mut bool) -> SyncResult<Value> {
        match raw {
            Value::Null => Ok(Value::Null),
            Value::String(text) if EncryptionService::is_ciphertext(text) => {
                let opened = self.crypto.decrypt(column, text)?;
                *needs_healing |= opened.used_retired_key;
                Ok(opened.value)
            }
            other => {
                // Legacy plaintext; adopt it and ask for a re-push.
                warn!(column, "plaintext value in encrypted column");
                *needs_healing = true;
                Ok(other.clone())
            }
        }
    }
}

fn apply_sync_columns(remote: &RemoteRecord, local: &mut dyn SyncableEntity, version: u64) {
    local.set_version(version);
    local.set_deleted(remote.is_deleted());
    if let Some(updated_at) = remote.updated_at() {
        local.set_updated_at(updated_at);
    }
}

fn apply_fields(
    values: Vec<(usize, Value)>,
    local: &mut dyn SyncableEntity,
    config: &EntityConfig,
) -> SyncResult<()> {
    let fields = config.fields();
    for (index, value) in values {
        fields[index].write(local, value)?;
    }
    Ok(())
}
