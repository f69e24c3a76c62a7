//! Backup registry: the single source of truth for published backups
//!
//! All mutations go through one write lock, so readers observe either a fully
//! inserted record or nothing. With a catalog path configured, every mutation
//! is written through to a JSON catalog before the lock is released; if that
//! write fails the mutation is rolled back.

use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::types::{BackupId, BackupRecord, VerificationStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const CATALOG_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Catalog {
    version: u32,
    records: Vec<BackupRecord>,
}

/// Keyed store of published [`BackupRecord`]s
#[derive(Debug, Default)]
pub struct BackupRegistry {
    records: RwLock<HashMap<BackupId, BackupRecord>>,
    catalog_path: Option<PathBuf>,
}

impl BackupRegistry {
    /// In-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted to `path`, loading any existing catalog
    pub fn open(path: impl Into<PathBuf>) -> BackupRecoveryResult<Self> {
        let path = path.into();
        let mut records = HashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let catalog: Catalog = serde_json::from_str(&raw)?;
            if catalog.version != CATALOG_VERSION {
                return Err(BackupRecoveryError::Configuration {
                    message: format!("unsupported catalog version {}", catalog.version),
                });
            }
            for record in catalog.records {
                records.insert(record.id.clone(), record);
            }
            info!(path = %path.display(), records = records.len(), "Loaded backup catalog");
        }

        Ok(Self {
            records: RwLock::new(records),
            catalog_path: Some(path),
        })
    }

    /// Publish a record. This is the only way a backup becomes visible.
    pub fn insert(&self, record: BackupRecord) -> BackupRecoveryResult<()> {
        if record.retention_expiry <= record.timestamp {
            return Err(BackupRecoveryError::Validation {
                message: format!("record {} expires before it was created", record.id),
            });
        }
        if record.checksum.is_empty() {
            return Err(BackupRecoveryError::Validation {
                message: format!("record {} has no checksum", record.id),
            });
        }

        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(BackupRecoveryError::DuplicateId {
                backup_id: record.id.to_string(),
            });
        }

        let id = record.id.clone();
        records.insert(id.clone(), record);
        if let Err(e) = self.persist(&records) {
            records.remove(&id);
            return Err(e);
        }

        debug!(backup_id = %id, "Registered backup record");
        Ok(())
    }

    /// Record by ID
    pub fn get(&self, id: &BackupId) -> Option<BackupRecord> {
        self.records.read().get(id).cloned()
    }

    /// Whether a record with `id` exists
    pub fn contains(&self, id: &BackupId) -> bool {
        self.records.read().contains_key(id)
    }

    /// All records, newest first
    pub fn list(&self) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// Remove a record, returning it if it existed
    pub fn remove(&self, id: &BackupId) -> BackupRecoveryResult<Option<BackupRecord>> {
        let mut records = self.records.write();
        let Some(removed) = records.remove(id) else {
            return Ok(None);
        };

        if let Err(e) = self.persist(&records) {
            records.insert(id.clone(), removed);
            return Err(e);
        }

        debug!(backup_id = %id, "Removed backup record");
        Ok(Some(removed))
    }

    /// Record the outcome of a verification
    pub fn set_verification_status(
        &self,
        id: &BackupId,
        status: VerificationStatus,
        at: DateTime<Utc>,
    ) -> BackupRecoveryResult<BackupRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| BackupRecoveryError::NotFound {
                backup_id: id.to_string(),
            })?;

        let previous = (record.verification_status, record.verified_at);
        record.verification_status = status;
        record.verified_at = Some(at);
        let updated = record.clone();

        if let Err(e) = self.persist(&records) {
            if let Some(record) = records.get_mut(id) {
                record.verification_status = previous.0;
                record.verified_at = previous.1;
            }
            return Err(e);
        }

        Ok(updated)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Newest record satisfying `predicate`
    pub fn latest_matching<F>(&self, predicate: F) -> Option<BackupRecord>
    where
        F: Fn(&BackupRecord) -> bool,
    {
        self.records
            .read()
            .values()
            .filter(|record| predicate(record))
            .max_by_key(|record| record.timestamp)
            .cloned()
    }

    fn persist(&self, records: &HashMap<BackupId, BackupRecord>) -> BackupRecoveryResult<()> {
        let Some(path) = &self.catalog_path else {
            return Ok(());
        };

        let mut ordered: Vec<&BackupRecord> = records.values().collect();
        ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let catalog = serde_json::json!({
            "version": CATALOG_VERSION,
            "records": ordered,
        });

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("tmp");
        let result = (|| -> BackupRecoveryResult<()> {
            let mut file = std::fs::File::create(&staging)?;
            file.write_all(serde_json::to_string_pretty(&catalog)?.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&staging, path)?;
            Ok(())
        })();

        if let Err(e) = &result {
            warn!(path = %path.display(), error = %e, "Failed to write backup catalog");
        }
        result
    }
}
