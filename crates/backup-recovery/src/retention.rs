//! Retention enforcement

use crate::registry::BackupRegistry;
use crate::replication::ReplicationManager;
use crate::storage::BlobStore;
use crate::types::BackupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a cleanup sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Records removed
    pub removed: Vec<BackupId>,
    /// Stored bytes released
    pub freed_bytes: u64,
    /// Per-record failures; failed records are left for the next sweep
    pub errors: Vec<String>,
}

/// Deletes backups whose retention expiry has passed
pub struct RetentionManager {
    registry: Arc<BackupRegistry>,
    store: Arc<dyn BlobStore>,
    replication: Arc<ReplicationManager>,
}

impl RetentionManager {
    /// Retention over `registry` and `store`
    pub fn new(
        registry: Arc<BackupRegistry>,
        store: Arc<dyn BlobStore>,
        replication: Arc<ReplicationManager>,
    ) -> Self {
        Self {
            registry,
            store,
            replication,
        }
    }

    /// Remove every expired record and its payload
    pub async fn cleanup_expired(&self) -> CleanupReport {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// Remove every record with `retention_expiry < now`, then its payload.
    ///
    /// The record is unregistered first so no reader sees a record whose
    /// payload is already gone; a payload that then fails to delete is
    /// reported as orphaned.
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        let expired: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|record| record.is_expired_at(now))
            .collect();

        for record in expired {
            match self.registry.remove(&record.id) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    warn!(backup_id = %record.id, error = %e, "Failed to unregister expired backup");
                    report.errors.push(format!("{}: {e}", record.id));
                    continue;
                }
            }

            match self.store.delete(&record.metadata.storage_path).await {
                Ok(true) => report.freed_bytes += record.metadata.stored_size_bytes,
                Ok(false) => {
                    debug!(backup_id = %record.id, "Expired payload was already gone");
                }
                Err(e) => {
                    warn!(backup_id = %record.id, error = %e, "Expired payload left orphaned");
                    report
                        .errors
                        .push(format!("{}: payload not deleted: {e}", record.id));
                }
            }
            self.replication.forget(&record.id);
            report.removed.push(record.id);
        }

        if !report.removed.is_empty() || !report.errors.is_empty() {
            info!(
                removed = report.removed.len(),
                freed_bytes = report.freed_bytes,
                errors = report.errors.len(),
                "Retention cleanup finished"
            );
        }
        report
    }
}
