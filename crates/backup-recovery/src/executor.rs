//! Backup pipeline: capture, encode, persist, publish
//!
//! A record becomes visible only when it is inserted into the registry,
//! after its payload is durably stored. A job that fails or is cancelled
//! before that point leaves no record, and any payload it already wrote is
//! deleted.

use crate::codec::{PayloadBundle, PayloadCodec};
use crate::config::BackupRecoveryConfig;
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::events::{BackupEvent, EventBus};
use crate::integrity::{compute_checksum, CHECKSUM_ALGORITHM};
use crate::provider::ProviderRegistry;
use crate::registry::BackupRegistry;
use crate::replication::ReplicationManager;
use crate::scheduler::CancelFlag;
use crate::snapshot::{SnapshotBuilder, SnapshotContext};
use crate::storage::{payload_path, BlobStore};
use crate::types::{
    BackupId, BackupJob, BackupRecord, BackupType, IdGenerator, RecordMetadata,
    VerificationStatus,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs backup jobs through the pipeline
pub struct BackupExecutor {
    config: Arc<BackupRecoveryConfig>,
    providers: ProviderRegistry,
    store: Arc<dyn BlobStore>,
    codec: Arc<PayloadCodec>,
    registry: Arc<BackupRegistry>,
    replication: Arc<ReplicationManager>,
    events: EventBus,
    snapshots: SnapshotBuilder,
    ids: Arc<IdGenerator>,
}

impl BackupExecutor {
    /// Executor publishing into `registry` and `store`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BackupRecoveryConfig>,
        providers: ProviderRegistry,
        store: Arc<dyn BlobStore>,
        codec: Arc<PayloadCodec>,
        registry: Arc<BackupRegistry>,
        replication: Arc<ReplicationManager>,
        events: EventBus,
        snapshots: SnapshotBuilder,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            config,
            providers,
            store,
            codec,
            registry,
            replication,
            events,
            snapshots,
            ids,
        }
    }

    /// Run one job to publication, failure or cancellation, emitting the
    /// matching lifecycle events
    pub async fn run(
        &self,
        job: &BackupJob,
        cancel: &CancelFlag,
        context: SnapshotContext,
    ) -> BackupRecoveryResult<BackupRecord> {
        info!(
            job_id = %job.id,
            backup_type = %job.backup_type,
            components = ?job.components,
            "Starting backup"
        );
        self.events.publish(BackupEvent::BackupStarted {
            job_id: job.id.clone(),
            backup_type: job.backup_type,
            components: job.components.clone(),
            timestamp: Utc::now(),
        });

        let mut written = None;
        let result = self.execute(job, cancel, context, &mut written).await;

        if let Err(e) = &result {
            if let Some(path) = written {
                if let Err(cleanup) = self.store.delete(&path).await {
                    warn!(job_id = %job.id, path = %path, error = %cleanup, "Failed to delete unpublished payload");
                }
            }

            let event = match e {
                BackupRecoveryError::Cancelled { .. } => {
                    info!(job_id = %job.id, "Backup cancelled");
                    BackupEvent::BackupCancelled {
                        job_id: job.id.clone(),
                        timestamp: Utc::now(),
                    }
                }
                other => {
                    warn!(job_id = %job.id, error = %other, "Backup failed");
                    BackupEvent::BackupFailed {
                        job_id: job.id.clone(),
                        reason: other.to_string(),
                        timestamp: Utc::now(),
                    }
                }
            };
            self.events.publish(event);
        }
        result
    }

    async fn execute(
        &self,
        job: &BackupJob,
        cancel: &CancelFlag,
        context: SnapshotContext,
        written: &mut Option<String>,
    ) -> BackupRecoveryResult<BackupRecord> {
        let check_cancelled = || {
            if cancel.is_cancelled() {
                Err(BackupRecoveryError::Cancelled {
                    job_id: job.id.to_string(),
                })
            } else {
                Ok(())
            }
        };

        let mut warnings = Vec::new();
        let snapshot = match self.snapshots.build(&self.config, context) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "System snapshot unavailable");
                warnings.push(format!("system snapshot unavailable: {e}"));
                None
            }
        };
        self.progress(job, "snapshot", 10.0);
        check_cancelled()?;

        let mut payloads = Vec::with_capacity(job.components.len());
        for (index, component) in job.components.iter().enumerate() {
            let provider = self.providers.require(component)?;
            let mut payload = provider
                .capture(job.backup_type)
                .await
                .map_err(|e| match e {
                    BackupRecoveryError::Provider { .. } => e,
                    other => BackupRecoveryError::Provider {
                        component: component.clone(),
                        reason: other.to_string(),
                    },
                })?;
            if payload.component != *component {
                warnings.push(format!(
                    "provider for {component} labelled its payload {}",
                    payload.component
                ));
                payload.component = component.clone();
            }
            debug!(job_id = %job.id, component = %component, bytes = payload.size_bytes, "Captured component");
            payloads.push(payload);

            let captured = (index + 1) as f32 / job.components.len() as f32;
            self.progress(job, "capture", 10.0 + 50.0 * captured);
            check_cancelled()?;
        }

        let component_sizes: BTreeMap<String, u64> = payloads
            .iter()
            .map(|p| (p.component.clone(), p.size_bytes))
            .collect();
        let bundle = PayloadBundle::new(job.backup_type, payloads);
        let size_bytes = bundle.declared_size();
        let serialized = bundle.to_bytes()?;
        drop(bundle);

        let compressed = self.codec.compress(&serialized)?;
        let compressed_size_bytes = compressed.len() as u64;
        let compression_ratio = if serialized.is_empty() {
            1.0
        } else {
            compressed_size_bytes as f64 / serialized.len() as f64
        };
        drop(serialized);

        // Integrity is checked over the compressed, pre-encryption bytes
        let checksum = compute_checksum(&compressed);
        let stored = self.codec.seal(&job.id, compressed)?;
        let stored_size_bytes = stored.len() as u64;
        if stored_size_bytes > self.config.max_backup_size_bytes {
            return Err(BackupRecoveryError::Capacity {
                size_bytes: stored_size_bytes,
                limit_bytes: self.config.max_backup_size_bytes,
            });
        }
        self.progress(job, "encode", 75.0);
        check_cancelled()?;

        let storage_path = payload_path(&job.id);
        *written = Some(storage_path.clone());
        self.store.put(&storage_path, &stored).await?;
        self.progress(job, "persist", 90.0);
        check_cancelled()?;

        let timestamp = self.ids.next_timestamp();
        let encryption_algorithm = self.codec.encryption_algorithm().map(str::to_string);
        let record = BackupRecord {
            id: job.id.clone(),
            backup_type: job.backup_type,
            timestamp,
            size_bytes,
            checksum,
            components: job.components.clone(),
            dependencies: job.dependencies.clone(),
            parent_id: self.parent_for(job),
            metadata: RecordMetadata {
                snapshot,
                storage_path,
                stored_size_bytes,
                compressed_size_bytes,
                compression_algorithm: self.codec.compression_algorithm().to_string(),
                compression_ratio,
                encrypted: encryption_algorithm.is_some(),
                encryption_algorithm,
                checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
                component_sizes,
                warnings,
            },
            verification_status: VerificationStatus::Pending,
            verified_at: None,
            retention_expiry: timestamp + self.config.retention_window(),
        };

        self.registry.insert(record.clone())?;
        *written = None;

        info!(
            backup_id = %record.id,
            size_bytes,
            stored_size_bytes,
            parent_id = ?record.parent_id,
            "Backup published"
        );
        self.replication.enqueue(record.clone(), Arc::new(stored));
        self.events.publish(BackupEvent::BackupCompleted {
            job_id: job.id.clone(),
            size_bytes,
            stored_size_bytes,
            timestamp: Utc::now(),
        });
        Ok(record)
    }

    /// Incremental backups chain to the latest overlapping record of any
    /// type, differential backups to the latest overlapping full backup
    fn parent_for(&self, job: &BackupJob) -> Option<BackupId> {
        let overlapping = |record: &BackupRecord| job.overlaps(&record.components);
        let parent = match job.backup_type {
            BackupType::Incremental => self.registry.latest_matching(overlapping),
            BackupType::Differential => self
                .registry
                .latest_matching(|r| r.backup_type == BackupType::Full && overlapping(r)),
            BackupType::Full | BackupType::Snapshot => None,
        };
        parent.map(|record| record.id)
    }

    fn progress(&self, job: &BackupJob, stage: &str, percentage: f32) {
        self.events.publish(BackupEvent::BackupProgress {
            job_id: job.id.clone(),
            stage: stage.to_string(),
            percentage,
            timestamp: Utc::now(),
        });
    }
}
