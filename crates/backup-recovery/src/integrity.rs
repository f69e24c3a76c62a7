//! Checksum computation and backup integrity verification

use crate::codec::{PayloadBundle, PayloadCodec};
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::provider::ProviderRegistry;
use crate::registry::BackupRegistry;
use crate::storage::BlobStore;
use crate::types::{BackupId, BackupRecord, VerificationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Checksum algorithm identifier stored in record metadata
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// Hex-encoded SHA-256 digest
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Outcome of verifying one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Backup ID
    pub backup_id: BackupId,
    /// Whether no errors were found
    pub is_valid: bool,
    /// Failures that make the backup unusable
    pub errors: Vec<String>,
    /// Best-effort structural findings
    pub warnings: Vec<String>,
    /// Verified at
    pub verified_at: DateTime<Utc>,
    /// Verification duration
    pub duration_ms: u64,
}

/// Re-validates stored payloads against their records
pub struct IntegrityVerifier {
    registry: Arc<BackupRegistry>,
    store: Arc<dyn BlobStore>,
    codec: Arc<PayloadCodec>,
    providers: ProviderRegistry,
}

impl IntegrityVerifier {
    /// Verifier reading payloads from `store`
    pub fn new(
        registry: Arc<BackupRegistry>,
        store: Arc<dyn BlobStore>,
        codec: Arc<PayloadCodec>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            registry,
            store,
            codec,
            providers,
        }
    }

    /// Verify one backup and record the outcome on its registry entry.
    ///
    /// A failed verification excludes the record from recovery until a later
    /// verification passes.
    pub async fn verify(&self, backup_id: &BackupId) -> BackupRecoveryResult<VerificationResult> {
        let started = Instant::now();
        let record = self
            .registry
            .get(backup_id)
            .ok_or_else(|| BackupRecoveryError::NotFound {
                backup_id: backup_id.to_string(),
            })?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        self.inspect(&record, &mut errors, &mut warnings).await;

        let is_valid = errors.is_empty();
        let verified_at = Utc::now();
        let status = if is_valid {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Failed
        };

        match self
            .registry
            .set_verification_status(backup_id, status, verified_at)
        {
            Ok(_) => {}
            // Removed by cleanup while we were reading it
            Err(BackupRecoveryError::NotFound { .. }) => {
                debug!(backup_id = %backup_id, "Record removed during verification");
            }
            Err(e) => return Err(e),
        }

        if is_valid {
            info!(backup_id = %backup_id, warnings = warnings.len(), "Backup verified");
        } else {
            warn!(backup_id = %backup_id, errors = ?errors, "Backup failed verification");
        }

        Ok(VerificationResult {
            backup_id: backup_id.clone(),
            is_valid,
            errors,
            warnings,
            verified_at,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Verify every registered backup, newest first
    pub async fn verify_all(&self) -> Vec<VerificationResult> {
        let mut results = Vec::new();
        for record in self.registry.list() {
            match self.verify(&record.id).await {
                Ok(result) => results.push(result),
                Err(BackupRecoveryError::NotFound { .. }) => continue,
                Err(e) => warn!(backup_id = %record.id, error = %e, "Verification aborted"),
            }
        }

        let failed = results.iter().filter(|r| !r.is_valid).count();
        info!(
            verified = results.len() - failed,
            failed, "Completed verification sweep"
        );
        results
    }

    /// Read, open and checksum-check a payload, then decode it.
    ///
    /// Any mismatch is an integrity error; nothing is restored from a
    /// payload that does not match its record.
    pub async fn load_bundle(&self, record: &BackupRecord) -> BackupRecoveryResult<PayloadBundle> {
        let integrity = |details: String| BackupRecoveryError::Integrity {
            backup_id: record.id.to_string(),
            details,
        };

        let stored = self
            .store
            .get(&record.metadata.storage_path)
            .await?
            .ok_or_else(|| integrity("payload missing from storage".to_string()))?;

        let compressed = self
            .codec
            .open(
                &record.id,
                record.metadata.encryption_algorithm.as_deref(),
                &stored,
            )
            .map_err(|e| integrity(e.to_string()))?;

        if compute_checksum(&compressed) != record.checksum {
            return Err(integrity("checksum mismatch".to_string()));
        }

        let serialized = self
            .codec
            .decompress(&record.metadata.compression_algorithm, &compressed)
            .map_err(|e| integrity(e.to_string()))?;
        PayloadBundle::from_bytes(&serialized).map_err(|e| integrity(e.to_string()))
    }

    async fn inspect(
        &self,
        record: &BackupRecord,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let path = &record.metadata.storage_path;
        // A blob of the wrong length is never read
        match self.store.size(path).await {
            Ok(Some(size)) if size != record.metadata.stored_size_bytes => {
                errors.push(format!(
                    "size mismatch: stored {size} bytes, expected {}",
                    record.metadata.stored_size_bytes
                ));
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                errors.push("payload missing".to_string());
                return;
            }
            Err(e) => {
                errors.push(format!("payload unreadable: {e}"));
                return;
            }
        }

        let stored = match self.store.get(path).await {
            Ok(Some(stored)) => stored,
            // Removed between the size check and the read
            Ok(None) => {
                errors.push("payload missing".to_string());
                return;
            }
            Err(e) => {
                errors.push(format!("payload unreadable: {e}"));
                return;
            }
        };

        let compressed = match record.metadata.encryption_algorithm.as_deref() {
            Some(algorithm) if !self.codec.can_open(algorithm) => {
                errors.push(format!("no key available for {algorithm}"));
                return;
            }
            algorithm => match self.codec.open(&record.id, algorithm, &stored) {
                Ok(compressed) => compressed,
                Err(e) => {
                    // Authentication failure means the bytes changed
                    errors.push("checksum mismatch".to_string());
                    warnings.push(e.to_string());
                    return;
                }
            },
        };

        if compute_checksum(&compressed) != record.checksum {
            errors.push("checksum mismatch".to_string());
            return;
        }

        let bundle = match self
            .codec
            .decompress(&record.metadata.compression_algorithm, &compressed)
            .and_then(|bytes| PayloadBundle::from_bytes(&bytes))
        {
            Ok(bundle) => bundle,
            Err(e) => {
                errors.push(format!("payload undecodable: {e}"));
                return;
            }
        };

        if bundle.declared_size() != record.size_bytes {
            errors.push(format!(
                "size mismatch: payload declares {} bytes, record {}",
                bundle.declared_size(),
                record.size_bytes
            ));
        }

        for component in &record.components {
            let Some(payload) = bundle.component(component) else {
                errors.push(format!("component {component} missing from payload"));
                continue;
            };
            if payload.data.len() as u64 != payload.size_bytes {
                warnings.push(format!(
                    "{component}: declared {} bytes but carries {}",
                    payload.size_bytes,
                    payload.data.len()
                ));
            }
            match self.providers.get(component) {
                Some(provider) => warnings.extend(
                    provider
                        .validate_payload(payload)
                        .into_iter()
                        .map(|w| format!("{component}: {w}")),
                ),
                None => warnings.push(format!(
                    "{component}: no provider registered, structural check skipped"
                )),
            }
        }
    }
}
