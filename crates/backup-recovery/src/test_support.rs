//! Shared fixtures for unit tests

use crate::codec::{PayloadBundle, PayloadCodec};
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::integrity::{compute_checksum, CHECKSUM_ALGORITHM};
use crate::provider::{ComponentPayload, ComponentProvider};
use crate::registry::BackupRegistry;
use crate::replication::{ReplicationChannel, ReplicationNode};
use crate::storage::{payload_path, BlobStore, MemoryBlobStore};
use crate::types::{BackupId, BackupRecord, BackupType, RecordMetadata, VerificationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A registry-valid record with no payload behind it
pub fn record(id: &str, timestamp: DateTime<Utc>) -> BackupRecord {
    BackupRecord {
        id: BackupId::from(id),
        backup_type: BackupType::Full,
        timestamp,
        size_bytes: 1024,
        checksum: "ab".repeat(32),
        components: vec!["cache".to_string()],
        dependencies: BTreeMap::new(),
        parent_id: None,
        metadata: RecordMetadata {
            storage_path: payload_path(&BackupId::from(id)),
            ..Default::default()
        },
        verification_status: VerificationStatus::Pending,
        verified_at: None,
        retention_expiry: timestamp + Duration::days(30),
    }
}

/// Encode 1 KiB per component, store it and register the record
pub async fn publish_bundle(
    registry: &BackupRegistry,
    store: &dyn BlobStore,
    codec: &PayloadCodec,
    id: &str,
    components: &[&str],
) -> BackupRecord {
    let backup_id = BackupId::from(id);
    let payloads: Vec<ComponentPayload> = components
        .iter()
        .map(|c| ComponentPayload::new(*c, vec![b'x'; 1024]))
        .collect();
    let bundle = PayloadBundle::new(BackupType::Full, payloads);

    let compressed = codec.compress(&bundle.to_bytes().unwrap()).unwrap();
    let checksum = compute_checksum(&compressed);
    let compressed_len = compressed.len() as u64;
    let stored = codec.seal(&backup_id, compressed).unwrap();
    let path = payload_path(&backup_id);
    store.put(&path, &stored).await.unwrap();

    let timestamp = Utc::now();
    let record = BackupRecord {
        id: backup_id,
        backup_type: BackupType::Full,
        timestamp,
        size_bytes: bundle.declared_size(),
        checksum,
        components: components.iter().map(|c| c.to_string()).collect(),
        dependencies: BTreeMap::new(),
        parent_id: None,
        metadata: RecordMetadata {
            storage_path: path,
            stored_size_bytes: stored.len() as u64,
            compressed_size_bytes: compressed_len,
            compression_algorithm: codec.compression_algorithm().to_string(),
            encrypted: codec.encryption_algorithm().is_some(),
            encryption_algorithm: codec.encryption_algorithm().map(str::to_string),
            checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
            ..Default::default()
        },
        verification_status: VerificationStatus::Pending,
        verified_at: None,
        retention_expiry: timestamp + Duration::days(30),
    };
    registry.insert(record.clone()).unwrap();
    record
}

/// Provider returning a fixed-size payload, with switchable failures
pub struct StaticProvider {
    name: String,
    size: usize,
    dependencies: Vec<String>,
    fail_capture: AtomicBool,
    fail_restore: AtomicBool,
    gate: Option<Arc<Notify>>,
    restore_log: Arc<Mutex<Vec<String>>>,
    captures: AtomicUsize,
}

impl StaticProvider {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            dependencies: Vec::new(),
            fail_capture: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            gate: None,
            restore_log: Arc::new(Mutex::new(Vec::new())),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn depends_on(mut self, components: &[&str]) -> Self {
        self.dependencies = components.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Block captures until the gate is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Append restored component names to a shared log
    pub fn logging_to(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.restore_log = log;
        self
    }

    pub fn failing_capture(self) -> Self {
        self.fail_capture.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_restore(self) -> Self {
        self.fail_restore.store(true, Ordering::SeqCst);
        self
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComponentProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn capture(&self, _backup_type: BackupType) -> BackupRecoveryResult<ComponentPayload> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(BackupRecoveryError::Provider {
                component: self.name.clone(),
                reason: "snapshot unavailable".to_string(),
            });
        }
        Ok(ComponentPayload::new(
            self.name.clone(),
            vec![b'a'; self.size],
        ))
    }

    async fn restore(&self, payload: &ComponentPayload) -> BackupRecoveryResult<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(BackupRecoveryError::Restore {
                component: self.name.clone(),
                reason: "target rejected payload".to_string(),
            });
        }
        if payload.data.len() != self.size {
            return Err(BackupRecoveryError::Restore {
                component: self.name.clone(),
                reason: format!("expected {} bytes, got {}", self.size, payload.data.len()),
            });
        }
        self.restore_log.lock().push(self.name.clone());
        Ok(())
    }
}

/// Memory store whose reads can be made to fail, counting payload reads
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryBlobStore,
    failing_reads: AtomicBool,
    reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self) {
        self.failing_reads.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn put(&self, path: &str, data: &[u8]) -> BackupRecoveryResult<u64> {
        self.inner.put(path, data).await
    }

    async fn get(&self, path: &str) -> BackupRecoveryResult<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(BackupRecoveryError::Storage {
                details: format!("read of {path} timed out"),
            });
        }
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> BackupRecoveryResult<bool> {
        self.inner.delete(path).await
    }

    async fn size(&self, path: &str) -> BackupRecoveryResult<Option<u64>> {
        self.inner.size(path).await
    }
}

/// In-memory replication channel that can fail chosen nodes
#[derive(Default)]
pub struct RecordingChannel {
    failing: Mutex<HashSet<String>>,
    rejecting: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, usize>>,
    pushed: Mutex<Vec<(String, BackupId)>>,
    removed: Mutex<Vec<BackupId>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_node(&self, node_id: &str) {
        self.failing.lock().insert(node_id.to_string());
    }

    pub fn heal_node(&self, node_id: &str) {
        self.failing.lock().remove(node_id);
        self.rejecting.lock().remove(node_id);
    }

    /// Fail pushes to `node_id` with an error that retrying cannot fix
    pub fn reject_node(&self, node_id: &str) {
        self.rejecting.lock().insert(node_id.to_string());
    }

    pub fn attempts(&self, node_id: &str) -> usize {
        self.attempts.lock().get(node_id).copied().unwrap_or(0)
    }

    pub fn pushed(&self) -> Vec<(String, BackupId)> {
        self.pushed.lock().clone()
    }

    pub fn removed(&self) -> Vec<BackupId> {
        self.removed.lock().clone()
    }

    fn check(&self, node: &ReplicationNode) -> BackupRecoveryResult<()> {
        if self.rejecting.lock().contains(&node.id) {
            return Err(BackupRecoveryError::Configuration {
                message: format!("node {} rejected the replica format", node.id),
            });
        }
        if self.failing.lock().contains(&node.id) {
            return Err(BackupRecoveryError::Replication {
                node_id: node.id.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationChannel for RecordingChannel {
    async fn push(
        &self,
        node: &ReplicationNode,
        record: &BackupRecord,
        _payload: &[u8],
    ) -> BackupRecoveryResult<()> {
        *self.attempts.lock().entry(node.id.clone()).or_default() += 1;
        self.check(node)?;
        self.pushed.lock().push((node.id.clone(), record.id.clone()));
        Ok(())
    }

    async fn ping(&self, node: &ReplicationNode) -> BackupRecoveryResult<()> {
        self.check(node)
    }

    async fn remove(&self, _node: &ReplicationNode, backup_id: &BackupId) -> BackupRecoveryResult<()> {
        self.removed.lock().push(backup_id.clone());
        Ok(())
    }
}
