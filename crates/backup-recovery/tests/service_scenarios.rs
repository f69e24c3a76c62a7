use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratoswarm_backup_recovery::events::next_matching;
use stratoswarm_backup_recovery::*;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// Provider holding a fixed-size state blob
struct FixedProvider {
    name: String,
    size: usize,
    dependencies: Vec<String>,
    gate: Option<Arc<Notify>>,
    fail_capture: bool,
    restores: Arc<Mutex<Vec<String>>>,
    captures: AtomicUsize,
}

impl FixedProvider {
    fn new(name: &str, size: usize, restores: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            size,
            dependencies: Vec::new(),
            gate: None,
            fail_capture: false,
            restores: Arc::clone(restores),
            captures: AtomicUsize::new(0),
        }
    }

    fn depends_on(mut self, component: &str) -> Self {
        self.dependencies.push(component.to_string());
        self
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn broken(mut self) -> Self {
        self.fail_capture = true;
        self
    }
}

#[async_trait]
impl ComponentProvider for FixedProvider {
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
        if self.fail_capture {
            return Err(BackupRecoveryError::Provider {
                component: self.name.clone(),
                reason: "disk read error".to_string(),
            });
        }
        Ok(ComponentPayload::new(
            self.name.clone(),
            vec![0x5a; self.size],
        ))
    }

    async fn restore(&self, payload: &ComponentPayload) -> BackupRecoveryResult<()> {
        if payload.data.len() != self.size {
            return Err(BackupRecoveryError::Restore {
                component: self.name.clone(),
                reason: format!("expected {} bytes, got {}", self.size, payload.data.len()),
            });
        }
        self.restores.lock().push(self.name.clone());
        Ok(())
    }
}

/// Replication channel keeping replicas in memory
#[derive(Default)]
struct MemoryChannel {
    replicas: Mutex<HashMap<String, Vec<BackupId>>>,
}

#[async_trait]
impl ReplicationChannel for MemoryChannel {
    async fn push(
        &self,
        node: &ReplicationNode,
        record: &BackupRecord,
        _payload: &[u8],
    ) -> BackupRecoveryResult<()> {
        self.replicas
            .lock()
            .entry(node.id.clone())
            .or_default()
            .push(record.id.clone());
        Ok(())
    }

    async fn ping(&self, _node: &ReplicationNode) -> BackupRecoveryResult<()> {
        Ok(())
    }

    async fn remove(&self, node: &ReplicationNode, backup_id: &BackupId) -> BackupRecoveryResult<()> {
        if let Some(ids) = self.replicas.lock().get_mut(&node.id) {
            ids.retain(|id| id != backup_id);
        }
        Ok(())
    }
}

fn test_config() -> BackupRecoveryConfig {
    BackupRecoveryConfig {
        auto_backup_enabled: false,
        ..Default::default()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<BackupEvent>,
    job_id: &BackupId,
    kinds: &[EventKind],
) -> BackupEvent {
    timeout(WAIT, async {
        loop {
            let event = next_matching(events, kinds)
                .await
                .expect("event bus closed");
            if event.job_id() == Some(job_id) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn backup_and_wait(
    service: &BackupRecoveryService,
    components: &[&str],
    backup_type: BackupType,
) -> BackupId {
    let mut events = service.subscribe();
    let id = service
        .create_backup(components.iter().copied(), backup_type)
        .unwrap();
    let event = wait_for(
        &mut events,
        &id,
        &[EventKind::BackupCompleted, EventKind::BackupFailed],
    )
    .await;
    assert_eq!(event.kind(), EventKind::BackupCompleted, "{event:?}");
    id
}

#[tokio::test]
async fn test_incremental_backup_is_published_pending() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(FixedProvider::new("cache", 1024, &restores)))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
    service.initialize().await.unwrap();

    let id = backup_and_wait(&service, &["cache"], BackupType::Incremental).await;

    let backups = service.list_backups();
    assert_eq!(backups.len(), 1);
    let record = &backups[0];
    assert_eq!(record.id, id);
    assert_eq!(record.size_bytes, 1024);
    assert_eq!(record.verification_status, VerificationStatus::Pending);
    assert!(record.retention_expiry > record.timestamp);
    assert_eq!(record.metadata.compression_algorithm, "zstd");
    assert_eq!(record.metadata.encryption_algorithm.as_deref(), Some("aes-256-gcm"));
    assert!(record.parent_id.is_none());

    service.stop().await;
}

#[tokio::test]
async fn test_overlapping_backup_is_rejected_while_active() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(
            FixedProvider::new("cache", 1024, &restores).gated(Arc::clone(&gate)),
        ))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
    let mut events = service.subscribe();

    let first = service
        .create_backup(["cache"], BackupType::Incremental)
        .unwrap();
    let second = service.create_backup(["cache"], BackupType::Incremental);
    match second {
        Err(BackupRecoveryError::Conflict { job_id, components }) => {
            assert_eq!(job_id, first.to_string());
            assert_eq!(components, vec!["cache"]);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    gate.notify_one();
    wait_for(&mut events, &first, &[EventKind::BackupCompleted]).await;
    assert_eq!(service.list_backups().len(), 1);
    service.stop().await;
}

#[tokio::test]
async fn test_capture_failure_publishes_nothing() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(FixedProvider::new("cache", 1024, &restores)))
        .provider(Arc::new(
            FixedProvider::new("userFiles", 1024, &restores).broken(),
        ))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
    let before = service.list_backups().len();
    let mut events = service.subscribe();

    let id = service
        .create_backup(["cache", "userFiles"], BackupType::Full)
        .unwrap();
    let event = wait_for(
        &mut events,
        &id,
        &[EventKind::BackupCompleted, EventKind::BackupFailed],
    )
    .await;

    match event {
        BackupEvent::BackupFailed { reason, .. } => assert!(reason.contains("userFiles")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(service.list_backups().len(), before);
    assert!(service.get_backup(&id).is_none());
    service.stop().await;
}

#[tokio::test]
async fn test_tampered_payload_fails_verification_and_blocks_restore() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(MemoryBlobStore::new());
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(FixedProvider::new("cache", 1024, &restores)))
        .store(store.clone())
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();

    let id = backup_and_wait(&service, &["cache"], BackupType::Full).await;
    let path = service.get_backup(&id).unwrap().metadata.storage_path;
    let mut stored = store.get(&path).await.unwrap().unwrap();
    let last = stored.len() - 1;
    stored[last] ^= 0xff;
    store.put(&path, &stored).await.unwrap();

    let result = service.verify_backup(&id).await.unwrap();
    assert!(!result.is_valid);
    assert_eq!(result.errors, vec!["checksum mismatch"]);
    assert_eq!(
        service.get_backup(&id).unwrap().verification_status,
        VerificationStatus::Failed
    );

    let restore = service.restore_from_backup(&id, None, None).await;
    assert!(matches!(restore, Err(BackupRecoveryError::Integrity { .. })));
    assert!(restores.lock().is_empty());
    service.stop().await;
}

#[tokio::test]
async fn test_restore_follows_dependency_order() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(FixedProvider::new("cache", 512, &restores)))
        .provider(Arc::new(
            FixedProvider::new("userFiles", 2048, &restores).depends_on("cache"),
        ))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();

    let id = backup_and_wait(&service, &["userFiles", "cache"], BackupType::Full).await;
    assert!(service.verify_backup(&id).await.unwrap().is_valid);

    let requested = vec!["userFiles".to_string(), "cache".to_string()];
    let status = service
        .restore_from_backup(&id, Some(&requested), None)
        .await
        .unwrap();

    assert_eq!(status.state, RecoveryState::Completed);
    assert_eq!(status.restored_components, vec!["cache", "userFiles"]);
    assert!(status.failed_components.is_empty());
    assert_eq!(*restores.lock(), vec!["cache", "userFiles"]);
    service.stop().await;
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_records() {
    let dir = tempfile::tempdir().unwrap();
    let catalog: PathBuf = dir.path().join("catalog.json");
    let store = Arc::new(MemoryBlobStore::new());
    let restores = Arc::new(Mutex::new(Vec::new()));

    let short_lived = BackupRecoveryService::builder(BackupRecoveryConfig {
        retention_secs: 1,
        catalog_path: Some(catalog.clone()),
        ..test_config()
    })
    .provider(Arc::new(FixedProvider::new("cache", 64, &restores)))
    .store(store.clone())
    .snapshot_builder(SnapshotBuilder::without_system_metrics())
    .build()
    .unwrap();
    let expired = backup_and_wait(&short_lived, &["cache"], BackupType::Full).await;
    short_lived.stop().await;

    let service = BackupRecoveryService::builder(BackupRecoveryConfig {
        retention_secs: 1000,
        catalog_path: Some(catalog),
        ..test_config()
    })
    .provider(Arc::new(FixedProvider::new("cache", 64, &restores)))
    .store(store.clone())
    .snapshot_builder(SnapshotBuilder::without_system_metrics())
    .build()
    .unwrap();
    assert!(service.get_backup(&expired).is_some());

    let kept = backup_and_wait(&service, &["cache"], BackupType::Full).await;
    assert_ne!(kept, expired);
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let report = service.cleanup_expired_backups().await;
    assert_eq!(report.removed, vec![expired.clone()]);
    assert!(report.errors.is_empty());
    assert!(service.get_backup(&expired).is_none());
    assert!(service.get_backup(&kept).is_some());
    assert_eq!(store.len(), 1);
    service.stop().await;
}

#[tokio::test]
async fn test_cancelled_backup_leaves_registry_unchanged() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    let store = Arc::new(MemoryBlobStore::new());
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(
            FixedProvider::new("cache", 1024, &restores).gated(Arc::clone(&gate)),
        ))
        .store(store.clone())
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
    let before = service.list_backups().len();
    let mut events = service.subscribe();

    let id = service.create_backup(["cache"], BackupType::Full).unwrap();
    wait_for(&mut events, &id, &[EventKind::BackupStarted]).await;
    assert!(service.cancel_backup(&id));
    gate.notify_one();

    let event = wait_for(
        &mut events,
        &id,
        &[
            EventKind::BackupCompleted,
            EventKind::BackupFailed,
            EventKind::BackupCancelled,
        ],
    )
    .await;
    assert_eq!(event.kind(), EventKind::BackupCancelled);
    assert_eq!(service.list_backups().len(), before);
    assert!(store.is_empty());
    assert!(!service.cancel_backup(&id));
    service.stop().await;
}

#[tokio::test]
async fn test_point_in_time_restore_uses_latest_verified_backup() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let service = BackupRecoveryService::builder(test_config())
        .provider(Arc::new(FixedProvider::new("cache", 256, &restores)))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();

    let full = backup_and_wait(&service, &["cache"], BackupType::Full).await;
    let incremental = backup_and_wait(&service, &["cache"], BackupType::Incremental).await;
    assert_eq!(
        service.get_backup(&incremental).unwrap().parent_id,
        Some(full.clone())
    );

    // Only the full backup is verified, so it is the only restore point
    assert!(service.verify_backup(&full).await.unwrap().is_valid);
    let point = service
        .resolve_restore_point(chrono::Utc::now())
        .expect("restore point");
    assert_eq!(point.backup_id, full);

    let status = service
        .restore_to_point_in_time(chrono::Utc::now(), None)
        .await
        .unwrap();
    assert_eq!(status.backup_id, full);
    assert_eq!(status.state, RecoveryState::Completed);

    let before_any = service.get_backup(&full).unwrap().timestamp - chrono::Duration::seconds(1);
    assert!(matches!(
        service.restore_to_point_in_time(before_any, None).await,
        Err(BackupRecoveryError::NotFound { .. })
    ));
    service.stop().await;
}

#[tokio::test]
async fn test_backups_replicate_and_health_reports() {
    let restores = Arc::new(Mutex::new(Vec::new()));
    let channel = Arc::new(MemoryChannel::default());
    let service = BackupRecoveryService::builder(BackupRecoveryConfig {
        replication_nodes: vec![ReplicationNodeConfig {
            id: "replica-east".to_string(),
            endpoint: "mem://east".to_string(),
        }],
        ..test_config()
    })
    .provider(Arc::new(FixedProvider::new("cache", 128, &restores)))
    .replication_channel(channel.clone())
    .snapshot_builder(SnapshotBuilder::without_system_metrics())
    .build()
    .unwrap();
    service.initialize().await.unwrap();

    let health = service.get_backup_health();
    assert_eq!(health.status, HealthStatus::Warning);

    let id = backup_and_wait(&service, &["cache"], BackupType::Full).await;
    timeout(WAIT, async {
        while service.replicas_of(&id).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(channel.replicas.lock()["replica-east"], vec![id.clone()]);

    let nodes = service.replication_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].health, NodeHealth::Active);

    let health = service.get_backup_health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.score, 100);

    let stats = service.get_backup_statistics();
    assert_eq!(stats.total_backups, 1);
    assert_eq!(stats.pending_count, 1);
    service.stop().await;
}
