//! Backup and recovery service: lifecycle, timers and public operations

use crate::codec::{EncryptionKey, PayloadCodec};
use crate::config::BackupRecoveryConfig;
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::events::{BackupEvent, EventBus};
use crate::executor::BackupExecutor;
use crate::health::{assess_health, BackupHealth, BackupStatistics};
use crate::integrity::{IntegrityVerifier, VerificationResult};
use crate::provider::{ComponentProvider, ProviderRegistry};
use crate::recovery::{RecoveryExecutor, RecoveryPlanner, RecoveryStatus};
use crate::registry::BackupRegistry;
use crate::replication::{ReplicationChannel, ReplicationManager, ReplicationNode};
use crate::retention::{CleanupReport, RetentionManager};
use crate::scheduler::{CancelOutcome, JobQueue, ReadyJob};
use crate::snapshot::{SnapshotBuilder, SnapshotContext};
use crate::storage::{BlobStore, MemoryBlobStore};
use crate::types::{BackupId, BackupJob, BackupRecord, BackupType, IdGenerator, RestorePoint};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Builder for [`BackupRecoveryService`]
pub struct BackupRecoveryServiceBuilder {
    config: BackupRecoveryConfig,
    providers: Vec<Arc<dyn ComponentProvider>>,
    store: Option<Arc<dyn BlobStore>>,
    replication_channel: Option<Arc<dyn ReplicationChannel>>,
    encryption_key: Option<EncryptionKey>,
    snapshots: SnapshotBuilder,
}

impl BackupRecoveryServiceBuilder {
    /// Builder with no providers registered
    pub fn new(config: BackupRecoveryConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            store: None,
            replication_channel: None,
            encryption_key: None,
            snapshots: SnapshotBuilder::new(),
        }
    }

    /// Register a component provider
    pub fn provider(mut self, provider: Arc<dyn ComponentProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Payload store; in-memory when unset
    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Transport to the configured replication nodes
    pub fn replication_channel(mut self, channel: Arc<dyn ReplicationChannel>) -> Self {
        self.replication_channel = Some(channel);
        self
    }

    /// Key for payload encryption; a random key is generated when unset
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Use `snapshots` for system snapshots
    pub fn snapshot_builder(mut self, snapshots: SnapshotBuilder) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Validate the configuration and assemble the service
    pub fn build(self) -> BackupRecoveryResult<BackupRecoveryService> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let providers = ProviderRegistry::new();
        for provider in self.providers {
            providers.register(provider)?;
        }

        let store = match self.store {
            Some(store) => store,
            None => {
                info!("No blob store configured, keeping payloads in memory");
                Arc::new(MemoryBlobStore::new()) as Arc<dyn BlobStore>
            }
        };

        if config.encryption_enabled && self.encryption_key.is_none() {
            warn!("No encryption key supplied, generated a key for this process only");
        }
        let codec = Arc::new(PayloadCodec::from_settings(
            config.compression_level,
            config.encryption_enabled,
            self.encryption_key,
        )?);

        let registry = Arc::new(match &config.catalog_path {
            Some(path) => BackupRegistry::open(path)?,
            None => BackupRegistry::new(),
        });
        let ids = Arc::new(IdGenerator::new());
        let existing = registry.list();
        ids.resume_after(&existing);
        let last_success = existing.first().map(|record| record.timestamp);

        let replication = Arc::new(ReplicationManager::new(
            config.replication.clone(),
            &config.replication_nodes,
            self.replication_channel,
        )?);
        let events = EventBus::new(config.event_channel_capacity);

        let verifier = Arc::new(IntegrityVerifier::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&codec),
            providers.clone(),
        ));
        let executor = BackupExecutor::new(
            Arc::clone(&config),
            providers.clone(),
            Arc::clone(&store),
            codec,
            Arc::clone(&registry),
            Arc::clone(&replication),
            events.clone(),
            self.snapshots,
            Arc::clone(&ids),
        );
        let retention = RetentionManager::new(
            Arc::clone(&registry),
            store,
            Arc::clone(&replication),
        );
        let planner = RecoveryPlanner::new(Arc::clone(&registry), Arc::clone(&config));
        let recovery = RecoveryExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&verifier),
            providers.clone(),
            events.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(BackupRecoveryService {
            inner: Arc::new(ServiceInner {
                queue: JobQueue::new(config.max_concurrent_backups),
                config,
                providers,
                registry,
                executor,
                verifier,
                replication,
                retention,
                planner,
                recovery,
                events,
                ids,
                last_success: RwLock::new(last_success),
                lifecycle: RwLock::new(Lifecycle::Created),
                job_tasks: Mutex::new(HashMap::new()),
                timers: Mutex::new(Vec::new()),
                shutdown_tx,
            }),
        })
    }
}

struct ServiceInner {
    config: Arc<BackupRecoveryConfig>,
    providers: ProviderRegistry,
    registry: Arc<BackupRegistry>,
    queue: JobQueue,
    executor: BackupExecutor,
    verifier: Arc<IntegrityVerifier>,
    replication: Arc<ReplicationManager>,
    retention: RetentionManager,
    planner: RecoveryPlanner,
    recovery: RecoveryExecutor,
    events: EventBus,
    ids: Arc<IdGenerator>,
    last_success: RwLock<Option<DateTime<Utc>>>,
    lifecycle: RwLock<Lifecycle>,
    job_tasks: Mutex<HashMap<BackupId, JoinHandle<()>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Orchestrates backup creation, verification, replication, retention and
/// recovery for a set of registered components.
///
/// Cloning is cheap; clones share the same service.
#[derive(Clone)]
pub struct BackupRecoveryService {
    inner: Arc<ServiceInner>,
}

impl BackupRecoveryService {
    /// Start building a service
    pub fn builder(config: BackupRecoveryConfig) -> BackupRecoveryServiceBuilder {
        BackupRecoveryServiceBuilder::new(config)
    }

    /// Start replication and the scheduler, verification and cleanup timers
    pub async fn initialize(&self) -> BackupRecoveryResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.write();
            match *lifecycle {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => {
                    return Err(BackupRecoveryError::Validation {
                        message: "backup service was stopped and cannot be restarted".to_string(),
                    })
                }
                Lifecycle::Created => *lifecycle = Lifecycle::Running,
            }
        }

        let config = &self.inner.config;
        info!(
            providers = ?self.inner.providers.names(),
            records = self.inner.registry.len(),
            auto_backup = config.auto_backup_enabled,
            "Starting backup recovery service"
        );

        self.inner.replication.start();

        let mut timers = self.inner.timers.lock();
        if config.auto_backup_enabled {
            timers.push(self.spawn_timer("scheduler", config.scheduler_tick(), |inner| async move {
                match inner.run_scheduled_backup(Utc::now()) {
                    Ok(Some(job_id)) => info!(job_id = %job_id, "Scheduled backup submitted"),
                    Ok(None) => {}
                    Err(BackupRecoveryError::Conflict { job_id, .. }) => {
                        debug!(active_job = %job_id, "Scheduled backup skipped, components busy")
                    }
                    Err(e) => warn!(error = %e, "Scheduled backup not submitted"),
                }
            }));
        }
        timers.push(self.spawn_timer(
            "verification",
            config.verification_interval(),
            |inner| async move {
                inner.verifier.verify_all().await;
            },
        ));
        timers.push(self.spawn_timer("cleanup", config.cleanup_interval(), |inner| async move {
            inner.retention.cleanup_expired().await;
        }));

        Ok(())
    }

    /// Stop timers, drop queued jobs and wait for running backups to finish
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.write();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        info!("Stopping backup recovery service");

        let _ = self.inner.shutdown_tx.send(true);
        for job_id in self.inner.queue.close() {
            info!(job_id = %job_id, "Queued backup dropped at shutdown");
            self.inner.events.publish(BackupEvent::BackupCancelled {
                job_id,
                timestamp: Utc::now(),
            });
        }

        let timers: Vec<JoinHandle<()>> = self.inner.timers.lock().drain(..).collect();
        for timer in timers {
            let _ = timer.await;
        }

        // A job admitted just before close may not have registered its
        // task handle yet, so wait on the queue rather than the handles
        self.inner.queue.wait_idle().await;
        let finished: Vec<(BackupId, JoinHandle<()>)> =
            self.inner.job_tasks.lock().drain().collect();
        for (job_id, handle) in finished {
            if let Err(e) = handle.await {
                warn!(job_id = %job_id, error = %e, "Backup task ended abnormally");
            }
        }

        self.inner.replication.stop().await;
        info!("Backup recovery service stopped");
    }

    /// Submit a backup of `components`. Returns the job ID, which is also the
    /// ID of the record it publishes; the pipeline itself runs in the
    /// background.
    pub fn create_backup<I, S>(
        &self,
        components: I,
        backup_type: BackupType,
    ) -> BackupRecoveryResult<BackupId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        ServiceInner::submit(&self.inner, components, backup_type)
    }

    /// Check the schedule now, as the scheduler timer does on each tick
    pub fn run_scheduled_backup(&self) -> BackupRecoveryResult<Option<BackupId>> {
        self.inner.run_scheduled_backup(Utc::now())
    }

    /// Restore `components` (all when `None`) from a verified backup
    pub async fn restore_from_backup(
        &self,
        backup_id: &BackupId,
        components: Option<&[String]>,
        target_timestamp: Option<DateTime<Utc>>,
    ) -> BackupRecoveryResult<RecoveryStatus> {
        let plan = self
            .inner
            .planner
            .plan(backup_id, components, target_timestamp)?;
        self.inner.recovery.execute(&plan).await
    }

    /// Restore from the latest verified backup taken at or before `target`
    pub async fn restore_to_point_in_time(
        &self,
        target: DateTime<Utc>,
        components: Option<&[String]>,
    ) -> BackupRecoveryResult<RecoveryStatus> {
        let point = self.resolve_restore_point(target).ok_or_else(|| {
            BackupRecoveryError::NotFound {
                backup_id: format!("no verified backup at or before {target}"),
            }
        })?;
        self.restore_from_backup(&point.backup_id, components, Some(target))
            .await
    }

    /// Newest restorable backup taken at or before `target`
    pub fn resolve_restore_point(&self, target: DateTime<Utc>) -> Option<RestorePoint> {
        self.inner.planner.resolve_restore_point(target)
    }

    /// Restorable backups, newest first
    pub fn list_restore_points(&self) -> Vec<RestorePoint> {
        self.inner.planner.list_restore_points()
    }

    /// Latest status of a recovery started by this service
    pub fn recovery_status(&self, plan_id: &Uuid) -> Option<RecoveryStatus> {
        self.inner.recovery.status(plan_id)
    }

    /// All published backups, newest first
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.inner.registry.list()
    }

    /// Record by ID
    pub fn get_backup(&self, backup_id: &BackupId) -> Option<BackupRecord> {
        self.inner.registry.get(backup_id)
    }

    /// Aggregate backup statistics
    pub fn get_backup_statistics(&self) -> BackupStatistics {
        BackupStatistics::from_records(&self.inner.registry.list())
    }

    /// Current backup health
    pub fn get_backup_health(&self) -> BackupHealth {
        assess_health(
            &self.get_backup_statistics(),
            &self.inner.replication.nodes(),
            self.inner.config.backup_interval(),
            Utc::now(),
        )
    }

    /// Cancel a queued or running job. Returns false for unknown or
    /// finished jobs.
    pub fn cancel_backup(&self, job_id: &BackupId) -> bool {
        match self.inner.queue.cancel(job_id) {
            CancelOutcome::Dequeued => {
                info!(job_id = %job_id, "Queued backup cancelled");
                self.inner.events.publish(BackupEvent::BackupCancelled {
                    job_id: job_id.clone(),
                    timestamp: Utc::now(),
                });
                true
            }
            CancelOutcome::Signalled => {
                info!(job_id = %job_id, "Cancellation requested for running backup");
                true
            }
            CancelOutcome::NotFound => false,
        }
    }

    /// Re-verify one backup
    pub async fn verify_backup(&self, backup_id: &BackupId) -> BackupRecoveryResult<VerificationResult> {
        self.inner.verifier.verify(backup_id).await
    }

    /// Re-verify every backup
    pub async fn verify_all_backups(&self) -> Vec<VerificationResult> {
        self.inner.verifier.verify_all().await
    }

    /// Remove expired backups now
    pub async fn cleanup_expired_backups(&self) -> CleanupReport {
        self.inner.retention.cleanup_expired().await
    }

    /// Subscribe to lifecycle events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.inner.events.subscribe()
    }

    /// Queued and running job IDs
    pub fn active_jobs(&self) -> Vec<BackupId> {
        self.inner.queue.active_ids()
    }

    /// Configured replication nodes and their health
    pub fn replication_nodes(&self) -> Vec<ReplicationNode> {
        self.inner.replication.nodes()
    }

    /// Nodes holding a replica of `backup_id`
    pub fn replicas_of(&self, backup_id: &BackupId) -> Vec<String> {
        self.inner.replication.replicas_of(backup_id)
    }

    /// Active configuration
    pub fn config(&self) -> &BackupRecoveryConfig {
        &self.inner.config
    }

    fn spawn_timer<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<ServiceInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        tick(inner).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(timer = name, "Timer stopped");
        })
    }
}

impl ServiceInner {
    fn submit(
        inner: &Arc<Self>,
        components: Vec<String>,
        backup_type: BackupType,
    ) -> BackupRecoveryResult<BackupId> {
        if components.is_empty() {
            return Err(BackupRecoveryError::Validation {
                message: "at least one component is required".to_string(),
            });
        }
        let mut unique: Vec<String> = Vec::with_capacity(components.len());
        for component in components {
            if component.is_empty() {
                return Err(BackupRecoveryError::Validation {
                    message: "component names cannot be empty".to_string(),
                });
            }
            if !unique.contains(&component) {
                unique.push(component);
            }
        }
        for component in &unique {
            inner.providers.require(component)?;
        }

        let priority = unique
            .iter()
            .map(|c| inner.config.criticality_of(c))
            .max()
            .unwrap_or_default();
        let job = BackupJob {
            id: inner.ids.next_id(),
            backup_type,
            dependencies: inner.providers.dependencies_for(&unique),
            components: unique,
            created_at: Utc::now(),
            priority,
        };
        let job_id = job.id.clone();

        match inner.queue.admit(job)? {
            Some(ready) => Self::spawn_job(inner, ready),
            None => info!(job_id = %job_id, "Backup queued behind running jobs"),
        }
        Ok(job_id)
    }

    fn spawn_job(inner: &Arc<Self>, ready: ReadyJob) {
        let job_id = ready.job.id.clone();
        let slot = JobSlot {
            inner: Arc::clone(inner),
            job_id: job_id.clone(),
        };

        let handle = tokio::spawn(async move {
            let ReadyJob { job, cancel } = ready;
            let context = slot.inner.snapshot_context();
            if let Ok(record) = slot.inner.executor.run(&job, &cancel, context).await {
                let mut last = slot.inner.last_success.write();
                *last = (*last).max(Some(record.timestamp));
            }
        });

        let mut tasks = inner.job_tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(job_id, handle);
    }

    fn run_scheduled_backup(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> BackupRecoveryResult<Option<BackupId>> {
        if !self.config.auto_backup_enabled {
            return Ok(None);
        }
        let due = match *self.last_success.read() {
            Some(last) => now - last >= self.config.backup_interval(),
            None => true,
        };
        if !due {
            return Ok(None);
        }

        let components: Vec<String> = self
            .config
            .default_components
            .iter()
            .filter(|c| self.providers.contains(c))
            .cloned()
            .collect();
        if components.is_empty() {
            debug!("No providers registered for the default component set");
            return Ok(None);
        }

        Self::submit(self, components, BackupType::Incremental).map(Some)
    }

    fn snapshot_context(&self) -> SnapshotContext {
        SnapshotContext {
            active_jobs: self
                .queue
                .active_ids()
                .into_iter()
                .map(|id| id.to_string())
                .collect(),
            replication_nodes: self
                .replication
                .nodes()
                .into_iter()
                .map(|node| (node.id, node.health.to_string()))
                .collect(),
            providers: self.providers.names(),
        }
    }
}

/// Releases a running job's queue slot when its task ends, including by
/// panic, and starts whatever the queue hands back
struct JobSlot {
    inner: Arc<ServiceInner>,
    job_id: BackupId,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!(job_id = %self.job_id, "Backup task panicked");
        }
        for next in self.inner.queue.finish(&self.job_id) {
            ServiceInner::spawn_job(&self.inner, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Criticality, ReplicationNodeConfig};
    use crate::events::{next_matching, EventKind};
    use crate::test_support::{RecordingChannel, StaticProvider};
    use crate::types::VerificationStatus;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> BackupRecoveryConfig {
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
                let event = next_matching(events, kinds).await.unwrap();
                if event.job_id() == Some(job_id) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = BackupRecoveryService::builder(BackupRecoveryConfig {
            max_concurrent_backups: 0,
            ..Default::default()
        })
        .build();
        assert!(matches!(
            result,
            Err(BackupRecoveryError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_backup_validation() {
        let service = BackupRecoveryService::builder(config())
            .provider(Arc::new(StaticProvider::new("cache", 16)))
            .build()
            .unwrap();

        let empty: [&str; 0] = [];
        assert!(matches!(
            service.create_backup(empty, BackupType::Full),
            Err(BackupRecoveryError::Validation { .. })
        ));
        assert!(matches!(
            service.create_backup(["logs"], BackupType::Full),
            Err(BackupRecoveryError::Provider { .. })
        ));
        assert!(service.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_backup_verify_restore_cycle() {
        let service = BackupRecoveryService::builder(config())
            .provider(Arc::new(StaticProvider::new("cache", 1024)))
            .snapshot_builder(SnapshotBuilder::without_system_metrics())
            .build()
            .unwrap();
        service.initialize().await.unwrap();
        let mut events = service.subscribe();

        let id = service.create_backup(["cache"], BackupType::Full).unwrap();
        let event = wait_for(&mut events, &id, &[EventKind::BackupCompleted, EventKind::BackupFailed]).await;
        assert_eq!(event.kind(), EventKind::BackupCompleted);

        let result = service.verify_backup(&id).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(service.list_restore_points().len(), 1);

        let status = service.restore_from_backup(&id, None, None).await.unwrap();
        assert_eq!(status.restored_components, vec!["cache"]);
        assert_eq!(
            service.recovery_status(&status.plan_id).unwrap().state,
            status.state
        );

        let stats = service.get_backup_statistics();
        assert_eq!(stats.total_backups, 1);
        assert_eq!(stats.verified_count, 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_queued_job_can_be_cancelled() {
        let gate = Arc::new(Notify::new());
        let service = BackupRecoveryService::builder(BackupRecoveryConfig {
            max_concurrent_backups: 1,
            ..config()
        })
        .provider(Arc::new(StaticProvider::new("cache", 16).gated(Arc::clone(&gate))))
        .provider(Arc::new(StaticProvider::new("logs", 16)))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
        let mut events = service.subscribe();

        let running = service.create_backup(["cache"], BackupType::Full).unwrap();
        let queued = service.create_backup(["logs"], BackupType::Full).unwrap();
        assert_eq!(service.active_jobs().len(), 2);

        assert!(service.cancel_backup(&queued));
        assert!(!service.cancel_backup(&queued));
        let event = wait_for(&mut events, &queued, &[EventKind::BackupCancelled]).await;
        assert_eq!(event.kind(), EventKind::BackupCancelled);

        gate.notify_one();
        wait_for(&mut events, &running, &[EventKind::BackupCompleted]).await;
        assert_eq!(service.list_backups().len(), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_priority_follows_criticality() {
        let gate = Arc::new(Notify::new());
        let service = BackupRecoveryService::builder(BackupRecoveryConfig {
            max_concurrent_backups: 1,
            component_criticality: HashMap::from([("db".to_string(), Criticality::Critical)]),
            ..config()
        })
        .provider(Arc::new(StaticProvider::new("cache", 16).gated(Arc::clone(&gate))))
        .provider(Arc::new(StaticProvider::new("logs", 16)))
        .provider(Arc::new(StaticProvider::new("db", 16)))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
        let mut events = service.subscribe();

        let first = service.create_backup(["cache"], BackupType::Full).unwrap();
        let low = service.create_backup(["logs"], BackupType::Full).unwrap();
        let critical = service.create_backup(["db"], BackupType::Full).unwrap();

        gate.notify_one();
        wait_for(&mut events, &first, &[EventKind::BackupCompleted]).await;
        let next = timeout(WAIT, next_matching(&mut events, &[EventKind::BackupStarted]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.job_id(), Some(&critical));
        wait_for(&mut events, &low, &[EventKind::BackupCompleted]).await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_running_jobs() {
        let gate = Arc::new(Notify::new());
        let service = BackupRecoveryService::builder(config())
            .provider(Arc::new(StaticProvider::new("cache", 16).gated(Arc::clone(&gate))))
            .snapshot_builder(SnapshotBuilder::without_system_metrics())
            .build()
            .unwrap();
        service.initialize().await.unwrap();

        let id = service.create_backup(["cache"], BackupType::Full).unwrap();
        let stopper = {
            let service = service.clone();
            tokio::spawn(async move { service.stop().await })
        };
        tokio::task::yield_now().await;
        assert!(!stopper.is_finished());

        gate.notify_one();
        timeout(WAIT, stopper).await.unwrap().unwrap();
        assert!(service.get_backup(&id).is_some());
        assert!(matches!(
            service.create_backup(["cache"], BackupType::Full),
            Err(BackupRecoveryError::Validation { .. })
        ));
        assert!(service.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_waits_for_job_without_registered_task() {
        let service = BackupRecoveryService::builder(config())
            .provider(Arc::new(StaticProvider::new("cache", 16)))
            .build()
            .unwrap();
        service.initialize().await.unwrap();

        // Admitted and running, but its task handle is not registered yet
        let job = BackupJob {
            id: BackupId::new("backup-unregistered"),
            backup_type: BackupType::Full,
            components: vec!["cache".to_string()],
            dependencies: Default::default(),
            created_at: Utc::now(),
            priority: Criticality::Low,
        };
        let job_id = job.id.clone();
        assert!(service.inner.queue.admit(job).unwrap().is_some());

        let gate = Arc::new(Notify::new());
        let finisher = {
            let inner = Arc::clone(&service.inner);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.notified().await;
                inner.queue.finish(&job_id);
            })
        };
        let stopper = {
            let service = service.clone();
            tokio::spawn(async move { service.stop().await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!stopper.is_finished());

        gate.notify_one();
        timeout(WAIT, stopper).await.unwrap().unwrap();
        finisher.await.unwrap();
        assert_eq!(service.inner.queue.running_count(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_backup_runs_when_due() {
        let service = BackupRecoveryService::builder(BackupRecoveryConfig {
            auto_backup_enabled: true,
            default_components: vec!["cache".to_string(), "userFiles".to_string()],
            ..Default::default()
        })
        .provider(Arc::new(StaticProvider::new("cache", 16)))
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
        let mut events = service.subscribe();

        let id = service.run_scheduled_backup().unwrap().unwrap();
        wait_for(&mut events, &id, &[EventKind::BackupCompleted]).await;
        let record = service.get_backup(&id).unwrap();
        assert_eq!(record.backup_type, BackupType::Incremental);
        assert_eq!(record.components, vec!["cache"]);

        // Not due again until the interval has passed
        assert!(service.run_scheduled_backup().unwrap().is_none());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_backups_replicate_to_healthy_nodes() {
        let channel = Arc::new(RecordingChannel::new());
        channel.fail_node("replica-b");
        let service = BackupRecoveryService::builder(BackupRecoveryConfig {
            replication_nodes: vec![
                ReplicationNodeConfig {
                    id: "replica-a".to_string(),
                    endpoint: "mem://a".to_string(),
                },
                ReplicationNodeConfig {
                    id: "replica-b".to_string(),
                    endpoint: "mem://b".to_string(),
                },
            ],
            replication: crate::config::ReplicationPolicy {
                max_attempts: 1,
                ..Default::default()
            },
            ..config()
        })
        .provider(Arc::new(StaticProvider::new("cache", 16)))
        .replication_channel(channel.clone())
        .snapshot_builder(SnapshotBuilder::without_system_metrics())
        .build()
        .unwrap();
        service.initialize().await.unwrap();
        let mut events = service.subscribe();

        let id = service.create_backup(["cache"], BackupType::Full).unwrap();
        wait_for(&mut events, &id, &[EventKind::BackupCompleted]).await;

        timeout(WAIT, async {
            while service.replicas_of(&id).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(service.replicas_of(&id), vec!["replica-a"]);
        assert_eq!(
            service.get_backup(&id).unwrap().verification_status,
            VerificationStatus::Pending
        );
        service.stop().await;
    }
}
