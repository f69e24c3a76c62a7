//! Asynchronous best-effort replication of published backups
//!
//! Replication never gates publication: the executor enqueues a record
//! after it is registered and moves on. A background processor pushes the
//! payload to every configured node, retrying with exponential backoff, and
//! tracks per-node health from consecutive failures. Unhealthy nodes are
//! pinged periodically and return to `Active` once a ping succeeds.

use crate::config::{ReplicationNodeConfig, ReplicationPolicy};
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::types::{BackupId, BackupRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Transport to remote replica nodes
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// Store a payload and its record on `node`
    async fn push(
        &self,
        node: &ReplicationNode,
        record: &BackupRecord,
        payload: &[u8],
    ) -> BackupRecoveryResult<()>;

    /// Cheap reachability check
    async fn ping(&self, node: &ReplicationNode) -> BackupRecoveryResult<()>;

    /// Drop a replica that expired locally
    async fn remove(&self, _node: &ReplicationNode, _backup_id: &BackupId) -> BackupRecoveryResult<()> {
        Ok(())
    }
}

/// Node health derived from consecutive push failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    /// Last push succeeded
    Active,
    /// Recent pushes failed
    Degraded,
    /// Too many consecutive failures; skipped until a ping succeeds
    Unreachable,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeHealth::Active => "active",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// Replica node and its observed health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationNode {
    /// Node ID
    pub id: String,
    /// Endpoint
    pub endpoint: String,
    /// Health
    pub health: NodeHealth,
    /// Last successful push
    pub last_sync: Option<DateTime<Utc>>,
    /// Failed pushes since the last success
    pub consecutive_failures: u32,
}

impl From<&ReplicationNodeConfig> for ReplicationNode {
    fn from(config: &ReplicationNodeConfig) -> Self {
        Self {
            id: config.id.clone(),
            endpoint: config.endpoint.clone(),
            health: NodeHealth::Active,
            last_sync: None,
            consecutive_failures: 0,
        }
    }
}

/// Replication metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    /// Successful pushes
    pub successful_pushes: u64,
    /// Pushes that exhausted their retries
    pub failed_pushes: u64,
    /// Retry attempts
    pub retries: u64,
    /// Payload bytes delivered
    pub bytes_replicated: u64,
    /// Requests dropped because the queue was full or closed
    pub dropped_requests: u64,
}

/// Per-node results of replicating one backup
#[derive(Debug, Clone, Default)]
pub struct ReplicationOutcome {
    /// Nodes that accepted the replica
    pub succeeded: Vec<String>,
    /// Nodes that did not
    pub failed: Vec<String>,
}

enum ReplicationCommand {
    Replicate {
        record: BackupRecord,
        payload: Arc<Vec<u8>>,
    },
    Forget(BackupId),
}

struct ReplicationState {
    policy: ReplicationPolicy,
    nodes: DashMap<String, ReplicationNode>,
    replicas: DashMap<BackupId, BTreeSet<String>>,
    channel: Option<Arc<dyn ReplicationChannel>>,
    metrics: RwLock<ReplicationMetrics>,
}

/// Replication manager
pub struct ReplicationManager {
    state: Arc<ReplicationState>,
    command_tx: mpsc::Sender<ReplicationCommand>,
    command_rx: Arc<Mutex<mpsc::Receiver<ReplicationCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    /// Create a manager for `nodes`. A channel is required once any node is
    /// configured.
    pub fn new(
        policy: ReplicationPolicy,
        nodes: &[ReplicationNodeConfig],
        channel: Option<Arc<dyn ReplicationChannel>>,
    ) -> BackupRecoveryResult<Self> {
        if !nodes.is_empty() && channel.is_none() {
            return Err(BackupRecoveryError::Configuration {
                message: "replication nodes configured without a replication channel".to_string(),
            });
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let state = ReplicationState {
            policy,
            nodes: nodes
                .iter()
                .map(|node| (node.id.clone(), ReplicationNode::from(node)))
                .collect(),
            replicas: DashMap::new(),
            channel,
            metrics: RwLock::new(ReplicationMetrics::default()),
        };

        Ok(Self {
            state: Arc::new(state),
            command_tx,
            command_rx: Arc::new(Mutex::new(command_rx)),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start the command processor and the node health check loop
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!(nodes = self.state.nodes.len(), "Starting replication manager");
        tasks.push(self.start_command_processor());
        tasks.push(self.start_health_checker());
    }

    /// Stop background tasks. A push already in flight completes; queued
    /// requests are dropped.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping replication manager");
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Queue a published backup for replication. Never blocks and never fails;
    /// a full queue drops the request with a warning.
    pub fn enqueue(&self, record: BackupRecord, payload: Arc<Vec<u8>>) {
        if self.state.nodes.is_empty() {
            return;
        }
        let backup_id = record.id.clone();
        if let Err(e) = self
            .command_tx
            .try_send(ReplicationCommand::Replicate { record, payload })
        {
            self.state.metrics.write().dropped_requests += 1;
            warn!(backup_id = %backup_id, error = %e, "Replication request dropped");
        }
    }

    /// Queue removal of a backup's replicas. Commands are processed in
    /// order, so a push still queued for the backup lands first and is then
    /// removed.
    pub fn forget(&self, backup_id: &BackupId) {
        if self.state.nodes.is_empty() {
            return;
        }
        if let Err(e) = self
            .command_tx
            .try_send(ReplicationCommand::Forget(backup_id.clone()))
        {
            self.state.metrics.write().dropped_requests += 1;
            warn!(backup_id = %backup_id, error = %e, "Replica removal request dropped");
        }
    }

    /// Push one backup to every node now, waiting for all of them
    pub async fn replicate_now(
        &self,
        record: &BackupRecord,
        payload: Arc<Vec<u8>>,
    ) -> ReplicationOutcome {
        self.state.replicate(record, payload).await
    }

    /// Ping every node that is not active
    pub async fn check_nodes(&self) {
        self.state.recheck_unhealthy().await;
    }

    /// Nodes sorted by ID
    pub fn nodes(&self) -> Vec<ReplicationNode> {
        let mut nodes: Vec<ReplicationNode> =
            self.state.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Current state of one node
    pub fn node(&self, node_id: &str) -> Option<ReplicationNode> {
        self.state.nodes.get(node_id).map(|n| n.value().clone())
    }

    /// Nodes known to hold a copy of `backup_id`
    pub fn replicas_of(&self, backup_id: &BackupId) -> Vec<String> {
        self.state
            .replicas
            .get(backup_id)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate counters
    pub fn metrics(&self) -> ReplicationMetrics {
        self.state.metrics.read().clone()
    }

    fn start_command_processor(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let command_rx = Arc::clone(&self.command_rx);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut rx = command_rx.lock().await;
            loop {
                let command = tokio::select! {
                    command = rx.recv() => command,
                    _ = shutdown.changed() => break,
                };
                match command {
                    Some(ReplicationCommand::Replicate { record, payload }) => {
                        let outcome = state.replicate(&record, payload).await;
                        debug!(
                            backup_id = %record.id,
                            succeeded = outcome.succeeded.len(),
                            failed = outcome.failed.len(),
                            "Replication finished"
                        );
                    }
                    Some(ReplicationCommand::Forget(backup_id)) => {
                        state.forget(&backup_id).await;
                    }
                    None => break,
                }
            }
            debug!("Replication command processor stopped");
        })
    }

    fn start_health_checker(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(self.state.policy.health_check_interval_secs.max(1));

        tokio::spawn(async move {
            let mut check_interval = interval_at(Instant::now() + period, period);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = check_interval.tick() => state.recheck_unhealthy().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

impl ReplicationState {
    async fn replicate(&self, record: &BackupRecord, payload: Arc<Vec<u8>>) -> ReplicationOutcome {
        let mut outcome = ReplicationOutcome::default();
        let Some(channel) = self.channel.clone() else {
            return outcome;
        };

        let nodes: Vec<ReplicationNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        let mut pushes = JoinSet::new();
        for node in nodes {
            let channel = Arc::clone(&channel);
            let record = record.clone();
            let payload = Arc::clone(&payload);
            let policy = self.policy.clone();
            pushes.spawn(async move {
                let result = push_with_retry(&policy, channel.as_ref(), &node, &record, &payload).await;
                (node.id, result)
            });
        }

        while let Some(joined) = pushes.join_next().await {
            let Ok((node_id, (result, retries))) = joined else {
                continue;
            };
            self.metrics.write().retries += retries;
            match result {
                Ok(()) => {
                    self.record_success(&node_id, &record.id, payload.len() as u64);
                    outcome.succeeded.push(node_id);
                }
                Err(e) => {
                    self.record_failure(&node_id, &record.id, &e);
                    outcome.failed.push(node_id);
                }
            }
        }

        outcome.succeeded.sort();
        outcome.failed.sort();
        outcome
    }

    fn record_success(&self, node_id: &str, backup_id: &BackupId, bytes: u64) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            if node.health != NodeHealth::Active {
                info!(node_id, "Replication node recovered");
            }
            node.health = NodeHealth::Active;
            node.consecutive_failures = 0;
            node.last_sync = Some(Utc::now());
        }
        self.replicas
            .entry(backup_id.clone())
            .or_default()
            .insert(node_id.to_string());

        let mut metrics = self.metrics.write();
        metrics.successful_pushes += 1;
        metrics.bytes_replicated += bytes;
    }

    fn record_failure(&self, node_id: &str, backup_id: &BackupId, error: &BackupRecoveryError) {
        self.metrics.write().failed_pushes += 1;
        let Some(mut node) = self.nodes.get_mut(node_id) else {
            return;
        };
        node.consecutive_failures += 1;
        let health = if node.consecutive_failures >= self.policy.unreachable_after_failures {
            NodeHealth::Unreachable
        } else if node.consecutive_failures >= self.policy.degraded_after_failures {
            NodeHealth::Degraded
        } else {
            node.health
        };
        if health != node.health {
            warn!(node_id, from = %node.health, to = %health, "Replication node health changed");
        }
        node.health = health;

        warn!(
            node_id,
            backup_id = %backup_id,
            failures = node.consecutive_failures,
            error = %error,
            "Replication failed"
        );
    }

    async fn recheck_unhealthy(&self) {
        let Some(channel) = &self.channel else {
            return;
        };
        let unhealthy: Vec<ReplicationNode> = self
            .nodes
            .iter()
            .filter(|n| n.health != NodeHealth::Active)
            .map(|n| n.value().clone())
            .collect();

        for node in unhealthy {
            match channel.ping(&node).await {
                Ok(()) => {
                    if let Some(mut entry) = self.nodes.get_mut(&node.id) {
                        entry.health = NodeHealth::Active;
                        entry.consecutive_failures = 0;
                    }
                    info!(node_id = %node.id, "Replication node reachable again");
                }
                Err(e) => debug!(node_id = %node.id, error = %e, "Health check failed"),
            }
        }
    }

    async fn forget(&self, backup_id: &BackupId) {
        let Some((_, holders)) = self.replicas.remove(backup_id) else {
            return;
        };
        let Some(channel) = &self.channel else {
            return;
        };
        for node_id in holders {
            let Some(node) = self.nodes.get(&node_id).map(|n| n.value().clone()) else {
                continue;
            };
            if let Err(e) = channel.remove(&node, backup_id).await {
                warn!(node_id = %node_id, backup_id = %backup_id, error = %e, "Failed to remove replica");
            }
        }
    }
}

/// Exponential backoff delay before retry number `attempt` (1-based)
pub fn backoff_delay(policy: &ReplicationPolicy, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(20);
    let delay = policy.base_delay_ms.saturating_mul(factor);
    Duration::from_millis(delay.min(policy.max_delay_ms))
}

/// Returns the push result and the number of retries spent
async fn push_with_retry(
    policy: &ReplicationPolicy,
    channel: &dyn ReplicationChannel,
    node: &ReplicationNode,
    record: &BackupRecord,
    payload: &[u8],
) -> (BackupRecoveryResult<()>, u64) {
    // Unreachable nodes get one attempt per backup until a ping succeeds
    let attempts = if node.health == NodeHealth::Unreachable {
        1
    } else {
        policy.max_attempts.max(1)
    };

    let mut retries = 0;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match channel.push(node, record, payload).await {
            Ok(()) => return (Ok(()), retries),
            Err(e) => {
                debug!(node_id = %node.id, attempt, error = %e, "Replication attempt failed");
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable {
                    break;
                }
                if attempt < attempts {
                    retries += 1;
                    sleep(backoff_delay(policy, attempt)).await;
                }
            }
        }
    }

    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempt made".to_string());
    (
        Err(BackupRecoveryError::Replication {
            node_id: node.id.clone(),
            reason,
        }),
        retries,
    )
}
