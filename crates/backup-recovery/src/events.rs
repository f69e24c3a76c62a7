//! Backup and recovery event publication

use crate::recovery::RecoveryState;
use crate::types::{BackupId, BackupType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Event name, for subscribers that only care about some events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// See [`BackupEvent::BackupStarted`]
    BackupStarted,
    /// See [`BackupEvent::BackupProgress`]
    BackupProgress,
    /// See [`BackupEvent::BackupCompleted`]
    BackupCompleted,
    /// See [`BackupEvent::BackupFailed`]
    BackupFailed,
    /// See [`BackupEvent::BackupCancelled`]
    BackupCancelled,
    /// See [`BackupEvent::RecoveryStarted`]
    RecoveryStarted,
    /// See [`BackupEvent::RecoveryProgress`]
    RecoveryProgress,
    /// See [`BackupEvent::RecoveryCompleted`]
    RecoveryCompleted,
}

/// Published lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupEvent {
    /// A job started executing
    BackupStarted {
        job_id: BackupId,
        backup_type: BackupType,
        components: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A pipeline stage finished
    BackupProgress {
        job_id: BackupId,
        stage: String,
        percentage: f32,
        timestamp: DateTime<Utc>,
    },
    /// A record was published
    BackupCompleted {
        job_id: BackupId,
        size_bytes: u64,
        stored_size_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed before publication
    BackupFailed {
        job_id: BackupId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was cancelled before publication
    BackupCancelled {
        job_id: BackupId,
        timestamp: DateTime<Utc>,
    },
    /// A recovery started restoring
    RecoveryStarted {
        plan_id: Uuid,
        backup_id: BackupId,
        components: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A component finished restoring, successfully or not
    RecoveryProgress {
        plan_id: Uuid,
        component: String,
        succeeded: bool,
        percentage: f32,
        timestamp: DateTime<Utc>,
    },
    /// A recovery reached a terminal state
    RecoveryCompleted {
        plan_id: Uuid,
        backup_id: BackupId,
        state: RecoveryState,
        errors: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl BackupEvent {
    /// Event name
    pub fn kind(&self) -> EventKind {
        match self {
            BackupEvent::BackupStarted { .. } => EventKind::BackupStarted,
            BackupEvent::BackupProgress { .. } => EventKind::BackupProgress,
            BackupEvent::BackupCompleted { .. } => EventKind::BackupCompleted,
            BackupEvent::BackupFailed { .. } => EventKind::BackupFailed,
            BackupEvent::BackupCancelled { .. } => EventKind::BackupCancelled,
            BackupEvent::RecoveryStarted { .. } => EventKind::RecoveryStarted,
            BackupEvent::RecoveryProgress { .. } => EventKind::RecoveryProgress,
            BackupEvent::RecoveryCompleted { .. } => EventKind::RecoveryCompleted,
        }
    }

    /// Backup job the event belongs to, for backup events
    pub fn job_id(&self) -> Option<&BackupId> {
        match self {
            BackupEvent::BackupStarted { job_id, .. }
            | BackupEvent::BackupProgress { job_id, .. }
            | BackupEvent::BackupCompleted { job_id, .. }
            | BackupEvent::BackupFailed { job_id, .. }
            | BackupEvent::BackupCancelled { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            BackupEvent::BackupStarted { timestamp, .. }
            | BackupEvent::BackupProgress { timestamp, .. }
            | BackupEvent::BackupCompleted { timestamp, .. }
            | BackupEvent::BackupFailed { timestamp, .. }
            | BackupEvent::BackupCancelled { timestamp, .. }
            | BackupEvent::RecoveryStarted { timestamp, .. }
            | BackupEvent::RecoveryProgress { timestamp, .. }
            | BackupEvent::RecoveryCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// Fan-out of [`BackupEvent`]s to any number of subscribers.
///
/// Subscribing returns a receiver; dropping it unsubscribes. Publishing
/// never blocks and never fails when nobody listens.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to current subscribers; dropped when there are none
    pub fn publish(&self, event: BackupEvent) {
        let kind = event.kind();
        // No receivers is not an error
        let delivered = self.sender.send(event).unwrap_or(0);
        trace!(?kind, delivered, "Published event");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receive the next event of one of the given kinds, skipping the rest.
/// Returns `None` once the bus is gone.
pub async fn next_matching(
    receiver: &mut broadcast::Receiver<BackupEvent>,
    kinds: &[EventKind],
) -> Option<BackupEvent> {
    loop {
        match receiver.recv().await {
            Ok(event) if kinds.contains(&event.kind()) => return Some(event),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(skipped, "Event subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
