//! Backup statistics and health assessment

use crate::replication::{NodeHealth, ReplicationNode};
use crate::types::{BackupRecord, VerificationStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const NO_BACKUP_PENALTY: u32 = 40;
const STALE_PENALTY: u32 = 15;
const VERY_STALE_PENALTY: u32 = 30;
const FAILED_VERIFICATION_PENALTY: u32 = 10;
const MAX_VERIFICATION_PENALTY: u32 = 30;
const UNREACHABLE_NODE_PENALTY: u32 = 15;
const DEGRADED_NODE_PENALTY: u32 = 5;
const MAX_REPLICATION_PENALTY: u32 = 30;

/// Aggregate statistics over the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStatistics {
    /// Published records
    pub total_backups: usize,
    /// Sum of captured sizes
    pub total_size: u64,
    /// Sum of stored sizes
    pub total_stored_size: u64,
    /// Most recent publication
    pub last_backup_time: Option<DateTime<Utc>>,
    /// Records whose last verification passed
    pub verified_count: usize,
    /// Records whose last verification failed
    pub failed_count: usize,
    /// Records not verified yet
    pub pending_count: usize,
}

impl BackupStatistics {
    /// Aggregate statistics over `records`
    pub fn from_records(records: &[BackupRecord]) -> Self {
        let mut stats = Self {
            total_backups: records.len(),
            ..Default::default()
        };
        for record in records {
            stats.total_size += record.size_bytes;
            stats.total_stored_size += record.metadata.stored_size_bytes;
            stats.last_backup_time = stats.last_backup_time.max(Some(record.timestamp));
            match record.verification_status {
                VerificationStatus::Verified => stats.verified_count += 1,
                VerificationStatus::Failed => stats.failed_count += 1,
                VerificationStatus::Pending => stats.pending_count += 1,
            }
        }
        stats
    }
}

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Score of 80 or more
    Healthy,
    /// Score from 50 to 79
    Warning,
    /// Score below 50
    Critical,
}

impl HealthStatus {
    fn from_score(score: u8) -> Self {
        match score {
            80..=100 => HealthStatus::Healthy,
            50..=79 => HealthStatus::Warning,
            _ => HealthStatus::Critical,
        }
    }
}

/// Health summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupHealth {
    /// Status
    pub status: HealthStatus,
    /// Human-readable findings
    pub issues: Vec<String>,
    /// Score from 0 (critical) to 100 (healthy)
    pub score: u8,
    /// Assessed at
    pub checked_at: DateTime<Utc>,
}

/// Score backup freshness, verification failures and replica health.
///
/// `expected_interval` is how often a backup should land; a last backup older
/// than one interval costs points, older than two costs more.
pub fn assess_health(
    stats: &BackupStatistics,
    nodes: &[ReplicationNode],
    expected_interval: Duration,
    now: DateTime<Utc>,
) -> BackupHealth {
    let mut penalty = 0u32;
    let mut issues = Vec::new();

    match stats.last_backup_time {
        None => {
            penalty += NO_BACKUP_PENALTY;
            issues.push("no backups have been published".to_string());
        }
        Some(last) => {
            let age = now - last;
            if age > expected_interval * 2 {
                penalty += VERY_STALE_PENALTY;
                issues.push(format!(
                    "last backup is {} minutes old, more than twice the backup interval",
                    age.num_minutes()
                ));
            } else if age > expected_interval {
                penalty += STALE_PENALTY;
                issues.push(format!(
                    "last backup is {} minutes old, older than the backup interval",
                    age.num_minutes()
                ));
            }
        }
    }

    if stats.failed_count > 0 {
        penalty += (stats.failed_count as u32 * FAILED_VERIFICATION_PENALTY)
            .min(MAX_VERIFICATION_PENALTY);
        issues.push(format!(
            "{} backup(s) failed verification",
            stats.failed_count
        ));
    }

    let mut replication_penalty = 0;
    for node in nodes {
        match node.health {
            NodeHealth::Active => {}
            NodeHealth::Degraded => {
                replication_penalty += DEGRADED_NODE_PENALTY;
                issues.push(format!("replication node {} is degraded", node.id));
            }
            NodeHealth::Unreachable => {
                replication_penalty += UNREACHABLE_NODE_PENALTY;
                issues.push(format!("replication node {} is unreachable", node.id));
            }
        }
    }
    penalty += replication_penalty.min(MAX_REPLICATION_PENALTY);

    let score = 100u32.saturating_sub(penalty) as u8;
    BackupHealth {
        status: HealthStatus::from_score(score),
        issues,
        score,
        checked_at: now,
    }
}
