//! Backup and recovery configuration

use crate::codec::{AES_256_GCM, COMPRESSION_NONE, ZSTD};
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Component criticality, used to order queued jobs
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    /// Can be rebuilt cheaply
    Low,
    /// Default for unlisted components
    #[default]
    Medium,
    /// Loss is user visible
    High,
    /// Loss is unacceptable
    Critical,
}

/// A secondary node that receives copies of published backups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationNodeConfig {
    /// Node ID
    pub id: String,
    /// Endpoint identifier handed to the replication channel
    pub endpoint: String,
}

/// Retry and health thresholds for replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationPolicy {
    /// Push attempts per backup and node
    pub max_attempts: u32,
    /// First retry delay, doubled on each attempt
    pub base_delay_ms: u64,
    /// Retry delay ceiling
    pub max_delay_ms: u64,
    /// Consecutive failed pushes before a node is degraded
    pub degraded_after_failures: u32,
    /// Consecutive failed pushes before a node is unreachable
    pub unreachable_after_failures: u32,
    /// Interval between pings of non-active nodes
    pub health_check_interval_secs: u64,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            degraded_after_failures: 2,
            unreachable_after_failures: 5,
            health_check_interval_secs: 300,
        }
    }
}

/// Backup and recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupRecoveryConfig {
    /// Enable the periodic automatic backup
    pub auto_backup_enabled: bool,
    /// Scheduler timer period
    pub scheduler_tick_secs: u64,
    /// Maximum age of the last successful backup before the scheduler enqueues a new one
    pub backup_interval_secs: u64,
    /// Retention window applied to every new record
    pub retention_secs: u64,
    /// zstd level, 0 disables compression
    pub compression_level: i32,
    /// Encrypt persisted payloads
    pub encryption_enabled: bool,
    /// Encryption algorithm identifier
    pub encryption_algorithm: String,
    /// Worker pool size
    pub max_concurrent_backups: usize,
    /// Secondary nodes
    pub replication_nodes: Vec<ReplicationNodeConfig>,
    /// Replication retry policy
    pub replication: ReplicationPolicy,
    /// Verification sweep period
    pub verification_interval_secs: u64,
    /// Retention sweep period
    pub cleanup_interval_secs: u64,
    /// Components covered by automatic backups
    pub default_components: Vec<String>,
    /// Per-component criticality
    pub component_criticality: HashMap<String, Criticality>,
    /// Largest payload the executor will persist
    pub max_backup_size_bytes: u64,
    /// Throughput assumed when estimating recovery duration
    pub restore_throughput_bytes_per_sec: u64,
    /// Recovery time objective
    pub rto_target_secs: u64,
    /// Registry catalog file, in-memory only when unset
    pub catalog_path: Option<PathBuf>,
    /// Event channel capacity
    pub event_channel_capacity: usize,
}

impl Default for BackupRecoveryConfig {
    fn default() -> Self {
        Self {
            auto_backup_enabled: true,
            scheduler_tick_secs: 60,
            backup_interval_secs: 3600,
            retention_secs: 30 * 24 * 3600,
            compression_level: 3,
            encryption_enabled: true,
            encryption_algorithm: AES_256_GCM.to_string(),
            max_concurrent_backups: 3,
            replication_nodes: Vec::new(),
            replication: ReplicationPolicy::default(),
            verification_interval_secs: 3600,
            cleanup_interval_secs: 24 * 3600,
            default_components: vec!["cache".to_string(), "userFiles".to_string()],
            component_criticality: HashMap::new(),
            max_backup_size_bytes: 4 * 1024 * 1024 * 1024,
            restore_throughput_bytes_per_sec: 50 * 1024 * 1024,
            rto_target_secs: 3600,
            catalog_path: None,
            event_channel_capacity: 1024,
        }
    }
}

impl BackupRecoveryConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> BackupRecoveryResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> BackupRecoveryResult<()> {
        let non_zero = [
            ("scheduler_tick_secs", self.scheduler_tick_secs),
            ("backup_interval_secs", self.backup_interval_secs),
            ("retention_secs", self.retention_secs),
            ("verification_interval_secs", self.verification_interval_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("max_backup_size_bytes", self.max_backup_size_bytes),
            (
                "restore_throughput_bytes_per_sec",
                self.restore_throughput_bytes_per_sec,
            ),
            ("max_concurrent_backups", self.max_concurrent_backups as u64),
            ("event_channel_capacity", self.event_channel_capacity as u64),
            ("replication.max_attempts", self.replication.max_attempts as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(BackupRecoveryError::Configuration {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }

        if !(0..=22).contains(&self.compression_level) {
            return Err(BackupRecoveryError::Configuration {
                message: format!(
                    "compression level {} outside 0..=22",
                    self.compression_level
                ),
            });
        }

        if self.encryption_enabled && self.encryption_algorithm != AES_256_GCM {
            return Err(BackupRecoveryError::Configuration {
                message: format!(
                    "unsupported encryption algorithm: {}",
                    self.encryption_algorithm
                ),
            });
        }

        let policy = &self.replication;
        if policy.unreachable_after_failures <= policy.degraded_after_failures {
            return Err(BackupRecoveryError::Configuration {
                message: "unreachable threshold must exceed degraded threshold".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.replication_nodes {
            if node.id.is_empty() || node.endpoint.is_empty() {
                return Err(BackupRecoveryError::Configuration {
                    message: "replication node id and endpoint cannot be empty".to_string(),
                });
            }
            if !seen.insert(node.id.as_str()) {
                return Err(BackupRecoveryError::Configuration {
                    message: format!("duplicate replication node: {}", node.id),
                });
            }
        }

        Ok(())
    }

    /// Criticality of a component, `Medium` when unlisted
    pub fn criticality_of(&self, component: &str) -> Criticality {
        self.component_criticality
            .get(component)
            .copied()
            .unwrap_or_default()
    }

    /// Compression algorithm identifier stored in record metadata
    pub fn compression_algorithm(&self) -> &'static str {
        if self.compression_level == 0 {
            COMPRESSION_NONE
        } else {
            ZSTD
        }
    }

    /// How often the scheduler checks whether a backup is due
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    /// Interval between automatic backups
    pub fn backup_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.backup_interval_secs as i64)
    }

    /// Age after which backups expire
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    /// Interval between verification sweeps
    pub fn verification_interval(&self) -> Duration {
        Duration::from_secs(self.verification_interval_secs)
    }

    /// Interval between cleanup runs
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
