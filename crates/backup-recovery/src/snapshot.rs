//! Point-in-time descriptors of ambient system state attached to backups

use crate::config::BackupRecoveryConfig;
use crate::error::BackupRecoveryResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sysinfo::System;
use tracing::debug;

/// Best-effort description of the system at backup start.
///
/// Diagnostic context only; never restored on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
    /// Host name, if the platform reports one
    pub hostname: Option<String>,
    /// Process ID of the capturing process
    pub process_id: u32,
    /// Logical CPU count
    pub cpu_count: usize,
    /// Total memory in bytes
    pub total_memory_bytes: u64,
    /// Used memory in bytes
    pub used_memory_bytes: u64,
    /// Backup jobs active at capture time
    pub active_jobs: Vec<String>,
    /// Replication node health by node ID
    pub replication_nodes: BTreeMap<String, String>,
    /// Registered component providers
    pub providers: Vec<String>,
    /// Active configuration
    pub configuration: serde_json::Value,
}

/// Worker and process state handed to the builder
#[derive(Debug, Clone, Default)]
pub struct SnapshotContext {
    /// IDs of running and queued jobs
    pub active_jobs: Vec<String>,
    /// Health per replication node
    pub replication_nodes: BTreeMap<String, String>,
    /// Registered component names
    pub providers: Vec<String>,
}

/// Builds [`SystemSnapshot`]s
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    collect_system_metrics: bool,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuilder {
    /// Builder that collects host metrics
    pub fn new() -> Self {
        Self {
            collect_system_metrics: true,
        }
    }

    /// Skip host resource probing
    pub fn without_system_metrics() -> Self {
        Self {
            collect_system_metrics: false,
        }
    }

    /// Capture a snapshot. Failures are reported to the caller, who treats
    /// them as warnings.
    pub fn build(
        &self,
        config: &BackupRecoveryConfig,
        context: SnapshotContext,
    ) -> BackupRecoveryResult<SystemSnapshot> {
        let configuration = serde_json::to_value(config)?;

        let (hostname, cpu_count, total_memory_bytes, used_memory_bytes) =
            if self.collect_system_metrics {
                let mut system = System::new();
                system.refresh_memory();
                (
                    System::host_name(),
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1),
                    system.total_memory(),
                    system.used_memory(),
                )
            } else {
                (None, 0, 0, 0)
            };

        let snapshot = SystemSnapshot {
            captured_at: Utc::now(),
            hostname,
            process_id: std::process::id(),
            cpu_count,
            total_memory_bytes,
            used_memory_bytes,
            active_jobs: context.active_jobs,
            replication_nodes: context.replication_nodes,
            providers: context.providers,
            configuration,
        };

        debug!(
            active_jobs = snapshot.active_jobs.len(),
            used_memory_bytes = snapshot.used_memory_bytes,
            "Captured system snapshot"
        );
        Ok(snapshot)
    }
}
