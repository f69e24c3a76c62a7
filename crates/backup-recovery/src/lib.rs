//! Backup and recovery orchestration for the StratoSwarm node runtime
//!
//! This crate provides:
//! - Full, incremental, differential and snapshot backups of registered components
//! - Bounded-concurrency job scheduling with per-component mutual exclusion
//! - Zstd compression and AES-256-GCM encryption of stored payloads
//! - SHA-256 integrity verification before any restore
//! - Replication of published backups to remote nodes with retry and health tracking
//! - Retention enforcement and expired backup cleanup
//! - Dependency-ordered recovery plans and point-in-time restore
//! - Lifecycle events for progress reporting

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod integrity;
pub mod provider;
pub mod recovery;
pub mod registry;
pub mod replication;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

pub use error::{BackupRecoveryError, BackupRecoveryResult};

pub use config::{BackupRecoveryConfig, Criticality, ReplicationNodeConfig, ReplicationPolicy};

pub use types::{
    BackupId, BackupJob, BackupRecord, BackupType, RecordMetadata, RestorePoint,
    VerificationStatus,
};

pub use service::{BackupRecoveryService, BackupRecoveryServiceBuilder};

pub use provider::{ComponentPayload, ComponentProvider, ProviderRegistry};

pub use storage::{BlobStore, LocalBlobStore, MemoryBlobStore};

pub use codec::{EncryptionKey, PayloadCodec};

pub use events::{BackupEvent, EventBus, EventKind};

pub use integrity::{IntegrityVerifier, VerificationResult};

pub use replication::{
    NodeHealth, ReplicationChannel, ReplicationManager, ReplicationMetrics, ReplicationNode,
};

pub use retention::CleanupReport;

pub use health::{BackupHealth, BackupStatistics, HealthStatus};

pub use recovery::{RecoveryPlan, RecoveryState, RecoveryStatus};

pub use snapshot::{SnapshotBuilder, SystemSnapshot};
