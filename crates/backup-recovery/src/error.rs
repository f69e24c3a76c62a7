//! Backup and recovery error types

use thiserror::Error;

/// Backup and recovery error types
#[derive(Debug, Error)]
pub enum BackupRecoveryError {
    /// Malformed request
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Requested components overlap a job that is already active
    #[error("Conflict: components {components:?} overlap active job {job_id}")]
    Conflict {
        job_id: String,
        components: Vec<String>,
    },

    /// A component provider failed to capture its state
    #[error("Provider for {component} failed: {reason}")]
    Provider { component: String, reason: String },

    /// A component provider failed to restore its state
    #[error("Restore of {component} failed: {reason}")]
    Restore { component: String, reason: String },

    /// A record with the same id is already registered
    #[error("Backup {backup_id} already exists")]
    DuplicateId { backup_id: String },

    /// Unknown backup id
    #[error("Backup {backup_id} not found")]
    NotFound { backup_id: String },

    /// Checksum or verification failure blocking recovery
    #[error("Integrity check failed for backup {backup_id}: {details}")]
    Integrity { backup_id: String, details: String },

    /// Cyclic or unsatisfiable dependency graph
    #[error("Recovery plan error: {reason}")]
    Plan { reason: String },

    /// Replication node unreachable
    #[error("Replication to node {node_id} failed: {reason}")]
    Replication { node_id: String, reason: String },

    /// Output exceeds the configured maximum size
    #[error("Capacity exceeded: {size_bytes} bytes > {limit_bytes} bytes")]
    Capacity { size_bytes: u64, limit_bytes: u64 },

    /// Blob store failure
    #[error("Storage error: {details}")]
    Storage { details: String },

    /// Compression, encryption or payload encoding failure
    #[error("Codec error: {details}")]
    Codec { details: String },

    /// Job was cancelled between pipeline stages
    #[error("Backup job {job_id} was cancelled")]
    Cancelled { job_id: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Bincode serialization error
    #[error("Bincode error: {source}")]
    Bincode {
        #[from]
        source: bincode::Error,
    },
}

impl BackupRecoveryError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupRecoveryError::Replication { .. }
                | BackupRecoveryError::Storage { .. }
                | BackupRecoveryError::Io { .. }
        )
    }

    /// Whether this error is raised by a recovery pre-flight check, before
    /// any provider is asked to restore
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            BackupRecoveryError::NotFound { .. }
                | BackupRecoveryError::Integrity { .. }
                | BackupRecoveryError::Plan { .. }
                | BackupRecoveryError::Validation { .. }
        )
    }
}

/// Backup and recovery result type
pub type BackupRecoveryResult<T> = Result<T, BackupRecoveryError>;
