//! Core backup types: jobs, records, identifiers and restore points

use crate::config::Criticality;
use crate::snapshot::SystemSnapshot;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique backup identifier, `<unix millis>-<counter>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(String);

impl BackupId {
    /// Wrap an existing ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counter component of a generated id
    fn sequence(&self) -> Option<u64> {
        self.0.rsplit('-').next()?.parse().ok()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Backup type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Complete capture of every component
    Full,
    /// Changes since the last backup of any type
    Incremental,
    /// Changes since the last full backup
    Differential,
    /// Point-in-time capture without a parent chain
    Snapshot,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
            BackupType::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// Verification state of a published record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// Not verified since publication
    #[default]
    Pending,
    /// Last verification passed
    Verified,
    /// Last verification failed; excluded from recovery
    Failed,
}

/// A requested unit of backup work, consumed once by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    /// Job ID, reused as the ID of the record it publishes
    pub id: BackupId,
    /// Backup type
    pub backup_type: BackupType,
    /// Components in capture order
    pub components: Vec<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Highest criticality among the components
    pub priority: Criticality,
    /// Declared dependencies per component
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl BackupJob {
    /// Whether two jobs would capture a common component
    pub fn overlaps(&self, components: &[String]) -> bool {
        self.components.iter().any(|c| components.contains(c))
    }
}

/// Diagnostic and storage details attached to a record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Ambient state at backup start, if it could be captured
    pub snapshot: Option<SystemSnapshot>,
    /// Blob store path of the payload
    pub storage_path: String,
    /// Bytes actually persisted
    pub stored_size_bytes: u64,
    /// Bytes after compression, before encryption
    pub compressed_size_bytes: u64,
    /// Compression algorithm identifier
    pub compression_algorithm: String,
    /// compressed / uncompressed
    pub compression_ratio: f64,
    /// Whether the stored payload is encrypted
    pub encrypted: bool,
    /// Encryption algorithm identifier
    pub encryption_algorithm: Option<String>,
    /// Checksum algorithm identifier
    pub checksum_algorithm: String,
    /// Declared size per component
    pub component_sizes: BTreeMap<String, u64>,
    /// Non-fatal issues raised while building the backup
    pub warnings: Vec<String>,
}

/// The durable artifact of a successful backup job.
///
/// `checksum` is computed over the compressed, pre-encryption payload and is
/// never changed after publication; the registry only exposes verification
/// status updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Backup ID
    pub id: BackupId,
    /// Backup type
    pub backup_type: BackupType,
    /// Publication timestamp, strictly increasing across records
    pub timestamp: DateTime<Utc>,
    /// Sum of captured component sizes
    pub size_bytes: u64,
    /// Hex-encoded content digest
    pub checksum: String,
    /// Components covered
    pub components: Vec<String>,
    /// Declared dependencies per component
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Parent record for incremental and differential backups
    pub parent_id: Option<BackupId>,
    /// Metadata
    pub metadata: RecordMetadata,
    /// Verification status
    pub verification_status: VerificationStatus,
    /// Last verification timestamp
    pub verified_at: Option<DateTime<Utc>>,
    /// Earliest time cleanup may delete the record
    pub retention_expiry: DateTime<Utc>,
}

impl BackupRecord {
    /// Whether `component` was captured
    pub fn covers(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }

    /// Whether retention expired before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.retention_expiry < now
    }

    /// Whether recovery may use this record
    pub fn is_restorable(&self) -> bool {
        self.verification_status == VerificationStatus::Verified
    }
}

/// A (timestamp, backup) pair for "restore to approximately T"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePoint {
    /// Backup timestamp
    pub timestamp: DateTime<Utc>,
    /// Backup to restore from
    pub backup_id: BackupId,
}

impl From<&BackupRecord> for RestorePoint {
    fn from(record: &BackupRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            backup_id: record.id.clone(),
        }
    }
}

/// Generates backup ids and strictly increasing record timestamps
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
    last_timestamp_ms: Mutex<i64>,
}

impl IdGenerator {
    /// Generator starting at counter zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Next backup id
    pub fn next_id(&self) -> BackupId {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        BackupId(format!(
            "{:013}-{:06}",
            Utc::now().timestamp_millis(),
            sequence
        ))
    }

    /// Current time, bumped to stay strictly after the previous call
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last_timestamp_ms.lock();
        let millis = now.timestamp_millis().max(*last + 1);
        *last = millis;
        Utc.timestamp_millis_opt(millis).single().unwrap_or(now)
    }

    /// Continue numbering after previously published records
    pub fn resume_after<'a>(&self, records: impl IntoIterator<Item = &'a BackupRecord>) {
        let mut last = self.last_timestamp_ms.lock();
        for record in records {
            if let Some(sequence) = record.id.sequence() {
                self.counter.fetch_max(sequence, Ordering::SeqCst);
            }
            *last = (*last).max(record.timestamp.timestamp_millis());
        }
    }
}
