//! Recovery planning and execution
//!
//! A recovery runs in two phases:
//! - planning validates the backup, resolves the component subset and
//!   orders it so dependencies restore before their dependents
//! - execution re-checks integrity, then restores each component in plan
//!   order, continuing past per-component failures

pub mod dependencies;
pub mod executor;
pub mod planner;

pub use dependencies::ComponentGraph;
pub use executor::RecoveryExecutor;
pub use planner::RecoveryPlanner;

use crate::types::BackupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Recovery lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    /// Selecting the backup and ordering components
    Planning,
    /// Restoring components
    Restoring,
    /// Running post-restore checks
    Verifying,
    /// Every component restored
    Completed,
    /// Pre-flight failed or at least one component failed
    Failed,
}

/// Ordered restore plan for one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Plan ID
    pub id: Uuid,
    /// Backup to restore from
    pub backup_id: BackupId,
    /// Components in restore order
    pub components: Vec<String>,
    /// Planned components each component transitively depends on
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Requested point in time, if any
    pub target_timestamp: Option<DateTime<Utc>>,
    /// Estimated restore duration in seconds
    pub estimated_duration_secs: u64,
    /// Non-fatal planning findings
    pub warnings: Vec<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Progress and outcome of a recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatus {
    /// Plan ID
    pub plan_id: Uuid,
    /// Backup being restored
    pub backup_id: BackupId,
    /// State
    pub state: RecoveryState,
    /// Progress percentage (0-100)
    pub progress: f32,
    /// Components restored successfully
    pub restored_components: Vec<String>,
    /// Components that failed or were skipped
    pub failed_components: Vec<String>,
    /// Per-component restore errors
    pub errors: Vec<String>,
    /// Planning and post-restore warnings
    pub warnings: Vec<String>,
    /// Started timestamp
    pub started_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryStatus {
    fn new(plan: &RecoveryPlan) -> Self {
        Self {
            plan_id: plan.id,
            backup_id: plan.backup_id.clone(),
            state: RecoveryState::Planning,
            progress: 0.0,
            restored_components: Vec::new(),
            failed_components: Vec::new(),
            errors: Vec::new(),
            warnings: plan.warnings.clone(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}
