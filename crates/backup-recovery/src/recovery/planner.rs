//! Recovery planning

use super::{ComponentGraph, RecoveryPlan};
use crate::config::BackupRecoveryConfig;
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::registry::BackupRegistry;
use crate::types::{BackupId, BackupRecord, RestorePoint};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed per-component overhead added to restore estimates
const COMPONENT_OVERHEAD_SECS: u64 = 1;

/// Builds [`RecoveryPlan`]s from verified backups
pub struct RecoveryPlanner {
    registry: Arc<BackupRegistry>,
    config: Arc<BackupRecoveryConfig>,
}

impl RecoveryPlanner {
    /// Planner over `registry`
    pub fn new(registry: Arc<BackupRegistry>, config: Arc<BackupRecoveryConfig>) -> Self {
        Self { registry, config }
    }

    /// Plan a restore of `components` (all of the backup's when `None`).
    ///
    /// Fails without side effects when the backup is unknown or not
    /// verified, when a requested component is not in the backup, or when
    /// the component dependencies form a cycle.
    pub fn plan(
        &self,
        backup_id: &BackupId,
        components: Option<&[String]>,
        target_timestamp: Option<DateTime<Utc>>,
    ) -> BackupRecoveryResult<RecoveryPlan> {
        let record = self
            .registry
            .get(backup_id)
            .ok_or_else(|| BackupRecoveryError::NotFound {
                backup_id: backup_id.to_string(),
            })?;

        if !record.is_restorable() {
            return Err(BackupRecoveryError::Integrity {
                backup_id: backup_id.to_string(),
                details: format!(
                    "backup is not verified (status: {:?})",
                    record.verification_status
                ),
            });
        }

        if let Some(target) = target_timestamp {
            if record.timestamp > target {
                return Err(BackupRecoveryError::Validation {
                    message: format!(
                        "backup {backup_id} was taken at {} which is after the target {target}",
                        record.timestamp
                    ),
                });
            }
        }

        let requested = Self::resolve_components(&record, components)?;
        let mut warnings = Vec::new();

        let (graph, external) = ComponentGraph::build(&record.components, &record.dependencies);
        for (dependent, dependency) in external {
            if requested.contains(&dependent) {
                warnings.push(format!(
                    "{dependent} depends on {dependency}, which is not part of this backup"
                ));
            }
        }

        let order: Vec<String> = graph
            .restore_order()?
            .into_iter()
            .filter(|component| requested.contains(component))
            .collect();

        let mut dependencies = BTreeMap::new();
        for component in &order {
            let transitive = graph.transitive_dependencies(component);
            for dependency in &transitive {
                if !requested.contains(dependency) {
                    warnings.push(format!(
                        "{component} depends on {dependency}, which is not being restored"
                    ));
                }
            }
            let planned: Vec<String> = transitive
                .into_iter()
                .filter(|d| requested.contains(d))
                .collect();
            if !planned.is_empty() {
                dependencies.insert(component.clone(), planned);
            }
        }

        let estimated_duration_secs = self.estimate_duration_secs(&record, &order);
        if estimated_duration_secs > self.config.rto_target_secs {
            warn!(
                backup_id = %backup_id,
                estimated_duration_secs,
                rto_target_secs = self.config.rto_target_secs,
                "Estimated restore time exceeds RTO target"
            );
            warnings.push(format!(
                "estimated restore time {estimated_duration_secs}s exceeds RTO target {}s",
                self.config.rto_target_secs
            ));
        }

        let plan = RecoveryPlan {
            id: Uuid::new_v4(),
            backup_id: backup_id.clone(),
            components: order,
            dependencies,
            target_timestamp,
            estimated_duration_secs,
            warnings,
            created_at: Utc::now(),
        };

        info!(
            plan_id = %plan.id,
            backup_id = %backup_id,
            components = ?plan.components,
            "Created recovery plan"
        );
        Ok(plan)
    }

    /// Latest verified backup taken at or before `target`
    pub fn resolve_restore_point(&self, target: DateTime<Utc>) -> Option<RestorePoint> {
        let point = self
            .registry
            .latest_matching(|record| record.is_restorable() && record.timestamp <= target)
            .map(|record| RestorePoint::from(&record));
        debug!(%target, ?point, "Resolved restore point");
        point
    }

    /// Verified backups as restore points, newest first
    pub fn list_restore_points(&self) -> Vec<RestorePoint> {
        self.registry
            .list()
            .iter()
            .filter(|record| record.is_restorable())
            .map(RestorePoint::from)
            .collect()
    }

    fn resolve_components(
        record: &BackupRecord,
        components: Option<&[String]>,
    ) -> BackupRecoveryResult<BTreeSet<String>> {
        let Some(components) = components else {
            return Ok(record.components.iter().cloned().collect());
        };
        if components.is_empty() {
            return Err(BackupRecoveryError::Validation {
                message: "component list cannot be empty".to_string(),
            });
        }

        let mut requested = BTreeSet::new();
        for component in components {
            if !record.covers(component) {
                return Err(BackupRecoveryError::Plan {
                    reason: format!("component {component} is not part of backup {}", record.id),
                });
            }
            requested.insert(component.clone());
        }
        Ok(requested)
    }

    fn estimate_duration_secs(&self, record: &BackupRecord, components: &[String]) -> u64 {
        let bytes: u64 = components
            .iter()
            .map(|c| {
                record
                    .metadata
                    .component_sizes
                    .get(c)
                    .copied()
                    // Older records without per-component sizes: split evenly
                    .unwrap_or(record.size_bytes / record.components.len().max(1) as u64)
            })
            .sum();
        let throughput = self.config.restore_throughput_bytes_per_sec.max(1);
        bytes.div_ceil(throughput) + COMPONENT_OVERHEAD_SECS * components.len() as u64
    }
}
