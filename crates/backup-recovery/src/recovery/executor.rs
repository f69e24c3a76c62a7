//! Recovery execution

use super::{RecoveryPlan, RecoveryState, RecoveryStatus};
use crate::codec::PayloadBundle;
use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::events::{BackupEvent, EventBus};
use crate::integrity::IntegrityVerifier;
use crate::provider::ProviderRegistry;
use crate::registry::BackupRegistry;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Share of progress reported once every component has been attempted;
/// the remainder covers post-restore checks
const RESTORE_PROGRESS_SHARE: f32 = 90.0;

/// Restores components from a verified backup in plan order
pub struct RecoveryExecutor {
    registry: Arc<BackupRegistry>,
    verifier: Arc<IntegrityVerifier>,
    providers: ProviderRegistry,
    events: EventBus,
    statuses: DashMap<Uuid, RecoveryStatus>,
}

impl RecoveryExecutor {
    /// Executor restoring through `providers`
    pub fn new(
        registry: Arc<BackupRegistry>,
        verifier: Arc<IntegrityVerifier>,
        providers: ProviderRegistry,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            verifier,
            providers,
            events,
            statuses: DashMap::new(),
        }
    }

    /// Execute a plan.
    ///
    /// Pre-flight failures (unknown or unverified backup, payload integrity)
    /// abort before any provider is called and are returned as errors. So do
    /// storage failures while loading the payload; those leave a warning on
    /// the status that the recovery can be retried.
    /// Per-component restore failures do not abort: they are collected in
    /// the returned status, and components depending on a failed one are
    /// skipped.
    pub async fn execute(&self, plan: &RecoveryPlan) -> BackupRecoveryResult<RecoveryStatus> {
        let mut status = RecoveryStatus::new(plan);
        self.statuses.insert(plan.id, status.clone());

        let bundle = match self.preflight(plan).await {
            Ok(bundle) => bundle,
            Err(e) => {
                if e.is_preflight() {
                    warn!(plan_id = %plan.id, backup_id = %plan.backup_id, error = %e, "Recovery rejected by pre-flight checks");
                } else {
                    error!(plan_id = %plan.id, backup_id = %plan.backup_id, error = %e, "Recovery could not load the backup");
                }
                status.state = RecoveryState::Failed;
                status.errors.push(e.to_string());
                if e.is_retryable() {
                    status
                        .warnings
                        .push("backup could not be read; the recovery can be retried".to_string());
                }
                status.completed_at = Some(Utc::now());
                self.statuses.insert(plan.id, status);
                return Err(e);
            }
        };

        info!(
            plan_id = %plan.id,
            backup_id = %plan.backup_id,
            components = plan.components.len(),
            "Starting recovery"
        );
        status.state = RecoveryState::Restoring;
        self.statuses.insert(plan.id, status.clone());
        self.events.publish(BackupEvent::RecoveryStarted {
            plan_id: plan.id,
            backup_id: plan.backup_id.clone(),
            components: plan.components.clone(),
            timestamp: Utc::now(),
        });

        let total = plan.components.len().max(1) as f32;
        let mut failed: HashSet<&str> = HashSet::new();

        for (index, component) in plan.components.iter().enumerate() {
            let outcome = match plan
                .dependencies
                .get(component)
                .and_then(|deps| deps.iter().find(|d| failed.contains(d.as_str())))
            {
                Some(dependency) => Err(BackupRecoveryError::Restore {
                    component: component.clone(),
                    reason: format!("skipped because dependency {dependency} failed to restore"),
                }),
                None => self.restore_component(component, &bundle).await,
            };

            let succeeded = outcome.is_ok();
            match outcome {
                Ok(()) => {
                    info!(plan_id = %plan.id, component = %component, "Component restored");
                    status.restored_components.push(component.clone());
                }
                Err(e) => {
                    warn!(plan_id = %plan.id, component = %component, error = %e, "Component restore failed");
                    failed.insert(component.as_str());
                    status.failed_components.push(component.clone());
                    status.errors.push(e.to_string());
                }
            }

            status.progress = (index + 1) as f32 / total * RESTORE_PROGRESS_SHARE;
            self.statuses.insert(plan.id, status.clone());
            self.events.publish(BackupEvent::RecoveryProgress {
                plan_id: plan.id,
                component: component.clone(),
                succeeded,
                percentage: status.progress,
                timestamp: Utc::now(),
            });
        }

        status.state = RecoveryState::Verifying;
        self.statuses.insert(plan.id, status.clone());
        let mut findings = Vec::new();
        for component in &status.restored_components {
            if let Some(provider) = self.providers.get(component) {
                for finding in provider.post_restore_check().await {
                    findings.push(format!("{component}: {finding}"));
                }
            }
        }
        status.warnings.extend(findings);

        status.state = if status.failed_components.is_empty() {
            RecoveryState::Completed
        } else {
            RecoveryState::Failed
        };
        status.progress = 100.0;
        status.completed_at = Some(Utc::now());
        self.statuses.insert(plan.id, status.clone());

        self.events.publish(BackupEvent::RecoveryCompleted {
            plan_id: plan.id,
            backup_id: plan.backup_id.clone(),
            state: status.state,
            errors: status.errors.clone(),
            timestamp: Utc::now(),
        });

        info!(
            plan_id = %plan.id,
            state = ?status.state,
            restored = status.restored_components.len(),
            failed = status.failed_components.len(),
            "Recovery finished"
        );
        Ok(status)
    }

    /// Last known status of a plan
    pub fn status(&self, plan_id: &Uuid) -> Option<RecoveryStatus> {
        self.statuses.get(plan_id).map(|s| s.value().clone())
    }

    async fn preflight(
        &self,
        plan: &RecoveryPlan,
    ) -> BackupRecoveryResult<PayloadBundle> {
        // Verification status may have changed since planning
        let record = self
            .registry
            .get(&plan.backup_id)
            .ok_or_else(|| BackupRecoveryError::NotFound {
                backup_id: plan.backup_id.to_string(),
            })?;
        if !record.is_restorable() {
            return Err(BackupRecoveryError::Integrity {
                backup_id: plan.backup_id.to_string(),
                details: "backup is no longer verified".to_string(),
            });
        }
        self.verifier.load_bundle(&record).await
    }

    async fn restore_component(
        &self,
        component: &str,
        bundle: &PayloadBundle,
    ) -> BackupRecoveryResult<()> {
        let restore_error = |reason: String| BackupRecoveryError::Restore {
            component: component.to_string(),
            reason,
        };

        let payload = bundle
            .component(component)
            .ok_or_else(|| restore_error("payload missing from backup".to_string()))?;
        let provider = self
            .providers
            .get(component)
            .ok_or_else(|| restore_error("no provider registered".to_string()))?;

        provider.restore(payload).await.map_err(|e| match e {
            BackupRecoveryError::Restore { .. } => e,
            other => restore_error(other.to_string()),
        })
    }
}
