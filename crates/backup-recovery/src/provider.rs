//! Component backup provider contract and the provider registry
//!
//! Providers own the state of one named component. The core only asks them
//! to capture a payload and later to restore it; what the bytes mean is
//! entirely the provider's business.

use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::types::BackupType;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Opaque captured state of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPayload {
    /// Component name
    pub component: String,
    /// Provider-defined format version
    pub format_version: u32,
    /// Declared size in bytes
    pub size_bytes: u64,
    /// Captured bytes
    pub data: Vec<u8>,
}

impl ComponentPayload {
    /// Payload at format version 1, sized from `data`
    pub fn new(component: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            component: component.into(),
            format_version: 1,
            size_bytes: data.len() as u64,
            data,
        }
    }
}

/// Capture/restore contract implemented by each component
#[async_trait]
pub trait ComponentProvider: Send + Sync {
    /// Component name this provider is registered under
    fn name(&self) -> &str;

    /// Components that must be restored before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Produce a consistent snapshot of the component.
    ///
    /// Fails with [`BackupRecoveryError::Provider`] when no consistent
    /// snapshot can be produced.
    async fn capture(&self, backup_type: BackupType) -> BackupRecoveryResult<ComponentPayload>;

    /// Apply a previously captured payload.
    ///
    /// Fails with [`BackupRecoveryError::Restore`] on malformed or
    /// incompatible payloads.
    async fn restore(&self, payload: &ComponentPayload) -> BackupRecoveryResult<()>;

    /// Minimal structural checks on a stored payload, returned as warnings
    fn validate_payload(&self, _payload: &ComponentPayload) -> Vec<String> {
        Vec::new()
    }

    /// Lightweight checks after a restore, returned as warnings
    async fn post_restore_check(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Providers keyed by component name
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Arc<DashMap<String, Arc<dyn ComponentProvider>>>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name
    pub fn register(&self, provider: Arc<dyn ComponentProvider>) -> BackupRecoveryResult<()> {
        let name = provider.name().to_string();
        if name.is_empty() {
            return Err(BackupRecoveryError::Validation {
                message: "provider name cannot be empty".to_string(),
            });
        }

        match self.providers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BackupRecoveryError::Validation {
                message: format!("provider already registered: {name}"),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(provider);
                info!(component = %name, "Registered component provider");
                Ok(())
            }
        }
    }

    /// Provider registered for `component`
    pub fn get(&self, component: &str) -> Option<Arc<dyn ComponentProvider>> {
        self.providers
            .get(component)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a provider is registered for `component`
    pub fn contains(&self, component: &str) -> bool {
        self.providers.contains_key(component)
    }

    /// Registered component names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Look up a provider, failing with a provider error when it is missing
    pub fn require(&self, component: &str) -> BackupRecoveryResult<Arc<dyn ComponentProvider>> {
        self.get(component)
            .ok_or_else(|| BackupRecoveryError::Provider {
                component: component.to_string(),
                reason: "no provider registered".to_string(),
            })
    }

    /// Declared dependencies of each listed component
    pub fn dependencies_for(&self, components: &[String]) -> BTreeMap<String, Vec<String>> {
        components
            .iter()
            .filter_map(|component| {
                self.get(component)
                    .map(|provider| (component.clone(), provider.dependencies()))
            })
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
