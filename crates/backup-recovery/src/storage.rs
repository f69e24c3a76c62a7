//! Durable blob storage for backup payloads

use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use crate::types::BackupId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Storage path of a backup payload
pub fn payload_path(backup_id: &BackupId) -> String {
    format!("backups/{backup_id}.bak")
}

/// Abstract durable blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Durably write `data` under `path`, replacing any previous blob.
    /// Returns the number of bytes written.
    async fn put(&self, path: &str, data: &[u8]) -> BackupRecoveryResult<u64>;

    /// Read a blob, `None` when absent
    async fn get(&self, path: &str) -> BackupRecoveryResult<Option<Vec<u8>>>;

    /// Delete a blob. Returns whether it existed.
    async fn delete(&self, path: &str) -> BackupRecoveryResult<bool>;

    /// Size of a blob, `None` when absent
    async fn size(&self, path: &str) -> BackupRecoveryResult<Option<u64>>;
}

/// Filesystem-backed store rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Store rooted at `root`, created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> BackupRecoveryResult<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BackupRecoveryError::Storage {
                details: format!("invalid blob path: {path}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> BackupRecoveryResult<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename so readers never see a partial blob
        let staging = target.with_extension("partial");
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &target).await?;

        debug!(path, bytes = data.len(), "Stored blob");
        Ok(data.len() as u64)
    }

    async fn get(&self, path: &str) -> BackupRecoveryResult<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> BackupRecoveryResult<bool> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, path: &str) -> BackupRecoveryResult<Option<u64>> {
        let target = self.resolve(path)?;
        match fs::metadata(&target).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether no blobs are stored
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> BackupRecoveryResult<u64> {
        self.blobs.insert(path.to_string(), data.to_vec());
        Ok(data.len() as u64)
    }

    async fn get(&self, path: &str) -> BackupRecoveryResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(path).map(|blob| blob.value().clone()))
    }

    async fn delete(&self, path: &str) -> BackupRecoveryResult<bool> {
        Ok(self.blobs.remove(path).is_some())
    }

    async fn size(&self, path: &str) -> BackupRecoveryResult<Option<u64>> {
        Ok(self.blobs.get(path).map(|blob| blob.value().len() as u64))
    }
}
