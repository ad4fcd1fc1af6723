//! The `Storage` contract and its three backends.

pub mod cloud;
pub mod local;
pub mod secondary;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{BackupMetadata, FilesystemInfo, RetentionConfig, RetentionSummary, StorageStats, Tier};

/// Uniform contract satisfied by every storage backend. `Box<dyn Storage>` /
/// `Arc<dyn Storage>` is the crate's one polymorphism boundary, matching the
/// teacher's `Box<dyn StorageBackend>` idiom.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;
    fn location(&self) -> Tier;
    fn is_enabled(&self) -> bool;
    fn is_critical(&self) -> bool {
        self.location() == Tier::Primary
    }

    async fn detect_filesystem(&self, ct: &CancellationToken) -> Result<FilesystemInfo>;

    async fn store(
        &self,
        ct: &CancellationToken,
        archive_path: &Path,
        metadata: Option<&BackupMetadata>,
    ) -> Result<()>;

    async fn list(&self, ct: &CancellationToken) -> Result<Vec<BackupMetadata>>;

    /// Delete an archive and its associated files. Returns whether an
    /// associated log file was also removed.
    async fn delete(&self, ct: &CancellationToken, archive_ref: &str) -> Result<bool>;

    /// Apply the given retention policy, returning the number of archives
    /// deleted.
    async fn apply_retention(&self, ct: &CancellationToken, cfg: &RetentionConfig) -> Result<usize>;

    /// Always `Ok(true)` for primary/secondary, which have no upload step.
    async fn verify_upload(
        &self,
        ct: &CancellationToken,
        local_file: &Path,
        remote_file: &str,
    ) -> Result<bool>;

    async fn get_stats(&self, ct: &CancellationToken) -> Result<StorageStats>;
}

/// Optional capability implemented by backends that track retention
/// outcomes across calls to `apply_retention`.
pub trait RetentionReporter {
    fn last_retention_summary(&self) -> Option<RetentionSummary>;
}
