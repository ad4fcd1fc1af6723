//! Primary (critical) local filesystem backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::associated::{build_backup_candidate_paths, extract_log_key_from_backup, trim_bundle_suffix};
use crate::error::{Result, StorageError};
use crate::fsdetect;
use crate::metadata;
use crate::model::{
    BackupMetadata, FilesystemInfo, RetentionCategory, RetentionConfig, RetentionPolicyKind,
    RetentionSummary, StorageStats, Tier,
};
use crate::retention;
use crate::safefs;
use crate::storage::{RetentionReporter, Storage};

const FS_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Does `name` match either of the two backup-file glob patterns this
/// engine recognizes: legacy `proxmox-backup-*.tar.*` or current
/// `*-backup-*.tar*`?
pub fn is_backup_filename(name: &str) -> bool {
    let legacy = name.starts_with("proxmox-backup-") && name.contains(".tar.");
    let current = name.contains("-backup-") && name.contains(".tar");
    legacy || current
}

fn is_sidecar(name: &str) -> bool {
    name.ends_with(".sha256") || name.ends_with(".metadata") || name.ends_with(".bundle.tar")
}

/// Local (primary) storage backend. Every returned [`StorageError`] has
/// `is_critical=true`.
pub struct LocalStorage {
    base_path: PathBuf,
    log_path: PathBuf,
    bundles_enabled: bool,
    fs_info: Mutex<Option<FilesystemInfo>>,
    last_summary: Mutex<Option<RetentionSummary>>,
}

impl LocalStorage {
    pub fn new(base_path: PathBuf, log_path: PathBuf, bundles_enabled: bool) -> Self {
        Self {
            base_path,
            log_path,
            bundles_enabled,
            fs_info: Mutex::new(None),
            last_summary: Mutex::new(None),
        }
    }

    fn err(&self, op: &str, path: impl Into<String>, cause: anyhow::Error) -> StorageError {
        StorageError::new(Tier::Primary, op, path, cause)
    }

    fn candidate_paths(&self, base: &Path) -> Vec<PathBuf> {
        let base_str = base.to_string_lossy().to_string();
        build_backup_candidate_paths(&base_str, self.bundles_enabled)
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    /// Enumerate raw archive file entries (before metadata loading),
    /// applying the glob/sidecar/bundle-base filtering rules.
    fn enumerate_files(&self) -> Result<Vec<PathBuf>> {
        let read_dir = std::fs::read_dir(&self.base_path).map_err(|e| {
            self.err(
                "list",
                self.base_path.to_string_lossy().to_string(),
                e.into(),
            )
        })?;

        let mut names: HashSet<String> = HashSet::new();
        let mut entries: Vec<PathBuf> = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if !is_backup_filename(&name) || is_sidecar(&name) {
                continue;
            }
            if names.insert(name) {
                entries.push(path);
            }
        }

        if self.bundles_enabled {
            entries.retain(|path| {
                let bundle = self.base_path.join(format!(
                    "{}.bundle.tar",
                    path.file_name().unwrap().to_string_lossy()
                ));
                !bundle.exists()
            });
        }

        Ok(entries)
    }

    fn load_or_synthesize(&self, path: &Path) -> BackupMetadata {
        let reference = path.to_string_lossy().to_string();
        metadata::metadata_for_archive(path, &reference, self.bundles_enabled)
            .or_else(|_| metadata::synthesize_from_stat(path, &reference))
            .unwrap_or(BackupMetadata {
                reference,
                timestamp: Utc::now(),
                size: 0,
                checksum: None,
                flavor: None,
                compression: None,
                producer_version: None,
            })
    }

    fn delete_archive_files(&self, archive_ref: &str) -> (usize, bool) {
        let path = PathBuf::from(archive_ref);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let (base_name, _) = trim_bundle_suffix(&name);
        let base_path = path.with_file_name(&base_name);

        let mut removed = 0;
        for candidate in self.candidate_paths(&base_path) {
            match std::fs::remove_file(&candidate) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        path = %candidate.display(),
                        error = %e,
                        "failed to remove associated file, continuing"
                    );
                }
            }
        }

        let log_removed = extract_log_key_from_backup(&base_name)
            .map(|key| {
                let log_file = self.log_path.join(key);
                std::fs::remove_file(&log_file).is_ok()
            })
            .unwrap_or(false);

        (removed, log_removed)
    }

    fn apply_simple_retention(&self, cfg: &RetentionConfig) -> Result<(usize, RetentionSummary)> {
        let mut archives = self.enumerate_files()?
            .into_iter()
            .map(|p| self.load_or_synthesize(&p))
            .collect::<Vec<_>>();
        archives.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = archives.len();
        let mut summary = RetentionSummary::default();

        if cfg.max_backups <= 0 || (total as i64) <= cfg.max_backups {
            summary.backups_remaining = total as u64;
            summary.has_log_info = self.log_path.is_dir();
            return Ok((0, summary));
        }

        let keep = cfg.max_backups as usize;
        let victims = &archives[keep..];
        let mut deleted = 0;
        let mut logs_deleted = 0;
        for victim in victims {
            let (_, log_removed) = self.delete_archive_files(&victim.reference);
            deleted += 1;
            if log_removed {
                logs_deleted += 1;
            }
        }

        summary.backups_deleted = deleted as u64;
        summary.backups_remaining = (total - deleted) as u64;
        summary.logs_deleted = logs_deleted;
        summary.has_log_info = self.log_path.is_dir();
        Ok((deleted, summary))
    }

    fn apply_gfs_retention(&self, cfg: &RetentionConfig) -> Result<(usize, RetentionSummary)> {
        let normalized = cfg.clone().normalized();
        let archives = self.enumerate_files()?
            .into_iter()
            .map(|p| self.load_or_synthesize(&p))
            .collect::<Vec<_>>();
        let total = archives.len();

        let classification = retention::classify(&archives, &normalized, Utc::now());
        let mut victims: Vec<&BackupMetadata> = archives
            .iter()
            .filter(|a| classification.get(&a.reference) == Some(&RetentionCategory::Delete))
            .collect();
        victims.sort_by(|a, b| a.reference.cmp(&b.reference));

        let mut deleted = 0;
        let mut logs_deleted = 0;
        for victim in victims {
            let (_, log_removed) = self.delete_archive_files(&victim.reference);
            deleted += 1;
            if log_removed {
                logs_deleted += 1;
            }
        }

        let mut summary = RetentionSummary::default();
        summary.backups_deleted = deleted as u64;
        summary.backups_remaining = (total - deleted) as u64;
        summary.logs_deleted = logs_deleted;
        summary.has_log_info = self.log_path.is_dir();
        Ok((deleted, summary))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    fn location(&self) -> Tier {
        Tier::Primary
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn detect_filesystem(&self, ct: &CancellationToken) -> Result<FilesystemInfo> {
        let info = fsdetect::detect_filesystem(ct, &self.base_path)
            .await
            .map_err(|e| self.err("detect_filesystem", self.base_path.to_string_lossy().to_string(), e))?;
        *self.fs_info.lock().unwrap() = Some(info.clone());
        Ok(info)
    }

    async fn store(
        &self,
        _ct: &CancellationToken,
        archive_path: &Path,
        _metadata: Option<&BackupMetadata>,
    ) -> Result<()> {
        if !archive_path.exists() {
            return Err(self.err(
                "store",
                archive_path.to_string_lossy().to_string(),
                anyhow::anyhow!("source archive does not exist"),
            ));
        }

        let info = self.fs_info.lock().unwrap().clone();
        if let Some(info) = info.filter(|i| i.supports_ownership) {
            let uid = nix::unistd::getuid().as_raw();
            let gid = nix::unistd::getgid().as_raw();
            if let Err(e) = fsdetect::set_permissions(archive_path, uid, gid, 0o600, &info) {
                tracing::warn!(path = %archive_path.display(), error = %e, "failed to set ownership, continuing");
            }
        }

        if let Ok(entries) = self.enumerate_files() {
            tracing::debug!(count = entries.len(), "post-store backup count");
        }

        Ok(())
    }

    async fn list(&self, _ct: &CancellationToken) -> Result<Vec<BackupMetadata>> {
        let mut archives = self
            .enumerate_files()?
            .into_iter()
            .map(|p| self.load_or_synthesize(&p))
            .collect::<Vec<_>>();
        archives.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(archives)
    }

    async fn delete(&self, _ct: &CancellationToken, archive_ref: &str) -> Result<bool> {
        let (_, log_removed) = self.delete_archive_files(archive_ref);
        Ok(log_removed)
    }

    async fn apply_retention(&self, _ct: &CancellationToken, cfg: &RetentionConfig) -> Result<usize> {
        let (deleted, summary) = match cfg.policy {
            RetentionPolicyKind::Simple => self.apply_simple_retention(cfg)?,
            RetentionPolicyKind::Gfs => self.apply_gfs_retention(cfg)?,
        };
        *self.last_summary.lock().unwrap() = Some(summary);
        Ok(deleted)
    }

    async fn verify_upload(
        &self,
        _ct: &CancellationToken,
        _local_file: &Path,
        _remote_file: &str,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn get_stats(&self, ct: &CancellationToken) -> Result<StorageStats> {
        let archives = self.list(ct).await?;
        let total_size: u64 = archives.iter().map(|a| a.size).sum();
        let oldest = archives.iter().map(|a| a.timestamp).min();
        let newest = archives.iter().map(|a| a.timestamp).max();

        let capacity = safefs::statfs(ct, &self.base_path, FS_CALL_TIMEOUT)
            .await
            .unwrap_or_default();

        let fs_type = self.fs_info.lock().unwrap().as_ref().map(|i| i.kind);

        Ok(StorageStats {
            total_backups: archives.len() as u64,
            total_size,
            oldest_backup: oldest,
            newest_backup: newest,
            total: capacity.total,
            available: capacity.available,
            used: capacity.used,
            filesystem_type: fs_type,
        })
    }
}

impl RetentionReporter for LocalStorage {
    fn last_retention_summary(&self) -> Option<RetentionSummary> {
        *self.last_summary.lock().unwrap()
    }
}
