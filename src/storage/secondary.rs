//! Secondary (non-critical, best-effort) storage backend.
//!
//! Copies are staged to a temp file in the destination directory, fsynced,
//! then renamed into place so a reader never observes a partially-written
//! archive. Every error returned from this backend is non-critical and
//! recoverable, matching the tier's degrade-gracefully contract.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::associated::{build_backup_candidate_paths, extract_log_key_from_backup, trim_bundle_suffix};
use crate::error::{Result, StorageError};
use crate::fsdetect;
use crate::metadata;
use crate::model::{
    BackupMetadata, FilesystemInfo, RetentionConfig, RetentionPolicyKind, RetentionSummary,
    StorageStats, Tier,
};
use crate::retention;
use crate::safefs;
use crate::storage::local::is_backup_filename;
use crate::storage::{RetentionReporter, Storage};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;
const FS_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct SecondaryStorage {
    base_path: PathBuf,
    log_path: PathBuf,
    bundles_enabled: bool,
    fs_info: Mutex<Option<FilesystemInfo>>,
    last_summary: Mutex<Option<RetentionSummary>>,
    degraded: Mutex<bool>,
}

impl SecondaryStorage {
    pub fn new(base_path: PathBuf, log_path: PathBuf, bundles_enabled: bool) -> Self {
        Self {
            base_path,
            log_path,
            bundles_enabled,
            fs_info: Mutex::new(None),
            last_summary: Mutex::new(None),
            degraded: Mutex::new(false),
        }
    }

    fn err(&self, op: &str, path: impl Into<String>, cause: anyhow::Error) -> StorageError {
        StorageError::new(Tier::Secondary, op, path, cause).recoverable(true)
    }

    fn enumerate_files(&self) -> Result<Vec<PathBuf>> {
        let read_dir = match std::fs::read_dir(&self.base_path) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(self.err(
                    "list",
                    self.base_path.to_string_lossy().to_string(),
                    e.into(),
                ))
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if !is_backup_filename(&name)
                || name.ends_with(".sha256")
                || name.ends_with(".metadata")
                || name.ends_with(".bundle.tar")
            {
                continue;
            }
            if seen.insert(name) {
                entries.push(path);
            }
        }
        Ok(entries)
    }

    fn load_or_synthesize(&self, path: &Path) -> BackupMetadata {
        let reference = path.to_string_lossy().to_string();
        metadata::metadata_for_archive(path, &reference, self.bundles_enabled)
            .or_else(|_| metadata::synthesize_from_stat(path, &reference))
            .unwrap_or(BackupMetadata {
                reference,
                timestamp: chrono::Utc::now(),
                size: 0,
                checksum: None,
                flavor: None,
                compression: None,
                producer_version: None,
            })
    }

    fn candidate_paths(&self, base: &Path) -> Vec<PathBuf> {
        let base_str = base.to_string_lossy().to_string();
        build_backup_candidate_paths(&base_str, self.bundles_enabled)
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    /// Remove the archive named by `archive_ref` plus every sidecar/bundle
    /// associated with it, then (if derivable) its log file. Every failure
    /// is non-critical: a missing candidate is skipped, any other removal
    /// error is logged and otherwise ignored.
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

    async fn copy_one(&self, ct: &CancellationToken, src: &Path) -> Result<PathBuf> {
        let ct = ct.clone();
        let src_owned = src.to_path_buf();
        let src_for_task = src_owned.clone();
        let base_path = self.base_path.clone();
        let secondary = SecondaryCopyHandle { base_path };

        tokio::task::spawn_blocking(move || secondary.atomic_copy_static(&ct, &src_for_task))
            .await
            .map_err(|e| self.err("store", "", anyhow::anyhow!("copy task panicked: {e}")))?
            .map_err(|e| self.err("store", archive_path_display(&src_owned), e.into()))
    }
}

#[async_trait]
impl Storage for SecondaryStorage {
    fn name(&self) -> &str {
        "secondary"
    }

    fn location(&self) -> Tier {
        Tier::Secondary
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn detect_filesystem(&self, ct: &CancellationToken) -> Result<FilesystemInfo> {
        if let Err(e) = std::fs::create_dir_all(&self.base_path) {
            tracing::warn!(
                path = %self.base_path.display(),
                error = %e,
                "secondary base path unavailable, continuing in degraded mode"
            );
            *self.degraded.lock().unwrap() = true;
            let info = FilesystemInfo::unknown(self.base_path.clone());
            *self.fs_info.lock().unwrap() = Some(info.clone());
            return Ok(info);
        }

        match fsdetect::detect_filesystem(ct, &self.base_path).await {
            Ok(info) => {
                *self.fs_info.lock().unwrap() = Some(info.clone());
                Ok(info)
            }
            Err(e) => {
                tracing::warn!(error = %e, "secondary filesystem detection failed, continuing in degraded mode");
                *self.degraded.lock().unwrap() = true;
                let info = FilesystemInfo::unknown(self.base_path.clone());
                *self.fs_info.lock().unwrap() = Some(info.clone());
                Ok(info)
            }
        }
    }

    async fn store(
        &self,
        ct: &CancellationToken,
        archive_path: &Path,
        _metadata: Option<&BackupMetadata>,
    ) -> Result<()> {
        if *self.degraded.lock().unwrap() {
            return Err(self.err(
                "store",
                archive_path.to_string_lossy().to_string(),
                anyhow::anyhow!("secondary backend is degraded"),
            ));
        }

        if !archive_path.exists() {
            return Err(self.err(
                "store",
                archive_path.to_string_lossy().to_string(),
                anyhow::anyhow!("source archive does not exist"),
            ));
        }

        let mut copied = vec![self.copy_one(ct, archive_path).await?];

        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (base_name, _) = trim_bundle_suffix(&name);
        let parent = archive_path.parent().unwrap_or_else(|| Path::new("."));

        // Candidates are [base, .sha256, .metadata, .metadata.sha256, (bundle)].
        // Bundling replaces individual sidecars with the single bundle file.
        let associated: Vec<String> = if self.bundles_enabled {
            build_backup_candidate_paths(&base_name, true).into_iter().skip(4).collect()
        } else {
            build_backup_candidate_paths(&base_name, false).into_iter().skip(1).collect()
        };

        for candidate in associated {
            let candidate_path = parent.join(&candidate);
            if !candidate_path.exists() {
                continue;
            }
            match self.copy_one(ct, &candidate_path).await {
                Ok(dest) => copied.push(dest),
                Err(e) => tracing::warn!(
                    path = %candidate_path.display(),
                    error = %e,
                    "failed to copy associated file to secondary, continuing"
                ),
            }
        }

        let info = self.fs_info.lock().unwrap().clone();
        if let Some(info) = info.filter(|i| i.supports_ownership) {
            let uid = nix::unistd::getuid().as_raw();
            let gid = nix::unistd::getgid().as_raw();
            for dest in &copied {
                if let Err(e) = fsdetect::set_permissions(dest, uid, gid, 0o600, &info) {
                    tracing::warn!(
                        path = %dest.display(),
                        error = %e,
                        "failed to set ownership on secondary copy, continuing"
                    );
                }
            }
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
        let archives = self.enumerate_files()?
            .into_iter()
            .map(|p| self.load_or_synthesize(&p))
            .collect::<Vec<_>>();
        let total = archives.len();

        let victims: Vec<String> = match cfg.policy {
            RetentionPolicyKind::Simple => {
                if cfg.max_backups <= 0 || (total as i64) <= cfg.max_backups {
                    Vec::new()
                } else {
                    let mut sorted = archives.clone();
                    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                    sorted[cfg.max_backups as usize..]
                        .iter()
                        .map(|a| a.reference.clone())
                        .collect()
                }
            }
            RetentionPolicyKind::Gfs => {
                let normalized = cfg.clone().normalized();
                let classification = retention::classify(&archives, &normalized, chrono::Utc::now());
                archives
                    .iter()
                    .filter(|a| {
                        classification.get(&a.reference)
                            == Some(&crate::model::RetentionCategory::Delete)
                    })
                    .map(|a| a.reference.clone())
                    .collect()
            }
        };

        let mut deleted = 0;
        let mut logs_deleted = 0;
        for victim in &victims {
            let (_, log_removed) = self.delete_archive_files(victim);
            deleted += 1;
            if log_removed {
                logs_deleted += 1;
            }
        }

        *self.last_summary.lock().unwrap() = Some(RetentionSummary {
            backups_deleted: deleted as u64,
            backups_remaining: (total - deleted) as u64,
            logs_deleted,
            logs_remaining: 0,
            has_log_info: self.log_path.is_dir(),
        });

        Ok(deleted)
    }

    async fn verify_upload(
        &self,
        _ct: &CancellationToken,
        local_file: &Path,
        _remote_file: &str,
    ) -> Result<bool> {
        Ok(local_file.exists())
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

impl RetentionReporter for SecondaryStorage {
    fn last_retention_summary(&self) -> Option<RetentionSummary> {
        *self.last_summary.lock().unwrap()
    }
}

fn archive_path_display(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

/// Standalone helper carrying just what the blocking copy task needs,
/// so the closure passed to `spawn_blocking` doesn't capture `&self`.
struct SecondaryCopyHandle {
    base_path: PathBuf,
}

impl SecondaryCopyHandle {
    fn atomic_copy_static(&self, ct: &CancellationToken, src: &Path) -> std::io::Result<PathBuf> {
        let name = src.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "source has no file name")
        })?;
        let dest = self.base_path.join(name);
        let tmp = self
            .base_path
            .join(format!(".tmp-{}-{}", std::process::id(), name.to_string_lossy()));

        let mut reader = std::fs::File::open(src)?;
        let mut writer = std::fs::File::create(&tmp)?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            if ct.is_cancelled() {
                let _ = std::fs::remove_file(&tmp);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "copy cancelled",
                ));
            }
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read])?;
        }
        writer.flush()?;
        writer.sync_all()?;
        drop(writer);

        std::fs::rename(&tmp, &dest)?;
        if let Ok(dir) = std::fs::File::open(&self.base_path) {
            let _ = dir.sync_all();
        }
        Ok(dest)
    }
}
