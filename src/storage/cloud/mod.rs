//! Cloud (remote, non-critical) storage backend driving an external
//! `rclone`-compatible binary.

pub mod addressing;
pub mod exec;
pub mod listing;
pub mod log;
pub mod reachability;
pub mod upload;
pub mod verify;

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::associated::{build_backup_candidate_paths, trim_bundle_suffix};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::model::{
    BackupMetadata, FilesystemInfo, RetentionCategory, RetentionConfig, RetentionPolicyKind,
    RetentionSummary, StorageStats, Tier,
};
use crate::retention;
use crate::storage::{RetentionReporter, Storage};

use addressing::RemoteAddress;
use exec::ExecHook;
use log::LogPathLatch;
use upload::UploadTask;

pub struct CloudStorage {
    addr: RemoteAddress,
    cfg: Config,
    exec: ExecHook,
    log_dir: String,
    remote_snapshot: RwLock<HashSet<String>>,
    log_latch: LogPathLatch,
    last_summary: std::sync::Mutex<Option<RetentionSummary>>,
}

impl CloudStorage {
    pub fn new(cfg: Config, exec: ExecHook) -> Self {
        let addr = RemoteAddress::new(&cfg.cloud_remote, &cfg.cloud_remote_path);
        let log_dir = log::resolve_log_dir(&addr, &cfg.cloud_log_path);
        Self {
            addr,
            cfg,
            exec,
            log_dir,
            remote_snapshot: RwLock::new(HashSet::new()),
            log_latch: LogPathLatch::default(),
            last_summary: std::sync::Mutex::new(None),
        }
    }

    fn err(&self, op: &str, path: impl Into<String>, cause: anyhow::Error) -> StorageError {
        StorageError::new(Tier::Cloud, op, path, cause).recoverable(true)
    }

    /// Build the task list for `store`: the primary archive (always
    /// verified), then sidecars or the bundle (never both).
    fn build_task_list(&self, archive_path: &Path) -> Vec<UploadTask> {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (base_name, _) = trim_bundle_suffix(&name);

        let mut tasks = vec![UploadTask {
            local_path: archive_path.to_path_buf(),
            remote_name: name.clone(),
            verify: true,
        }];

        let parent = archive_path.parent().unwrap_or_else(|| Path::new("."));
        let candidates = build_backup_candidate_paths(&base_name, self.cfg.bundle_associated_files);
        // Candidates are [base, .sha256, .metadata, .metadata.sha256, (bundle)].
        // Bundling replaces individual sidecars with the single bundle file.
        let associated: Vec<String> = if self.cfg.bundle_associated_files {
            candidates.into_iter().skip(4).collect()
        } else {
            candidates.into_iter().skip(1).collect()
        };

        for candidate in associated {
            let candidate_path = parent.join(&candidate);
            if candidate_path.exists() {
                tasks.push(UploadTask {
                    local_path: candidate_path,
                    remote_name: candidate,
                    verify: self.cfg.cloud_parallel_verify,
                });
            }
        }

        tasks
    }

    async fn refresh_snapshot(&self, ct: &CancellationToken) -> Result<Vec<BackupMetadata>> {
        let base = self.addr.remote_base();
        let out = (self.exec)(
            ct.clone(),
            "rclone".to_string(),
            vec!["lsl".to_string(), base],
        )
        .await
        .map_err(|e| self.err("list", self.addr.remote_base(), e.into()))?;

        if !out.success {
            return Err(self.err(
                "list",
                self.addr.remote_base(),
                anyhow::anyhow!(out.combined()),
            ));
        }

        let (snapshot, backups) = listing::parse_listing(&out.stdout, self.cfg.bundle_associated_files);
        *self.remote_snapshot.write().await = snapshot;
        Ok(backups)
    }

    async fn delete_one(&self, ct: &CancellationToken, name: &str) -> Result<()> {
        {
            let snapshot = self.remote_snapshot.read().await;
            if !snapshot.is_empty() && !snapshot.contains(name) {
                return Ok(());
            }
        }

        let target = self.addr.remote_path_for(name);
        let out = (self.exec)(
            ct.clone(),
            "rclone".to_string(),
            vec!["deletefile".to_string(), target],
        )
        .await
        .map_err(|e| self.err("delete", name.to_string(), e.into()))?;

        if out.success || out.combined().to_ascii_lowercase().contains("object not found") {
            self.remote_snapshot.write().await.remove(name);
            return Ok(());
        }

        tracing::warn!(name, output = %out.combined(), "cloud delete failed, continuing");
        Err(self.err("delete", name.to_string(), anyhow::anyhow!(out.combined())))
    }

    async fn delete_batched(
        &self,
        ct: &CancellationToken,
        victims: &[BackupMetadata],
    ) -> (u64, u64, u64) {
        let mut deleted = 0u64;
        let mut logs_deleted = 0u64;
        let mut since_pause = 0u32;

        for victim in victims {
            let name = victim.reference.clone();
            let (base_name, _) = trim_bundle_suffix(&name);
            let candidates =
                build_backup_candidate_paths(&base_name, self.cfg.bundle_associated_files);

            let mut archive_ok = true;
            for candidate in candidates {
                if self.delete_one(ct, &candidate).await.is_err() {
                    archive_ok = false;
                }
            }
            if log::delete_associated_log(&self.exec, ct, &self.log_dir, &self.log_latch, &name).await {
                logs_deleted += 1;
            }

            if archive_ok {
                deleted += 1;
                since_pause += 1;
                if self.cfg.cloud_batch_size > 0 && since_pause >= self.cfg.cloud_batch_size {
                    since_pause = 0;
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(self.cfg.cloud_batch_pause_secs)) => {}
                    }
                }
            }
        }

        (deleted, victims.len() as u64 - deleted, logs_deleted)
    }
}

#[async_trait]
impl Storage for CloudStorage {
    fn name(&self) -> &str {
        "cloud"
    }

    fn location(&self) -> Tier {
        Tier::Cloud
    }

    fn is_enabled(&self) -> bool {
        self.cfg.cloud_enabled
    }

    async fn detect_filesystem(&self, ct: &CancellationToken) -> Result<FilesystemInfo> {
        reachability::check_remote_accessible(&self.exec, &self.addr, ct, &self.cfg)
            .await
            .map_err(|e| self.err("detect_filesystem", self.addr.remote_base(), e.into()))?;

        Ok(FilesystemInfo {
            kind: crate::model::FilesystemKind::Unknown,
            mount_point: std::path::PathBuf::from(self.addr.remote_base()),
            device: self.cfg.cloud_remote.clone(),
            supports_ownership: false,
            is_network_fs: true,
        })
    }

    async fn store(
        &self,
        ct: &CancellationToken,
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

        let mut tasks = self.build_task_list(archive_path);
        let primary = tasks.remove(0);

        let deadline = std::time::Duration::from_secs(self.cfg.rclone_timeout_operation_secs);
        tokio::time::timeout(
            deadline,
            upload::upload_with_retry(&self.exec, &self.addr, ct, &self.cfg, &primary),
        )
        .await
        .map_err(|_| self.err("store", primary.remote_name.clone(), anyhow::anyhow!("primary upload timed out")))?
        .map_err(|e| self.err("store", primary.remote_name.clone(), e))?;

        upload::run_remainder(&self.exec, &self.addr, ct, &self.cfg, tasks)
            .await
            .map_err(|e| self.err("store", primary.remote_name, e))?;

        Ok(())
    }

    async fn list(&self, ct: &CancellationToken) -> Result<Vec<BackupMetadata>> {
        self.refresh_snapshot(ct).await
    }

    async fn delete(&self, ct: &CancellationToken, archive_ref: &str) -> Result<bool> {
        if self.remote_snapshot.read().await.is_empty() {
            let _ = self.refresh_snapshot(ct).await;
        }

        let (base_name, _) = trim_bundle_suffix(archive_ref);
        let candidates = build_backup_candidate_paths(&base_name, self.cfg.bundle_associated_files);

        let mut any_failed = false;
        for candidate in &candidates {
            if self.delete_one(ct, candidate).await.is_err() {
                any_failed = true;
            }
        }

        let _ = log::delete_associated_log(&self.exec, ct, &self.log_dir, &self.log_latch, archive_ref).await;

        if any_failed {
            return Err(self.err(
                "delete",
                archive_ref.to_string(),
                anyhow::anyhow!("one or more cloud deletes failed"),
            ));
        }
        Ok(true)
    }

    async fn apply_retention(&self, ct: &CancellationToken, cfg: &RetentionConfig) -> Result<usize> {
        let archives = self.refresh_snapshot(ct).await?;
        let total = archives.len();

        let victims: Vec<BackupMetadata> = match cfg.policy {
            RetentionPolicyKind::Simple => {
                if cfg.max_backups <= 0 || (total as i64) <= cfg.max_backups {
                    Vec::new()
                } else {
                    let mut sorted = archives.clone();
                    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                    sorted.split_off(cfg.max_backups as usize)
                }
            }
            RetentionPolicyKind::Gfs => {
                let normalized = cfg.clone().normalized();
                let classification =
                    retention::classify(&archives, &normalized, chrono::Utc::now());
                let mut victims: Vec<BackupMetadata> = archives
                    .iter()
                    .filter(|a| {
                        classification.get(&a.reference) == Some(&RetentionCategory::Delete)
                    })
                    .cloned()
                    .collect();
                victims.sort_by(|a, b| a.reference.cmp(&b.reference));
                victims
            }
        };

        let log_files_before = log::count_log_files(&self.exec, ct, &self.log_dir, &self.log_latch).await;
        let (deleted, _failed, logs_deleted) = self.delete_batched(ct, &victims).await;

        *self.last_summary.lock().unwrap() = Some(RetentionSummary {
            backups_deleted: deleted,
            backups_remaining: total as u64 - deleted,
            logs_deleted,
            logs_remaining: log_files_before.saturating_sub(logs_deleted),
            has_log_info: !self.log_latch.is_unavailable(),
        });

        Ok(deleted as usize)
    }

    async fn verify_upload(
        &self,
        ct: &CancellationToken,
        local_file: &Path,
        remote_file: &str,
    ) -> Result<bool> {
        let local_size = std::fs::metadata(local_file).map(|m| m.len()).unwrap_or(0);
        verify::verify_primary_then_alternative(&self.exec, &self.addr, ct, remote_file, local_size)
            .await
            .map_err(|e| self.err("verify_upload", remote_file.to_string(), e.into()))
    }

    async fn get_stats(&self, ct: &CancellationToken) -> Result<StorageStats> {
        let archives = self.list(ct).await?;
        let total_size: u64 = archives.iter().map(|a| a.size).sum();
        let oldest = archives.iter().map(|a| a.timestamp).min();
        let newest = archives.iter().map(|a| a.timestamp).max();

        Ok(StorageStats {
            total_backups: archives.len() as u64,
            total_size,
            oldest_backup: oldest,
            newest_backup: newest,
            total: 0,
            available: 0,
            used: 0,
            filesystem_type: None,
        })
    }
}

impl RetentionReporter for CloudStorage {
    fn last_retention_summary(&self) -> Option<RetentionSummary> {
        *self.last_summary.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cloud::exec::test_support::{ok, RecordingExec};
    use tempfile::TempDir;

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.cloud_enabled = true;
        cfg.cloud_remote = "remote".to_string();
        cfg.cloud_remote_path = "backups".to_string();
        cfg.cloud_log_path = "logs".to_string();
        cfg.rclone_retries = 1;
        cfg.rclone_timeout_operation_secs = 30;
        cfg
    }

    #[tokio::test]
    async fn store_uploads_primary_only_when_no_sidecars() {
        let recorder = RecordingExec::new(vec![ok(""), ok("   4 2024-01-01 00:00:00 x.tar")]);
        let hook = recorder.hook();
        let backend = CloudStorage::new(cfg(), hook);

        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("hostA-backup-20240101-000000.tar");
        std::fs::write(&archive, b"data").unwrap();

        let ct = CancellationToken::new();
        backend.store(&ct, &archive, None).await.unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls[0][0], "copyto");
        assert_eq!(calls[1][0], "lsl");
    }

    #[tokio::test]
    async fn store_rejects_missing_source() {
        let recorder = RecordingExec::new(vec![]);
        let hook = recorder.hook();
        let backend = CloudStorage::new(cfg(), hook);

        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("hostA-backup-20240101-000000.tar");

        let ct = CancellationToken::new();
        let err = backend.store(&ct, &archive, None).await.unwrap_err();
        assert!(recorder.calls.lock().unwrap().is_empty(), "no rclone call should be attempted");
        assert!(err.recoverable);
    }

    #[tokio::test]
    async fn delete_treats_object_not_found_as_success() {
        // First call is the lazy list (`lsl`) used to populate the snapshot;
        // the second is the first `deletefile` attempt, reporting the
        // object already gone. Every call after that defaults to success.
        let recorder = RecordingExec::new(vec![
            ok(""),
            Ok(crate::storage::cloud::exec::ExecOutput {
                stdout: String::new(),
                stderr: "object not found".to_string(),
                success: false,
            }),
        ]);
        let hook = recorder.hook();
        let backend = CloudStorage::new(cfg(), hook);
        let ct = CancellationToken::new();

        let result = backend
            .delete(&ct, "hostA-backup-20240101-000000.tar")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn apply_retention_simple_deletes_oldest() {
        let listing = "10 2024-01-04 00:00:00 a4-backup-4.tar\n\
                        10 2024-01-03 00:00:00 a3-backup-3.tar\n\
                        10 2024-01-02 00:00:00 a2-backup-2.tar\n\
                        10 2024-01-01 00:00:00 a1-backup-1.tar\n";
        let recorder = RecordingExec::new(vec![
            ok(listing),
            ok(""),
            ok(""),
            ok(""),
            ok(""),
        ]);
        let hook = recorder.hook();
        let mut config = cfg();
        config.retention_policy = RetentionPolicyKind::Simple;
        let backend = CloudStorage::new(config, hook);
        let ct = CancellationToken::new();
        let retention_cfg = RetentionConfig {
            policy: RetentionPolicyKind::Simple,
            max_backups: 2,
            ..RetentionConfig::default()
        };
        let deleted = backend.apply_retention(&ct, &retention_cfg).await.unwrap();
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn apply_retention_tracks_log_deletions_and_remaining() {
        let listing = "10 2024-01-04 00:00:00 a4-backup-4.tar\n\
                        10 2024-01-03 00:00:00 a3-backup-3.tar\n\
                        10 2024-01-02 00:00:00 a2-backup-2.tar\n\
                        10 2024-01-01 00:00:00 a1-backup-1.tar\n";
        let log_listing = "backup-a1-1.log\nbackup-a2-2.log\nbackup-a3-3.log\n";
        let recorder = RecordingExec::new(vec![ok(listing), ok(log_listing)]);
        let hook = recorder.hook();
        let backend = CloudStorage::new(cfg(), hook);
        let ct = CancellationToken::new();
        let retention_cfg = RetentionConfig {
            policy: RetentionPolicyKind::Simple,
            max_backups: 2,
            ..RetentionConfig::default()
        };
        let deleted = backend.apply_retention(&ct, &retention_cfg).await.unwrap();
        assert_eq!(deleted, 2);

        let summary = backend.last_retention_summary().unwrap();
        assert_eq!(summary.logs_deleted, 2);
        assert_eq!(summary.logs_remaining, 1);
    }
}
