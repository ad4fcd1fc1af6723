//! Cloud log-directory bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use super::addressing::RemoteAddress;
use super::exec::ExecHook;
use crate::associated::extract_log_key_from_backup;
use crate::error::RemoteCheckError;

/// One-shot latch: once set, cloud log operations are skipped for the rest
/// of the process without re-probing the remote.
#[derive(Default)]
pub struct LogPathLatch(AtomicBool);

impl LogPathLatch {
    pub fn is_unavailable(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolve the configured `cloud_log_path` to a full remote ref: a bare
/// sub-path is prefixed with the remote name; anything already containing
/// `:` is treated as fully qualified.
pub fn resolve_log_dir(addr: &RemoteAddress, cloud_log_path: &str) -> String {
    if cloud_log_path.contains(':') {
        cloud_log_path.to_string()
    } else {
        format!("{}:{}", addr.remote_name, cloud_log_path.trim_start_matches('/'))
    }
}

fn looks_like_missing_directory(output: &str) -> bool {
    matches!(
        RemoteCheckError::classify(output),
        crate::error::RemoteCheckKind::Path
    )
}

/// Delete the log file associated with archive `reference`, per the
/// log-key derivation rule. A no-op once the latch is set. Returns whether
/// a log file was actually removed.
pub async fn delete_associated_log(
    exec: &ExecHook,
    ct: &CancellationToken,
    log_dir: &str,
    latch: &LogPathLatch,
    reference: &str,
) -> bool {
    if latch.is_unavailable() {
        return false;
    }
    let Some(log_key) = extract_log_key_from_backup(reference) else {
        return false;
    };

    let target = format!("{log_dir}/{log_key}");
    match exec(
        ct.clone(),
        "rclone".to_string(),
        vec!["delete".to_string(), target],
    )
    .await
    {
        Ok(out) if out.success => true,
        Ok(out) => {
            if looks_like_missing_directory(&out.combined()) {
                tracing::warn!(
                    dir = %log_dir,
                    "cloud log directory not found, disabling log cleanup for this process"
                );
                latch.set();
            } else {
                tracing::warn!(output = %out.combined(), "cloud log cleanup failed, continuing");
            }
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "cloud log cleanup command failed, continuing");
            false
        }
    }
}

/// Count remote log files named `backup-*.log` in `log_dir`. A no-op
/// (returns 0) once the latch is set.
pub async fn count_log_files(
    exec: &ExecHook,
    ct: &CancellationToken,
    log_dir: &str,
    latch: &LogPathLatch,
) -> u64 {
    if latch.is_unavailable() {
        return 0;
    }

    let out = exec(
        ct.clone(),
        "rclone".to_string(),
        vec![
            "lsf".to_string(),
            log_dir.to_string(),
            "--files-only".to_string(),
        ],
    )
    .await;

    match out {
        Ok(out) if out.success => {
            latch.clear();
            out.stdout
                .lines()
                .filter(|l| l.starts_with("backup-") && l.ends_with(".log"))
                .count() as u64
        }
        Ok(out) => {
            if looks_like_missing_directory(&out.combined()) {
                latch.set();
            }
            0
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cloud::exec::test_support::{fail, ok, RecordingExec};

    #[tokio::test]
    async fn delete_associated_log_sets_latch_on_missing_dir() {
        let recorder = RecordingExec::new(vec![fail("directory not found")]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let latch = LogPathLatch::default();
        let removed = delete_associated_log(&hook, &ct, "remote:logs", &latch, "hostA-backup-20240101-000000.tar.zst")
            .await;
        assert!(!removed);
        assert!(latch.is_unavailable());
    }

    #[tokio::test]
    async fn delete_associated_log_reports_success() {
        let recorder = RecordingExec::new(vec![ok("")]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let latch = LogPathLatch::default();
        let removed = delete_associated_log(&hook, &ct, "remote:logs", &latch, "hostA-backup-20240101-000000.tar.zst")
            .await;
        assert!(removed);
    }

    #[tokio::test]
    async fn delete_associated_log_noop_once_latched() {
        let recorder = RecordingExec::new(vec![ok("")]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let latch = LogPathLatch::default();
        latch.set();
        let removed = delete_associated_log(&hook, &ct, "remote:logs", &latch, "hostA-backup-20240101-000000.tar.zst")
            .await;
        assert!(!removed);
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn count_log_files_matches_pattern() {
        let recorder = RecordingExec::new(vec![ok("backup-hostA-1.log\nother.txt\nbackup-hostB-2.log\n")]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let latch = LogPathLatch::default();
        let count = count_log_files(&hook, &ct, "remote:logs", &latch).await;
        assert_eq!(count, 2);
    }

    #[test]
    fn resolve_bare_subpath_prefixes_remote_name() {
        let addr = RemoteAddress::new("remote", "");
        assert_eq!(resolve_log_dir(&addr, "logs/cloud"), "remote:logs/cloud");
    }

    #[test]
    fn resolve_fully_qualified_passthrough() {
        let addr = RemoteAddress::new("remote", "");
        assert_eq!(resolve_log_dir(&addr, "other:logs"), "other:logs");
    }
}
