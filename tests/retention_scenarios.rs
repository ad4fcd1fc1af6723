//! End-to-end scenario tests exercising a backend through its public
//! `Storage` surface rather than internal helpers.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use tiered_archive_retention::config::{Config, RcloneVerifyMethod};
use tiered_archive_retention::model::{RetentionConfig, RetentionPolicyKind};
use tiered_archive_retention::storage::cloud::exec::ExecOutput;
use tiered_archive_retention::storage::cloud::{reachability, CloudStorage};
use tiered_archive_retention::storage::local::LocalStorage;
use tiered_archive_retention::storage::Storage;

fn write_backup(dir: &std::path::Path, name: &str, timestamp: chrono::DateTime<Utc>, size: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![b'x'; size]).unwrap();
    std::fs::write(
        dir.join(format!("{name}.metadata")),
        serde_json::json!({ "timestamp": timestamp.to_rfc3339() }).to_string(),
    )
    .unwrap();
    path
}

#[tokio::test]
async fn local_simple_retention_keeps_newest_n_end_to_end() {
    let base = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let backend = LocalStorage::new(base.path().to_path_buf(), logs.path().to_path_buf(), false);
    let ct = CancellationToken::new();

    let now = Utc::now();
    for day in 0..5 {
        let ts = now - ChronoDuration::days(day);
        write_backup(
            base.path(),
            &format!("hostA-backup-2024010{}-000000.tar.zst", 5 - day),
            ts,
            1024,
        );
    }

    let archives_before = backend.list(&ct).await.unwrap();
    assert_eq!(archives_before.len(), 5);

    let retention_cfg = RetentionConfig {
        policy: RetentionPolicyKind::Simple,
        max_backups: 2,
        daily: 0,
        weekly: 0,
        monthly: 0,
        yearly: 0,
    };
    let deleted = backend.apply_retention(&ct, &retention_cfg).await.unwrap();
    assert_eq!(deleted, 3);

    let archives_after = backend.list(&ct).await.unwrap();
    assert_eq!(archives_after.len(), 2);
    // The two newest (smallest `day` offset) survive.
    let mut names: Vec<String> = archives_after.iter().map(|a| a.logical_basename()).collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "hostA-backup-20240104-000000.tar.zst".to_string(),
            "hostA-backup-20240105-000000.tar.zst".to_string(),
        ]
    );
}

#[tokio::test]
async fn local_gfs_retention_excludes_current_week_from_weekly_bucket() {
    let base = tempdir().unwrap();
    let logs = tempdir().unwrap();
    let backend = LocalStorage::new(base.path().to_path_buf(), logs.path().to_path_buf(), false);
    let ct = CancellationToken::new();

    let now = Utc::now();
    // One archive today (daily bucket), one a year ago (should fall to
    // yearly or be deleted depending on configured tier sizes).
    write_backup(base.path(), "hostA-backup-20990101-000000.tar.zst", now, 512);
    write_backup(
        base.path(),
        "hostA-backup-19990101-000000.tar.zst",
        now - ChronoDuration::days(400),
        512,
    );

    let retention_cfg = RetentionConfig {
        policy: RetentionPolicyKind::Gfs,
        max_backups: 0,
        daily: 1,
        weekly: 0,
        monthly: 0,
        yearly: -1,
    };
    let deleted = backend.apply_retention(&ct, &retention_cfg).await.unwrap();
    // With weekly/monthly/yearly all disabled, only today's archive (the
    // daily slot) survives; the year-old one has no bucket left to land in.
    assert_eq!(deleted, 1);
    let remaining = backend.list(&ct).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].logical_basename(), "hostA-backup-20990101-000000.tar.zst");
}

fn cloud_config(remote: &str) -> Config {
    let mut cfg = Config::default();
    cfg.cloud_enabled = true;
    cfg.cloud_remote = remote.to_string();
    cfg.cloud_remote_path = String::new();
    cfg.rclone_verify_method = RcloneVerifyMethod::Primary;
    cfg.rclone_retries = 1;
    cfg.rclone_timeout_operation_secs = 5;
    cfg
}

/// A minimal recording exec hook, built directly against the public
/// `ExecHook` type rather than the library's internal (cfg(test)-only)
/// `RecordingExec`, since integration tests link the crate without its own
/// test cfg enabled.
fn scripted_exec(
    responses: Vec<std::io::Result<ExecOutput>>,
) -> (tiered_archive_retention::storage::cloud::exec::ExecHook, Arc<std::sync::Mutex<Vec<Vec<String>>>>) {
    let responses = Arc::new(std::sync::Mutex::new(responses));
    let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
    let calls_for_hook = calls.clone();
    let hook: tiered_archive_retention::storage::cloud::exec::ExecHook = Arc::new(move |_ct, _program, args| {
        let responses = responses.clone();
        let calls = calls_for_hook.clone();
        Box::pin(async move {
            calls.lock().unwrap().push(args);
            let mut responses = responses.lock().unwrap();
            if responses.is_empty() {
                Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    success: true,
                })
            } else {
                responses.remove(0)
            }
        })
    });
    (hook, calls)
}

fn ok(stdout: impl Into<String>) -> std::io::Result<ExecOutput> {
    Ok(ExecOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        success: true,
    })
}

fn fail(stderr: impl Into<String>) -> std::io::Result<ExecOutput> {
    Ok(ExecOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        success: false,
    })
}

#[tokio::test]
async fn cloud_store_sequential_upload_order_primary_then_sidecars() {
    let local = tempdir().unwrap();
    let archive = local.path().join("hostA-backup-20240101-000000.tar.zst");
    std::fs::write(&archive, vec![b'x'; 2048]).unwrap();
    std::fs::write(
        local.path().join("hostA-backup-20240101-000000.tar.zst.sha256"),
        b"deadbeef",
    )
    .unwrap();

    let cfg = cloud_config("remote");
    let (hook, calls) = scripted_exec(vec![
        // First call is the primary `copyto`; second is the `lsl` verify.
        ok(""),
        ok("   2048 2024-01-01 00:00:00 hostA-backup-20240101-000000.tar.zst"),
    ]);
    let backend = CloudStorage::new(cfg, hook);
    let ct = CancellationToken::new();

    backend.store(&ct, &archive, None).await.unwrap();

    let calls = calls.lock().unwrap();
    // copyto primary, then lsl to verify it, then copyto for the sidecar.
    assert_eq!(calls[0][0], "copyto");
    assert!(calls[0].iter().any(|a| a.contains("hostA-backup-20240101-000000.tar.zst")));
    assert_eq!(calls[1][0], "lsl");
    assert_eq!(calls[2][0], "copyto");
    assert!(calls[2].iter().any(|a| a.ends_with(".sha256")));
}

#[tokio::test(start_paused = true)]
async fn cloud_reachability_falls_back_to_write_probe_on_auth_error() {
    let cfg = cloud_config("remote");
    let (hook, calls) = scripted_exec(vec![
        fail("Error: 403 permission denied"),
        ok(""),
        ok(""),
    ]);
    let addr = tiered_archive_retention::storage::cloud::addressing::RemoteAddress::new(
        &cfg.cloud_remote,
        &cfg.cloud_remote_path,
    );
    let ct = CancellationToken::new();

    let result = reachability::check_remote_accessible(&hook, &addr, &ct, &cfg).await;
    assert!(result.is_ok());

    let calls = calls.lock().unwrap();
    assert!(calls.iter().any(|a| a.first().map(|s| s.as_str()) == Some("touch")));
}
