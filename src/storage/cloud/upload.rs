//! Upload with retry and the bounded-concurrency parallel
//! executor.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::addressing::RemoteAddress;
use super::exec::ExecHook;
use super::verify::verify_primary_then_alternative;
use crate::config::{CloudUploadMode, Config};

/// One queued upload: a local file and the remote name it should land at.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub local_path: std::path::PathBuf,
    pub remote_name: String,
    pub verify: bool,
}

fn build_copyto_args(local: &Path, remote_path: &str, cfg: &Config) -> Vec<String> {
    let mut args = vec![
        "copyto".to_string(),
        local.to_string_lossy().to_string(),
        remote_path.to_string(),
    ];
    if let Some(limit) = &cfg.rclone_bandwidth_limit {
        args.push("--bwlimit".to_string());
        args.push(limit.clone());
    }
    if let Some(transfers) = cfg.rclone_transfers {
        args.push("--transfers".to_string());
        args.push(transfers.to_string());
    }
    args.push("--progress".to_string());
    args.push("--stats".to_string());
    args.push("10s".to_string());
    args.extend(cfg.rclone_flags.iter().cloned());
    args
}

/// Upload `task` with up to `cfg.rclone_retries` attempts, exponential
/// backoff `2^attempt` seconds between them, each attempt (and the
/// subsequent verification) bounded by a fresh `rclone_timeout_operation`
/// deadline. Returns `Ok(())` only once both the copy and (if requested)
/// verification succeed.
pub async fn upload_with_retry(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    cfg: &Config,
    task: &UploadTask,
) -> Result<(), anyhow::Error> {
    let remote_path = addr.remote_path_for(&task.remote_name);
    let per_task_deadline = Duration::from_secs(cfg.rclone_timeout_operation_secs);
    let local_size = std::fs::metadata(&task.local_path)
        .map(|m| m.len())
        .unwrap_or(0);

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..cfg.rclone_retries.max(1) {
        if ct.is_cancelled() {
            anyhow::bail!("upload cancelled");
        }

        let args = build_copyto_args(&task.local_path, &remote_path, cfg);
        let started = Instant::now();
        let attempt_result = tokio::time::timeout(
            per_task_deadline,
            exec(ct.clone(), "rclone".to_string(), args),
        )
        .await;

        let outcome = match attempt_result {
            Err(_elapsed) => {
                last_err = Some(anyhow::anyhow!(
                    "upload of {} timed out after {:?}",
                    task.remote_name,
                    started.elapsed()
                ));
                None
            }
            Ok(Err(io_err)) => {
                last_err = Some(anyhow::anyhow!("upload of {}: {io_err}", task.remote_name));
                None
            }
            Ok(Ok(out)) if !out.success => {
                last_err = Some(anyhow::anyhow!(
                    "upload of {} failed: {}",
                    task.remote_name,
                    out.combined()
                ));
                None
            }
            Ok(Ok(_)) => Some(()),
        };

        if outcome.is_some() {
            if task.verify {
                match verify_primary_then_alternative(exec, addr, ct, &task.remote_name, local_size)
                    .await
                {
                    Ok(true) => return Ok(()),
                    Ok(false) => {
                        last_err = Some(anyhow::anyhow!(
                            "verification of {} failed: size mismatch",
                            task.remote_name
                        ));
                    }
                    Err(e) => {
                        last_err = Some(anyhow::anyhow!("verification of {}: {e}", task.remote_name));
                    }
                }
            } else {
                return Ok(());
            }
        }

        if attempt + 1 < cfg.rclone_retries.max(1) {
            let backoff = Duration::from_secs(2u64.saturating_pow(attempt + 1));
            tokio::select! {
                _ = ct.cancelled() => anyhow::bail!("upload cancelled"),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("upload of {} failed after retries", task.remote_name)))
}

/// Run the remainder of an upload group (everything after the primary
/// archive) either sequentially or via a semaphore-bounded parallel
/// executor, per `cfg.cloud_upload_mode`/`cfg.cloud_parallel_jobs`.
/// On the first failure the whole group is cancelled (subsequent tasks
/// already in flight observe the shared token and stop).
pub async fn run_remainder(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    cfg: &Config,
    tasks: Vec<UploadTask>,
) -> Result<(), anyhow::Error> {
    if tasks.is_empty() {
        return Ok(());
    }

    let sequential = cfg.cloud_upload_mode == CloudUploadMode::Sequential
        || cfg.cloud_parallel_jobs <= 1;

    if sequential {
        for task in &tasks {
            upload_with_retry(exec, addr, ct, cfg, task).await?;
        }
        return Ok(());
    }

    let group_ct = ct.child_token();
    let semaphore = Arc::new(Semaphore::new(cfg.cloud_parallel_jobs.max(1)));
    let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        let exec = exec.clone();
        let addr = addr.clone();
        let cfg = cfg.clone();
        let ct = group_ct.clone();
        let semaphore = semaphore.clone();
        let first_error = first_error.clone();

        handles.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            if ct.is_cancelled() {
                return;
            }
            if let Err(e) = upload_with_retry(&exec, &addr, &ct, &cfg, &task).await {
                let mut guard = first_error.lock().await;
                if guard.is_none() {
                    *guard = Some(e);
                }
                ct.cancel();
            }
        }));
    }

    futures::future::join_all(handles).await;

    match Arc::try_unwrap(first_error) {
        Ok(mutex) => match mutex.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        },
        Err(arc) => match arc.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        },
    }
}
