//! Remote reachability probing.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::addressing::RemoteAddress;
use super::exec::ExecHook;
use crate::config::Config;
use crate::error::{RemoteCheckError, RemoteCheckKind};

const BACKOFFS: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];
const MAX_ATTEMPTS: u32 = 3;
const WRITE_PROBE_MIN_BUDGET: Duration = Duration::from_secs(5);

/// Probe reachability of `addr`, retrying up to [`MAX_ATTEMPTS`] times with
/// exponential backoff, bounded overall by `cfg.rclone_timeout_connection_secs`.
pub async fn check_remote_accessible(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    cfg: &Config,
) -> Result<(), RemoteCheckError> {
    let budget = Duration::from_secs(cfg.rclone_timeout_connection_secs);
    let deadline = Instant::now() + budget;

    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if ct.is_cancelled() {
            return Err(RemoteCheckError::new(RemoteCheckKind::Other, "cancelled"));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() && attempt > 0 {
            break;
        }

        match check_remote_once(exec, addr, ct, cfg, remaining).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    kind = %e.kind,
                    message = %e.message,
                    "cloud remote reachability probe failed, check your rclone configuration"
                );
                last_err = Some(e);
            }
        }

        if let Some(backoff) = BACKOFFS.get(attempt as usize) {
            tokio::select! {
                _ = ct.cancelled() => {
                    return Err(RemoteCheckError::new(RemoteCheckKind::Other, "cancelled"));
                }
                _ = tokio::time::sleep(*backoff) => {}
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        RemoteCheckError::new(RemoteCheckKind::Timeout, "reachability probe exhausted its budget")
    }))
}

async fn check_remote_once(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    cfg: &Config,
    remaining_budget: Duration,
) -> Result<(), RemoteCheckError> {
    if cfg.cloud_write_health_check {
        return write_probe(exec, addr, ct).await;
    }

    let root = addr.remote_root();
    let list_result = exec(
        ct.clone(),
        "rclone".to_string(),
        vec!["lsf".to_string(), root, "--max-depth".to_string(), "1".to_string()],
    )
    .await;

    let list_err = match list_result {
        Ok(out) if out.success => None,
        Ok(out) => Some(RemoteCheckError::new(
            RemoteCheckError::classify(&out.combined()),
            out.combined(),
        )),
        Err(e) => Some(RemoteCheckError::new(RemoteCheckKind::Network, e.to_string())),
    };

    if let Some(err) = list_err {
        if err.kind == RemoteCheckKind::Auth && remaining_budget >= WRITE_PROBE_MIN_BUDGET {
            return write_probe(exec, addr, ct).await;
        }
        return Err(err);
    }

    if !addr.prefix.is_empty() {
        let base = addr.remote_base();
        let _ = exec(
            ct.clone(),
            "rclone".to_string(),
            vec!["mkdir".to_string(), base.clone()],
        )
        .await;

        let out = exec(
            ct.clone(),
            "rclone".to_string(),
            vec!["lsf".to_string(), base, "--max-depth".to_string(), "1".to_string()],
        )
        .await
        .map_err(|e| RemoteCheckError::new(RemoteCheckKind::Network, e.to_string()))?;

        if !out.success {
            let kind = RemoteCheckError::classify(&out.combined());
            if kind == RemoteCheckKind::Auth && remaining_budget >= WRITE_PROBE_MIN_BUDGET {
                return write_probe(exec, addr, ct).await;
            }
            return Err(RemoteCheckError::new(kind, out.combined()));
        }
    }

    Ok(())
}

async fn write_probe(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
) -> Result<(), RemoteCheckError> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let probe_path = format!("{}/.healthcheck-{nanos}", addr.remote_base());

    let touch = exec(
        ct.clone(),
        "rclone".to_string(),
        vec!["touch".to_string(), probe_path.clone()],
    )
    .await
    .map_err(|e| RemoteCheckError::new(RemoteCheckKind::Network, e.to_string()))?;

    if !touch.success {
        return Err(RemoteCheckError::new(
            RemoteCheckError::classify(&touch.combined()),
            touch.combined(),
        ));
    }

    let cleanup = exec(
        ct.clone(),
        "rclone".to_string(),
        vec!["deletefile".to_string(), probe_path],
    )
    .await;
    if let Ok(out) = cleanup {
        if !out.success {
            tracing::warn!(output = %out.combined(), "health-check probe cleanup failed, leaking a marker file");
        }
    }

    Ok(())
}
