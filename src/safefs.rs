//! Timeout-bounded filesystem primitives.
//!
//! Each call runs the blocking syscall on a dedicated worker via
//! [`tokio::task::spawn_blocking`] so the caller can enforce an upper bound
//! via whichever is smaller of the explicit `timeout` or the cancellation
//! token's own deadline. On timeout a [`TimeoutError`] is returned whose
//! cause is the sentinel [`ErrTimeout`]; the spawned task is *not* aborted
//! (the underlying syscall is not interruptible) — we simply stop waiting
//! on it and let it complete in the background.
//!
//! Modeled on `oxidized-mount-common::TimeoutFs`, adapted from a
//! thread+`mpsc::recv_timeout` primitive to the async `tokio` idiom used
//! throughout this crate.

use std::fs::{self, DirEntry, Metadata};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ErrTimeout, TimeoutError};

/// Outcome of a `statfs`-style capacity query.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCapacity {
    pub total: u64,
    pub available: u64,
    pub used: u64,
}

async fn run_with_timeout<T, F>(
    ct: &CancellationToken,
    op_name: &'static str,
    path: &Path,
    timeout: Duration,
    op: F,
) -> Result<T, anyhow::Error>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    if ct.is_cancelled() {
        anyhow::bail!("operation cancelled");
    }

    // A zero or negative timeout disables the wrapping entirely.
    if timeout.is_zero() {
        return Ok(op()?);
    }

    let handle = tokio::task::spawn_blocking(op);

    tokio::select! {
        _ = ct.cancelled() => {
            anyhow::bail!("operation cancelled");
        }
        res = tokio::time::timeout(timeout, handle) => {
            match res {
                Ok(Ok(inner)) => Ok(inner?),
                Ok(Err(join_err)) => Err(anyhow::anyhow!("worker panicked: {join_err}")),
                Err(_elapsed) => {
                    // The spawned task keeps running; we abandon waiting on it.
                    // `ErrTimeout` is the sentinel cause, discoverable via the
                    // error chain; the visible message is the `TimeoutError`.
                    Err(anyhow::Error::new(ErrTimeout)
                        .context(TimeoutError::new(op_name, path.to_path_buf(), timeout)))
                }
            }
        }
    }
}

/// Timeout-bounded `stat`.
pub async fn stat(
    ct: &CancellationToken,
    path: &Path,
    timeout: Duration,
) -> Result<Metadata, anyhow::Error> {
    let p = path.to_path_buf();
    run_with_timeout(ct, "stat", path, timeout, move || fs::metadata(&p)).await
}

/// Timeout-bounded directory listing. Collects all entries eagerly (unlike
/// `std::fs::read_dir`'s lazy iterator) so the whole call can be bounded.
pub async fn read_dir(
    ct: &CancellationToken,
    path: &Path,
    timeout: Duration,
) -> Result<Vec<DirEntry>, anyhow::Error> {
    let p = path.to_path_buf();
    run_with_timeout(ct, "readdir", path, timeout, move || {
        fs::read_dir(&p)?.collect::<std::io::Result<Vec<_>>>()
    })
    .await
}

/// Timeout-bounded `statfs`-equivalent capacity query.
pub async fn statfs(
    ct: &CancellationToken,
    path: &Path,
    timeout: Duration,
) -> Result<FsCapacity, anyhow::Error> {
    let p = path.to_path_buf();
    run_with_timeout(ct, "statfs", path, timeout, move || statfs_blocking(&p)).await
}

fn statfs_blocking(path: &Path) -> std::io::Result<FsCapacity> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    let block_size = stat.fragment_size().max(1) as u64;
    let total = stat.blocks() as u64 * block_size;
    let available = stat.blocks_available() as u64 * block_size;
    let free = stat.blocks_free() as u64 * block_size;
    let used = total.saturating_sub(free);
    Ok(FsCapacity {
        total,
        available,
        used,
    })
}

/// Resolve a path to its absolute canonical form without following a
/// potentially-dead symlink target indefinitely; delegates to
/// [`std::fs::canonicalize`] which is itself timeout-wrapped by callers that
/// care (the struct above intentionally keeps a narrow surface matching
/// three named operations).
pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

pub type SafeFsError = anyhow::Error;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stat_succeeds_within_timeout() {
        let dir = TempDir::new().unwrap();
        let ct = CancellationToken::new();
        let meta = stat(&ct, dir.path(), Duration::from_secs(1)).await.unwrap();
        assert!(meta.is_dir());
    }

    #[tokio::test]
    async fn stat_missing_path_errors() {
        let ct = CancellationToken::new();
        let result = stat(&ct, Path::new("/nonexistent/path/xyz"), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_dir_lists_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        std::fs::write(dir.path().join("b"), b"b").unwrap();
        let ct = CancellationToken::new();
        let entries = read_dir(&ct, dir.path(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn statfs_reports_nonzero_capacity() {
        let dir = TempDir::new().unwrap();
        let ct = CancellationToken::new();
        let cap = statfs(&ct, dir.path(), Duration::from_secs(1)).await.unwrap();
        assert!(cap.total > 0);
        assert!(cap.total >= cap.used);
    }

    #[tokio::test]
    async fn zero_timeout_runs_inline() {
        let dir = TempDir::new().unwrap();
        let ct = CancellationToken::new();
        let meta = stat(&ct, dir.path(), Duration::from_secs(0)).await.unwrap();
        assert!(meta.is_dir());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let dir = TempDir::new().unwrap();
        let ct = CancellationToken::new();
        ct.cancel();
        let result = stat(&ct, dir.path(), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
