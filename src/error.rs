//! Error types for the tiered archive retention engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::Tier;

/// Tier-boundary error returned by every `Storage` operation.
///
/// Message format is deterministic: `"<CRITICAL|WARNING>: <tier> storage
/// <op> operation failed for <path>[ (recoverable)]: <err>"`, matching what
/// operators grep for in logs. The format depends on two boolean fields, so
/// `Display` is hand-written rather than derived via `thiserror`'s `#[error]`
/// shorthand.
#[derive(Debug)]
pub struct StorageError {
    pub tier: Tier,
    pub op: String,
    pub path: String,
    pub cause: anyhow::Error,
    pub is_critical: bool,
    pub recoverable: bool,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} storage {} operation failed for {}{}: {}",
            if self.is_critical { "CRITICAL" } else { "WARNING" },
            self.tier,
            self.op,
            self.path,
            if self.recoverable { " (recoverable)" } else { "" },
            self.cause,
        )
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.source()
    }
}

impl StorageError {
    pub fn new(
        tier: Tier,
        op: impl Into<String>,
        path: impl Into<String>,
        cause: anyhow::Error,
    ) -> Self {
        Self {
            tier,
            op: op.into(),
            path: path.into(),
            cause,
            is_critical: tier == Tier::Primary,
            recoverable: tier != Tier::Primary,
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Sentinel cause used by [`crate::safefs`] when an operation is abandoned
/// because its timeout elapsed before the underlying blocking call returned.
#[derive(Debug, Error)]
#[error("operation timed out")]
pub struct ErrTimeout;

/// Distinguishable timeout error raised by the safe-FS wrapper.
#[derive(Debug, Error)]
#[error("{op} on {path} timed out after {duration:?}")]
pub struct TimeoutError {
    pub op: &'static str,
    pub path: PathBuf,
    pub duration: Duration,
}

impl TimeoutError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, duration: Duration) -> Self {
        Self {
            op,
            path: path.into(),
            duration,
        }
    }
}

/// Classification of a failed `rclone` reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCheckKind {
    Timeout,
    Auth,
    Path,
    Network,
    Other,
}

impl std::fmt::Display for RemoteCheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemoteCheckKind::Timeout => "timeout",
            RemoteCheckKind::Auth => "auth",
            RemoteCheckKind::Path => "path",
            RemoteCheckKind::Network => "network",
            RemoteCheckKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Error raised while probing cloud remote reachability, tagged with a
/// classification so callers can decide whether a fallback applies.
#[derive(Debug, Error)]
#[error("remote check failed ({kind}): {message}")]
pub struct RemoteCheckError {
    pub kind: RemoteCheckKind,
    pub message: String,
}

impl RemoteCheckError {
    pub fn new(kind: RemoteCheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify raw `rclone` stderr/stdout text into a [`RemoteCheckKind`].
    ///
    /// Substring matching is case-insensitive; the precedence order below is
    /// deliberate: auth beats path beats network beats a generic "other"
    /// bucket.
    pub fn classify(output: &str) -> RemoteCheckKind {
        let lower = output.to_ascii_lowercase();
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("permission denied")
            || lower.contains("unauthorized")
        {
            RemoteCheckKind::Auth
        } else if lower.contains("directory not found") || lower.contains("file not found") {
            RemoteCheckKind::Path
        } else if lower.contains("dial tcp")
            || lower.contains("connection refused")
            || lower.contains("no such host")
        {
            RemoteCheckKind::Network
        } else {
            RemoteCheckKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_format_critical() {
        let err = StorageError::new(
            Tier::Primary,
            "store",
            "/var/lib/backups/x.tar",
            anyhow::anyhow!("disk full"),
        );
        assert_eq!(
            err.to_string(),
            "CRITICAL: primary storage store operation failed for /var/lib/backups/x.tar: disk full"
        );
        assert!(err.is_critical);
    }

    #[test]
    fn message_format_warning_recoverable() {
        let err = StorageError::new(
            Tier::Cloud,
            "upload",
            "remote:prefix/x.tar",
            anyhow::anyhow!("connection reset"),
        );
        assert_eq!(
            err.to_string(),
            "WARNING: cloud storage upload operation failed for remote:prefix/x.tar (recoverable): connection reset"
        );
        assert!(!err.is_critical);
    }

    #[test]
    fn classify_precedence() {
        assert_eq!(
            RemoteCheckError::classify("403 Forbidden"),
            RemoteCheckKind::Auth
        );
        assert_eq!(
            RemoteCheckError::classify("directory not found"),
            RemoteCheckKind::Path
        );
        assert_eq!(
            RemoteCheckError::classify("dial tcp: no such host"),
            RemoteCheckKind::Network
        );
        assert_eq!(
            RemoteCheckError::classify("unexpected EOF"),
            RemoteCheckKind::Other
        );
    }
}
