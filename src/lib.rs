//! # Tiered Archive Retention
//!
//! Multi-tier backup retention and placement engine for Proxmox-style host
//! archives.
//!
//! ## Features
//!
//! - **Three storage tiers**: a critical primary local filesystem, a
//!   non-critical secondary mounted filesystem, and a non-critical cloud
//!   object store addressed through an external `rclone`-compatible binary.
//! - **GFS retention**: Grandfather-Father-Son classification with daily,
//!   weekly, monthly, and yearly tiers plus a simple count-based policy.
//! - **Filesystem capability detection**: gates ownership/permission
//!   operations on what the backing filesystem actually supports.
//! - **Associated-file bookkeeping**: sidecars, bundles, and log files stay
//!   consistent with archive deletions across all three tiers.
//! - **Cloud upload pipeline**: retrying, timeout-bounded, optionally
//!   parallel uploads with post-upload verification and batched deletion.
//!
//! ## Architecture
//!
//! The engine is organized into a handful of modules:
//!
//! - `model`: the shared data model (`BackupMetadata`, `FilesystemInfo`,
//!   `RetentionConfig`, `RetentionSummary`, `StorageStats`).
//! - `error`: the `StorageError` taxonomy and auxiliary error kinds.
//! - `safefs`: timeout-bounded filesystem primitives.
//! - `fsdetect`: mount-point and filesystem-kind detection.
//! - `retention`: the GFS classifier and policy normalization.
//! - `associated`: sidecar/bundle/log-key path derivation.
//! - `metadata`: sidecar and in-bundle manifest loading.
//! - `storage`: the `Storage` trait and the `local`, `secondary`, and
//!   `cloud` backends.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tiered_archive_retention::storage::local::LocalStorage;
//! use tiered_archive_retention::storage::Storage;
//! use tiered_archive_retention::model::RetentionConfig;
//! use tokio_util::sync::CancellationToken;
//! use std::path::PathBuf;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let backend = LocalStorage::new(PathBuf::from("/var/lib/pve-backups"), PathBuf::from("/var/log/pve-backups"), true);
//! let ct = CancellationToken::new();
//!
//! backend.store(&ct, &PathBuf::from("/tmp/host-backup-20240101-000000.tar.zst"), None).await?;
//! let archives = backend.list(&ct).await?;
//! println!("{} archives on primary tier", archives.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(dead_code)]

pub mod associated;
pub mod config;
pub mod error;
pub mod fsdetect;
pub mod metadata;
pub mod model;
pub mod retention;
pub mod safefs;
pub mod storage;

pub use config::Config;
pub use error::{Result, StorageError};
pub use model::{
    BackupMetadata, FilesystemInfo, FilesystemKind, RetentionConfig, RetentionPolicyKind,
    RetentionSummary, StorageStats, Tier,
};
pub use storage::{RetentionReporter, Storage};

/// Version information for the retention engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports.
pub mod prelude {
    //! Commonly used types and traits.

    pub use crate::config::Config;
    pub use crate::error::{Result, StorageError};
    pub use crate::model::{
        BackupMetadata, FilesystemInfo, RetentionConfig, RetentionPolicyKind, RetentionSummary,
        StorageStats, Tier,
    };
    pub use crate::storage::{RetentionReporter, Storage};
}
