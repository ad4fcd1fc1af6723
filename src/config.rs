//! Typed configuration consumed by the storage backends.
//!
//! Parsing `.env`-style configuration files is out of scope here; this
//! module only defines the struct the backends are constructed from.
//! Callers are expected to populate it from whatever configuration source
//! they already use.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::RetentionPolicyKind;

/// Upload scheduling mode for the cloud backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudUploadMode {
    Sequential,
    Parallel,
}

/// Verification strategy for the cloud backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcloneVerifyMethod {
    Primary,
    Alternative,
}

/// The full set of fields the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backup_path: PathBuf,
    pub log_path: PathBuf,

    pub secondary_enabled: bool,
    pub secondary_path: PathBuf,
    pub secondary_log_path: PathBuf,

    pub cloud_enabled: bool,
    pub cloud_remote: String,
    pub cloud_remote_path: String,
    pub cloud_log_path: String,
    pub cloud_upload_mode: CloudUploadMode,
    pub cloud_parallel_jobs: usize,
    pub cloud_parallel_verify: bool,
    pub cloud_write_health_check: bool,

    pub rclone_timeout_connection_secs: u64,
    pub rclone_timeout_operation_secs: u64,
    pub rclone_retries: u32,
    pub rclone_transfers: Option<u32>,
    pub rclone_bandwidth_limit: Option<String>,
    pub rclone_verify_method: RcloneVerifyMethod,
    pub rclone_flags: Vec<String>,

    pub cloud_batch_size: u32,
    pub cloud_batch_pause_secs: u64,

    pub bundle_associated_files: bool,

    pub local_retention_days: i64,
    pub secondary_retention_days: i64,
    pub cloud_retention_days: i64,

    pub retention_policy: RetentionPolicyKind,
    pub retention_daily: i64,
    pub retention_weekly: i64,
    pub retention_monthly: i64,
    pub retention_yearly: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_path: PathBuf::from("/var/lib/proxmox-backups"),
            log_path: PathBuf::from("/var/log/proxmox-backups"),

            secondary_enabled: false,
            secondary_path: PathBuf::from("/mnt/secondary-backups"),
            secondary_log_path: PathBuf::from("/mnt/secondary-backups/logs"),

            cloud_enabled: false,
            cloud_remote: String::new(),
            cloud_remote_path: String::new(),
            cloud_log_path: String::new(),
            cloud_upload_mode: CloudUploadMode::Sequential,
            cloud_parallel_jobs: 2,
            cloud_parallel_verify: false,
            cloud_write_health_check: false,

            rclone_timeout_connection_secs: 30,
            rclone_timeout_operation_secs: 300,
            rclone_retries: 3,
            rclone_transfers: None,
            rclone_bandwidth_limit: None,
            rclone_verify_method: RcloneVerifyMethod::Primary,
            rclone_flags: Vec::new(),

            cloud_batch_size: 0,
            cloud_batch_pause_secs: 2,

            bundle_associated_files: false,

            local_retention_days: 0,
            secondary_retention_days: 0,
            cloud_retention_days: 0,

            retention_policy: RetentionPolicyKind::Simple,
            retention_daily: 7,
            retention_weekly: 4,
            retention_monthly: 12,
            retention_yearly: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_conservative() {
        let cfg = Config::default();
        assert!(!cfg.secondary_enabled);
        assert!(!cfg.cloud_enabled);
        assert_eq!(cfg.cloud_batch_size, 0);
    }
}
