//! Shared data model for archives, filesystem capability snapshots, and
//! retention configuration/results.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A storage tier. Primary is the only critical tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Secondary,
    Cloud,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
            Tier::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

/// Proxmox backup flavor carried in manifest metadata, when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxmoxFlavor {
    Vzdump,
    PbsClient,
    Unknown,
}

/// Compression kind carried in manifest metadata, when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    Zstd,
    Gzip,
    Lzo,
    None,
    Unknown,
}

/// A single archive as seen by a storage backend: an immutable payload
/// identified by a path-like reference (local path or remote object key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Local path or remote object key identifying the archive.
    pub reference: String,
    /// Creation timestamp, either manifest-derived or synthesized from
    /// `stat`.
    pub timestamp: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 checksum, when known.
    pub checksum: Option<String>,
    pub flavor: Option<ProxmoxFlavor>,
    pub compression: Option<CompressionKind>,
    pub producer_version: Option<String>,
}

impl BackupMetadata {
    /// Basename of `reference`, with a trailing `.bundle.tar` suffix
    /// stripped, used to decide whether two archives are "the same logical
    /// backup".
    pub fn logical_basename(&self) -> String {
        let base = PathBuf::from(&self.reference);
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        crate::associated::trim_bundle_suffix(&name).0
    }
}

/// The closed set of filesystem kinds this engine can reason about.
/// Unrecognized textual kinds collapse to `Unknown` rather than opening the
/// enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Zfs,
    Jfs,
    ReiserFs,
    Fat,
    Vfat,
    ExFat,
    Ntfs,
    Fuse,
    Nfs,
    Nfs4,
    Cifs,
    Tmpfs,
    Overlay,
    Unknown,
}

impl FilesystemKind {
    /// Case-insensitive parse of the textual kind reported by the mount
    /// table, collapsing known aliases (`fat32`→`vfat`, `fat16`→`fat`,
    /// `ntfs-3g`→`ntfs`, `fuse.*`→`fuse`, `smb`/`smbfs`→`cifs`).
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        match lower.as_str() {
            "ext2" => Self::Ext2,
            "ext3" => Self::Ext3,
            "ext4" => Self::Ext4,
            "xfs" => Self::Xfs,
            "btrfs" => Self::Btrfs,
            "zfs" => Self::Zfs,
            "jfs" => Self::Jfs,
            "reiserfs" => Self::ReiserFs,
            "fat" | "fat16" => Self::Fat,
            "vfat" | "fat32" => Self::Vfat,
            "exfat" => Self::ExFat,
            "ntfs" | "ntfs-3g" => Self::Ntfs,
            "nfs" => Self::Nfs,
            "nfs4" => Self::Nfs4,
            "cifs" | "smb" | "smbfs" => Self::Cifs,
            "tmpfs" => Self::Tmpfs,
            "overlay" | "overlayfs" => Self::Overlay,
            other if other.starts_with("fuse") => Self::Fuse,
            _ => Self::Unknown,
        }
    }

    /// POSIX-family kinds support ownership unconditionally.
    pub fn is_posix_family(self) -> bool {
        matches!(
            self,
            Self::Ext2
                | Self::Ext3
                | Self::Ext4
                | Self::Xfs
                | Self::Btrfs
                | Self::Zfs
                | Self::Jfs
                | Self::ReiserFs
                | Self::Tmpfs
                | Self::Overlay
        )
    }

    /// Kinds auto-excluded from chown/chmod regardless of any probe.
    pub fn is_auto_excluded(self) -> bool {
        matches!(
            self,
            Self::Fat | Self::Vfat | Self::ExFat | Self::Ntfs | Self::Cifs
        )
    }

    /// Network filesystem kinds requiring a runtime write-probe before
    /// trusting `supports_ownership`.
    pub fn is_network(self) -> bool {
        matches!(self, Self::Nfs | Self::Nfs4 | Self::Cifs)
    }
}

/// Per-path capability snapshot produced by [`crate::fsdetect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub kind: FilesystemKind,
    pub mount_point: PathBuf,
    pub device: String,
    pub supports_ownership: bool,
    pub is_network_fs: bool,
}

impl FilesystemInfo {
    pub fn unknown(mount_point: PathBuf) -> Self {
        Self {
            kind: FilesystemKind::Unknown,
            mount_point,
            device: String::new(),
            supports_ownership: false,
            is_network_fs: false,
        }
    }
}

/// Retention policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicyKind {
    Simple,
    Gfs,
}

/// Retention configuration consumed by every backend's `apply_retention`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub policy: RetentionPolicyKind,
    /// Simple policy: 0 disables retention.
    pub max_backups: i64,
    /// GFS tier limits.
    pub daily: i64,
    pub weekly: i64,
    pub monthly: i64,
    /// `0` means "keep all prior years"; negative disables the yearly tier.
    pub yearly: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            policy: RetentionPolicyKind::Simple,
            max_backups: 0,
            daily: 7,
            weekly: 4,
            monthly: 12,
            yearly: 0,
        }
    }
}

impl RetentionConfig {
    /// Enforce GFS invariants: when `policy=gfs` and `daily<=0`, force
    /// `daily=1`, logging the adjustment.
    pub fn normalized(mut self) -> Self {
        if self.policy == RetentionPolicyKind::Gfs && self.daily <= 0 {
            tracing::info!(
                old_daily = self.daily,
                "retention config: forcing daily=1 for gfs policy"
            );
            self.daily = 1;
        }
        self
    }
}

/// Classification assigned to each archive by the GFS classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionCategory {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Delete,
}

/// Outcome of the last retention pass run against a backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetentionSummary {
    pub backups_deleted: u64,
    pub backups_remaining: u64,
    pub logs_deleted: u64,
    pub logs_remaining: u64,
    pub has_log_info: bool,
}

/// Capacity triple plus aggregate archive stats reported by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_backups: u64,
    pub total_size: u64,
    pub oldest_backup: Option<DateTime<Utc>>,
    pub newest_backup: Option<DateTime<Utc>>,
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub filesystem_type: Option<FilesystemKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_kind_aliases() {
        assert_eq!(FilesystemKind::parse("FAT32"), FilesystemKind::Vfat);
        assert_eq!(FilesystemKind::parse("fat16"), FilesystemKind::Fat);
        assert_eq!(FilesystemKind::parse("NTFS-3G"), FilesystemKind::Ntfs);
        assert_eq!(FilesystemKind::parse("fuse.sshfs"), FilesystemKind::Fuse);
        assert_eq!(FilesystemKind::parse("smbfs"), FilesystemKind::Cifs);
        assert_eq!(FilesystemKind::parse("made-up-fs"), FilesystemKind::Unknown);
    }

    #[test]
    fn gfs_normalization_forces_daily() {
        let cfg = RetentionConfig {
            policy: RetentionPolicyKind::Gfs,
            daily: -5,
            ..RetentionConfig::default()
        }
        .normalized();
        assert_eq!(cfg.daily, 1);
    }

    #[test]
    fn simple_policy_untouched_by_normalization() {
        let cfg = RetentionConfig {
            policy: RetentionPolicyKind::Simple,
            max_backups: 0,
            ..RetentionConfig::default()
        }
        .normalized();
        assert_eq!(cfg.max_backups, 0);
    }
}
