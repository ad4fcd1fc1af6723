//! Filesystem-type detection and ownership-capability probing.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::model::{FilesystemInfo, FilesystemKind};

/// A single parsed mount-table entry (one line of `/proc/mounts`).
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Un-escape octal escapes (`\NNN`) found in `/proc/mounts` fields, which the
/// kernel uses to encode spaces, tabs, newlines, and backslashes in mount
/// paths.
pub fn unescape_octal(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let maybe_octal = &raw[i + 1..i + 4];
            if maybe_octal.chars().all(|c| ('0'..='7').contains(&c)) {
                if let Ok(value) = u8::from_str_radix(maybe_octal, 8) {
                    out.push(value as char);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Parse the contents of a Linux mount table (`/proc/mounts` format: `device
/// mount_point fs_type options dump pass`).
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn read_mount_table() -> std::io::Result<String> {
    std::fs::read_to_string("/proc/mounts")
}

/// Select the entry whose mount point is the longest prefix of `path`.
pub fn longest_prefix_match<'a>(
    entries: &'a [MountEntry],
    path: &Path,
) -> Option<&'a MountEntry> {
    entries
        .iter()
        .filter(|e| path.starts_with(&e.mount_point))
        .max_by_key(|e| e.mount_point.as_os_str().len())
}

/// Hooks overridable in tests: injectable function pointers standing in for
/// the real filesystem probes (mount lookup, kind lookup, ownership probe).
pub struct DetectHooks {
    pub read_mount_table: fn() -> std::io::Result<String>,
    pub kind_lookup: fn(&str) -> FilesystemKind,
    pub probe_ownership: fn(&Path) -> std::io::Result<bool>,
}

impl Default for DetectHooks {
    fn default() -> Self {
        Self {
            read_mount_table,
            kind_lookup: FilesystemKind::parse,
            probe_ownership: probe_ownership_support,
        }
    }
}

/// Detect the filesystem backing `path`. Requires `path` to exist.
pub async fn detect_filesystem(
    ct: &CancellationToken,
    path: &Path,
) -> Result<FilesystemInfo, anyhow::Error> {
    detect_filesystem_with_hooks(ct, path, &DetectHooks::default()).await
}

pub async fn detect_filesystem_with_hooks(
    ct: &CancellationToken,
    path: &Path,
    hooks: &DetectHooks,
) -> Result<FilesystemInfo, anyhow::Error> {
    if ct.is_cancelled() {
        anyhow::bail!("operation cancelled");
    }
    if !path.exists() {
        anyhow::bail!("path does not exist: {}", path.display());
    }

    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let contents = (hooks.read_mount_table)()?;
    let entries = parse_mount_table(&contents);
    let entry = longest_prefix_match(&entries, &absolute)
        .ok_or_else(|| anyhow::anyhow!("no mount entry found for {}", absolute.display()))?;

    let kind = (hooks.kind_lookup)(&entry.fs_type);
    let mut supports_ownership = kind.is_posix_family();
    let is_network = kind.is_network();

    if kind.is_auto_excluded() {
        tracing::debug!(
            path = %path.display(),
            kind = ?kind,
            "ownership operations will be skipped on this filesystem"
        );
        supports_ownership = false;
    } else if is_network {
        supports_ownership = (hooks.probe_ownership)(&absolute).unwrap_or(false);
    }

    Ok(FilesystemInfo {
        kind,
        mount_point: entry.mount_point.clone(),
        device: entry.device.clone(),
        supports_ownership,
        is_network_fs: is_network,
    })
}

/// Write-probe used for network filesystems: create a uniquely-named file,
/// chown it to the current uid/gid, chmod 0600, then verify the mode
/// round-tripped.
fn probe_ownership_support(dir: &Path) -> std::io::Result<bool> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let probe_path = dir.join(format!(".fsdetect-probe-{now}"));
    std::fs::write(&probe_path, b"")?;

    let result = (|| -> std::io::Result<bool> {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        nix::unistd::chown(&probe_path, Some(uid), Some(gid))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        std::fs::set_permissions(&probe_path, std::fs::Permissions::from_mode(0o600))?;
        let mode = std::fs::metadata(&probe_path)?.permissions().mode() & 0o777;
        Ok(mode == 0o600)
    })();

    let _ = std::fs::remove_file(&probe_path);
    result
}

/// Apply ownership/permissions to `path`, gated on
/// `info.supports_ownership`. `chown` failure is a warning (continue);
/// `chmod` failure is fatal to the call.
pub fn set_permissions(
    path: &Path,
    uid: u32,
    gid: u32,
    mode: u32,
    info: &FilesystemInfo,
) -> Result<(), anyhow::Error> {
    if !info.supports_ownership {
        return Ok(());
    }

    if let Err(e) = nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    ) {
        tracing::warn!(path = %path.display(), error = %e, "chown failed, continuing");
    }

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| anyhow::anyhow!("chmod {} failed: {e}", path.display()))
}
