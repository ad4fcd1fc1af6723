//! Per-archive manifest loading from sidecars or bundle tarballs.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BackupMetadata, CompressionKind, ProxmoxFlavor};

/// On-disk JSON manifest shape written alongside (or bundled with) an
/// archive. All fields are optional; absent ones fall back to `stat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub timestamp: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub flavor: Option<ProxmoxFlavor>,
    pub compression: Option<CompressionKind>,
    pub producer_version: Option<String>,
}

/// Load the manifest for local archive path `archive`:
/// - if `archive` ends in `.bundle.tar`, read the `.metadata` entry from
///   inside it;
/// - else, if bundling is enabled and `archive+".bundle.tar"` exists, read
///   from that bundle;
/// - else read the `.metadata` sidecar directly.
pub fn load_manifest(archive: &Path, bundles_enabled: bool) -> Result<Manifest, anyhow::Error> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if let Some(base_name) = name.strip_suffix(".bundle.tar") {
        return load_from_bundle(archive, base_name);
    }

    let bundle_path = archive.with_file_name(format!("{name}.bundle.tar"));
    if bundles_enabled && bundle_path.exists() {
        return load_from_bundle(&bundle_path, &name);
    }

    let sidecar_path = archive.with_file_name(format!("{name}.metadata"));
    let contents = std::fs::read(&sidecar_path)?;
    Ok(serde_json::from_slice(&contents)?)
}

fn load_from_bundle(bundle_path: &Path, base_name: &str) -> Result<Manifest, anyhow::Error> {
    let wanted = format!("{base_name}.metadata");
    let file = File::open(bundle_path)?;
    let mut archive = tar::Archive::new(file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_name = entry
            .path()?
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if entry_name == wanted {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(serde_json::from_slice(&contents)?);
        }
    }

    anyhow::bail!("no {wanted} entry found in bundle {}", bundle_path.display())
}

/// Build [`BackupMetadata`] for `archive`, preferring manifest-derived
/// fields and substituting `stat`-derived `timestamp`/`size` when the
/// manifest is missing or partial. Callers are expected to fall back to a
/// minimal `stat`-only record when this returns `Err`.
pub fn metadata_for_archive(
    archive: &Path,
    reference: &str,
    bundles_enabled: bool,
) -> Result<BackupMetadata, anyhow::Error> {
    let stat = std::fs::metadata(archive)?;
    let stat_mtime: DateTime<Utc> = stat.modified()?.into();
    let stat_size = stat.len();

    let manifest = load_manifest(archive, bundles_enabled).unwrap_or_default();

    Ok(BackupMetadata {
        reference: reference.to_string(),
        timestamp: manifest.timestamp.unwrap_or(stat_mtime),
        size: manifest.size.unwrap_or(stat_size),
        checksum: manifest.checksum,
        flavor: manifest.flavor,
        compression: manifest.compression,
        producer_version: manifest.producer_version,
    })
}

/// Synthesize minimal metadata purely from `stat`, used when no manifest is
/// available at all.
pub fn synthesize_from_stat(archive: &Path, reference: &str) -> Result<BackupMetadata, anyhow::Error> {
    let stat = std::fs::metadata(archive)?;
    Ok(BackupMetadata {
        reference: reference.to_string(),
        timestamp: stat.modified()?.into(),
        size: stat.len(),
        checksum: None,
        flavor: None,
        compression: None,
        producer_version: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_sidecar_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("host-backup-20240101-000000.tar.zst");
        std::fs::write(&archive, b"data").unwrap();
        let sidecar = dir
            .path()
            .join("host-backup-20240101-000000.tar.zst.metadata");
        std::fs::write(&sidecar, br#"{"size": 4, "checksum": "abc"}"#).unwrap();

        let manifest = load_manifest(&archive, false).unwrap();
        assert_eq!(manifest.size, Some(4));
        assert_eq!(manifest.checksum.as_deref(), Some("abc"));
    }

    #[test]
    fn missing_manifest_falls_back_to_stat() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("host-backup-20240101-000000.tar.zst");
        std::fs::write(&archive, b"hello").unwrap();

        let meta = metadata_for_archive(&archive, "host-backup-20240101-000000.tar.zst", false)
            .unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.checksum.is_none());
    }

    #[test]
    fn load_manifest_from_bundle() {
        let dir = TempDir::new().unwrap();
        let bundle_path = dir
            .path()
            .join("host-backup-20240101-000000.tar.zst.bundle.tar");
        let file = File::create(&bundle_path).unwrap();
        let mut builder = tar::Builder::new(file);
        let data = br#"{"size": 10}"#;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                "host-backup-20240101-000000.tar.zst.metadata",
                &data[..],
            )
            .unwrap();
        builder.finish().unwrap();

        let manifest = load_manifest(&bundle_path, true).unwrap();
        assert_eq!(manifest.size, Some(10));
    }
}
