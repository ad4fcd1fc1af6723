//! Remote listing and snapshot parsing.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::addressing::sanitize_name;
use crate::model::BackupMetadata;

#[derive(Debug, Clone)]
struct ParsedEntry {
    name: String,
    size: u64,
    timestamp: DateTime<Utc>,
}

/// Parse `rclone lsl` output (`SIZE DATE TIME NAME` per line) into the set
/// of all observed relative names (the remote snapshot) plus the subset
/// recognized as backup entries, sorted newest-first.
pub fn parse_listing(output: &str, bundles_enabled: bool) -> (HashSet<String>, Vec<BackupMetadata>) {
    let mut snapshot = HashSet::new();
    let mut entries = Vec::new();

    for line in output.lines() {
        if let Some(entry) = parse_line(line) {
            snapshot.insert(entry.name.clone());
            entries.push(entry);
        }
    }

    let mut backups: Vec<BackupMetadata> = entries
        .iter()
        .filter(|e| is_backup_entry(&e.name, &snapshot, bundles_enabled))
        .map(|e| BackupMetadata {
            reference: e.name.clone(),
            timestamp: e.timestamp,
            size: e.size,
            checksum: None,
            flavor: None,
            compression: None,
            producer_version: None,
        })
        .collect();

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    (snapshot, backups)
}

fn parse_line(line: &str) -> Option<ParsedEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut fields = line.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let date = fields.next()?;
    let time = fields.next()?;
    let name = fields.collect::<Vec<_>>().join(" ");

    let name = sanitize_name(&name);
    if name.is_empty() {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").ok()?;
    let timestamp = Utc.from_utc_datetime(&naive);

    Some(ParsedEntry { name, size, timestamp })
}

fn is_backup_entry(name: &str, snapshot: &HashSet<String>, bundles_enabled: bool) -> bool {
    let looks_like_backup = name.contains("-backup-") || name.starts_with("proxmox-backup-");
    if !looks_like_backup || !name.contains(".tar") {
        return false;
    }
    if name.ends_with(".sha256") || name.ends_with(".metadata") {
        return false;
    }
    if bundles_enabled {
        let bundle_name = format!("{name}.bundle.tar");
        if snapshot.contains(&bundle_name) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wellformed_lines() {
        let output = "     1024 2024-01-15 03:00:00 hostA-backup-20240115-030000.tar.zst\n\
                           512 2024-01-15 03:00:01 hostA-backup-20240115-030000.tar.zst.sha256\n";
        let (snapshot, backups) = parse_listing(output, false);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].size, 1024);
    }

    #[test]
    fn skips_unparseable_lines() {
        let output = "not a valid line\n1024 2024-01-15 03:00:00 host-backup-x.tar.zst\n";
        let (snapshot, backups) = parse_listing(output, false);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn bundle_hides_base_when_bundling_enabled() {
        let output = "1024 2024-01-15 03:00:00 host-backup-x.tar.zst\n\
                       2048 2024-01-15 03:00:01 host-backup-x.tar.zst.bundle.tar\n";
        let (_, backups) = parse_listing(output, true);
        assert!(backups.is_empty(), "base should be hidden behind its bundle");
    }

    #[test]
    fn newest_first_ordering() {
        let output = "1 2024-01-01 00:00:00 a-backup-1.tar\n2 2024-02-01 00:00:00 a-backup-2.tar\n";
        let (_, backups) = parse_listing(output, false);
        assert_eq!(backups[0].reference, "a-backup-2.tar");
        assert_eq!(backups[1].reference, "a-backup-1.tar");
    }
}
