//! Derivation of an archive's associated sidecar/bundle/log paths.

const BUNDLE_SUFFIX: &str = ".bundle.tar";

/// Strip a trailing `.bundle.tar` suffix from `name`, returning the
/// resulting base and whether the suffix was present.
pub fn trim_bundle_suffix(name: &str) -> (String, bool) {
    match name.strip_suffix(BUNDLE_SUFFIX) {
        Some(base) => (base.to_string(), true),
        None => (name.to_string(), false),
    }
}

/// Ordered list of candidate paths associated with logical archive `base`:
/// `[base, base+".sha256", base+".metadata", base+".metadata.sha256",
/// base+".bundle.tar" (only if bundling is enabled)]`. Empty entries are
/// never produced since `base` is assumed non-empty.
pub fn build_backup_candidate_paths(base: &str, bundles_enabled: bool) -> Vec<String> {
    let mut out = vec![
        base.to_string(),
        format!("{base}.sha256"),
        format!("{base}.metadata"),
        format!("{base}.metadata.sha256"),
    ];
    if bundles_enabled {
        out.push(format!("{base}{BUNDLE_SUFFIX}"));
    }
    out.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Derive the log-file key for an archive reference: the basename
/// must contain the literal `-backup-` segment; the host is everything
/// before it, and the timestamp segment is everything from the segment up
/// to (but not including) the file extension. Returns `None` when the
/// basename doesn't match this shape (e.g. legacy `proxmox-backup-*`
/// archives, which were never log-linked — this is intentional, not a gap).
pub fn extract_log_key_from_backup(reference: &str) -> Option<String> {
    let basename = std::path::Path::new(reference)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| reference.to_string());
    let (base, _) = trim_bundle_suffix(&basename);

    const MARKER: &str = "-backup-";
    let marker_pos = base.find(MARKER)?;
    let host = &base[..marker_pos];
    if host.is_empty() {
        return None;
    }
    let rest = &base[marker_pos + MARKER.len()..];

    // The timestamp segment is the leading `yyyymmdd-HHMMSS` token, cut at
    // the first '.' (the start of the compression extension chain) or '_'.
    let ts_end = rest
        .find(|c: char| c == '.' || c == '_')
        .unwrap_or(rest.len());
    let timestamp = &rest[..ts_end];
    if timestamp.is_empty() {
        return None;
    }

    Some(format!("backup-{host}-{timestamp}.log"))
}

/// Compute the remaining archive count after `deleted_count` deletions from
/// an `initial_count` that may be unknown (`<0`).
pub fn compute_remaining(initial_count: i64, deleted_count: i64) -> (u64, bool) {
    if initial_count < 0 {
        return (0, false);
    }
    let remaining = (initial_count - deleted_count).max(0);
    (remaining as u64, true)
}
