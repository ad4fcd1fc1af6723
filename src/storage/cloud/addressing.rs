//! Remote address composition and path sanitization.

/// `cloud_remote` may carry an embedded prefix (`remote:base/path`);
/// `cloud_remote_path` is an optional additional prefix. Both compose into
/// one `remote_prefix`, trimmed of leading/trailing slashes.
#[derive(Debug, Clone)]
pub struct RemoteAddress {
    pub remote_name: String,
    pub prefix: String,
}

impl RemoteAddress {
    pub fn new(cloud_remote: &str, cloud_remote_path: &str) -> Self {
        let (remote_name, embedded_prefix) = match cloud_remote.split_once(':') {
            Some((name, rest)) => (name.to_string(), rest.to_string()),
            None => (cloud_remote.to_string(), String::new()),
        };

        let mut parts = Vec::new();
        if !embedded_prefix.trim_matches('/').is_empty() {
            parts.push(embedded_prefix.trim_matches('/').to_string());
        }
        if !cloud_remote_path.trim_matches('/').is_empty() {
            parts.push(cloud_remote_path.trim_matches('/').to_string());
        }

        Self {
            remote_name,
            prefix: parts.join("/"),
        }
    }

    /// `remote:`
    pub fn remote_root(&self) -> String {
        format!("{}:", self.remote_name)
    }

    /// `remote:[prefix]`
    pub fn remote_base(&self) -> String {
        if self.prefix.is_empty() {
            self.remote_root()
        } else {
            format!("{}:{}", self.remote_name, self.prefix)
        }
    }

    /// `remote:[prefix/]name`, with `name` sanitized against `..` traversal.
    pub fn remote_path_for(&self, name: &str) -> String {
        let safe = sanitize_name(name);
        if self.prefix.is_empty() {
            format!("{}:{}", self.remote_name, safe)
        } else {
            format!("{}:{}/{}", self.remote_name, self.prefix, safe)
        }
    }

    /// Parent remote ref of `reference` (a full `remote:path/name` string).
    pub fn remote_dir_ref(&self, reference: &str) -> String {
        match reference.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => self.remote_root(),
        }
    }
}

/// Reject `..`-based traversal by collapsing such inputs to their basename.
/// Also strips a leading `./` or `/`.
pub fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim_start_matches("./").trim_start_matches('/');
    if trimmed.split('/').any(|seg| seg == "..") {
        std::path::Path::new(trimmed)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        trimmed.to_string()
    }
}
