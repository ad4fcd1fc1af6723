//! Upload verification.

use super::addressing::RemoteAddress;
use super::exec::ExecHook;
use tokio_util::sync::CancellationToken;

/// Compare the uploaded object's size to `local_size` using the `primary`
/// method (`rclone lsl`), falling back to `alternative` (`rclone ls` +
/// linear scan) if `lsl` itself errors.
pub async fn verify_primary_then_alternative(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    remote_name: &str,
    local_size: u64,
) -> std::io::Result<bool> {
    match verify_primary(exec, addr, ct, remote_name, local_size).await {
        Ok(matched) => Ok(matched),
        Err(_) => verify_alternative(exec, addr, ct, remote_name, local_size).await,
    }
}

pub async fn verify_primary(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    remote_name: &str,
    local_size: u64,
) -> std::io::Result<bool> {
    let remote_path = addr.remote_path_for(remote_name);
    let out = exec(
        ct.clone(),
        "rclone".to_string(),
        vec!["lsl".to_string(), remote_path],
    )
    .await?;
    if !out.success {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, out.combined()));
    }
    let size = out
        .stdout
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok());
    Ok(size == Some(local_size))
}

pub async fn verify_alternative(
    exec: &ExecHook,
    addr: &RemoteAddress,
    ct: &CancellationToken,
    remote_name: &str,
    local_size: u64,
) -> std::io::Result<bool> {
    let remote_dir = addr.remote_dir_ref(&addr.remote_path_for(remote_name));
    let out = exec(
        ct.clone(),
        "rclone".to_string(),
        vec!["ls".to_string(), remote_dir],
    )
    .await?;
    if !out.success {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, out.combined()));
    }

    for line in out.stdout.lines() {
        let mut fields = line.split_whitespace();
        let size = fields.next().and_then(|s| s.parse::<u64>().ok());
        let name = fields.next();
        if name == Some(remote_name) {
            return Ok(size == Some(local_size));
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cloud::exec::test_support::{fail, ok, RecordingExec};

    fn addr() -> RemoteAddress {
        RemoteAddress::new("remote", "prefix")
    }

    #[tokio::test]
    async fn primary_matches_size() {
        let recorder = RecordingExec::new(vec![ok("   1024 2024-01-01 00:00:00 x.tar")]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let matched = verify_primary_then_alternative(&hook, &addr(), &ct, "x.tar", 1024)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn primary_error_falls_back_to_alternative() {
        let recorder = RecordingExec::new(vec![
            fail("some lsl error"),
            ok("1024 x.tar\n512 y.tar\n"),
        ]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let matched = verify_primary_then_alternative(&hook, &addr(), &ct, "x.tar", 1024)
            .await
            .unwrap();
        assert!(matched);
    }

    #[tokio::test]
    async fn size_mismatch_fails() {
        let recorder = RecordingExec::new(vec![ok("   999 2024-01-01 00:00:00 x.tar")]);
        let hook = recorder.hook();
        let ct = CancellationToken::new();
        let matched = verify_primary_then_alternative(&hook, &addr(), &ct, "x.tar", 1024)
            .await
            .unwrap();
        assert!(!matched);
    }
}
