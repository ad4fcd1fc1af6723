//! Context-aware process execution, the seam between the cloud backend and
//! an external `rclone`-compatible binary.

use std::process::Stdio;

use tokio_util::sync::CancellationToken;

/// Combined stdout+stderr and exit status of one process invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl ExecOutput {
    /// stdout and stderr concatenated, used by the substring classifiers in
    /// / which don't care which stream a message landed on.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// The exec hook signature every cloud backend is constructed with.
/// Boxed so `CloudStorage` can hold either the real `tokio::process::Command`
/// wrapper below or a recording fake in tests.
pub type ExecHook = std::sync::Arc<
    dyn Fn(
            CancellationToken,
            String,
            Vec<String>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = std::io::Result<ExecOutput>> + Send>,
        > + Send
        + Sync,
>;

/// Default hook: spawns `rclone` (or whatever binary name is configured)
/// via `tokio::process::Command`, racing completion against the
/// cancellation token.
pub fn spawn_process_hook(binary: String) -> ExecHook {
    std::sync::Arc::new(move |ct, _program_ignored, args| {
        let binary = binary.clone();
        Box::pin(async move { run_process(&binary, &args, &ct).await })
    })
}

async fn run_process(
    binary: &str,
    args: &[String],
    ct: &CancellationToken,
) -> std::io::Result<ExecOutput> {
    if ct.is_cancelled() {
        return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "process cancelled"));
    }

    let mut child = tokio::process::Command::new(binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    tokio::select! {
        _ = ct.cancelled() => {
            let _ = child.start_kill();
            Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "process cancelled"))
        }
        status = child.wait() => {
            let status = status?;
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut out, &mut stdout_buf).await;
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut err, &mut stderr_buf).await;
            }
            Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                success: status.success(),
            })
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A recording fake exec hook: returns canned responses keyed by the
    /// joined argument vector's first two tokens (subcommand + first arg),
    /// and records every invocation for assertions.
    pub struct RecordingExec {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub responses: Mutex<Vec<std::io::Result<ExecOutput>>>,
    }

    impl RecordingExec {
        pub fn new(responses: Vec<std::io::Result<ExecOutput>>) -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            })
        }

        pub fn hook(self: &std::sync::Arc<Self>) -> ExecHook {
            let this = self.clone();
            std::sync::Arc::new(move |_ct, _program, args| {
                let this = this.clone();
                Box::pin(async move {
                    this.calls.lock().unwrap().push(args);
                    let mut responses = this.responses.lock().unwrap();
                    if responses.is_empty() {
                        Ok(ExecOutput {
                            success: true,
                            ..Default::default()
                        })
                    } else {
                        responses.remove(0)
                    }
                })
            })
        }
    }

    pub fn ok(stdout: impl Into<String>) -> std::io::Result<ExecOutput> {
        Ok(ExecOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        })
    }

    pub fn fail(stderr: impl Into<String>) -> std::io::Result<ExecOutput> {
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        })
    }
}
