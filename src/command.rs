//! External command execution.
//!
//! Every external tool (`qemu-img`, `tar`, `genisoimage`, `virsh`) is invoked
//! through a [`CommandRunner`]. The production implementation spawns the
//! process with tokio and ties its lifetime to a [`CancellationToken`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// Default time a canceled process gets to exit after SIGTERM before SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Bytes written to the process stdin.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock limit. `None` or zero disables the timeout.
    pub timeout: Option<Duration>,
    /// Return stdout and stderr in one buffer.
    pub combined_output: bool,
}

impl CommandOptions {
    /// Options with no timeout, as used for long-running conversions.
    pub fn untimed() -> Self {
        Self::default()
    }

    /// Options with a timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output (or stdout followed by stderr in combined mode).
    pub stdout: Vec<u8>,
    /// Standard error (empty in combined mode).
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Stdout as lossy UTF-8.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// Cancelling `cancel` terminates the process and yields
    /// [`Error::Canceled`]. A nonzero exit yields [`Error::CommandFailed`]
    /// carrying stderr in the message and the captured stdout.
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        options: &CommandOptions,
    ) -> Result<CommandOutput>;
}

/// Render a command line for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// [`CommandRunner`] that spawns real processes with tokio.
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    grace_period: Duration,
}

impl TokioCommandRunner {
    /// Create a runner with the given SIGTERM-to-SIGKILL grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Canceled,
    TimedOut(Duration),
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        options: &CommandOptions,
    ) -> Result<CommandOutput> {
        let command_line = display_command(program, args);
        if cancel.is_cancelled() {
            return Err(Error::Canceled(format!("{} not started", program)));
        }

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        tracing::debug!(command = %command_line, "spawning command");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound(program.to_string())
            } else {
                Error::command_failed(&command_line, e.to_string())
            }
        })?;

        if let (Some(data), Some(mut stdin)) = (options.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    tracing::debug!(error = %e, "failed to write command stdin");
                }
            });
        }
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Canceled,
            after = deadline(options.effective_timeout()) => Outcome::TimedOut(after),
        };

        let status = match outcome {
            Outcome::Exited(status) => status?,
            Outcome::Canceled => {
                tracing::info!(command = %command_line, "terminating canceled command");
                terminate(&mut child, self.grace_period).await;
                return Err(Error::Canceled(format!("{} terminated", program)));
            }
            Outcome::TimedOut(after) => {
                tracing::warn!(command = %command_line, timeout = ?after, "terminating timed out command");
                terminate(&mut child, self.grace_period).await;
                return Err(Error::Timeout {
                    command: command_line,
                    after,
                });
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();
        let output = if options.combined_output {
            let mut combined = stdout;
            combined.extend_from_slice(&stderr);
            CommandOutput {
                stdout: combined,
                stderr: Vec::new(),
            }
        } else {
            CommandOutput { stdout, stderr }
        };

        if status.success() {
            return Ok(output);
        }

        let detail = if options.combined_output {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        };
        let message = if detail.is_empty() {
            format!("exited with {}", status)
        } else {
            format!("exited with {}: {}", status, detail)
        };
        Err(Error::CommandFailed {
            command: command_line,
            message,
            stdout: output.stdout,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "failed to read command output");
        }
    }
    buf
}

async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(after) => {
            tokio::time::sleep(after).await;
            after
        }
        None => std::future::pending().await,
    }
}

/// SIGTERM, then SIGKILL once `grace` has elapsed.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned and have not reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_display_command() {
        assert_eq!(
            display_command("tar", &args(&["-cf", "out.ova"])),
            "tar -cf out.ova"
        );
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        assert_eq!(CommandOptions::with_timeout(Duration::ZERO).effective_timeout(), None);
        assert_eq!(
            CommandOptions::with_timeout(Duration::from_secs(3)).effective_timeout(),
            Some(Duration::from_secs(3))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout() {
        let runner = TokioCommandRunner::default();
        let out = runner
            .run(
                &CancellationToken::new(),
                "sh",
                &args(&["-c", "printf hello"]),
                &CommandOptions::untimed(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout_lossy(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_includes_stderr_and_keeps_stdout() {
        let runner = TokioCommandRunner::default();
        let err = runner
            .run(
                &CancellationToken::new(),
                "sh",
                &args(&["-c", "printf partial; echo boom >&2; exit 3"]),
                &CommandOptions::untimed(),
            )
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { message, stdout, .. } => {
                assert!(message.contains("boom"), "message was {message}");
                assert_eq!(stdout, b"partial");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TokioCommandRunner::default();
        let options = CommandOptions {
            cwd: Some(dir.path().to_path_buf()),
            env: vec![("KVMGR_TEST".into(), "yes".into())],
            ..CommandOptions::default()
        };
        let out = runner
            .run(
                &CancellationToken::new(),
                "sh",
                &args(&["-c", "printf \"$KVMGR_TEST:$(pwd)\""]),
                &options,
            )
            .await
            .unwrap();
        let text = out.stdout_lossy();
        assert!(text.starts_with("yes:"));
        assert!(text.ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let runner = TokioCommandRunner::default();
        let options = CommandOptions {
            stdin: Some(b"from stdin".to_vec()),
            ..CommandOptions::default()
        };
        let out = runner
            .run(&CancellationToken::new(), "cat", &[], &options)
            .await
            .unwrap();
        assert_eq!(out.stdout, b"from stdin");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_terminates_process() {
        let runner = TokioCommandRunner::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = runner
            .run(&cancel, "sleep", &args(&["30"]), &CommandOptions::untimed())
            .await
            .unwrap_err();
        assert!(err.is_canceled(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_distinct_error() {
        let runner = TokioCommandRunner::new(Duration::from_millis(200));
        let err = runner
            .run(
                &CancellationToken::new(),
                "sleep",
                &args(&["30"]),
                &CommandOptions::with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = TokioCommandRunner::default();
        let err = runner
            .run(
                &CancellationToken::new(),
                "kvmgr-definitely-not-installed",
                &[],
                &CommandOptions::untimed(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandNotFound(_)), "unexpected error: {err}");
    }
}
