//! One-shot command execution

use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long an interrupted command gets before it is killed
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Error type for helper command execution
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{action} failed ({cmd}): exit code {code:?}: {stderr}")]
    Failed {
        action: String,
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{action} timed out after {after:?} ({cmd})")]
    Timeout {
        action: String,
        cmd: String,
        after: Duration,
    },
}

impl ExecError {
    /// Build a failure for a command that exited non-zero
    pub fn failed(
        action: impl Into<String>,
        cmd: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::Failed {
            action: action.into(),
            cmd: cmd.into(),
            code,
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<ExecError> for castle_common::Error {
    fn from(e: ExecError) -> Self {
        match &e {
            ExecError::Failed { code, stderr, .. } => {
                Self::process_failed(e.to_string(), *code, stderr.clone())
            }
            ExecError::Timeout { .. } => Self::timeout(e.to_string()),
            ExecError::Spawn { .. } => Self::external(e.to_string()),
        }
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Collect command arguments into owned strings
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Render a command line for logs and errors
#[must_use]
pub fn command_line(cmd: &str, args: &[String]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{cmd} {}", args.join(" "))
    }
}

/// Runs helper commands to completion
///
/// `action` is a short human description used in logs and errors
/// (e.g. "zap sdb").
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run and discard output
    async fn execute(&self, action: &str, cmd: &str, args: &[String]) -> ExecResult<()>;

    /// Run and return stdout
    async fn execute_with_output(
        &self,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String>;

    /// Run and return stdout followed by stderr
    async fn execute_with_combined_output(
        &self,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String>;

    /// Run with a deadline; on expiry the command is interrupted, then killed
    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String>;
}

/// [`Executor`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn output(action: &str, cmd: &str, args: &[String]) -> ExecResult<(String, String)> {
        let line = command_line(cmd, args);
        debug!("Running {}: {}", action, line);
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                cmd: line.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ExecError::failed(action, line, output.status.code(), stderr));
        }
        Ok((stdout, stderr))
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        crate::process::send_signal(pid, Some(Signal::SIGINT));
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, action: &str, cmd: &str, args: &[String]) -> ExecResult<()> {
        Self::output(action, cmd, args).await.map(|_| ())
    }

    async fn execute_with_output(
        &self,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String> {
        Self::output(action, cmd, args).await.map(|(out, _)| out)
    }

    async fn execute_with_combined_output(
        &self,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String> {
        Self::output(action, cmd, args)
            .await
            .map(|(out, err)| format!("{out}{err}"))
    }

    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        action: &str,
        cmd: &str,
        args: &[String],
    ) -> ExecResult<String> {
        let line = command_line(cmd, args);
        debug!("Running {} with timeout {:?}: {}", action, timeout, line);
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                cmd: line.clone(),
                source,
            })?;
        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ExecError::Spawn {
                cmd: line.clone(),
                source,
            })?,
            () = tokio::time::sleep(timeout) => {
                warn!("{} timed out after {:?}, interrupting", action, timeout);
                interrupt(&child);
                if tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
                return Err(ExecError::Timeout {
                    action: action.to_string(),
                    cmd: line,
                    after: timeout,
                });
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(ExecError::failed(action, line, status.code(), stderr));
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_with_output() {
        let exec = CommandExecutor::new();
        let out = exec
            .execute_with_output("echo", "echo", &args(["hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_failure_keeps_exit_code_and_stderr() {
        let exec = CommandExecutor::new();
        let err = exec
            .execute("fail", "sh", &args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        let common: castle_common::Error = err.into();
        assert_eq!(common.exit_code(), Some(3));
        assert!(common.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_combined_output() {
        let exec = CommandExecutor::new();
        let out = exec
            .execute_with_combined_output("mixed", "sh", &args(["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert!(out.contains("out") && out.contains("err"));
    }

    #[tokio::test]
    async fn test_timeout_interrupts() {
        let exec = CommandExecutor::new();
        let err = exec
            .execute_with_timeout(Duration::from_millis(100), "sleep", "sleep", &args(["30"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let exec = CommandExecutor::new();
        let err = exec
            .execute("missing", "/nonexistent/castle-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
