//! Bounded subprocess execution.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{AuthorityError, AuthorityResult};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn a non-zero exit into [`AuthorityError::Command`].
    pub fn check(self, command: &str) -> AuthorityResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(AuthorityError::Command {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// `shown` is what appears in logs and errors, so callers pass a
/// rendering with secrets removed.
pub async fn run_bounded(
    mut cmd: Command,
    shown: &str,
    timeout: Duration,
) -> AuthorityResult<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(command = %shown, timeout_secs = timeout.as_secs(), "running command");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(AuthorityError::Timeout {
                command: shown.to_string(),
                secs: timeout.as_secs(),
            });
        }
        Ok(result) => result.map_err(|source| AuthorityError::Spawn {
            command: shown.to_string(),
            source,
        })?,
    };

    Ok(CommandOutput {
        success: output.status.success(),
        status: output.status.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_output() {
        let out = run_bounded(sh("echo hello; echo oops >&2"), "sh", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr, "oops");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_check() {
        let out = run_bounded(sh("exit 3"), "sh", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(matches!(out.check("sh"), Err(AuthorityError::Command { .. })));
    }

    #[tokio::test]
    async fn timeout_is_typed() {
        let err = run_bounded(sh("sleep 5"), "sleepy", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::Timeout { ref command, .. } if command == "sleepy"));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = run_bounded(
            Command::new("/nonexistent/binary"),
            "missing",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthorityError::Spawn { ref command, .. } if command == "missing"));
    }
}
