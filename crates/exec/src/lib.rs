// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! sentinel-exec: subprocess execution primitives shared by every adapter
//! that shells out to an external tool (git, compose, systemctl, file,
//! arduino-cli).
//!
//! This intentionally does not parse or interpret shell syntax — every
//! caller passes a fixed argv vector. Each invocation gets its own tracing
//! span with structured fields so a failure is attributable without the
//! caller repeating that boilerplate.

use std::path::Path;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::Instrument;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{0}`: {1}")]
    SpawnFailed(String, #[source] std::io::Error),
    #[error("`{command}` exited with status {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("`{0}` timed out after {1:?}")]
    TimedOut(String, Duration),
}

impl ExecError {
    pub fn stderr(&self) -> &str {
        match self {
            ExecError::NonZeroExit { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Captured output of a successful subprocess run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_std(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs a fixed argv vector as a subprocess, capturing stdout/stderr.
///
/// Every run opens an `info_span!("exec")` carrying `program`/`args` so
/// failures are attributable in logs without the caller repeating that
/// boilerplate.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    /// Default per-invocation timeout; `None` means no timeout.
    default_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Run `program args...` in `cwd` (or the current directory if `None`),
    /// returning an error on non-zero exit or timeout.
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecError> {
        self.run_timeout(program, args, cwd, self.default_timeout)
            .await
    }

    /// Run with an explicit timeout, overriding the runner's default.
    pub async fn run_timeout(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let command_line = format!("{program} {}", args.join(" "));
        async {
            tracing::debug!(program, ?args, "running");
            let mut cmd = Command::new(program);
            cmd.args(args);
            if let Some(dir) = cwd {
                cmd.current_dir(dir);
            }

            let fut = cmd.output();
            let output = match timeout {
                Some(d) => match tokio::time::timeout(d, fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(program, timeout = ?d, "timed out");
                        return Err(ExecError::TimedOut(command_line.clone(), d));
                    }
                },
                None => fut.await,
            }
            .map_err(|e| ExecError::SpawnFailed(command_line.clone(), e))?;

            if !output.status.success() {
                let code = output.status.code();
                let captured = CommandOutput::from_std(output);
                tracing::warn!(program, ?code, stderr = %captured.stderr, "exited non-zero");
                return Err(ExecError::NonZeroExit {
                    command: command_line.clone(),
                    code,
                    stdout: captured.stdout,
                    stderr: captured.stderr,
                });
            }

            Ok(CommandOutput::from_std(output))
        }
        .instrument(tracing::info_span!("exec", program))
        .await
    }

    /// Run with a fixed-backoff retry loop: `max_retries` additional
    /// attempts after the first failure, sleeping `backoff` between tries.
    pub async fn run_with_retry(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let mut attempt = 0;
        loop {
            match self.run(program, args, cwd).await {
                Ok(out) => return Ok(out),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(program, attempt, error = %e, "retrying after backoff");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let runner = CommandRunner::new();
        let out = runner.run("echo", &["hello"], None).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let runner = CommandRunner::new();
        let err = runner.run("false", &[], None).await.unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failed() {
        let runner = CommandRunner::new();
        let err = runner
            .run("definitely-not-a-real-binary", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SpawnFailed(_, _)));
    }

    #[tokio::test]
    async fn timeout_fires_before_long_command_finishes() {
        let runner = CommandRunner::new();
        let err = runner
            .run_timeout("sleep", &["5"], None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut(_, _)));
    }

    #[tokio::test]
    async fn retry_eventually_gives_up_and_surfaces_last_error() {
        let runner = CommandRunner::new();
        let start = std::time::Instant::now();
        let err = runner
            .run_with_retry("false", &[], None, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { .. }));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
