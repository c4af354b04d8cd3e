//! Privileged host command execution.
//!
//! Every disk operation is a host tool (`truncate`, `mkfs.ext4`, `mount`,
//! ...) invoked with an explicit argument vector. Nothing is ever passed
//! through a shell, so user-derived path components cannot be interpreted
//! as shell syntax.
//!
//! Commands run under a per-call timeout. When the budget is exceeded the
//! caller gets [`DevcellError::Timeout`] and the child process is left
//! running to completion; it is never killed.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use devcell_common::config::HostConfig;
use devcell_common::error::{DevcellError, Result};

/// A single host command: program, arguments, and the step it implements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: &'static str,
    args: Vec<OsString>,
    step: &'static str,
    accepted: &'static [i32],
}

impl HostCommand {
    /// Creates a command for `program` labelled with the operation `step`.
    #[must_use]
    pub const fn new(program: &'static str, step: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
            step,
            accepted: &[0],
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Treats the given exit codes as success.
    ///
    /// `e2fsck` exits 1 or 2 after repairing a filesystem, which is still a
    /// usable outcome.
    #[must_use]
    pub const fn accept_exit_codes(mut self, codes: &'static [i32]) -> Self {
        self.accepted = codes;
        self
    }

    /// Program name.
    #[must_use]
    pub const fn program(&self) -> &'static str {
        self.program
    }

    /// Argument vector.
    #[must_use]
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Operation step, used in error messages.
    #[must_use]
    pub const fn step(&self) -> &'static str {
        self.step
    }

    /// Whether `code` counts as success.
    #[must_use]
    pub fn accepts(&self, code: Option<i32>) -> bool {
        code.is_some_and(|c| self.accepted.contains(&c))
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful, silent result.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// A successful result with the given standard output.
    #[must_use]
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::ok()
        }
    }

    /// A failed result with the given exit code and standard error.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Human-readable exit status.
    #[must_use]
    pub fn status_summary(&self) -> String {
        self.code.map_or_else(
            || "terminated by signal".to_string(),
            |c| format!("exit status {c}"),
        )
    }
}

/// Executes host commands.
///
/// Implementors provide [`HostRunner::execute`], which reports whatever
/// the command did. [`HostRunner::run`] layers the exit-status check on
/// top of it.
#[async_trait]
pub trait HostRunner: Send + Sync {
    /// Runs the command and returns its output regardless of exit status.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::DiskOp`] if the command cannot be spawned and
    /// [`DevcellError::Timeout`] if it exceeds its budget.
    async fn execute(&self, command: &HostCommand) -> Result<CommandOutput>;

    /// Runs the command and fails unless it exits with an accepted code.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::DiskOp`] naming the step on a rejected exit
    /// status, plus every error of [`HostRunner::execute`].
    async fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        let output = self.execute(command).await?;
        if command.accepts(output.code) {
            return Ok(output);
        }
        tracing::warn!(
            step = command.step(),
            command = %command,
            code = ?output.code,
            stderr = %output.stderr.trim(),
            "host command failed"
        );
        Err(DevcellError::DiskOp {
            step: command.step(),
            status: output.status_summary(),
        })
    }
}

/// Runs commands on the real host, elevating through `sudo -n` when needed.
#[derive(Debug, Clone)]
pub struct PrivilegedRunner {
    elevate: bool,
    timeout: Duration,
}

impl PrivilegedRunner {
    /// Creates a runner from the host configuration.
    ///
    /// Elevation is skipped when the process already runs as root.
    #[must_use]
    pub fn from_config(config: &HostConfig) -> Self {
        let elevate = config.sudo && !nix::unistd::geteuid().is_root();
        Self::new(elevate, config.command_timeout())
    }

    /// Creates a runner with explicit elevation and timeout.
    #[must_use]
    pub const fn new(elevate: bool, timeout: Duration) -> Self {
        Self { elevate, timeout }
    }

    fn build(&self, command: &HostCommand) -> tokio::process::Command {
        let mut process = if self.elevate {
            let mut sudo = tokio::process::Command::new("sudo");
            let _ = sudo.arg("-n").arg(command.program());
            sudo
        } else {
            tokio::process::Command::new(command.program())
        };
        let _ = process
            .args(command.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process
    }
}

#[async_trait]
impl HostRunner for PrivilegedRunner {
    async fn execute(&self, command: &HostCommand) -> Result<CommandOutput> {
        tracing::debug!(step = command.step(), command = %command, "running host command");
        let child = self
            .build(command)
            .spawn()
            .map_err(|e| DevcellError::DiskOp {
                step: command.step(),
                status: format!("cannot spawn {}: {e}", command.program()),
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(DevcellError::DiskOp {
                step: command.step(),
                status: format!("cannot collect output of {}: {e}", command.program()),
            }),
            Err(_) => {
                tracing::warn!(
                    step = command.step(),
                    command = %command,
                    timeout_secs = self.timeout.as_secs(),
                    "host command exceeded its budget and keeps running in the background"
                );
                Err(DevcellError::Timeout {
                    operation: command.program().to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

/// Host tools the disk image manager depends on.
pub const REQUIRED_TOOLS: &[&str] = &[
    "truncate",
    "mkfs.ext4",
    "mount",
    "umount",
    "findmnt",
    "losetup",
    "resize2fs",
    "e2fsck",
    "chown",
    "stat",
    "df",
    "cp",
    "mv",
    "rm",
    "mkdir",
];

/// Lists the required host tools that are not on `PATH`.
///
/// `sudo` is included when `elevate` is set.
#[must_use]
pub fn missing_tools(elevate: bool) -> Vec<&'static str> {
    let sudo: &[&'static str] = if elevate { &["sudo"] } else { &[] };
    REQUIRED_TOOLS
        .iter()
        .chain(sudo)
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_arguments() {
        let cmd = HostCommand::new("mount", "mount image")
            .args(["-o", "loop"])
            .arg("/data/ssd/containers/alice/workspace.img");
        assert_eq!(
            cmd.to_string(),
            "mount -o loop /data/ssd/containers/alice/workspace.img"
        );
    }

    #[test]
    fn accepted_codes_default_to_zero() {
        let cmd = HostCommand::new("e2fsck", "check filesystem");
        assert!(cmd.accepts(Some(0)));
        assert!(!cmd.accepts(Some(1)));
        assert!(!cmd.accepts(None));
        let lenient = cmd.accept_exit_codes(&[0, 1, 2]);
        assert!(lenient.accepts(Some(2)));
    }

    #[tokio::test]
    async fn runner_captures_stdout() {
        let runner = PrivilegedRunner::new(false, Duration::from_secs(5));
        let out = runner
            .run(&HostCommand::new("echo", "echo").arg("hello"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_maps_to_disk_op_error() {
        let runner = PrivilegedRunner::new(false, Duration::from_secs(5));
        let err = runner
            .run(&HostCommand::new("false", "probe"))
            .await
            .unwrap_err();
        assert!(matches!(err, DevcellError::DiskOp { step: "probe", .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let runner = PrivilegedRunner::new(false, Duration::from_secs(5));
        let err = runner
            .execute(&HostCommand::new("devcell-no-such-tool", "probe"))
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "DISK_OP_ERROR");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let runner = PrivilegedRunner::new(false, Duration::from_millis(100));
        let err = runner
            .execute(&HostCommand::new("sleep", "sleep").arg("2"))
            .await
            .unwrap_err();
        assert!(matches!(err, DevcellError::Timeout { .. }));
    }
}
