//! Command execution inside running containers.

use devcell_common::error::{DevcellError, Result};

/// Output from an exec command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i64,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Rejects an empty command line.
///
/// # Errors
///
/// Returns [`DevcellError::Validation`] if `command` is empty or its program
/// name is blank.
pub fn validate_command(command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(DevcellError::validation("exec command is empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        assert!(validate_command(&[]).is_err());
        assert!(validate_command(&[" ".into()]).is_err());
        assert!(validate_command(&["ls".into(), "-la".into()]).is_ok());
    }

    #[test]
    fn success_reflects_exit_code() {
        let out = ExecOutput {
            exit_code: 2,
            ..ExecOutput::default()
        };
        assert!(!out.success());
    }
}
