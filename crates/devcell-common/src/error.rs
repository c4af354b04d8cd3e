//! Unified error types for the devcell workspace.
//!
//! Every crate returns [`DevcellError`]. The variants follow the lifecycle
//! taxonomy that the API layer maps onto HTTP status codes: client errors
//! (validation, conflicts, missing records) versus server errors (runtime,
//! disk, store, timeouts). Use [`DevcellError::tag`] to keep the taxonomy
//! tag in user-facing messages.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::ContainerStatus;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DevcellError {
    /// Input failed validation (out-of-range quota, malformed username).
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// A resource that must be unique already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Every port in the configured SSH range is taken.
    #[error("no free SSH port in range {min}-{max}")]
    PortExhaustion {
        /// Lowest port of the range.
        min: u16,
        /// Highest port of the range.
        max: u16,
    },

    /// The container runtime rejected or failed an operation.
    #[error("container runtime failed to {operation}: {message}")]
    Runtime {
        /// Operation that failed (`create`, `start`, ...).
        operation: &'static str,
        /// Runtime-provided failure description.
        message: String,
    },

    /// A privileged host command failed.
    ///
    /// Only the step and exit status are carried here. Command stderr is
    /// logged for operators and never reaches this message.
    #[error("disk operation failed at step '{step}': {status}")]
    DiskOp {
        /// The step that failed (`format image`, `mount image`, ...).
        step: &'static str,
        /// Exit status or spawn failure summary.
        status: String,
    },

    /// A storage quota change cannot be applied.
    #[error("invalid quota change: {message}")]
    Quota {
        /// Why the resize target was refused.
        message: String,
    },

    /// The operation requires a running container.
    #[error("container for user {user_id} is not running")]
    NotRunning {
        /// Owner of the container.
        user_id: String,
    },

    /// An operation did not finish within its time budget.
    ///
    /// The underlying host or runtime operation may still be running.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Budget that was exceeded.
        after: Duration,
    },

    /// A container record was asked to make a forbidden status change.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: ContainerStatus,
        /// Requested status.
        to: ContainerStatus,
    },

    /// The state store failed.
    #[error("state store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl DevcellError {
    /// Returns the stable taxonomy tag for this error.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::InvalidTransition { .. } => "VALIDATION_ERROR",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::PortExhaustion { .. } => "PORT_EXHAUSTION",
            Self::Runtime { .. } => "RUNTIME_ERROR",
            Self::DiskOp { .. } => "DISK_OP_ERROR",
            Self::Quota { .. } => "QUOTA_ERROR",
            Self::NotRunning { .. } => "NOT_RUNNING",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Store { .. } | Self::Io { .. } | Self::Serialization { .. } => "INTERNAL_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }

    /// Whether the caller is at fault (4xx) rather than the host (5xx).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::InvalidTransition { .. }
                | Self::AlreadyExists { .. }
                | Self::NotFound { .. }
                | Self::Quota { .. }
                | Self::NotRunning { .. }
        )
    }

    /// Shorthand for a [`DevcellError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`DevcellError::Store`].
    pub fn store(message: impl std::fmt::Display) -> Self {
        Self::Store {
            message: message.to_string(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DevcellError>;
