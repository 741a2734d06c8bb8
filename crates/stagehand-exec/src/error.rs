//! Error types for stagehand-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running commands or staging files on a bearer
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Command completed with a nonzero status and the failure was not tolerated
    #[error("{message} [exit status: {status}] STDOUT: '{stdout}', STDERR: '{stderr}'")]
    CommandFailed {
        /// Caller-supplied or default failure message
        message: String,
        /// Exit status reported by the backend
        status: i64,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// File could not be placed on the target; no command was attempted
    #[error("failed to stage {path}: {reason}")]
    StagingFailed {
        /// Destination path on the target
        path: String,
        /// Backend-specific reason
        reason: String,
    },

    /// Invalid or incomplete configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server presented a host key that the trust policy does not admit
    #[error("host key for {host} rejected")]
    HostKeyRejected {
        /// Host that presented the key
        host: String,
    },

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Container runtime API error
    #[error("container runtime error: {0}")]
    RuntimeError(String),

    /// Operation needs a live resource but the bearer was not acquired
    #[error("bearer not acquired")]
    NotAcquired,

    /// Operation timed out
    #[error("operation timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },
}

impl ExecError {
    /// Exit status of a failed command, if this is a command failure
    #[must_use]
    pub fn exit_status(&self) -> Option<i64> {
        match self {
            ExecError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::IoError(e.to_string())
    }
}
