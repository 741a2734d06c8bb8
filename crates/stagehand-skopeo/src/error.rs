//! Error types for stagehand-skopeo

use stagehand_exec::ExecError;
use thiserror::Error;

/// Errors that can occur during skopeo operations
#[derive(Error, Debug, Clone)]
pub enum SkopeoError {
    /// Underlying bearer failed
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Credentials needed for the operation were not provided
    #[error("skopeo login credentials are not present for {registry}: user and token must be provided")]
    MissingCredentials {
        /// Registry the login was for
        registry: String,
    },

    /// Login command ran but did not report success
    #[error("login command didn't generate expected output. STDOUT: '{stdout}', STDERR: '{stderr}'")]
    LoginFailed {
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// Failed to parse command output
    #[error("parse error: {0}")]
    ParseError(String),

    /// Reference or argument cannot be passed through a shell
    #[error("invalid reference: {0}")]
    InvalidReference(String),
}
