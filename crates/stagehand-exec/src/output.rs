//! Run options, raw completions and captured command output

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Directory every bearer stages files into
pub const STAGING_DIR: &str = "/tmp";

/// Permissions of every staged file; staged files often hold credentials
pub const STAGED_FILE_MODE: u32 = 0o600;

/// Message used when a failing command carries no caller-supplied message
pub const DEFAULT_ERR_MSG: &str = "An error has occurred when executing a command.";

/// Path a file named `filename` is staged at on any bearer
#[must_use]
pub fn staged_path(filename: &str) -> String {
    format!("{STAGING_DIR}/{filename}")
}

/// Per-call options for `run_cmd`
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions<'a> {
    /// Text written to the command's standard input
    pub stdin: Option<&'a str>,
    /// Return output instead of failing on nonzero status
    pub tolerate_err: bool,
    /// Message carried by the failure if the command exits nonzero
    pub err_msg: Option<&'a str>,
}

impl<'a> RunOptions<'a> {
    /// Options with no stdin, strict failure and the default message
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `stdin` to the command
    #[must_use]
    pub fn stdin(mut self, stdin: &'a str) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Treat nonzero completion as non-exceptional
    #[must_use]
    pub fn tolerate_err(mut self) -> Self {
        self.tolerate_err = true;
        self
    }

    /// Use a custom failure message
    #[must_use]
    pub fn err_msg(mut self, err_msg: &'a str) -> Self {
        self.err_msg = Some(err_msg);
        self
    }
}

/// Captured output of a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
}

impl CommandOutput {
    /// Create output from captured streams
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Split into `(stdout, stderr)`
    #[must_use]
    pub fn into_pair(self) -> (String, String) {
        (self.stdout, self.stderr)
    }
}

/// What a backend reported when a command finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Exit status code (0 for success)
    pub status: i64,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
}

impl Completion {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Classify the completion according to `options`.
    ///
    /// Output is returned unchanged on success or when the caller tolerates
    /// failure; otherwise the completion becomes `ExecError::CommandFailed`.
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` on untolerated nonzero status
    pub fn into_output(self, cmd: &str, options: &RunOptions<'_>) -> Result<CommandOutput, ExecError> {
        if self.success() {
            return Ok(CommandOutput::new(self.stdout, self.stderr));
        }

        if options.tolerate_err {
            tracing::debug!(
                command = %cmd,
                status = self.status,
                "tolerating command failure"
            );
            return Ok(CommandOutput::new(self.stdout, self.stderr));
        }

        tracing::error!(
            command = %cmd,
            status = self.status,
            stderr = %self.stderr,
            "command failed"
        );

        Err(ExecError::CommandFailed {
            message: options.err_msg.unwrap_or(DEFAULT_ERR_MSG).to_string(),
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}
