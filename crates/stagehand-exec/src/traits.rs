//! Executor bearer trait

use async_trait::async_trait;

use crate::error::ExecError;
use crate::output::{CommandOutput, RunOptions};

/// One execution backend: somewhere commands run and files are staged.
///
/// Implementations own their connection or resource state and translate
/// backend results into [`CommandOutput`] / [`ExecError`] themselves.
/// Operations on one bearer complete in call order; a bearer is not meant to
/// be shared between concurrent callers.
#[async_trait]
pub trait ExecutorBearer: Send + Sync {
    /// Run `cmd` on the backend.
    ///
    /// Returns captured output when the command exits zero, or when it exits
    /// nonzero and `options.tolerate_err` is set.
    async fn run_cmd(
        &self,
        cmd: &str,
        options: RunOptions<'_>,
    ) -> Result<CommandOutput, ExecError>;

    /// Run `cmd` with default options
    async fn run(&self, cmd: &str) -> Result<CommandOutput, ExecError> {
        self.run_cmd(cmd, RunOptions::default()).await
    }

    /// Stage `data` as `/tmp/<filename>` where later commands can read it
    async fn add_file(&self, data: &str, filename: &str) -> Result<(), ExecError>;

    /// Prepare the target environment
    async fn acquire(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    /// Tear down whatever `acquire` set up
    async fn release(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    /// Start tearing down whatever `acquire` set up without waiting for it.
    ///
    /// Called instead of `release` when a scope is dropped part way, for
    /// example when the caller's future is cancelled by a timeout.
    fn abandon(&mut self) {}

    /// Get bearer type name
    fn bearer_type(&self) -> &'static str;
}
