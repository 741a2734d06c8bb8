//! Local command execution using `tokio::process`

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::ExecError;
use crate::output::{CommandOutput, Completion, RunOptions, staged_path};
use crate::traits::ExecutorBearer;

/// How one of the child's standard streams is wired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioMode {
    /// Captured through a pipe
    #[default]
    Piped,
    /// Connected to the null device
    Null,
    /// Inherited from this process
    Inherit,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
            StdioMode::Inherit => Stdio::inherit(),
        }
    }
}

/// Process-spawn options for the local bearer.
///
/// Defaults are text-mode pipes on stdin, stdout and stderr; any field given
/// in configuration overrides the default for that field only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Working directory for spawned commands
    pub current_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment
    pub env_clear: bool,
    /// stdin wiring
    pub stdin: StdioMode,
    /// stdout wiring
    pub stdout: StdioMode,
    /// stderr wiring
    pub stderr: StdioMode,
}

impl SpawnOptions {
    /// Set working directory
    #[must_use]
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Local executor bearer
///
/// Runs commands as child processes of this one. There is no external
/// resource, so acquire and release do nothing.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutorBearer {
    options: SpawnOptions,
}

impl LocalExecutorBearer {
    /// Create a new local bearer
    #[must_use]
    pub fn new(options: SpawnOptions) -> Self {
        Self { options }
    }

    /// Spawn options in effect
    pub fn params(&self) -> &SpawnOptions {
        &self.options
    }

    fn command(&self, cmd: &str) -> Result<Command, ExecError> {
        let argv = shlex::split(cmd)
            .ok_or_else(|| ExecError::ConfigError(format!("cannot tokenize command: {cmd}")))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::ConfigError("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(self.options.stdin.to_stdio())
            .stdout(self.options.stdout.to_stdio())
            .stderr(self.options.stderr.to_stdio())
            .kill_on_drop(true);

        if let Some(dir) = &self.options.current_dir {
            command.current_dir(dir);
        }
        if self.options.env_clear {
            command.env_clear();
        }
        command.envs(&self.options.env);

        Ok(command)
    }

    /// Internal method to execute command
    async fn execute(&self, cmd: &str, stdin: Option<&str>) -> Result<Completion, ExecError> {
        let mut child = self
            .command(cmd)?
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        // Feed stdin while output is drained so a chatty child cannot block us
        let stdin_pipe = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(data)) = (stdin_pipe, stdin) {
                pipe.write_all(data.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        if let Err(e) = fed
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }
        let output = output?;

        Ok(Completion {
            status: output.status.code().map_or(-1, i64::from),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl ExecutorBearer for LocalExecutorBearer {
    #[instrument(skip(self, options), level = "debug")]
    async fn run_cmd(
        &self,
        cmd: &str,
        options: RunOptions<'_>,
    ) -> Result<CommandOutput, ExecError> {
        debug!(command = %cmd, "executing local command");

        let completion = self.execute(cmd, options.stdin).await?;

        debug!(command = %cmd, status = completion.status, "command completed");

        completion.into_output(cmd, &options)
    }

    #[instrument(skip(self, data), level = "debug")]
    async fn add_file(&self, data: &str, filename: &str) -> Result<(), ExecError> {
        let path = staged_path(filename);

        tokio::fs::write(&path, data.as_bytes())
            .await
            .map_err(|e| ExecError::StagingFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        debug!(path = %path, "staged local file");
        Ok(())
    }

    fn bearer_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("stagehand-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_defaults_are_text_pipes() {
        let bearer = LocalExecutorBearer::new(SpawnOptions::default().with_env("SOME_PARAM", "value"));

        let params = bearer.params();
        assert_eq!(params.env["SOME_PARAM"], "value");
        assert_eq!(params.stdin, StdioMode::Piped);
        assert_eq!(params.stdout, StdioMode::Piped);
        assert_eq!(params.stderr, StdioMode::Piped);
    }

    #[test]
    fn test_configured_options_merge_over_defaults() {
        let options: SpawnOptions = toml::from_str(
            r#"
            current_dir = "/srv"
            stderr = "null"
            "#,
        )
        .unwrap();

        assert_eq!(options.current_dir, Some(PathBuf::from("/srv")));
        assert_eq!(options.stderr, StdioMode::Null);
        assert_eq!(options.stdin, StdioMode::Piped);
        assert_eq!(options.stdout, StdioMode::Piped);
    }

    #[tokio::test]
    async fn test_run_success() {
        let bearer = LocalExecutorBearer::default();
        let out = bearer.run("echo hello").await.unwrap();

        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn test_run_writes_stdin() {
        let bearer = LocalExecutorBearer::default();
        let out = bearer
            .run_cmd("cat", RunOptions::new().stdin("input"))
            .await
            .unwrap();

        assert_eq!(out.stdout, "input");
    }

    #[tokio::test]
    async fn test_run_pwd_in_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bearer = LocalExecutorBearer::new(SpawnOptions::default().with_current_dir(dir.path()));

        let out = bearer
            .run_cmd("pwd", RunOptions::new().stdin("input"))
            .await
            .unwrap();

        let reported = PathBuf::from(out.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_quoted_arguments() {
        let bearer = LocalExecutorBearer::default();
        let out = bearer
            .run("sh -c 'echo \"$0\" >&2' 'two words'")
            .await
            .unwrap();

        assert_eq!(out.stderr, "two words\n");
    }

    #[tokio::test]
    async fn test_run_env() {
        let bearer =
            LocalExecutorBearer::new(SpawnOptions::default().with_env("STAGEHAND_TEST", "42"));
        let out = bearer.run("sh -c 'echo $STAGEHAND_TEST'").await.unwrap();

        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let bearer = LocalExecutorBearer::default();
        let err = bearer
            .run("sh -c 'echo oops >&2; exit 3'")
            .await
            .unwrap_err();

        match err {
            ExecError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "oops\n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_failure_custom_message() {
        let bearer = LocalExecutorBearer::default();
        let err = bearer
            .run_cmd("false", RunOptions::new().err_msg("Custom error"))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Custom error"));
    }

    #[tokio::test]
    async fn test_run_tolerate_err() {
        let bearer = LocalExecutorBearer::default();
        let out = bearer
            .run_cmd(
                "sh -c 'echo outlog; echo errlog >&2; exit 1'",
                RunOptions::new().tolerate_err(),
            )
            .await
            .unwrap();

        assert_eq!(out.stdout, "outlog\n");
        assert_eq!(out.stderr, "errlog\n");
    }

    #[tokio::test]
    async fn test_unbalanced_quotes_rejected() {
        let bearer = LocalExecutorBearer::default();
        let err = bearer.run("echo 'unterminated").await.unwrap_err();

        assert!(matches!(err, ExecError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let bearer = LocalExecutorBearer::default();
        let err = bearer.run("stagehand-no-such-program").await.unwrap_err();

        assert!(matches!(err, ExecError::SpawnError(_)));
    }

    #[tokio::test]
    async fn test_add_file_is_readable_by_later_commands() {
        let bearer = LocalExecutorBearer::default();
        let name = unique_name("add-file");

        bearer.add_file("some-data\nline two", &name).await.unwrap();
        let out = bearer.run(&format!("cat {}", staged_path(&name))).await.unwrap();

        assert_eq!(out.stdout, "some-data\nline two");
        std::fs::remove_file(staged_path(&name)).unwrap();
    }
}
