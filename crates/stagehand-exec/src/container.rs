//! Command execution inside a throwaway container
//!
//! The bearer owns exactly one container between `acquire` and `release`.
//! Use it through [`crate::with_bearer`] so the container is removed on every
//! exit path.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::output::{
    CommandOutput, Completion, RunOptions, STAGED_FILE_MODE, STAGING_DIR, staged_path,
};
use crate::traits::ExecutorBearer;

/// Settings for a container bearer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image the container is created from
    pub image: String,
    /// Container runtime API endpoint (`unix://`, `tcp://`, `http(s)://`)
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Talk TLS to the endpoint using material from `cert_path`
    #[serde(default)]
    pub verify_tls: bool,
    /// Directory holding `cert.pem`, `key.pem` and `ca.pem`
    pub cert_path: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    120
}

impl ContainerConfig {
    /// Create new config with plain-text transport and default timeout
    pub fn new(image: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            base_url: base_url.into(),
            timeout_secs: default_timeout(),
            verify_tls: false,
            cert_path: None,
        }
    }

    /// Set request timeout
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Enable TLS with material from `cert_path`
    #[must_use]
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>) -> Self {
        self.verify_tls = true;
        self.cert_path = Some(cert_path.into());
        self
    }

    /// TLS files to use, or `None` when TLS is off
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if TLS is on but `cert_path` is
    /// missing or not a directory
    pub fn tls_material(&self) -> Result<Option<TlsMaterial>, ExecError> {
        if !self.verify_tls {
            return Ok(None);
        }
        let dir = self
            .cert_path
            .as_deref()
            .ok_or_else(|| ExecError::ConfigError("verify_tls requires cert_path".to_string()))?;
        if !dir.is_dir() {
            return Err(ExecError::ConfigError(format!(
                "cert_path {} is not a directory",
                dir.display()
            )));
        }
        Ok(Some(TlsMaterial::in_dir(dir)))
    }
}

/// Client certificate, key and CA bundle paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Client certificate
    pub cert: PathBuf,
    /// Client key
    pub key: PathBuf,
    /// CA bundle used to verify the endpoint
    pub ca: PathBuf,
}

impl TlsMaterial {
    /// Standard file names under `dir`
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            ca: dir.join("ca.pem"),
        }
    }
}

/// Container runtime operations the container bearer is built on
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a detached container with a TTY, returning its id
    async fn create_container(&self, image: &str) -> Result<String, ExecError>;

    /// Start a created container
    async fn start_container(&self, id: &str) -> Result<(), ExecError>;

    /// Force-remove a container
    async fn remove_container(&self, id: &str) -> Result<(), ExecError>;

    /// Force-remove a container in the background, without waiting.
    ///
    /// Used where awaiting is impossible, such as a cancelled scope or drop.
    fn remove_detached(&self, id: String);

    /// Create an exec session for `argv`, returning the exec id
    async fn create_exec(
        &self,
        container_id: &str,
        argv: &[String],
        attach_stdin: bool,
    ) -> Result<String, ExecError>;

    /// Run an exec session to completion, feeding it `stdin`, returning its
    /// output if any
    async fn start_exec(
        &self,
        exec_id: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, ExecError>;

    /// Exit code of a finished exec session
    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, ExecError>;

    /// Extract a tar archive into `path` inside the container
    async fn put_archive(&self, container_id: &str, path: &str, archive: Vec<u8>) -> Result<bool, ExecError>;
}

/// [`ContainerRuntime`] over the Docker-compatible API via bollard
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Build an API client for `config`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for bad TLS settings and
    /// `ExecError::RuntimeError` if the client cannot be built
    pub fn connect(config: &ContainerConfig) -> Result<Self, ExecError> {
        let url = config.base_url.as_str();
        let timeout = config.timeout_secs;

        let docker = match config.tls_material()? {
            Some(tls) => Docker::connect_with_ssl(
                url,
                &tls.key,
                &tls.cert,
                &tls.ca,
                timeout,
                API_DEFAULT_VERSION,
            ),
            None if url.starts_with("unix://") => {
                Docker::connect_with_unix(url, timeout, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_http(url, timeout, API_DEFAULT_VERSION),
        }
        .map_err(runtime_err)?;

        Ok(Self { docker })
    }
}

fn runtime_err(e: bollard::errors::Error) -> ExecError {
    ExecError::RuntimeError(e.to_string())
}

fn force_remove() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, image: &str) -> Result<String, ExecError> {
        let config = Config {
            image: Some(image.to_string()),
            tty: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(runtime_err)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ExecError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn remove_container(&self, id: &str) -> Result<(), ExecError> {
        self.docker
            .remove_container(id, Some(force_remove()))
            .await
            .map_err(runtime_err)
    }

    fn remove_detached(&self, id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(container = %id, "no async runtime left to remove container");
            return;
        };

        let docker = self.docker.clone();
        handle.spawn(async move {
            match docker.remove_container(&id, Some(force_remove())).await {
                Ok(()) => info!(container = %id, "container removed in background"),
                Err(e) => error!(container = %id, error = %e, "background container removal failed"),
            }
        });
    }

    async fn create_exec(
        &self,
        container_id: &str,
        argv: &[String],
        attach_stdin: bool,
    ) -> Result<String, ExecError> {
        let options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(runtime_err)?;
        Ok(created.id)
    }

    async fn start_exec(
        &self,
        exec_id: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, ExecError> {
        match self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(runtime_err)?
        {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                let feed = async {
                    if let Some(data) = stdin {
                        input.write_all(data).await?;
                        input.shutdown().await?;
                    }
                    Ok::<(), std::io::Error>(())
                };
                let drain = async {
                    let mut captured = Vec::new();
                    while let Some(chunk) = output.next().await {
                        captured.extend_from_slice(&chunk.map_err(runtime_err)?.into_bytes());
                    }
                    Ok::<Vec<u8>, ExecError>(captured)
                };

                let (fed, drained) = tokio::join!(feed, drain);
                if let Err(e) = fed
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    return Err(e.into());
                }
                Ok(Some(drained?))
            }
            StartExecResults::Detached => Ok(None),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, ExecError> {
        let inspected = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(runtime_err)?;
        Ok(inspected.exit_code)
    }

    async fn put_archive(&self, container_id: &str, path: &str, archive: Vec<u8>) -> Result<bool, ExecError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(runtime_err)?;
        Ok(true)
    }
}

/// Container executor bearer
///
/// `acquire` creates and starts one container from the configured image;
/// `release` force-removes it. Commands run as exec sessions inside it.
pub struct ContainerExecutorBearer<R: ContainerRuntime = DockerRuntime> {
    image: String,
    runtime: R,
    container_id: Option<String>,
}

impl<R: ContainerRuntime> std::fmt::Debug for ContainerExecutorBearer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerExecutorBearer")
            .field("image", &self.image)
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

impl ContainerExecutorBearer {
    /// Create a container bearer talking to the runtime at `config.base_url`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for missing image or bad TLS
    /// settings, `ExecError::RuntimeError` if the client cannot be built
    pub fn new(config: &ContainerConfig) -> Result<Self, ExecError> {
        validate(config)?;
        let runtime = DockerRuntime::connect(config)?;
        Ok(Self::with_runtime(&config.image, runtime))
    }
}

fn validate(config: &ContainerConfig) -> Result<(), ExecError> {
    if config.image.trim().is_empty() {
        return Err(ExecError::ConfigError("image is required".to_string()));
    }
    if config.base_url.trim().is_empty() {
        return Err(ExecError::ConfigError("base_url is required".to_string()));
    }
    Ok(())
}

impl<R: ContainerRuntime> ContainerExecutorBearer<R> {
    /// Create a container bearer on top of a custom runtime
    pub fn with_runtime(image: impl Into<String>, runtime: R) -> Self {
        Self {
            image: image.into(),
            runtime,
            container_id: None,
        }
    }

    /// Id of the live container, if acquired
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Image reference containers are created from
    pub fn image(&self) -> &str {
        &self.image
    }

    fn live_container(&self) -> Result<&str, ExecError> {
        self.container_id.as_deref().ok_or(ExecError::NotAcquired)
    }

    fn remove_in_background(&mut self) -> Option<String> {
        let id = self.container_id.take()?;
        self.runtime.remove_detached(id.clone());
        Some(id)
    }
}

/// Tar archive holding one file `filename` with `data` as its content
fn build_archive(filename: &str, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(STAGED_FILE_MODE);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()),
    );

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, filename, data)?;
    builder.into_inner()
}

#[async_trait]
impl<R: ContainerRuntime> ExecutorBearer for ContainerExecutorBearer<R> {
    #[instrument(skip(self, options), fields(container = ?self.container_id))]
    async fn run_cmd(
        &self,
        cmd: &str,
        options: RunOptions<'_>,
    ) -> Result<CommandOutput, ExecError> {
        let container_id = self.live_container()?;
        let argv = shlex::split(cmd)
            .ok_or_else(|| ExecError::ConfigError(format!("cannot tokenize command: {cmd}")))?;

        debug!(command = %cmd, "executing container command");

        let stdin = options.stdin.map(str::as_bytes);
        let exec_id = self
            .runtime
            .create_exec(container_id, &argv, stdin.is_some())
            .await?;
        let output = self.runtime.start_exec(&exec_id, stdin).await?;
        let status = self.runtime.inspect_exec(&exec_id).await?.unwrap_or(-1);

        // The runtime hands back one interleaved stream at this layer
        let merged = output
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();

        debug!(command = %cmd, status, "container command completed");

        Completion {
            status,
            stdout: merged.clone(),
            stderr: merged,
        }
        .into_output(cmd, &options)
    }

    #[instrument(skip(self, data), fields(container = ?self.container_id))]
    async fn add_file(&self, data: &str, filename: &str) -> Result<(), ExecError> {
        let container_id = self.live_container()?;
        let path = staged_path(filename);
        let staging = |reason: String| ExecError::StagingFailed {
            path: path.clone(),
            reason,
        };

        let archive = build_archive(filename, data.as_bytes()).map_err(|e| staging(e.to_string()))?;

        match self.runtime.put_archive(container_id, STAGING_DIR, archive).await {
            Ok(true) => {
                debug!(path = %path, "staged container file");
                Ok(())
            }
            Ok(false) => Err(staging("runtime rejected the archive".to_string())),
            Err(e) => Err(staging(e.to_string())),
        }
    }

    #[instrument(skip(self), fields(image = %self.image))]
    async fn acquire(&mut self) -> Result<(), ExecError> {
        if let Some(id) = &self.container_id {
            return Err(ExecError::ConfigError(format!(
                "container {id} is already acquired"
            )));
        }

        let id = self.runtime.create_container(&self.image).await?;
        // Recorded before start so a failed start is still cleaned up on release
        self.container_id = Some(id.clone());
        self.runtime.start_container(&id).await?;

        info!(container = %id, image = %self.image, "container started");
        Ok(())
    }

    #[instrument(skip(self), fields(image = %self.image))]
    async fn release(&mut self) -> Result<(), ExecError> {
        let Some(id) = self.container_id.clone() else {
            return Ok(());
        };

        // Kept until removal was attempted so a cancelled release is still abandoned
        let removed = self.runtime.remove_container(&id).await;
        self.container_id = None;
        removed?;

        info!(container = %id, "container removed");
        Ok(())
    }

    fn abandon(&mut self) {
        if let Some(id) = self.remove_in_background() {
            warn!(container = %id, "scope abandoned, removing container in background");
        }
    }

    fn bearer_type(&self) -> &'static str {
        "container"
    }
}

impl<R: ContainerRuntime> Drop for ContainerExecutorBearer<R> {
    fn drop(&mut self) {
        if let Some(id) = self.remove_in_background() {
            error!(container = %id, "container bearer dropped without release, removing in background");
        }
    }
}
