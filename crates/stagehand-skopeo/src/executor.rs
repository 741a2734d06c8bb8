//! One bearer bound to the skopeo command set

use stagehand_exec::{
    ContainerConfig, ContainerExecutorBearer, ExecError, ExecutorBearer, LocalExecutorBearer,
    RemoteConfig, RemoteExecutorBearer, RetryPolicy, SpawnOptions, with_bearer,
};

use crate::commands::SkopeoCommands;

/// Skopeo run on one bearer.
///
/// `scope` acquires the bearer, hands the body a [`SkopeoCommands`] over it,
/// and releases the bearer afterwards whatever the body returned.
#[derive(Debug)]
pub struct SkopeoExecutor<B> {
    bearer: B,
    retry: RetryPolicy,
}

/// Skopeo run inside a throwaway container
pub type SkopeoContainerExecutor = SkopeoExecutor<ContainerExecutorBearer>;

/// Skopeo run on this machine
pub type SkopeoLocalExecutor = SkopeoExecutor<LocalExecutorBearer>;

/// Skopeo run on a host reached over SSH
pub type SkopeoRemoteExecutor = SkopeoExecutor<RemoteExecutorBearer>;

impl<B: ExecutorBearer> SkopeoExecutor<B> {
    /// Bind `bearer` with the default retry policy
    pub fn new(bearer: B) -> Self {
        Self {
            bearer,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the retry policy for retried operations
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The bound bearer
    pub fn bearer(&self) -> &B {
        &self.bearer
    }

    /// Run `body` with skopeo commands over the acquired bearer
    ///
    /// # Errors
    /// Returns the acquire error, the body's error, or the release error
    pub async fn scope<T, E, F>(&mut self, body: F) -> Result<T, E>
    where
        E: From<ExecError>,
        F: AsyncFnOnce(SkopeoCommands<'_, B>) -> Result<T, E>,
    {
        let retry = self.retry.clone();
        with_bearer(&mut self.bearer, async move |bearer: &B| {
            body(SkopeoCommands::new(bearer, retry)).await
        })
        .await
    }
}

impl SkopeoContainerExecutor {
    /// Skopeo in a container created from `config.image`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for invalid settings
    pub fn container(config: &ContainerConfig) -> Result<Self, ExecError> {
        Ok(Self::new(ContainerExecutorBearer::new(config)?))
    }
}

impl SkopeoLocalExecutor {
    /// Skopeo spawned locally with `options`
    #[must_use]
    pub fn local(options: SpawnOptions) -> Self {
        Self::new(LocalExecutorBearer::new(options))
    }
}

impl SkopeoRemoteExecutor {
    /// Skopeo run over SSH on `config.hostname`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for invalid settings
    pub fn remote(config: RemoteConfig) -> Result<Self, ExecError> {
        Ok(Self::new(RemoteExecutorBearer::new(config)?))
    }
}
