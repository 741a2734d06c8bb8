//! stagehand-exec: Uniform command execution across backends
//!
//! Provides the [`ExecutorBearer`] trait with local, SSH and container
//! implementations, a scoped acquire/release helper, and a retry wrapper for
//! higher-level operations.

pub mod container;
pub mod error;
pub mod local;
pub mod output;
pub mod remote;
pub mod retry;
pub mod scope;
pub mod traits;

pub use container::{ContainerConfig, ContainerExecutorBearer, ContainerRuntime, DockerRuntime};
pub use error::ExecError;
pub use local::{LocalExecutorBearer, SpawnOptions, StdioMode};
pub use output::{CommandOutput, RunOptions, STAGED_FILE_MODE, STAGING_DIR, staged_path};
pub use remote::{HostKeyPolicy, RemoteConfig, RemoteExecutorBearer, SshTransport};
pub use retry::{RetryPolicy, Retrying, run_with_retries};
pub use scope::with_bearer;
pub use traits::ExecutorBearer;
