//! stagehand-skopeo: Image copy, login and inspection through skopeo
//!
//! [`SkopeoCommands`] runs skopeo on whatever [`stagehand_exec::ExecutorBearer`]
//! it is given; [`SkopeoExecutor`] pairs one bearer with the command set and
//! manages the bearer's scope.

pub mod commands;
pub mod error;
pub mod executor;
pub mod types;

pub use commands::{DEFAULT_REGISTRY, PASSWORD_FILE, SkopeoCommands};
pub use error::SkopeoError;
pub use executor::{
    SkopeoContainerExecutor, SkopeoExecutor, SkopeoLocalExecutor, SkopeoRemoteExecutor,
};
pub use types::ImageInspection;
