//! Skopeo commands run on an executor bearer

use stagehand_exec::{ExecutorBearer, RetryPolicy, RunOptions, run_with_retries, staged_path};
use tracing::{info, instrument};

use crate::error::SkopeoError;
use crate::types::ImageInspection;

/// Registry logged into when none is given
pub const DEFAULT_REGISTRY: &str = "quay.io";

/// Name the registry password is staged under
pub const PASSWORD_FILE: &str = "skopeo_password.txt";

/// Set of skopeo commands run through one bearer.
///
/// The command set borrows the bearer and never looks at which backend it
/// is; every backend difference stays inside the bearer.
pub struct SkopeoCommands<'a, B: ?Sized> {
    bearer: &'a B,
    retry: RetryPolicy,
}

fn quote(value: &str) -> Result<String, SkopeoError> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| SkopeoError::InvalidReference(value.to_string()))
}

fn docker_ref(image_ref: &str) -> Result<String, SkopeoError> {
    quote(&format!("docker://{image_ref}"))
}

impl<'a, B: ExecutorBearer + ?Sized> SkopeoCommands<'a, B> {
    /// Create a command set over `bearer`
    pub fn new(bearer: &'a B, retry: RetryPolicy) -> Self {
        Self { bearer, retry }
    }

    /// Retry policy used by retried operations
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Copy an image from `source_ref` to each of `dest_refs`, in order.
    ///
    /// With `all_arch`, every architecture of a multi-arch image is copied.
    /// The whole operation is retried per the command set's retry policy.
    ///
    /// # Errors
    /// Returns the last copy failure once retries are exhausted
    #[instrument(skip(self, dest_refs), fields(dests = dest_refs.len()))]
    pub async fn tag_images<S: AsRef<str>>(
        &self,
        source_ref: &str,
        dest_refs: &[S],
        all_arch: bool,
    ) -> Result<(), SkopeoError> {
        run_with_retries(
            || self.copy_to_all(source_ref, dest_refs, all_arch),
            "Tag images",
            &self.retry,
        )
        .await
    }

    async fn copy_to_all<S: AsRef<str>>(
        &self,
        source_ref: &str,
        dest_refs: &[S],
        all_arch: bool,
    ) -> Result<(), SkopeoError> {
        let copy = if all_arch { "skopeo copy --all" } else { "skopeo copy" };
        let source = docker_ref(source_ref)?;

        for dest_ref in dest_refs {
            let dest_ref = dest_ref.as_ref();
            info!("Tagging source '{source_ref}' to destination '{dest_ref}'");

            let cmd = format!("{copy} {source} {}", docker_ref(dest_ref)?);
            self.bearer.run(&cmd).await?;

            info!("Destination image {dest_ref} has been tagged.");
        }

        info!("Tagging complete.");
        Ok(())
    }

    /// Log in to `registry` unless already logged in as `username`.
    ///
    /// The password is staged as a file and piped to `skopeo login` so it
    /// never appears on a command line.
    ///
    /// # Errors
    /// Returns `SkopeoError::MissingCredentials` if a login is needed but
    /// username or password is absent, `SkopeoError::LoginFailed` if skopeo
    /// does not confirm the login
    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        registry: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), SkopeoError> {
        let username = username.filter(|u| !u.is_empty());
        let password = password.filter(|p| !p.is_empty());

        let check = format!("skopeo login --get-login {}", quote(registry)?);
        let current = self
            .bearer
            .run_cmd(&check, RunOptions::new().tolerate_err())
            .await?;
        if let Some(user) = username
            && current.stdout.contains(user)
        {
            info!("Already logged in to {registry}");
            return Ok(());
        }

        let (Some(user), Some(password)) = (username, password) else {
            return Err(SkopeoError::MissingCredentials {
                registry: registry.to_string(),
            });
        };
        info!("Logging in to {registry} with provided credentials");

        self.bearer.add_file(password, PASSWORD_FILE).await?;

        let script = format!(
            "cat {} | skopeo login --authfile $HOME/.docker/config.json -u {} --password-stdin {}",
            staged_path(PASSWORD_FILE),
            quote(user)?,
            quote(registry)?
        );
        let output = self.bearer.run(&format!("sh -c {}", quote(&script)?)).await?;

        if output.stdout.contains("Login Succeeded") {
            info!("Login successful");
            Ok(())
        } else {
            Err(SkopeoError::LoginFailed {
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }

    /// Raw `skopeo inspect` output for `image_ref`
    ///
    /// # Errors
    /// Returns the bearer's error if skopeo fails
    #[instrument(skip(self))]
    pub async fn inspect_raw(&self, image_ref: &str) -> Result<String, SkopeoError> {
        let cmd = format!("skopeo inspect {}", docker_ref(image_ref)?);
        let output = self.bearer.run(&cmd).await?;
        Ok(output.stdout)
    }

    /// Parsed `skopeo inspect` output for `image_ref`
    ///
    /// # Errors
    /// Returns the bearer's error if skopeo fails, `SkopeoError::ParseError`
    /// if the output is not the expected JSON
    pub async fn inspect(&self, image_ref: &str) -> Result<ImageInspection, SkopeoError> {
        let raw = self.inspect_raw(image_ref).await?;
        serde_json::from_str(&raw).map_err(|e| SkopeoError::ParseError(e.to_string()))
    }
}
