//! SSH command execution using russh crate
//!
//! A fresh connection is opened for every call and closed afterwards, so a
//! long job never trips over a stale session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::output::{CommandOutput, Completion, RunOptions, STAGED_FILE_MODE, staged_path};
use crate::traits::ExecutorBearer;

/// Connection settings for a remote bearer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Host address
    pub hostname: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username, falls back to `$USER`
    pub username: Option<String>,
    /// Password for password authentication
    pub password: Option<String>,
    /// Private key file for public key authentication
    pub key_filename: Option<PathBuf>,
    /// Accept (and warn about) host keys missing from known hosts
    #[serde(default)]
    pub accept_unknown_host: bool,
    /// Known hosts file, defaults to `~/.ssh/known_hosts`
    pub known_hosts: Option<PathBuf>,
    /// Limit on one whole call (connect, run, disconnect)
    pub timeout_secs: Option<u64>,
}

fn default_port() -> u16 {
    22
}

impl RemoteConfig {
    /// Create new config for `hostname` with defaults everywhere else
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: default_port(),
            username: None,
            password: None,
            key_filename: None,
            accept_unknown_host: false,
            known_hosts: None,
            timeout_secs: None,
        }
    }

    /// Set username
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_filename = Some(path.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Accept unseen host keys with a warning instead of rejecting them
    #[must_use]
    pub fn accept_unknown_host(mut self, accept: bool) -> Self {
        self.accept_unknown_host = accept;
        self
    }
}

/// What the known hosts store says about a presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHost {
    /// Host is listed with this key
    Match,
    /// Host is not listed
    Unknown,
    /// Host is listed with a different key
    Changed,
}

/// Rule for hosts missing from the known hosts store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Refuse to connect
    Reject,
    /// Log a warning and connect
    WarnAndAccept,
}

impl HostKeyPolicy {
    /// Policy selected by the `accept_unknown_host` flag
    #[must_use]
    pub fn from_accept_unknown(accept_unknown_host: bool) -> Self {
        if accept_unknown_host {
            HostKeyPolicy::WarnAndAccept
        } else {
            HostKeyPolicy::Reject
        }
    }

    /// Whether a key with the given known-hosts status may be used.
    ///
    /// A changed key is never admitted.
    #[must_use]
    pub fn admits(self, known: KnownHost) -> bool {
        match known {
            KnownHost::Match => true,
            KnownHost::Changed => false,
            KnownHost::Unknown => self == HostKeyPolicy::WarnAndAccept,
        }
    }
}

/// Low-level SSH operations the remote bearer is built on
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Run `cmd`, feeding it `stdin`, and report how it finished
    async fn exec(&self, cmd: &str, stdin: Option<&str>) -> Result<Completion, ExecError>;

    /// Write `data` to `path` on the remote host and set its permissions to `mode`
    async fn upload(&self, path: &str, data: &[u8], mode: u32) -> Result<(), ExecError>;
}

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl SshClientHandler {
    fn lookup(&self, key: &ssh_key::PublicKey) -> KnownHost {
        let checked = match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, key),
        };

        match checked {
            Ok(true) => KnownHost::Match,
            Ok(false) => KnownHost::Unknown,
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(host = %self.host, line, "host key does not match known hosts entry");
                KnownHost::Changed
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "could not read known hosts");
                KnownHost::Unknown
            }
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let known = self.lookup(server_public_key);
        let admitted = self.policy.admits(known);

        if known == KnownHost::Unknown && admitted {
            warn!(
                host = %self.host,
                fingerprint = %server_public_key.fingerprint(ssh_key::HashAlg::Sha256),
                "accepting unknown host key"
            );
        }

        Ok(admitted)
    }
}

fn staging_open_flags() -> OpenFlags {
    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
}

fn staged_attributes(mode: u32) -> FileAttributes {
    FileAttributes {
        permissions: Some(mode),
        ..FileAttributes::empty()
    }
}

/// [`SshTransport`] over russh, one connection per call
#[derive(Debug, Clone)]
pub struct RusshTransport {
    config: RemoteConfig,
    username: String,
    policy: HostKeyPolicy,
}

impl RusshTransport {
    fn new(config: RemoteConfig, username: String, policy: HostKeyPolicy) -> Self {
        Self {
            config,
            username,
            policy,
        }
    }

    /// Connect and authenticate
    #[instrument(skip(self), fields(host = %self.config.hostname))]
    async fn connect(&self) -> Result<client::Handle<SshClientHandler>, ExecError> {
        info!(
            host = %self.config.hostname,
            port = self.config.port,
            user = %self.username,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: self.config.hostname.clone(),
            port: self.config.port,
            policy: self.policy,
            known_hosts: self.config.known_hosts.clone(),
        };

        let mut session = client::connect(
            config,
            (&self.config.hostname[..], self.config.port),
            handler,
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => ExecError::HostKeyRejected {
                host: self.config.hostname.clone(),
            },
            other => ExecError::ConnectionFailed(other.to_string()),
        })?;

        let mut authenticated = false;

        if let Some(key_path) = &self.config.key_filename {
            let key_pair = load_secret_key(key_path, None)
                .map_err(|e| ExecError::AuthenticationFailed(format!("cannot load key: {e}")))?;

            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            authenticated = session
                .authenticate_publickey(
                    &self.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
                .success();
        }

        if !authenticated && let Some(password) = &self.config.password {
            authenticated = session
                .authenticate_password(&self.username, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
                .success();
        }

        if !authenticated {
            let reason = if self.config.key_filename.is_none() && self.config.password.is_none() {
                "no authentication method available"
            } else {
                "server rejected the provided credentials"
            };
            return Err(ExecError::AuthenticationFailed(reason.to_string()));
        }

        debug!(host = %self.config.hostname, "SSH connected and authenticated");
        Ok(session)
    }

    async fn disconnect(&self, session: client::Handle<SshClientHandler>) {
        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.config.hostname, error = %e, "SSH disconnect failed");
        }
    }

    async fn exec_on(
        session: &client::Handle<SshClientHandler>,
        cmd: &str,
        stdin: Option<&str>,
    ) -> Result<Completion, ExecError> {
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        if let Some(data) = stdin {
            channel
                .data(data.as_bytes())
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // Exit status may arrive after EOF, so read until the channel closes
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(i64::from(exit_status)),
                _ => {}
            }
        }

        Ok(Completion {
            status: status.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    async fn upload_on(
        session: &client::Handle<SshClientHandler>,
        path: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), ExecError> {
        let staging = |reason: String| ExecError::StagingFailed {
            path: path.to_string(),
            reason,
        };

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| staging(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| staging(e.to_string()))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| staging(e.to_string()))?;

        let mut file = sftp
            .open_with_flags_and_attributes(path, staging_open_flags(), staged_attributes(mode))
            .await
            .map_err(|e| staging(e.to_string()))?;

        // A file left from an earlier run keeps its old mode, so restrict it before writing
        sftp.set_metadata(path, staged_attributes(mode))
            .await
            .map_err(|e| staging(format!("cannot restrict permissions: {e}")))?;

        file.write_all(data).await.map_err(|e| staging(e.to_string()))?;
        file.shutdown().await.map_err(|e| staging(e.to_string()))?;

        Ok(())
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, ExecError>>,
    ) -> Result<T, ExecError> {
        match self.config.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                timeout(limit, op)
                    .await
                    .map_err(|_| ExecError::Timeout { timeout: limit })?
            }
            None => op.await,
        }
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn exec(&self, cmd: &str, stdin: Option<&str>) -> Result<Completion, ExecError> {
        self.bounded(async {
            let session = self.connect().await?;
            let result = Self::exec_on(&session, cmd, stdin).await;
            self.disconnect(session).await;
            result
        })
        .await
    }

    async fn upload(&self, path: &str, data: &[u8], mode: u32) -> Result<(), ExecError> {
        self.bounded(async {
            let session = self.connect().await?;
            let result = Self::upload_on(&session, path, data, mode).await;
            self.disconnect(session).await;
            result
        })
        .await
    }
}

/// Remote executor bearer
///
/// Runs commands on a host reached over SSH. The host-key trust policy is
/// chosen once, at construction, from `accept_unknown_host`.
pub struct RemoteExecutorBearer<T = RusshTransport> {
    config: RemoteConfig,
    username: String,
    policy: HostKeyPolicy,
    transport: T,
}

impl<T> std::fmt::Debug for RemoteExecutorBearer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutorBearer")
            .field("hostname", &self.config.hostname)
            .field("port", &self.config.port)
            .field("username", &self.username)
            .field("key_filename", &self.config.key_filename)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutorBearer {
    /// Create a new remote bearer talking to the host through russh
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the hostname is empty or no
    /// username is configured or found in the environment
    pub fn new(config: RemoteConfig) -> Result<Self, ExecError> {
        let username = resolve_username(&config)?;
        let policy = HostKeyPolicy::from_accept_unknown(config.accept_unknown_host);
        let transport = RusshTransport::new(config.clone(), username.clone(), policy);
        Self::assemble(config, username, policy, transport)
    }
}

impl<T: SshTransport> RemoteExecutorBearer<T> {
    /// Create a remote bearer on top of a custom transport
    ///
    /// # Errors
    /// Same as [`RemoteExecutorBearer::new`]
    pub fn with_transport(config: RemoteConfig, transport: T) -> Result<Self, ExecError> {
        let username = resolve_username(&config)?;
        let policy = HostKeyPolicy::from_accept_unknown(config.accept_unknown_host);
        Self::assemble(config, username, policy, transport)
    }

    fn assemble(
        config: RemoteConfig,
        username: String,
        policy: HostKeyPolicy,
        transport: T,
    ) -> Result<Self, ExecError> {
        if config.hostname.trim().is_empty() {
            return Err(ExecError::ConfigError("hostname is required".to_string()));
        }
        Ok(Self {
            config,
            username,
            policy,
            transport,
        })
    }

    /// Host address
    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Username used to log in
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Private key file, if any
    pub fn key_filename(&self) -> Option<&PathBuf> {
        self.config.key_filename.as_ref()
    }

    /// Password, if any
    pub fn password(&self) -> Option<&str> {
        self.config.password.as_deref()
    }

    /// Trust policy for unseen host keys
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        self.policy
    }
}

fn resolve_username(config: &RemoteConfig) -> Result<String, ExecError> {
    if let Some(user) = &config.username {
        return Ok(user.clone());
    }
    std::env::var("USER").map_err(|_| {
        ExecError::ConfigError("no username configured and $USER is not set".to_string())
    })
}

#[async_trait]
impl<T: SshTransport> ExecutorBearer for RemoteExecutorBearer<T> {
    #[instrument(skip(self, options), fields(host = %self.config.hostname))]
    async fn run_cmd(
        &self,
        cmd: &str,
        options: RunOptions<'_>,
    ) -> Result<CommandOutput, ExecError> {
        debug!(command = %cmd, "executing remote command");

        let completion = self.transport.exec(cmd, options.stdin).await?;

        debug!(command = %cmd, status = completion.status, "remote command completed");

        completion.into_output(cmd, &options)
    }

    #[instrument(skip(self, data), fields(host = %self.config.hostname))]
    async fn add_file(&self, data: &str, filename: &str) -> Result<(), ExecError> {
        let path = staged_path(filename);
        self.transport
            .upload(&path, data.as_bytes(), STAGED_FILE_MODE)
            .await?;

        debug!(path = %path, "staged remote file");
        Ok(())
    }

    fn bearer_type(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Exec { cmd: String, stdin: Option<String> },
        Upload { path: String, data: Vec<u8>, mode: u32 },
    }

    struct FakeTransport {
        status: i64,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeTransport {
        fn exiting(status: i64) -> Self {
            Self {
                status,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SshTransport for FakeTransport {
        async fn exec(&self, cmd: &str, stdin: Option<&str>) -> Result<Completion, ExecError> {
            self.calls.lock().unwrap().push(Call::Exec {
                cmd: cmd.to_string(),
                stdin: stdin.map(str::to_string),
            });
            Ok(Completion {
                status: self.status,
                stdout: "outlog".to_string(),
                stderr: "errlog".to_string(),
            })
        }

        async fn upload(&self, path: &str, data: &[u8], mode: u32) -> Result<(), ExecError> {
            self.calls.lock().unwrap().push(Call::Upload {
                path: path.to_string(),
                data: data.to_vec(),
                mode,
            });
            Ok(())
        }
    }

    fn config() -> RemoteConfig {
        RemoteConfig::new("127.0.0.1")
            .with_username("dummy")
            .with_key_filename("path/to/file.key")
            .with_password("123456")
    }

    #[test]
    fn test_init() {
        let bearer = RemoteExecutorBearer::new(config().accept_unknown_host(false)).unwrap();

        assert_eq!(bearer.hostname(), "127.0.0.1");
        assert_eq!(bearer.username(), "dummy");
        assert_eq!(bearer.key_filename(), Some(&PathBuf::from("path/to/file.key")));
        assert_eq!(bearer.password(), Some("123456"));
        assert_eq!(bearer.port(), 22);
        assert_eq!(bearer.host_key_policy(), HostKeyPolicy::Reject);
    }

    #[test]
    fn test_accept_unknown_host_selects_warning_policy() {
        let bearer = RemoteExecutorBearer::new(config().accept_unknown_host(true)).unwrap();
        assert_eq!(bearer.host_key_policy(), HostKeyPolicy::WarnAndAccept);
    }

    #[test]
    fn test_policy_verdicts() {
        assert!(HostKeyPolicy::Reject.admits(KnownHost::Match));
        assert!(!HostKeyPolicy::Reject.admits(KnownHost::Unknown));
        assert!(!HostKeyPolicy::Reject.admits(KnownHost::Changed));

        assert!(HostKeyPolicy::WarnAndAccept.admits(KnownHost::Match));
        assert!(HostKeyPolicy::WarnAndAccept.admits(KnownHost::Unknown));
        assert!(!HostKeyPolicy::WarnAndAccept.admits(KnownHost::Changed));
    }

    #[test]
    fn test_staged_files_created_private() {
        let flags = staging_open_flags();

        assert!(flags.contains(OpenFlags::CREATE));
        assert!(flags.contains(OpenFlags::TRUNCATE));
        assert!(flags.contains(OpenFlags::WRITE));
        assert!(!flags.contains(OpenFlags::APPEND));
        assert_eq!(staged_attributes(STAGED_FILE_MODE).permissions, Some(0o600));
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: RemoteConfig = toml::from_str(r#"hostname = "build.example.com""#).unwrap();

        assert_eq!(config.port, 22);
        assert!(!config.accept_unknown_host);
        assert!(config.username.is_none());
    }

    #[test]
    fn test_empty_hostname_rejected() {
        let err = RemoteExecutorBearer::with_transport(
            RemoteConfig::new("  ").with_username("dummy"),
            FakeTransport::exiting(0),
        )
        .unwrap_err();

        assert!(matches!(err, ExecError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_run() {
        let bearer =
            RemoteExecutorBearer::with_transport(config(), FakeTransport::exiting(0)).unwrap();

        let out = bearer
            .run_cmd("pwd", RunOptions::new().stdin("input"))
            .await
            .unwrap();

        assert_eq!(out, CommandOutput::new("outlog", "errlog"));
        assert_eq!(
            *bearer.transport.calls.lock().unwrap(),
            vec![Call::Exec {
                cmd: "pwd".to_string(),
                stdin: Some("input".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_run_error() {
        let bearer =
            RemoteExecutorBearer::with_transport(config(), FakeTransport::exiting(1)).unwrap();

        let err = bearer
            .run_cmd("pwd", RunOptions::new().stdin("input"))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("An error has occurred when executing"));
        assert_eq!(err.exit_status(), Some(1));
    }

    #[tokio::test]
    async fn test_run_tolerate_err() {
        let bearer =
            RemoteExecutorBearer::with_transport(config(), FakeTransport::exiting(1)).unwrap();

        let out = bearer
            .run_cmd("pwd", RunOptions::new().tolerate_err())
            .await
            .unwrap();

        assert_eq!(out.stdout, "outlog");
    }

    #[tokio::test]
    async fn test_add_file_restricts_permissions() {
        let bearer =
            RemoteExecutorBearer::with_transport(config(), FakeTransport::exiting(0)).unwrap();

        bearer.add_file("some-data", "some_file").await.unwrap();

        assert_eq!(
            *bearer.transport.calls.lock().unwrap(),
            vec![Call::Upload {
                path: "/tmp/some_file".to_string(),
                data: b"some-data".to_vec(),
                mode: 0o600,
            }]
        );
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_round_trip() {
        let host = std::env::var("STAGEHAND_TEST_SSH_HOST").unwrap();
        let key = std::env::var("STAGEHAND_TEST_SSH_KEY").unwrap();
        let bearer = RemoteExecutorBearer::new(
            RemoteConfig::new(host)
                .with_key_filename(key)
                .accept_unknown_host(true),
        )
        .unwrap();

        let name = format!("stagehand-ssh-{}", std::process::id());
        bearer.add_file("secret", &name).await.unwrap();
        let out = bearer
            .run(&format!("cat {}", staged_path(&name)))
            .await
            .unwrap();
        bearer
            .run(&format!("rm -f {}", staged_path(&name)))
            .await
            .unwrap();

        assert_eq!(out.stdout, "secret");
    }
}
