//! Configuration loading and types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stagehand_exec::{ContainerConfig, RemoteConfig, RetryPolicy, SpawnOptions};

/// Top-level configuration for the stagehand binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
    /// Retry policy for retried skopeo operations
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Where commands are executed
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Execution backend, selected by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Processes spawned on this machine
    Local(SpawnOptions),
    /// Commands run over SSH
    Remote(RemoteConfig),
    /// Commands run inside a throwaway container
    Container(ContainerConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local(SpawnOptions::default())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            retry: RetryPolicy::default(),
            backend: BackendConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("cannot read config {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// Returns error if the text is not a valid configuration
    pub fn parse(content: &str) -> eyre::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Find the config file: the explicit path, `$STAGEHAND_CONFIG`, then
    /// the first of `./stagehand.toml` and the user config dir that exists
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var("STAGEHAND_CONFIG") {
            return Some(PathBuf::from(path));
        }

        [
            Some(PathBuf::from("stagehand.toml")),
            dirs::config_dir().map(|p| p.join("stagehand/stagehand.toml")),
        ]
        .into_iter()
        .flatten()
        .find(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(matches!(config.backend, BackendConfig::Local(_)));
    }

    #[test]
    fn test_container_backend() {
        let config = Config::parse(
            r#"
            log_level = "debug"

            [backend]
            type = "container"
            image = "quay.io/skopeo/stable:latest"
            base_url = "unix:///var/run/docker.sock"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        let BackendConfig::Container(container) = config.backend else {
            panic!("expected container backend");
        };
        assert_eq!(container.image, "quay.io/skopeo/stable:latest");
        assert_eq!(container.timeout_secs, 120);
        assert!(!container.verify_tls);
    }

    #[test]
    fn test_remote_backend_and_retry() {
        let config = Config::parse(
            r#"
            [retry]
            tries = 2

            [backend]
            type = "remote"
            hostname = "builder.lan"
            username = "deploy"
            key_filename = "/home/deploy/.ssh/id_ed25519"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.tries, 2);
        assert_eq!(config.retry.wait_time_increase_secs, 10);
        let BackendConfig::Remote(remote) = config.backend else {
            panic!("expected remote backend");
        };
        assert_eq!(remote.hostname, "builder.lan");
        assert_eq!(remote.port, 22);
        assert!(!remote.accept_unknown_host);
    }

    #[test]
    fn test_local_backend_env() {
        let config = Config::parse(
            r#"
            [backend]
            type = "local"
            current_dir = "/srv/images"

            [backend.env]
            REGISTRY_AUTH_FILE = "/srv/auth.json"
            "#,
        )
        .unwrap();

        let BackendConfig::Local(options) = config.backend else {
            panic!("expected local backend");
        };
        assert_eq!(options.current_dir, Some(PathBuf::from("/srv/images")));
        assert_eq!(
            options.env.get("REGISTRY_AUTH_FILE").map(String::as_str),
            Some("/srv/auth.json")
        );
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = Config::parse(
            r#"
            [backend]
            type = "kubernetes"
            "#,
        );

        assert!(err.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();

        let located = Config::locate(Some(&path)).unwrap();
        let config = Config::load(&located).unwrap();

        assert_eq!(located, path);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = Config::load(&path).unwrap_err();

        assert!(err.to_string().contains("absent.toml"));
    }
}
