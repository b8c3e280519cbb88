//! Server configuration — `~/.tether/config.json`.
//!
//! Generated on first run with a fresh auth token; every field has a
//! compiled default so hand-edited configs stay minimal.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use tether_agent::AgentSettings;

/// Configuration load/save failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Filesystem failure.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level server configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    /// Bearer token clients must present. Generated on first run.
    pub auth_token: String,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// SQLite database location.
    pub database_path: PathBuf,
    /// Agent invocation and turn policy.
    pub agent: AgentSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let dir = config_dir();
        let workspace_root = std::env::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            auth_token: String::new(),
            host: "0.0.0.0".into(),
            port: 8080,
            database_path: dir.join("tether.db"),
            agent: AgentSettings {
                workspace_root,
                ..Default::default()
            },
        }
    }
}

/// Default configuration directory (`~/.tether`).
#[must_use]
pub fn config_dir() -> PathBuf {
    std::env::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Default config file path.
#[must_use]
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl ServerConfig {
    /// Load the config at `path`, creating it (with a generated auth
    /// token) when missing. A present file with an empty token also gets
    /// a fresh token written back.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            serde_json::from_str::<Self>(&std::fs::read_to_string(path)?)?
        } else {
            Self::default()
        };

        if config.auth_token.is_empty() {
            config.auth_token = generate_token();
            config.save(path)?;
            info!(path = %path.display(), "generated new config with auth token");
        }
        Ok(config)
    }

    /// Write the config to `path` (0600 on unix — it holds the token).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// 64 hex chars of OS randomness.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_long_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn first_run_creates_file_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ServerConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.auth_token.len(), 64);

        // Second load returns the same token.
        let again = ServerConfig::load_or_init(&path).unwrap();
        assert_eq!(again.auth_token, config.auth_token);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auth_token": "abc", "port": 9090}"#).unwrap();

        let config = ServerConfig::load_or_init(&path).unwrap();
        assert_eq!(config.auth_token, "abc");
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.agent.binary, "claude");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(ServerConfig::load_or_init(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let _ = ServerConfig::load_or_init(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
