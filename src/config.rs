//! Configuration management for querymux.
//!
//! Handles loading configuration from TOML files and environment variables,
//! with daemon settings and named connection profiles.

use crate::error::{QueryMuxError, Result};
use crate::profiles::ConnectionProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "QUERYMUX_RUNTIME_DIR";

/// Main configuration structure for querymux.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Named connection profiles, keyed by profile id.
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionProfile>,
}

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the PID marker, the socket and the daemon log.
    pub runtime_dir: Option<PathBuf>,

    /// Whether the HTTP + SSE transport is enabled.
    #[serde(default = "default_http")]
    pub http: bool,

    /// Address for the HTTP transport. Port 0 picks a free port.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// How long a client waits for a spawned daemon to accept connections.
    #[serde(default = "default_spawn_timeout_secs")]
    pub spawn_timeout_secs: u64,

    /// Rows per page for row-streaming connectors.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_http() -> bool {
    true
}

fn default_http_addr() -> String {
    "127.0.0.1:0".to_string()
}

fn default_spawn_timeout_secs() -> u64 {
    10
}

fn default_page_size() -> usize {
    500
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            http: default_http(),
            http_addr: default_http_addr(),
            spawn_timeout_secs: default_spawn_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl DaemonConfig {
    /// Returns the spawn deadline as a duration.
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs.max(1))
    }

    /// Resolves the runtime directory.
    ///
    /// Precedence: `QUERYMUX_RUNTIME_DIR`, the config file, the platform
    /// runtime directory, the platform state directory, the temp directory.
    pub fn resolve_runtime_dir(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(RUNTIME_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.runtime_dir {
            return dir.clone();
        }
        dirs::runtime_dir()
            .or_else(dirs::state_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("querymux")
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("querymux")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| QueryMuxError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            QueryMuxError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Returns the connection profiles with ids (and default names) filled
    /// in from their table keys.
    pub fn profiles(&self) -> Vec<ConnectionProfile> {
        self.connections
            .iter()
            .map(|(id, profile)| {
                let mut profile = profile.clone();
                profile.id = id.clone();
                if profile.name.is_empty() {
                    profile.name = id.clone();
                }
                profile
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
[daemon]
runtime_dir = "/tmp/qm"
http_addr = "127.0.0.1:7411"
spawn_timeout_secs = 5

[connections.warehouse]
type = "trino"
name = "Warehouse"
host = "trino.internal"
port = 8080
user = "analyst"
catalog = "hive"

[connections.local]
type = "sqlite"
path = "~/data/app.db"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.daemon.runtime_dir, Some(PathBuf::from("/tmp/qm")));
        assert_eq!(config.daemon.http_addr, "127.0.0.1:7411");
        assert_eq!(config.daemon.spawn_timeout(), Duration::from_secs(5));
        assert!(config.daemon.http);

        let profiles = config.profiles();
        assert_eq!(profiles.len(), 2);

        let local = profiles.iter().find(|p| p.id == "local").unwrap();
        assert_eq!(local.kind, "sqlite");
        assert_eq!(local.name, "local");
        assert_eq!(local.str_field("path"), Some("~/data/app.db"));

        let warehouse = profiles.iter().find(|p| p.id == "warehouse").unwrap();
        assert_eq!(warehouse.name, "Warehouse");
        assert_eq!(warehouse.u64_field("port"), Some(8080));
    }

    #[test]
    fn test_missing_optional_fields() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connections.is_empty());
        assert_eq!(config.daemon.page_size, 500);
        assert_eq!(config.daemon.spawn_timeout_secs, 10);
        assert_eq!(config.daemon.http_addr, "127.0.0.1:0");
    }

    #[test]
    fn test_connection_requires_type() {
        let toml = r#"
[connections.broken]
host = "localhost"
"#;
        let result = Config::parse_toml(toml, Path::new("config.toml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("config.toml"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert!(config.profiles().is_empty());
    }

    #[test]
    fn test_runtime_dir_from_config() {
        let daemon = DaemonConfig {
            runtime_dir: Some(PathBuf::from("/var/run/qm")),
            ..Default::default()
        };
        if std::env::var_os(RUNTIME_DIR_ENV).is_none() {
            assert_eq!(daemon.resolve_runtime_dir(), PathBuf::from("/var/run/qm"));
        }
    }
}
