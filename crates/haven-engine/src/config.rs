//! Runtime configuration
//!
//! Loaded from YAML. `find_and_load` walks parent directories so the
//! runtime can be launched from anywhere inside a deployment tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Default config file name searched for by `find_and_load`
pub const CONFIG_FILE_NAME: &str = "haven.yaml";

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_DATABASE_PATH: &str = "haven.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{name} not found in {start} or any parent directory")]
    NotFound { name: String, start: PathBuf },
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub home_assistant: HomeAssistantConfig,

    /// Forwarded to the sun-position library; unused by the engine
    #[serde(default)]
    pub location: Option<Location>,

    /// Sqlite file path; ":memory:" for tests
    #[serde(default)]
    pub database_path: Option<String>,

    /// Seconds between reconnect attempts
    #[serde(default, rename = "reconnectInterval")]
    pub reconnect_interval: Option<f64>,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_assistant: HomeAssistantConfig::default(),
            location: None,
            database_path: None,
            reconnect_interval: None,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeAssistantConfig {
    /// Upstream address, e.g. "homeassistant.local:8123"
    #[serde(default)]
    pub host: String,

    /// Long-lived access token
    #[serde(default)]
    pub token: String,

    /// The user id our own service calls are attributed to upstream.
    /// Required for loop suppression to work.
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Search the current directory and its parents for
    /// `haven.yaml` and load the first hit.
    pub fn find_and_load() -> Result<Self, ConfigError> {
        let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let mut dir = Some(start.as_path());
        while let Some(current) = dir {
            let candidate = current.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "found config file");
                return Self::load(candidate);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound {
            name: CONFIG_FILE_NAME.to_string(),
            start,
        })
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL)
    }

    pub fn database_path(&self) -> &str {
        self.database_path.as_deref().unwrap_or(DEFAULT_DATABASE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = serde_yaml::from_str(
            r#"
homeAssistant:
  host: homeassistant.local:8123
  token: secret
  userId: abc123
location:
  lat: 52.52
  lng: 13.405
databasePath: /var/lib/haven/haven.db
reconnectInterval: 0.1
metricsEnabled: false
"#,
        )
        .unwrap();

        assert_eq!(config.home_assistant.host, "homeassistant.local:8123");
        assert_eq!(config.home_assistant.user_id, "abc123");
        assert_eq!(config.location.unwrap().lat, 52.52);
        assert_eq!(config.database_path(), "/var/lib/haven/haven.db");
        assert_eq!(config.reconnect_interval(), Duration::from_millis(100));
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn defaults_apply_to_sparse_config() {
        let config: Config = serde_yaml::from_str("homeAssistant:\n  host: ha:8123\n").unwrap();

        assert_eq!(config.database_path(), DEFAULT_DATABASE_PATH);
        assert_eq!(config.reconnect_interval(), DEFAULT_RECONNECT_INTERVAL);
        assert!(config.metrics_enabled);
        assert!(config.location.is_none());
    }

    #[test]
    fn find_and_load_walks_parents() {
        let dir = std::env::temp_dir().join(format!("haven-config-test-{}", std::process::id()));
        let nested = dir.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE_NAME),
            "homeAssistant:\n  host: found:8123\n",
        )
        .unwrap();

        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(&nested).unwrap();
        let result = Config::find_and_load();
        std::env::set_current_dir(original).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(result.unwrap().home_assistant.host, "found:8123");
    }
}
