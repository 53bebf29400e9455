//! Configuration loader for relayflow.
//!
//! Reads `relayflow.toml` (by default from the data directory, `~/.relayflow/`
//! in production) and deserializes it into [`RelayflowConfig`]. A missing file
//! yields the defaults. A file that exists but cannot be read or parsed is an
//! error: relay and executor must agree on the topic, so silently falling back
//! to defaults could split them.

use std::path::{Path, PathBuf};

use relayflow_types::config::RelayflowConfig;

use crate::sqlite::pool::database_url_in;

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "relayflow.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `RELAYFLOW_DATA_DIR` environment variable
/// 2. `~/.relayflow`
/// 3. `.relayflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RELAYFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".relayflow");
    }

    PathBuf::from(".relayflow")
}

/// Load configuration from `path`.
pub async fn load_config(path: &Path) -> Result<RelayflowConfig, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return Ok(RelayflowConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    toml::from_str::<RelayflowConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Run store database URL: the configured one, or `{data_dir}/store.db`.
pub fn store_database_url(config: &RelayflowConfig, data_dir: &Path) -> String {
    config
        .store
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir, "store.db"))
}

/// Broker database URL: the configured one, or `{data_dir}/broker.db`.
pub fn broker_database_url(config: &RelayflowConfig, data_dir: &Path) -> String {
    config
        .broker
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir, "broker.db"))
}
