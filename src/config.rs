//! Configuration file support.
//!
//! Loads optional `concord.toml` from the data directory. If no config file
//! exists, defaults are used.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConcordConfig {
    pub flow: FlowConfig,
    pub node: NodeSection,
}

/// Flow deadlines, in milliseconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Time each counterparty has to verify and sign
    pub session_timeout_ms: u64,
    /// Time the notary has to decide
    pub notary_timeout_ms: u64,
    /// Time each participant has to store a finalised update
    pub delivery_timeout_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            session_timeout_ms: crate::constants::DEFAULT_SESSION_TIMEOUT_MS,
            notary_timeout_ms: crate::constants::DEFAULT_NOTARY_TIMEOUT_MS,
            delivery_timeout_ms: crate::constants::DEFAULT_DELIVERY_TIMEOUT_MS,
        }
    }
}

impl FlowConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn notary_timeout(&self) -> Duration {
        Duration::from_millis(self.notary_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,
    pub data_dir: String,
    /// Keep vaults in memory and generate fresh keys on every run
    pub ephemeral: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            name: "concord".into(),
            data_dir: "./concord-data".into(),
            ephemeral: true,
        }
    }
}

impl NodeSection {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

impl ConcordConfig {
    /// Load configuration from `concord.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join(crate::constants::CONFIG_FILE_NAME);
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
