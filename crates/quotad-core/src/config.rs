//! Agent configuration.
//!
//! Built once at startup (TOML file, then command-line flags and environment
//! on top) and handed to every component as an `Arc<AgentConfig>`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quota::DEFAULT_QUOTA_BINARY;
use crate::units::Quantity;

/// Configuration of the node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Name of the node this agent runs on.
    #[serde(default)]
    pub node_name: String,

    /// Root of the managed directory tree; also the quota mount point.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Number of unbound volumes to keep available.
    #[serde(default = "default_available_num")]
    pub available_num: usize,

    /// Interval between reconciliation ticks.
    #[serde(default = "default_list_interval", with = "humantime_serde")]
    pub list_interval: Duration,

    /// Interval between claim listings.
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,

    /// Interval between metric collections.
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,

    /// Capacity advertised on new volumes; detected from the filesystem when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Storage class of managed volumes.
    #[serde(default = "default_storage_class_name")]
    pub storage_class_name: String,

    /// Quota tool binary.
    #[serde(default = "default_quota_binary")]
    pub quota_binary: PathBuf,

    /// Address of the metrics endpoint.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/data")
}

const fn default_available_num() -> usize {
    1
}

const fn default_list_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_resync_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_metrics_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_storage_class_name() -> String {
    "local-storage".to_string()
}

fn default_quota_binary() -> PathBuf {
    PathBuf::from(DEFAULT_QUOTA_BINARY)
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            base_dir: default_base_dir(),
            available_num: default_available_num(),
            list_interval: default_list_interval(),
            resync_interval: default_resync_interval(),
            metrics_interval: default_metrics_interval(),
            storage: None,
            storage_class_name: default_storage_class_name(),
            quota_binary: default_quota_binary(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown keys.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Checks the configuration for values the agent cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Validation("node_name is required".to_string()));
        }
        if !self.base_dir.is_absolute() {
            return Err(ConfigError::Validation(format!(
                "base_dir must be absolute, got {}",
                self.base_dir.display()
            )));
        }
        for (name, interval) in [
            ("list_interval", self.list_interval),
            ("resync_interval", self.resync_interval),
            ("metrics_interval", self.metrics_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Validation(format!("{name} must be non-zero")));
            }
        }
        if let Some(storage) = &self.storage {
            Quantity::parse(storage).map_err(|e| {
                ConfigError::Validation(format!("storage {storage:?} is not a quantity: {e}"))
            })?;
        }
        if self.storage_class_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "storage_class_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
