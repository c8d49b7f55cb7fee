//! Daemon configuration file.
//!
//! Every section and every key is optional; anything left out keeps the
//! library default.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! heartbeat_interval_secs = 15
//!
//! [storage]
//! path = "/srv/downloads"
//!
//! [bandwidth]
//! interval_secs = 1
//!
//! [auth]
//! token = "s3cret"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use skiff_sync::{ServerConfig, StorageConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub bandwidth: BandwidthSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind_addr: String,
    pub path: String,
    pub outbound_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub send_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind_addr: defaults.bind_addr,
            path: defaults.path,
            outbound_queue_capacity: defaults.outbound_queue_capacity,
            heartbeat_interval_secs: defaults.heartbeat_interval_secs,
            send_timeout_secs: defaults.send_timeout_secs,
            shutdown_grace_secs: defaults.shutdown_grace_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub path: PathBuf,
    pub extension: String,
    pub poll_interval_secs: u64,
    pub update_interval_secs: u64,
    pub settle_millis: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        let defaults = StorageConfig::default();
        Self {
            path: defaults.path,
            extension: defaults.extension,
            poll_interval_secs: defaults.poll_interval_secs,
            update_interval_secs: defaults.update_interval_secs,
            settle_millis: defaults.settle_millis,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BandwidthSection {
    /// Seconds between two bandwidth samples
    pub interval_secs: u64,
}

impl Default for BandwidthSection {
    fn default() -> Self {
        Self { interval_secs: 1 }
    }
}

/// Without a token every handshake is accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    pub token: Option<String>,
}

impl Config {
    /// Load `path`, or the defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::parse(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Interval timers cannot run with a zero period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("server.heartbeat_interval_secs", self.server.heartbeat_interval_secs),
            ("server.outbound_queue_capacity", self.server.outbound_queue_capacity as u64),
            ("storage.poll_interval_secs", self.storage.poll_interval_secs),
            ("storage.update_interval_secs", self.storage.update_interval_secs),
            ("bandwidth.interval_secs", self.bandwidth.interval_secs),
        ];
        match periods.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Zero(*name)),
            None => Ok(()),
        }
    }

    /// Command-line values win over the file.
    pub fn apply_overrides(&mut self, bind: Option<String>, storage: Option<PathBuf>) {
        if let Some(bind) = bind {
            self.server.bind_addr = bind;
        }
        if let Some(storage) = storage {
            self.storage.path = storage;
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server.bind_addr.clone(),
            path: self.server.path.clone(),
            outbound_queue_capacity: self.server.outbound_queue_capacity,
            heartbeat_interval_secs: self.server.heartbeat_interval_secs,
            send_timeout_secs: self.server.send_timeout_secs,
            shutdown_grace_secs: self.server.shutdown_grace_secs,
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            path: self.storage.path.clone(),
            extension: self.storage.extension.clone(),
            poll_interval_secs: self.storage.poll_interval_secs,
            update_interval_secs: self.storage.update_interval_secs,
            settle_millis: self.storage.settle_millis,
        }
    }

    pub fn bandwidth_interval(&self) -> Duration {
        Duration::from_secs(self.bandwidth.interval_secs)
    }
}
