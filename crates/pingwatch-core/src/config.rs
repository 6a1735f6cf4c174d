//! Configuration for the peers to monitor and the monitor cadence.
//!
//! Loaded from a JSON file with PascalCase keys. Parsing is lenient (every
//! key is optional); `Config::validate()` enforces the required fields.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("One or more peers must be configured")]
    TooFewPeers,
    #[error("All peers must have a Name")]
    NoPeerName,
    #[error("Peer {peer:?} must have a Network")]
    NoPeerNetwork { peer: String },
    #[error("Invalid {field} duration {value:?}: {source}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        source: humantime::DurationError,
    },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// Configuration for a single monitored peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PeerConfig {
    /// Display name, e.g. "ISP A"
    pub name: String,
    /// CIDR network echo requests are expected from, e.g. "192.168.1.0/24"
    pub network: String,
    /// Seen cycles before the peer is considered up (0 = global value)
    pub up_threshold: u32,
    /// Missed cycles before the peer is considered down (0 = global value)
    pub down_threshold: u32,
    /// Webhook URL for this peer's events (empty = global value)
    pub webhook: String,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            ..Default::default()
        }
    }

    /// Check the peer has a name and a network.
    ///
    /// The network is only checked for presence here; it is parsed when the
    /// peer registry is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::NoPeerName);
        }
        if self.network.is_empty() {
            return Err(ConfigError::NoPeerNetwork {
                peer: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Global configuration and the list of peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Default seen cycles before a peer is considered up
    pub up_threshold: u32,
    /// Default missed cycles before a peer is considered down
    pub down_threshold: u32,
    /// Time between liveness checks, e.g. "4s", "1m"
    pub monitor_cycle: String,
    /// Window a peer must have sent an echo request within to count as seen
    pub peer_timeout: String,
    /// Default webhook URL (empty = no webhook)
    pub webhook: String,
    /// Peers to monitor, matched in this order
    pub peers: Vec<PeerConfig>,
}

impl Config {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content)?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Check the configuration is usable.
    ///
    /// Requires at least one peer, a name and network for every peer, and
    /// non-zero `MonitorCycle` and `PeerTimeout` durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::TooFewPeers);
        }
        for peer in &self.peers {
            peer.validate()?;
        }
        self.monitor_cycle()?;
        self.peer_timeout()?;
        Ok(())
    }

    /// Parsed `MonitorCycle`.
    pub fn monitor_cycle(&self) -> Result<Duration, ConfigError> {
        parse_duration("MonitorCycle", &self.monitor_cycle)
    }

    /// Parsed `PeerTimeout`.
    pub fn peer_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("PeerTimeout", &self.peer_timeout)
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let duration =
        humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
            source,
        })?;
    if duration.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(duration)
}
