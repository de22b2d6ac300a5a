//! # Persistence Module
//!
//! Configuration data model and the store worker that writes it to disk.
//!
//! The whole bridge is configured through a single TOML file: the device list,
//! the broker connection, pairing credentials and connection tuning. A missing
//! file is seeded from the default template so a fresh install starts up
//! without manual steps. An unreadable or corrupt file is the one fatal
//! startup error in the system; everything after startup treats persistence
//! failures as log-and-continue.

pub mod store;

use crate::registry::Device;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "TUYABRIDGE_CONFIG";

/// Errors raised by configuration loading and saving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to resolve a configuration directory")]
    NoConfigDir,

    #[error("unable to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to write configuration {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("unable to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Complete persisted state of the bridge.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    /// Known devices, in registration order.
    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub pairing: PairingCredentials,

    #[serde(default)]
    pub connection: ConnectionTuning,
}

/// MQTT broker endpoint and topic layout.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for the bridge's own topics (`<prefix>/<id>`, `<prefix>/out`,
    /// `<prefix>/debug`).
    pub topic_prefix: String,
    /// Prefix of the external mirror system (`<mirror>/in`, `<mirror>/out`).
    pub mirror_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic_prefix: "tuya".to_string(),
            mirror_prefix: "domoticz".to_string(),
        }
    }
}

/// Vendor API credentials used by the pairing flow.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PairingCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_region: String,
    /// Upper bound on a single pairing attempt, in seconds.
    pub timeout_secs: u64,
}

impl Default for PairingCredentials {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            api_region: "eu".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Tuning knobs for device connections.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTuning {
    /// Upper bound on a single connect attempt (discovery + handshake),
    /// in seconds.
    pub connect_timeout_secs: u64,
    /// UDP port the devices announce themselves on.
    pub discovery_port: u16,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            discovery_port: 6667,
        }
    }
}
