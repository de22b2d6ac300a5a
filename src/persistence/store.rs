//! Configuration store: file resolution, seeding, loading and the async
//! save worker.
//!
//! Saves are full-state writes scheduled through a channel so that registry
//! mutations never wait on the filesystem. A failed save is logged and the
//! in-memory state stays authoritative.

use super::{Config, ConfigError, CONFIG_ENV};
use crate::registry::Device;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Capacity of the save queue. Saves are coalesced by being full-state, so a
/// small queue is enough.
const SAVE_QUEUE_CAPACITY: usize = 16;

/// Resolves the configuration file path.
///
/// `TUYABRIDGE_CONFIG` wins when set; otherwise the platform configuration
/// directory is used.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join("tuyabridge").join("config.toml"))
}

/// Loads the configuration, seeding the default template first when the file
/// does not exist yet.
///
/// Any error here is fatal to startup; this is the only place in the system
/// where a persistence error terminates the process.
pub fn load_or_seed(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(path = %path.display(), "seeding default configuration");
        write_config(path, &Config::default())?;
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let serialized = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, serialized).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
enum StoreCommand {
    SaveDevices(Vec<Device>),
}

/// Cheap handle for scheduling configuration saves from other components.
#[derive(Clone, Debug)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Schedules a full-state save with the given device list.
    ///
    /// Never blocks and never fails the caller; a full queue only means a
    /// save is already pending and the latest list will be captured by a
    /// follow-up schedule.
    pub fn schedule_save(&self, devices: Vec<Device>) {
        if let Err(e) = self.tx.try_send(StoreCommand::SaveDevices(devices)) {
            debug!("save already pending, skipping schedule: {e}");
        }
    }

    /// Handle that drops every scheduled save. For wiring tests.
    #[cfg(test)]
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Owns the configuration file and serializes all writes to it.
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
    rx: mpsc::Receiver<StoreCommand>,
}

impl ConfigStore {
    /// Spawns the store worker. The returned handle is the only way to
    /// schedule writes.
    pub fn spawn(path: PathBuf, config: Config) -> (StoreHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(SAVE_QUEUE_CAPACITY);
        let store = Self { path, config, rx };
        let task = tokio::spawn(store.run());
        (StoreHandle { tx }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                StoreCommand::SaveDevices(devices) => {
                    self.config.devices = devices;
                    if let Err(e) = write_config(&self.path, &self.config) {
                        error!("configuration save failed: {e}");
                    } else {
                        debug!(path = %self.path.display(), "configuration saved");
                    }
                }
            }
        }
    }
}
