//! # Event Fan-out
//!
//! Process-wide notification bus carrying device-list snapshots, connectivity
//! changes and human-readable log lines to external observers (UI sessions).
//!
//! Three channels with different delivery semantics:
//! - device list: a `watch` channel, so a new observer sees the current
//!   snapshot immediately and then every registry mutation;
//! - connectivity: incremental changes on a `broadcast` channel, with the
//!   current map kept alongside so a new observer can start from a snapshot;
//! - log lines: a `broadcast` channel, observers join mid-stream and only see
//!   future lines.
//!
//! Within a channel, delivery order is emission order; no ordering is
//! guaranteed across channels.

use crate::registry::Device;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

const CONNECTIVITY_CAPACITY: usize = 64;
const LOG_CAPACITY: usize = 256;

/// Incremental connectivity update for one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub device_id: String,
    pub connected: bool,
}

/// Everything one observer needs: current snapshots plus live receivers.
pub struct BusSubscription {
    pub devices: watch::Receiver<Vec<Device>>,
    pub connectivity_snapshot: HashMap<String, bool>,
    pub connectivity: broadcast::Receiver<ConnectivityChange>,
    pub log: broadcast::Receiver<String>,
}

/// Multi-subscriber notification bus.
pub struct EventBus {
    devices: watch::Sender<Vec<Device>>,
    connected: Mutex<HashMap<String, bool>>,
    connectivity: broadcast::Sender<ConnectivityChange>,
    log: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new() -> Self {
        let (devices, _) = watch::channel(Vec::new());
        let (connectivity, _) = broadcast::channel(CONNECTIVITY_CAPACITY);
        let (log, _) = broadcast::channel(LOG_CAPACITY);
        Self {
            devices,
            connected: Mutex::new(HashMap::new()),
            connectivity,
            log,
        }
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            devices: self.devices.subscribe(),
            connectivity_snapshot: self.connectivity_snapshot(),
            connectivity: self.connectivity.subscribe(),
            log: self.log.subscribe(),
        }
    }

    /// Replaces the device-list snapshot seen by all observers.
    pub fn publish_device_list(&self, devices: Vec<Device>) {
        self.devices.send_replace(devices);
    }

    /// Records and broadcasts a connectivity change.
    ///
    /// The snapshot map is updated before the broadcast so an observer that
    /// subscribes between the two sees the change at least once.
    pub fn publish_connectivity(&self, device_id: &str, connected: bool) {
        self.connected
            .lock()
            .expect("connectivity map poisoned")
            .insert(device_id.to_string(), connected);
        let _ = self.connectivity.send(ConnectivityChange {
            device_id: device_id.to_string(),
            connected,
        });
    }

    /// Forgets connectivity state for a removed device.
    pub fn drop_connectivity(&self, device_id: &str) {
        self.connected
            .lock()
            .expect("connectivity map poisoned")
            .remove(device_id);
    }

    /// Current connectivity map, keyed by device id.
    pub fn connectivity_snapshot(&self) -> HashMap<String, bool> {
        self.connected
            .lock()
            .expect("connectivity map poisoned")
            .clone()
    }

    /// Appends a line to the observer log feed. Lines emitted while nobody
    /// is subscribed are dropped.
    pub fn publish_log(&self, line: impl Into<String>) {
        let _ = self.log.send(line.into());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
