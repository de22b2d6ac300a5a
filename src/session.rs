//! # Observer Session
//!
//! Boundary to the transport/UI collaborator. One `Session` drives one
//! connected observer: it sends the initial device-list and connectivity
//! snapshots plus a replay of recently handled broker traffic, then streams
//! bus events, and it executes the UI command set. The wire transport itself
//! (WebSocket server or otherwise) lives outside this crate; it only needs
//! to shuttle JSON strings in and `SessionMessage` values out.

use crate::bus::EventBus;
use crate::device::discovery::Discovery;
use crate::device::pairing;
use crate::mqtt::router::TopicRouter;
use crate::persistence::PairingCredentials;
use crate::registry::{Device, DeviceFields, DeviceRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Commands a UI observer may send. Anything that does not parse into one of
/// these is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum SessionCommand {
    Search,
    AddDevice { data: Value },
    UpdateDevice {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        domoticz: Option<Value>,
    },
    DeleteDevice { id: String },
}

/// Messages pushed to a UI observer.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "cmd", content = "data", rename_all = "lowercase")]
pub enum SessionMessage {
    Devices(Vec<Device>),
    /// Connectivity map; full on session start, single-entry afterwards.
    Connected(HashMap<String, bool>),
    Console(String),
    SearchDone(SearchResult),
}

/// Outcome of a `search` command.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
}

/// Shape of the `adddevice` payload; id and key are mandatory, the rest is
/// optional.
#[derive(Debug, Deserialize)]
struct NewDevice {
    id: String,
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    domoticz: Option<u32>,
}

pub struct Session {
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    router: Arc<TopicRouter>,
    discovery: Arc<Discovery>,
    credentials: PairingCredentials,
}

impl Session {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        router: Arc<TopicRouter>,
        discovery: Arc<Discovery>,
        credentials: PairingCredentials,
    ) -> Self {
        Self {
            registry,
            bus,
            router,
            discovery,
            credentials,
        }
    }

    /// Runs the session until the observer disconnects (inbound closes) or
    /// stops reading (outbound closes).
    pub fn spawn(
        self,
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<SessionMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound, outbound))
    }

    async fn run(self, mut inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<SessionMessage>) {
        let mut sub = self.bus.subscribe();

        let initial_devices = sub.devices.borrow_and_update().clone();
        if outbound
            .send(SessionMessage::Devices(initial_devices))
            .await
            .is_err()
        {
            return;
        }
        let _ = outbound
            .send(SessionMessage::Connected(sub.connectivity_snapshot.clone()))
            .await;
        for line in self.router.recent_messages() {
            let _ = outbound.send(SessionMessage::Console(line)).await;
        }

        loop {
            tokio::select! {
                raw = inbound.recv() => match raw {
                    Some(text) => self.handle_command(&text, &outbound),
                    None => break,
                },
                changed = sub.devices.changed() => match changed {
                    Ok(()) => {
                        let devices = sub.devices.borrow_and_update().clone();
                        if outbound.send(SessionMessage::Devices(devices)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                change = sub.connectivity.recv() => match change {
                    Ok(change) => {
                        let update =
                            HashMap::from([(change.device_id, change.connected)]);
                        if outbound.send(SessionMessage::Connected(update)).await.is_err() {
                            break;
                        }
                    }
                    // Dropped increments; resend the whole map.
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let snapshot = self.bus.connectivity_snapshot();
                        if outbound.send(SessionMessage::Connected(snapshot)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                line = sub.log.recv() => match line {
                    Ok(line) => {
                        if outbound.send(SessionMessage::Console(line)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "observer missed log lines");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("session closed");
    }

    fn handle_command(&self, raw: &str, outbound: &mpsc::Sender<SessionMessage>) {
        let command = match serde_json::from_str::<SessionCommand>(raw) {
            Ok(command) => command,
            Err(e) => {
                debug!("ignoring unknown command: {e}");
                return;
            }
        };

        match command {
            SessionCommand::Search => self.search(outbound.clone()),
            SessionCommand::AddDevice { data } => self.add_device(data),
            SessionCommand::UpdateDevice { id, name, domoticz } => {
                let fields = DeviceFields {
                    name,
                    domoticz: domoticz.as_ref().and_then(parse_index),
                };
                self.registry.update_fields(&id, fields);
            }
            SessionCommand::DeleteDevice { id } => self.registry.remove(&id),
        }
    }

    fn add_device(&self, data: Value) {
        let record = match serde_json::from_value::<NewDevice>(data) {
            Ok(record) => record,
            Err(e) => {
                debug!("ignoring adddevice without id and key: {e}");
                return;
            }
        };

        let device = Device {
            name: record.name.unwrap_or_else(|| record.id.clone()),
            id: record.id,
            key: record.key,
            domoticz: record.domoticz,
        };
        info!(id = %device.id, "device added by observer");
        self.bus.publish_log(format!("Device added: {}", device.id));
        self.registry.add(device);
    }

    /// Pairing can take a long time; it runs off the session loop so the
    /// observer keeps receiving events meanwhile.
    fn search(&self, outbound: mpsc::Sender<SessionMessage>) {
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let discovery = self.discovery.clone();
        let credentials = self.credentials.clone();

        tokio::spawn(async move {
            let known: Vec<String> = registry.list().into_iter().map(|d| d.id).collect();
            let result = match pairing::find_device(&discovery, &known, &credentials).await {
                Ok(device) => {
                    bus.publish_log(format!("Device added: {}", device.id));
                    registry.add(device.clone());
                    SearchResult {
                        success: true,
                        message: Some(format!("Device {} added", device.name)),
                        device: Some(device),
                    }
                }
                Err(e) => SearchResult {
                    success: false,
                    message: Some(e.to_string()),
                    device: None,
                },
            };
            let _ = outbound.send(SessionMessage::SearchDone(result)).await;
        });
    }
}

fn parse_index(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
