//! # Device Registry
//!
//! Authoritative in-memory list of known devices with add/remove/change
//! notifications. The registry owns the `Device` records; network state lives
//! in the connection manager and never here.
//!
//! All mutations go through `&self` methods guarded by a single lock, so
//! concurrent callers are serialized and consumers never observe a half
//! applied mutation. Every mutation pushes a fresh device-list snapshot to
//! the event bus and schedules a full-state save through the store handle.

use crate::bus::EventBus;
use crate::persistence::store::StoreHandle;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// A managed smart device.
///
/// `id` is assigned by the vendor/pairing flow and unique across the
/// registry. `key` is the shared secret of the device protocol and immutable
/// once the device exists; changing it requires remove + add.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub key: String,
    pub name: String,
    /// Index of this device in the external mirror system, when mirrored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domoticz: Option<u32>,
}

/// Registry change notification.
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    Added(Device),
    Removed(Device),
    Changed(Device),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} is already registered")]
    DuplicateDevice(String),
}

/// Partial update for `DeviceRegistry::update_fields`. Unset fields are left
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct DeviceFields {
    pub name: Option<String>,
    pub domoticz: Option<u32>,
}

pub struct DeviceRegistry {
    devices: Mutex<Vec<Device>>,
    events: broadcast::Sender<DeviceEvent>,
    bus: Arc<EventBus>,
    store: StoreHandle,
}

impl DeviceRegistry {
    pub fn new(bus: Arc<EventBus>, store: StoreHandle) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            events,
            bus,
            store,
        })
    }

    /// Receiver for add/remove/change events. Subscribe before seeding so no
    /// event is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Current snapshot, in insertion order.
    pub fn list(&self) -> Vec<Device> {
        self.devices.lock().expect("registry lock poisoned").clone()
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Inserts a device, treating an existing `id` as an implicit replace.
    ///
    /// On replace, the change event carries the new record and is emitted
    /// before the swap, so a consumer never observes old and new side by side
    /// without a transition event.
    pub fn add(&self, device: Device) {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        if let Some(pos) = devices.iter().position(|d| d.id == device.id) {
            info!(id = %device.id, "replacing existing device");
            let _ = self.events.send(DeviceEvent::Changed(device.clone()));
            devices.remove(pos);
        } else {
            debug!(id = %device.id, "adding device");
            let _ = self.events.send(DeviceEvent::Added(device.clone()));
        }
        devices.push(device);
        self.after_mutation(devices.as_slice());
    }

    /// Inserts a device only when the id is unused. Used when seeding from the
    /// configuration file, where a duplicate entry is an operator mistake and
    /// the first record wins.
    pub fn insert_unique(&self, device: Device) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        if devices.iter().any(|d| d.id == device.id) {
            return Err(RegistryError::DuplicateDevice(device.id));
        }
        let _ = self.events.send(DeviceEvent::Added(device.clone()));
        devices.push(device);
        self.after_mutation(devices.as_slice());
        Ok(())
    }

    /// Removes a device. Absent ids are a no-op, not an error.
    pub fn remove(&self, id: &str) {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        let Some(pos) = devices.iter().position(|d| d.id == id) else {
            debug!(id, "remove of unknown device ignored");
            return;
        };
        let removed = devices.remove(pos);
        info!(id, "device removed");
        let _ = self.events.send(DeviceEvent::Removed(removed));
        self.after_mutation(devices.as_slice());
    }

    /// Applies the provided fields to an existing device.
    ///
    /// A `domoticz` change emits a change event, because the mirror topic
    /// binding depends on it. A name-only change is persisted and reflected
    /// in the list snapshot without a structural event.
    pub fn update_fields(&self, id: &str, fields: DeviceFields) {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        let Some(device) = devices.iter_mut().find(|d| d.id == id) else {
            warn!(id, "update of unknown device ignored");
            return;
        };

        if let Some(name) = fields.name {
            device.name = name;
        }
        let mut resubscribe = false;
        if let Some(idx) = fields.domoticz {
            if device.domoticz != Some(idx) {
                device.domoticz = Some(idx);
                resubscribe = true;
            }
        }

        let updated = device.clone();
        debug!(id, ?updated, "device updated");
        if resubscribe {
            let _ = self.events.send(DeviceEvent::Changed(updated));
        }
        self.after_mutation(devices.as_slice());
    }

    fn after_mutation(&self, devices: &[Device]) {
        self.bus.publish_device_list(devices.to_vec());
        self.store.schedule_save(devices.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<DeviceRegistry> {
        DeviceRegistry::new(Arc::new(EventBus::new()), StoreHandle::disconnected())
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            key: "secret".to_string(),
            name: format!("device {id}"),
            domoticz: None,
        }
    }

    #[tokio::test]
    async fn add_with_existing_id_emits_one_change_and_keeps_one_record() {
        let registry = registry();
        let mut events = registry.subscribe();

        registry.add(device("d1"));
        let replacement = Device {
            name: "renamed".to_string(),
            ..device("d1")
        };
        registry.add(replacement.clone());

        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Added(_)));
        match events.recv().await.unwrap() {
            DeviceEvent::Changed(d) => assert_eq!(d, replacement),
            other => panic!("expected change event, got {other:?}"),
        }
        assert!(events.try_recv().is_err());

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "renamed");
    }

    #[tokio::test]
    async fn remove_of_absent_id_is_a_noop() {
        let registry = registry();
        let mut events = registry.subscribe();

        registry.remove("ghost");

        assert!(events.try_recv().is_err());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn remove_emits_removed_event() {
        let registry = registry();
        registry.add(device("d1"));
        let mut events = registry.subscribe();

        registry.remove("d1");

        match events.recv().await.unwrap() {
            DeviceEvent::Removed(d) => assert_eq!(d.id, "d1"),
            other => panic!("expected removed event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn domoticz_change_emits_change_event_but_name_change_does_not() {
        let registry = registry();
        registry.add(device("d1"));
        let mut events = registry.subscribe();

        registry.update_fields(
            "d1",
            DeviceFields {
                name: Some("new name".to_string()),
                domoticz: None,
            },
        );
        assert!(events.try_recv().is_err());
        assert_eq!(registry.get("d1").unwrap().name, "new name");

        registry.update_fields(
            "d1",
            DeviceFields {
                name: None,
                domoticz: Some(7),
            },
        );
        match events.recv().await.unwrap() {
            DeviceEvent::Changed(d) => assert_eq!(d.domoticz, Some(7)),
            other => panic!("expected change event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_domoticz_value_does_not_emit() {
        let registry = registry();
        registry.add(Device {
            domoticz: Some(7),
            ..device("d1")
        });
        let mut events = registry.subscribe();

        registry.update_fields(
            "d1",
            DeviceFields {
                name: None,
                domoticz: Some(7),
            },
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn seeding_rejects_duplicate_ids() {
        let registry = registry();
        registry.insert_unique(device("d1")).unwrap();

        match registry.insert_unique(device("d1")) {
            Err(RegistryError::DuplicateDevice(id)) => assert_eq!(id, "d1"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn mutations_refresh_bus_snapshot() {
        let bus = Arc::new(EventBus::new());
        let registry = DeviceRegistry::new(bus.clone(), StoreHandle::disconnected());

        registry.add(device("d1"));
        let sub = bus.subscribe();
        assert_eq!(sub.devices.borrow().len(), 1);

        registry.remove("d1");
        assert!(sub.devices.borrow().is_empty());
    }
}
