//! Connection manager: one supervisor per registered device.
//!
//! Consumes registry add/remove/change events and the operator-facing
//! set-state entry point. Each device gets an independent runtime (task,
//! cancellation token, command channel, shared state cell); removal cancels
//! the token and joins the task, so a reconnect scheduled by a removed
//! device can never fire afterwards.

use crate::bus::EventBus;
use crate::device::connection::{ConnectionState, ConnectionSupervisor, DeviceCommand};
use crate::device::transport::DeviceConnector;
use crate::mqtt::router::TopicRouter;
use crate::registry::{Device, DeviceEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEVICE_COMMAND_QUEUE: usize = 8;

/// Commands addressed to the manager from the router and the UI layer.
#[derive(Clone, Debug)]
pub enum ManagerCommand {
    SetState { device_id: String, on: bool },
}

struct DeviceRuntime {
    token: CancellationToken,
    cmd_tx: mpsc::Sender<DeviceCommand>,
    state: Arc<Mutex<ConnectionState>>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager<C: DeviceConnector> {
    connector: Arc<C>,
    router: Arc<TopicRouter>,
    bus: Arc<EventBus>,
    connect_timeout: Duration,
    runtimes: HashMap<String, DeviceRuntime>,
}

impl<C: DeviceConnector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        router: Arc<TopicRouter>,
        bus: Arc<EventBus>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector: Arc::new(connector),
            router,
            bus,
            connect_timeout,
            runtimes: HashMap::new(),
        }
    }

    /// Drives the manager until the registry event stream closes.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<DeviceEvent>,
        mut commands: mpsc::Receiver<ManagerCommand>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(DeviceEvent::Added(device)) => self.start(device),
                    Ok(DeviceEvent::Removed(device)) => self.stop(&device.id).await,
                    Ok(DeviceEvent::Changed(device)) => {
                        // A changed record needs fresh bindings; restart the
                        // runtime with the new device data.
                        self.stop(&device.id).await;
                        self.start(device);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "registry event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                command = commands.recv() => match command {
                    Some(ManagerCommand::SetState { device_id, on }) => {
                        self.set_state(&device_id, on);
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    /// Connection state of a device, when it has a runtime.
    pub fn state(&self, device_id: &str) -> Option<ConnectionState> {
        self.runtimes
            .get(device_id)
            .map(|r| *r.state.lock().expect("connection state poisoned"))
    }

    fn start(&mut self, device: Device) {
        if let Some(existing) = self.runtimes.remove(&device.id) {
            // Should have been stopped through an event; never leave two
            // supervisors racing for one device.
            warn!(id = %device.id, "replacing a live runtime");
            existing.token.cancel();
            existing.task.abort();
        }

        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let (cmd_tx, cmd_rx) = mpsc::channel(DEVICE_COMMAND_QUEUE);
        let supervisor = ConnectionSupervisor::new(
            device.clone(),
            self.connector.clone(),
            self.router.clone(),
            self.bus.clone(),
            state.clone(),
            self.connect_timeout,
        );
        let task = tokio::spawn(supervisor.run(token.clone(), cmd_rx));

        info!(id = %device.id, name = %device.name, "device runtime started");
        self.runtimes.insert(
            device.id,
            DeviceRuntime {
                token,
                cmd_tx,
                state,
                task,
            },
        );
    }

    async fn stop(&mut self, device_id: &str) {
        let Some(runtime) = self.runtimes.remove(device_id) else {
            debug!(id = device_id, "stop for unknown device ignored");
            return;
        };

        runtime.token.cancel();
        if let Err(e) = runtime.task.await {
            warn!(id = device_id, "runtime task ended abnormally: {e}");
        }
        self.bus.drop_connectivity(device_id);
        info!(id = device_id, "device runtime stopped");
    }

    /// Forwards a state change to the live link, only when the device is
    /// currently connected. Otherwise the command is dropped, not queued;
    /// the caller retries once connectivity resumes.
    fn set_state(&self, device_id: &str, on: bool) {
        let Some(runtime) = self.runtimes.get(device_id) else {
            warn!(id = device_id, "state change for unknown device dropped");
            return;
        };

        let connected =
            *runtime.state.lock().expect("connection state poisoned") == ConnectionState::Connected;
        if !connected {
            info!(id = device_id, "device not connected, state change dropped");
            return;
        }

        if let Err(e) = runtime.cmd_tx.try_send(DeviceCommand::SetState(on)) {
            warn!(id = device_id, "device command queue full: {e}");
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<String> = self.runtimes.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::transport::testing::{Attempt, MockConnector, MockLink};
    use crate::mqtt::BrokerCommand;
    use crate::persistence::store::StoreHandle;
    use crate::registry::DeviceRegistry;
    use std::sync::atomic::Ordering;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            key: "secret".to_string(),
            name: id.to_string(),
            domoticz: None,
        }
    }

    struct World {
        registry: Arc<DeviceRegistry>,
        commands: mpsc::Sender<ManagerCommand>,
        broker: mpsc::Receiver<BrokerCommand>,
    }

    fn spawn_world(connector: MockConnector) -> World {
        let bus = Arc::new(EventBus::new());
        let registry = DeviceRegistry::new(bus.clone(), StoreHandle::disconnected());
        let (broker_tx, broker_rx) = mpsc::channel(256);
        let (mgr_tx, mgr_rx) = mpsc::channel(64);
        let router = TopicRouter::new("tuya", "domoticz", broker_tx, mgr_tx.clone(), bus.clone());

        let manager =
            ConnectionManager::new(connector, router, bus, Duration::from_secs(10));
        let events = registry.subscribe();
        tokio::spawn(manager.run(events, mgr_rx));

        World {
            registry,
            commands: mgr_tx,
            broker: broker_rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_device_cancels_its_pending_reconnect() {
        let (connector, attempts) = MockConnector::failing();
        let world = spawn_world(connector);

        world.registry.add(device("d1"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        world.registry.remove("d1");
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_reaches_a_connected_device() {
        let (link, _feeder, sent) = MockLink::new();
        let (connector, _attempts) = MockConnector::new(vec![Attempt::Connect(link)]);
        let world = spawn_world(connector);

        world.registry.add(device("d1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        world
            .commands
            .send(ManagerCommand::SetState {
                device_id: "d1".to_string(),
                on: true,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*sent.lock().unwrap(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_is_dropped_while_disconnected() {
        let (link, _feeder, sent) = MockLink::new();
        // First attempt fails, so the device sits in backoff when the
        // command arrives; the later connect must not replay it.
        let (connector, _attempts) =
            MockConnector::new(vec![Attempt::Fail, Attempt::Connect(link)]);
        let world = spawn_world(connector);

        world.registry.add(device("d1"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        world
            .commands
            .send(ManagerCommand::SetState {
                device_id: "d1".to_string(),
                on: true,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn changed_device_gets_fresh_bindings() {
        let (link_a, _feeder_a, _sent_a) = MockLink::new();
        let (link_b, _feeder_b, _sent_b) = MockLink::new();
        let (connector, _attempts) = MockConnector::new(vec![
            Attempt::Connect(link_a),
            Attempt::Connect(link_b),
        ]);
        let mut world = spawn_world(connector);

        world.registry.add(device("d1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        world.registry.update_fields(
            "d1",
            crate::registry::DeviceFields {
                name: None,
                domoticz: Some(5),
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut commands = Vec::new();
        while let Ok(cmd) = world.broker.try_recv() {
            commands.push(cmd);
        }
        // The restart resubscribes with the mirror topic in front.
        assert!(commands.contains(&BrokerCommand::Subscribe("domoticz/out".to_string())));
    }
}
