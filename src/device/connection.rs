//! Per-device connection state machine.
//!
//! One supervisor task per registered device walks
//! `Disconnected -> Connecting -> Connected` and back, reconnecting with
//! deterministic exponential backoff. Topic bindings exist exactly while the
//! device is connected. A status payload signalling a wrong shared key is
//! fatal for the device: the connection is dropped and the supervisor parks
//! until the device is removed or replaced, instead of burning reconnect
//! attempts against a key only the operator can fix.

use crate::bus::EventBus;
use crate::device::transport::{DeviceConnector, DeviceLink, LinkEvent};
use crate::device::DeviceError;
use crate::mqtt::router::TopicRouter;
use crate::registry::Device;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconnect delay ceiling.
pub const BACKOFF_CEILING_SECS: u64 = 300;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Deterministic exponential reconnect backoff: starts at one second,
/// doubles per failed attempt, capped at [`BACKOFF_CEILING_SECS`]. No jitter.
#[derive(Clone, Debug)]
pub struct Backoff {
    secs: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self { secs: 1 }
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.secs = 1;
    }

    /// Delay before the next attempt. Doubles the stored value for the
    /// following schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.secs.min(BACKOFF_CEILING_SECS));
        self.secs = (self.secs * 2).min(BACKOFF_CEILING_SECS);
        delay
    }

    pub fn current_secs(&self) -> u64 {
        self.secs
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Command for a live device link.
#[derive(Clone, Copy, Debug)]
pub enum DeviceCommand {
    SetState(bool),
}

enum ConnectedExit {
    Dropped,
    InvalidKey,
    Cancelled,
}

enum Step {
    Cancelled,
    Command(Option<DeviceCommand>),
    Event(LinkEvent),
}

/// Runs the connection lifecycle of one device until cancelled.
pub struct ConnectionSupervisor<C: DeviceConnector> {
    device: Device,
    connector: Arc<C>,
    router: Arc<TopicRouter>,
    bus: Arc<EventBus>,
    state: Arc<Mutex<ConnectionState>>,
    connect_timeout: Duration,
    backoff: Backoff,
}

impl<C: DeviceConnector> ConnectionSupervisor<C> {
    pub fn new(
        device: Device,
        connector: Arc<C>,
        router: Arc<TopicRouter>,
        bus: Arc<EventBus>,
        state: Arc<Mutex<ConnectionState>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            device,
            connector,
            router,
            bus,
            state,
            connect_timeout,
            backoff: Backoff::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken, mut commands: mpsc::Receiver<DeviceCommand>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            debug!(id = %self.device.id, "connecting");

            let connected = tokio::select! {
                _ = token.cancelled() => break,
                result = self.connector.connect(&self.device, self.connect_timeout) => result,
            };

            match connected {
                Ok(link) => match self.connected(link, &mut commands, &token).await {
                    ConnectedExit::Cancelled => break,
                    ConnectedExit::InvalidKey => {
                        error!(
                            id = %self.device.id,
                            "device key {} cannot read status data, waiting for operator correction",
                            self.device.key
                        );
                        self.set_state(ConnectionState::Error);
                        token.cancelled().await;
                        break;
                    }
                    ConnectedExit::Dropped => {
                        self.set_state(ConnectionState::Disconnected);
                    }
                },
                Err(e) => {
                    warn!(id = %self.device.id, "connect failed: {e}");
                    self.set_state(ConnectionState::Error);
                    self.router.publish_status(&self.device.id, "Error").await;
                    self.bus.publish_connectivity(&self.device.id, false);
                }
            }

            let delay = self.backoff.next_delay();
            debug!(id = %self.device.id, ?delay, "scheduling reconnect");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(id = %self.device.id, "connection supervisor stopped");
    }

    async fn connected(
        &mut self,
        mut link: C::Link,
        commands: &mut mpsc::Receiver<DeviceCommand>,
        token: &CancellationToken,
    ) -> ConnectedExit {
        // State commands are dropped while offline, never queued; anything
        // still in the channel predates this connection.
        while commands.try_recv().is_ok() {}

        self.set_state(ConnectionState::Connected);
        self.backoff.reset();
        self.router.register_device(&self.device).await;
        self.router
            .publish_status(&self.device.id, "Connected")
            .await;
        self.bus.publish_connectivity(&self.device.id, true);
        info!(id = %self.device.id, name = %self.device.name, "device connected");

        let exit = loop {
            let step = tokio::select! {
                _ = token.cancelled() => Step::Cancelled,
                command = commands.recv() => Step::Command(command),
                event = link.next_event() => Step::Event(event),
            };

            match step {
                Step::Cancelled => break ConnectedExit::Cancelled,
                Step::Command(None) => break ConnectedExit::Cancelled,
                Step::Command(Some(DeviceCommand::SetState(on))) => {
                    debug!(id = %self.device.id, on, "forwarding state change");
                    if let Err(e) = link.set_state(on).await {
                        warn!(id = %self.device.id, "state change failed: {e}");
                        break ConnectedExit::Dropped;
                    }
                }
                Step::Event(LinkEvent::Data(dps)) => {
                    self.router
                        .publish_data(&self.device.id, &dps, self.device.domoticz)
                        .await;
                }
                Step::Event(LinkEvent::Invalid(raw)) => {
                    let error = DeviceError::InvalidCredential(raw);
                    error!(id = %self.device.id, "{error}");
                    break ConnectedExit::InvalidKey;
                }
                Step::Event(LinkEvent::Closed) => break ConnectedExit::Dropped,
            }
        };

        self.router.unregister_device(&self.device.id).await;
        self.router
            .publish_status(&self.device.id, "Disconnected")
            .await;
        self.bus.publish_connectivity(&self.device.id, false);
        info!(id = %self.device.id, "device disconnected");
        exit
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("connection state poisoned") = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::manager::ManagerCommand;
    use crate::device::transport::testing::{Attempt, MockConnector, MockLink};
    use crate::mqtt::BrokerCommand;
    use crate::registry::Device;
    use tokio::sync::mpsc::Receiver;

    #[test]
    fn backoff_grows_one_two_four_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));

        for _ in 0..16 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
        assert_eq!(backoff.current_secs(), 300);
    }

    #[test]
    fn backoff_resets_to_one_second() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            key: "secret".to_string(),
            name: id.to_string(),
            domoticz: None,
        }
    }

    struct Harness {
        token: CancellationToken,
        commands: mpsc::Sender<DeviceCommand>,
        state: Arc<Mutex<ConnectionState>>,
        _broker: Receiver<BrokerCommand>,
        _manager: Receiver<ManagerCommand>,
    }

    fn spawn_supervisor(connector: MockConnector) -> Harness {
        let bus = Arc::new(EventBus::new());
        let (broker_tx, broker_rx) = mpsc::channel(256);
        let (mgr_tx, mgr_rx) = mpsc::channel(256);
        let router = TopicRouter::new("tuya", "domoticz", broker_tx, mgr_tx, bus.clone());

        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let token = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let supervisor = ConnectionSupervisor::new(
            device("d1"),
            Arc::new(connector),
            router,
            bus,
            state.clone(),
            Duration::from_secs(10),
        );
        tokio::spawn(supervisor.run(token.clone(), cmd_rx));

        Harness {
            token,
            commands: cmd_tx,
            state,
            _broker: broker_rx,
            _manager: mgr_rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_follow_backoff_schedule() {
        let (connector, attempts) = MockConnector::failing();
        let _harness = spawn_supervisor(connector);

        // Attempts land at t = 0s, 1s, 3s, 7s for the 1s/2s/4s schedule.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_backoff() {
        // Fail twice, connect once (link closes immediately), then fail on.
        // With the reset the fourth attempt lands at t = 4s; without it the
        // schedule would not reach four attempts until t = 7s.
        let (connector, attempts) = MockConnector::new(vec![
            Attempt::Fail,
            Attempt::Fail,
            Attempt::Connect(MockLink::closed()),
        ]);
        let _harness = spawn_supervisor(connector);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_reconnects() {
        let (connector, attempts) = MockConnector::failing();
        let harness = spawn_supervisor(connector);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);

        harness.token.cancel();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_key_parks_without_retry() {
        let (link, feeder, _sent) = MockLink::new();
        let (connector, attempts) = MockConnector::new(vec![Attempt::Connect(link)]);
        let harness = spawn_supervisor(connector);

        tokio::time::sleep(Duration::from_millis(100)).await;
        feeder
            .send(LinkEvent::Invalid("garbled".to_string()))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(*harness.state.lock().unwrap(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn state_commands_reach_the_link_while_connected() {
        let (link, _feeder, sent) = MockLink::new();
        let (connector, _attempts) = MockConnector::new(vec![Attempt::Connect(link)]);
        let harness = spawn_supervisor(connector);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*harness.state.lock().unwrap(), ConnectionState::Connected);

        harness
            .commands
            .send(DeviceCommand::SetState(true))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*sent.lock().unwrap(), vec![true]);
    }
}
