//! Transport seam between the connection state machine and the wire.
//!
//! `DeviceConnector` opens a link to one device, `DeviceLink` is the live
//! handle with the capabilities the state machine needs: send a state change
//! and surface inbound events. The LAN transport is the single production
//! variant today; the seam exists so further transports can be added without
//! touching the state machine.
//!
//! Wire shape of the LAN transport: discovery resolves the device id to an
//! address, then newline-delimited JSON over TCP. A status report carries a
//! `dps` object keyed by data-point id. A device that cannot read the shared
//! key answers with unstructured data instead, which the link surfaces as
//! `LinkEvent::Invalid`.

use super::discovery::Discovery;
use super::DeviceError;
use crate::registry::Device;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace};

/// TCP port the devices listen on.
pub const DEVICE_PORT: u16 = 6668;

/// Something the device sent over a live link.
#[derive(Debug)]
pub enum LinkEvent {
    /// Structured status report: data points keyed by id.
    Data(Map<String, Value>),
    /// Unreadable status data, the signature of a wrong shared key.
    Invalid(String),
    /// The transport dropped.
    Closed,
}

/// Live handle to one connected device.
pub trait DeviceLink: Send {
    fn set_state(&mut self, on: bool) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn next_event(&mut self) -> impl Future<Output = LinkEvent> + Send;
}

/// Opens links to devices. Implementations are shared across all device
/// tasks.
pub trait DeviceConnector: Send + Sync + 'static {
    type Link: DeviceLink + 'static;

    /// Connects to the device within `limit`; a timeout is an ordinary
    /// connection failure and feeds the caller's backoff.
    fn connect(
        &self,
        device: &Device,
        limit: Duration,
    ) -> impl Future<Output = Result<Self::Link, DeviceError>> + Send;
}

/// Production transport: discovery plus line-delimited JSON over TCP.
#[derive(Clone)]
pub struct LanConnector {
    discovery: Arc<Discovery>,
}

impl LanConnector {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self { discovery }
    }
}

impl DeviceConnector for LanConnector {
    type Link = LanLink;

    fn connect(
        &self,
        device: &Device,
        limit: Duration,
    ) -> impl Future<Output = Result<Self::Link, DeviceError>> + Send {
        async move {
            let attempt = async {
                let announce = self.discovery.wait_for(&device.id, limit).await?;
                debug!(id = %device.id, ip = %announce.ip, "device located");

                let stream = TcpStream::connect((announce.ip, DEVICE_PORT)).await?;
                let mut framed = Framed::new(stream, LinesCodec::new());

                let hello = json!({
                    "t": "query",
                    "gwId": device.id,
                    "devId": device.id,
                    "key": device.key,
                });
                framed
                    .send(hello.to_string())
                    .await
                    .map_err(|e| DeviceError::ConnectionFailure(format!("handshake: {e}")))?;

                Ok(LanLink { framed })
            };

            match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(DeviceError::Timeout(limit)),
            }
        }
    }
}

pub struct LanLink {
    framed: Framed<TcpStream, LinesCodec>,
}

impl DeviceLink for LanLink {
    fn set_state(&mut self, on: bool) -> impl Future<Output = Result<(), DeviceError>> + Send {
        async move {
            let message = json!({"t": "set", "dps": {"1": on}});
            self.framed
                .send(message.to_string())
                .await
                .map_err(|e| DeviceError::ConnectionFailure(format!("send: {e}")))
        }
    }

    fn next_event(&mut self) -> impl Future<Output = LinkEvent> + Send {
        async move {
            loop {
                let line = match self.framed.next().await {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        debug!("link read error: {e}");
                        return LinkEvent::Closed;
                    }
                    None => return LinkEvent::Closed,
                };

                match serde_json::from_str::<Value>(&line) {
                    Ok(Value::Object(object)) => {
                        if let Some(dps) = object.get("dps").and_then(Value::as_object) {
                            return LinkEvent::Data(dps.clone());
                        }
                        // Acks and heartbeats carry no data points.
                        trace!("link housekeeping message: {line}");
                    }
                    _ => return LinkEvent::Invalid(line),
                }
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Scriptable connector and link for state-machine tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Outcome of one scripted connect attempt.
    pub enum Attempt {
        Fail,
        Connect(MockLink),
    }

    /// Connector driven by a finite script; attempts past the end fail.
    pub struct MockConnector {
        attempts: Arc<AtomicUsize>,
        script: Mutex<VecDeque<Attempt>>,
    }

    impl MockConnector {
        pub fn new(script: Vec<Attempt>) -> (Self, Arc<AtomicUsize>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    attempts: attempts.clone(),
                    script: Mutex::new(script.into()),
                },
                attempts,
            )
        }

        /// Connector that fails every attempt.
        pub fn failing() -> (Self, Arc<AtomicUsize>) {
            Self::new(Vec::new())
        }
    }

    impl DeviceConnector for MockConnector {
        type Link = MockLink;

        fn connect(
            &self,
            _device: &Device,
            _limit: Duration,
        ) -> impl Future<Output = Result<Self::Link, DeviceError>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let attempt = self.script.lock().unwrap().pop_front();
            async move {
                match attempt {
                    Some(Attempt::Connect(link)) => Ok(link),
                    Some(Attempt::Fail) | None => {
                        Err(DeviceError::ConnectionFailure("scripted failure".into()))
                    }
                }
            }
        }
    }

    /// Link fed by the test through a channel. Dropping the feeder closes
    /// the link.
    pub struct MockLink {
        events: mpsc::UnboundedReceiver<LinkEvent>,
        sent: Arc<Mutex<Vec<bool>>>,
    }

    impl MockLink {
        pub fn new() -> (Self, mpsc::UnboundedSender<LinkEvent>, Arc<Mutex<Vec<bool>>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    events: rx,
                    sent: sent.clone(),
                },
                tx,
                sent,
            )
        }

        /// A link that reports closed on the first read.
        pub fn closed() -> Self {
            let (link, _tx, _sent) = Self::new();
            link
        }
    }

    impl DeviceLink for MockLink {
        fn set_state(&mut self, on: bool) -> impl Future<Output = Result<(), DeviceError>> + Send {
            self.sent.lock().unwrap().push(on);
            async { Ok(()) }
        }

        fn next_event(&mut self) -> impl Future<Output = LinkEvent> + Send {
            async {
                match self.events.recv().await {
                    Some(event) => event,
                    None => LinkEvent::Closed,
                }
            }
        }
    }
}
