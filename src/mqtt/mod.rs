//! # MQTT Integration Module
//!
//! Broker-facing half of the bridge, split into two submodules:
//!
//! ```text
//! mqtt/
//! ├── client.rs - broker connection task (rumqttc) and publish queue
//! └── router.rs - topic-to-handler bindings and inbound dispatch
//! ```
//!
//! The router decides which inbound message maps to which device and builds
//! every outbound payload; the client owns the single broker connection and
//! serializes all publishes through one queue. The two talk over a
//! `BrokerCommand` channel so the router never touches the socket and tests
//! can capture the outbound traffic directly.

pub mod client;
pub mod router;

use tokio::sync::mpsc;

/// Self-origin marker embedded in every outbound payload. Inbound messages
/// carrying it are our own traffic reflected by the broker and are never
/// dispatched.
pub const SELF_ORIGIN: &str = "tuyabridge";

/// Work for the broker connection task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerCommand {
    Publish { topic: String, payload: String },
    Subscribe(String),
    Unsubscribe(String),
}

/// Sending side of the broker queue.
pub type BrokerSender = mpsc::Sender<BrokerCommand>;
