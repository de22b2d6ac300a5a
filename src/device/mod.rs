//! # Device Module
//!
//! Everything between the registry and the wire: LAN discovery, the transport
//! seam, the per-device connection state machine with reconnect backoff, the
//! connection manager owning one state machine per registered device, and the
//! pairing flow.
//!
//! ```text
//! device/
//! ├── discovery.rs  - UDP announce listener shared by connect and pairing
//! ├── transport.rs  - DeviceConnector/DeviceLink seam and the LAN transport
//! ├── connection.rs - per-device state machine and backoff
//! ├── manager.rs    - runtime table, teardown, set-state entry point
//! └── pairing.rs    - find-device flow for the search command
//! ```

pub mod connection;
pub mod discovery;
pub mod manager;
pub mod pairing;
pub mod transport;

use std::time::Duration;
use thiserror::Error;

/// Errors of a single device connection. Transient variants feed the
/// reconnect backoff; `InvalidCredential` is fatal per device and needs the
/// operator to fix the key.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid device key: {0}")]
    InvalidCredential(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Pairing failures surface to the caller as a structured result; there is no
/// internal retry.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing failed: {0}")]
    Failed(String),

    #[error("no device discovered within {0:?}")]
    Timeout(Duration),
}
