//! UDP announce listener.
//!
//! Devices periodically broadcast a small JSON datagram on the discovery
//! port; devices in pairing mode additionally include their key and display
//! name. One listener task serves every consumer: connect attempts wait for
//! a specific id, the pairing flow watches for ids it does not know yet.

use super::DeviceError;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

const EVENT_CAPACITY: usize = 64;
const DATAGRAM_LIMIT: usize = 2048;

/// One announce datagram.
#[derive(Clone, Debug, Deserialize)]
pub struct Announce {
    pub id: String,
    pub ip: IpAddr,
    /// Present only while the device is in pairing mode.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

pub struct Discovery {
    seen: Mutex<HashMap<String, Announce>>,
    events: broadcast::Sender<Announce>,
}

impl Discovery {
    /// Binds the discovery socket and starts the listener task.
    pub async fn bind(port: u16) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!(port, "listening for device announcements");
        let discovery = Arc::new(Self::empty());
        tokio::spawn(Self::listen(socket, discovery.clone()));
        Ok(discovery)
    }

    /// A discovery instance without a socket, fed through `record`.
    #[cfg(test)]
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::empty())
    }

    fn empty() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            seen: Mutex::new(HashMap::new()),
            events,
        }
    }

    async fn listen(socket: UdpSocket, this: Arc<Self>) {
        let mut buf = [0u8; DATAGRAM_LIMIT];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => match serde_json::from_slice::<Announce>(&buf[..len]) {
                    Ok(announce) => {
                        trace!(id = %announce.id, %peer, "device announcement");
                        this.record(announce);
                    }
                    Err(e) => debug!(%peer, "ignoring malformed announcement: {e}"),
                },
                Err(e) => {
                    debug!("discovery receive error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Caches an announcement and notifies waiters. The cache keeps the
    /// latest datagram per id, so a device that changed address heals on its
    /// next announce.
    pub fn record(&self, announce: Announce) {
        self.seen
            .lock()
            .expect("discovery cache poisoned")
            .insert(announce.id.clone(), announce.clone());
        let _ = self.events.send(announce);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Announce> {
        self.events.subscribe()
    }

    /// Waits until the given device has announced itself, up to `limit`.
    pub async fn wait_for(&self, id: &str, limit: Duration) -> Result<Announce, DeviceError> {
        // Subscribe before checking the cache so an announce landing in
        // between is not missed.
        let mut rx = self.events.subscribe();
        let cached = self
            .seen
            .lock()
            .expect("discovery cache poisoned")
            .get(id)
            .cloned();
        if let Some(announce) = cached {
            return Ok(announce);
        }

        let waited = tokio::time::timeout(limit, async {
            loop {
                match rx.recv().await {
                    Ok(announce) if announce.id == id => return Ok(announce),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(DeviceError::ConnectionFailure(
                            "discovery listener stopped".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(limit)),
        }
    }
}
