//! Pairing flow backing the UI `search` command.
//!
//! A device put into pairing mode announces itself with its key and name
//! included. `find_device` watches the discovery stream for the first such
//! announce from an id the registry does not know yet and returns at most
//! one credential record. Failure and timeout surface as structured results;
//! retrying is the caller's decision.

use super::discovery::Discovery;
use super::PairingError;
use crate::persistence::PairingCredentials;
use crate::registry::Device;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub async fn find_device(
    discovery: &Discovery,
    known_ids: &[String],
    credentials: &PairingCredentials,
) -> Result<Device, PairingError> {
    if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
        return Err(PairingError::Failed(
            "vendor API credentials are not configured".to_string(),
        ));
    }

    let limit = Duration::from_secs(credentials.timeout_secs);
    let mut announces = discovery.subscribe();
    info!(region = %credentials.api_region, "searching for a device in pairing mode");

    let waited = tokio::time::timeout(limit, async {
        loop {
            match announces.recv().await {
                Ok(announce) => {
                    if known_ids.iter().any(|id| *id == announce.id) {
                        debug!(id = %announce.id, "announce from a known device, skipping");
                        continue;
                    }
                    let Some(key) = announce.key else {
                        debug!(id = %announce.id, "announce without pairing key, skipping");
                        continue;
                    };
                    return Ok(Device {
                        name: announce.name.unwrap_or_else(|| announce.id.clone()),
                        id: announce.id,
                        key,
                        domoticz: None,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(PairingError::Failed(
                        "discovery listener stopped".to_string(),
                    ))
                }
            }
        }
    })
    .await;

    match waited {
        Ok(result) => result,
        Err(_) => Err(PairingError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::discovery::Announce;

    fn credentials() -> PairingCredentials {
        PairingCredentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            api_region: "eu".to_string(),
            timeout_secs: 30,
        }
    }

    fn announce(id: &str, key: Option<&str>) -> Announce {
        Announce {
            id: id.to_string(),
            ip: "192.168.1.30".parse().unwrap(),
            key: key.map(str::to_string),
            name: Some(format!("new {id}")),
        }
    }

    #[tokio::test]
    async fn first_unknown_pairing_announce_wins() {
        let discovery = Discovery::detached();
        let task = {
            let discovery = discovery.clone();
            tokio::spawn(async move {
                find_device(&discovery, &["known".to_string()], &credentials()).await
            })
        };
        tokio::task::yield_now().await;

        discovery.record(announce("known", Some("k1")));
        discovery.record(announce("plain", None));
        discovery.record(announce("fresh", Some("k2")));

        let found = task.await.unwrap().unwrap();
        assert_eq!(found.id, "fresh");
        assert_eq!(found.key, "k2");
        assert_eq!(found.name, "new fresh");
        assert_eq!(found.domoticz, None);
    }

    #[tokio::test(start_paused = true)]
    async fn search_times_out_as_a_structured_failure() {
        let discovery = Discovery::detached();

        let result = find_device(&discovery, &[], &credentials()).await;

        match result {
            Err(PairingError::Timeout(limit)) => {
                assert_eq!(limit, Duration::from_secs(30));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_listening() {
        let discovery = Discovery::detached();
        let credentials = PairingCredentials::default();

        let result = find_device(&discovery, &[], &credentials).await;

        assert!(matches!(result, Err(PairingError::Failed(_))));
    }
}
