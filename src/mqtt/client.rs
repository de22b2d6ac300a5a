//! Broker connection task.
//!
//! Owns the single shared `rumqttc` connection. Outbound traffic arrives on
//! the broker command queue and is written by one task, so publishes from
//! any number of device contexts interleave safely. Inbound publishes are
//! handed to the topic router; everything else from the event loop is
//! connection housekeeping that rumqttc retries on its own.

use super::{BrokerCommand, BrokerSender};
use crate::mqtt::router::TopicRouter;
use crate::persistence::BrokerConfig;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CLIENT_ID: &str = "tuyabridge";
const REQUEST_QUEUE: usize = 100;
const COMMAND_QUEUE: usize = 256;

/// Creates the broker command queue. The sender goes to the router, the
/// receiver to `spawn`.
pub fn command_queue() -> (BrokerSender, mpsc::Receiver<BrokerCommand>) {
    mpsc::channel(COMMAND_QUEUE)
}

/// Spawns the two broker tasks: the writer draining the command queue and
/// the event loop feeding inbound publishes into the router.
pub fn spawn(
    config: &BrokerConfig,
    router: Arc<TopicRouter>,
    mut commands: mpsc::Receiver<BrokerCommand>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let mut options = MqttOptions::new(CLIENT_ID, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = match command {
                BrokerCommand::Publish { topic, payload } => {
                    client.publish(topic, QoS::AtMostOnce, false, payload).await
                }
                BrokerCommand::Subscribe(topic) => {
                    client.subscribe(topic, QoS::AtMostOnce).await
                }
                BrokerCommand::Unsubscribe(topic) => client.unsubscribe(topic).await,
            };
            if let Err(e) = result {
                warn!("broker request failed: {e}");
            }
        }
        debug!("broker command queue closed");
    });

    let reader = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    router.dispatch(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    (writer, reader)
}
