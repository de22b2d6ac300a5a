use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tuyabridge::bus::EventBus;
use tuyabridge::device::discovery::Discovery;
use tuyabridge::device::manager::ConnectionManager;
use tuyabridge::device::transport::LanConnector;
use tuyabridge::mqtt::client;
use tuyabridge::mqtt::router::TopicRouter;
use tuyabridge::persistence::store::{self, ConfigStore};
use tuyabridge::registry::DeviceRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = store::config_path()?;
    let config = store::load_or_seed(&config_path)
        .wrap_err("base configuration is unreadable, refusing to start")?;
    info!(path = %config_path.display(), devices = config.devices.len(), "configuration loaded");

    let bus = Arc::new(EventBus::new());
    let (store_handle, _store_task) = ConfigStore::spawn(config_path, config.clone());
    let registry = DeviceRegistry::new(bus.clone(), store_handle);

    let (broker_tx, broker_rx) = client::command_queue();
    let (manager_tx, manager_rx) = mpsc::channel(64);
    let router = TopicRouter::new(
        config.broker.topic_prefix.clone(),
        config.broker.mirror_prefix.clone(),
        broker_tx,
        manager_tx,
        bus.clone(),
    );
    let _broker_tasks = client::spawn(&config.broker, router.clone(), broker_rx);

    let discovery = Discovery::bind(config.connection.discovery_port)
        .await
        .wrap_err("binding the discovery socket")?;
    let connector = LanConnector::new(discovery.clone());
    let manager = ConnectionManager::new(
        connector,
        router.clone(),
        bus.clone(),
        Duration::from_secs(config.connection.connect_timeout_secs),
    );
    let registry_events = registry.subscribe();
    let _manager_task = tokio::spawn(manager.run(registry_events, manager_rx));

    info!("connecting to configured devices");
    for device in config.devices.clone() {
        if let Err(e) = registry.insert_unique(device) {
            warn!("skipping configured device: {e}");
        }
    }

    // Observer sessions are attached by the external transport layer through
    // `tuyabridge::session::Session`; the bridge itself runs headless.
    tokio::signal::ctrl_c()
        .await
        .wrap_err("waiting for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}
