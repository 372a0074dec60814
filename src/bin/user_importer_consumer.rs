//! user-importer-consumer: queue consumer process
//!
//! Consumes `save_user_queue` and creates each delivered user in its own
//! transaction. Runs until SIGINT or SIGTERM, then stops consuming and
//! gives deliveries already being handled up to ten seconds to finish and
//! ack before the broker connection is closed.
//!
//! ## Configuration
//! - `--config <path>` or USER_IMPORTER_CONFIG: YAML configuration file
//! - USER_IMPORTER__<SECTION>__<KEY>: per-key overrides
//! - USER_IMPORTER_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info, warn};

use user_importer::bus::init_broker;
use user_importer::config::Config;
use user_importer::events::{EventRegistry, SaveUserEvent, SAVE_USER_QUEUE};
use user_importer::services::{DefaultUserService, UserService};
use user_importer::storage::init_storage;
use user_importer::utils::bootstrap::{
    connect_with_retry, init_tracing, parse_config_path, shutdown_signal,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = parse_config_path(std::env::args());
    let config = Config::load(config_path.as_deref())?;
    init_tracing(config.logging.format);

    info!("Starting user-importer-consumer");

    let storage_config = &config.storage;
    let uow_factory = connect_with_retry("database", move || init_storage(storage_config))
        .await
        .map_err(|e| {
            error!("Failed to initialize storage: {}", e);
            e
        })?;

    let broker = init_broker(&config.messaging).await.map_err(|e| {
        error!("Failed to connect to message broker: {}", e);
        e
    })?;

    let service: Arc<dyn UserService> = Arc::new(DefaultUserService::new());
    let events = EventRegistry::new();
    events.get_or_insert_with(SAVE_USER_QUEUE, || {
        SaveUserEvent::new(broker.clone(), uow_factory.clone(), service.clone())
    })?;

    // A failed first setup stays registered and is retried on reconnect.
    if let Err(e) = events.register_consumers(broker.as_ref()).await {
        warn!("Consumer setup failed: {}", e);
    }

    info!(queues = ?events.queues(), "Consumer running, press Ctrl+C to exit");

    shutdown_signal().await;

    info!("Shutting down, waiting for in-flight deliveries");
    broker.close().await?;
    info!("Consumer stopped");
    Ok(())
}
