//! user-importer: batch import process
//!
//! Reads a JSON array of user records and drains it into storage.
//!
//! ## Flow
//! ```text
//! [users_data.json] -> [admission] -> [direct write] -> [database]
//!                                          | failed
//!                                          v
//!                                  [save_user_queue] -> (user-importer-consumer)
//!                                          | publish exhausted
//!                                          v
//!                              [failed_users_<timestamp>.json]
//! ```
//!
//! ## Configuration
//! - `--config <path>` or USER_IMPORTER_CONFIG: YAML configuration file
//! - USER_IMPORTER__<SECTION>__<KEY>: per-key overrides
//! - USER_IMPORTER_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use user_importer::bus::init_broker;
use user_importer::config::Config;
use user_importer::events::{EventRegistry, SaveUserEvent, SAVE_USER_QUEUE};
use user_importer::import::{
    load_batch, Admission, BackupFile, DirectWrite, Importer, PersistStrategy, QueuePublish,
};
use user_importer::services::{DefaultUserService, UserService};
use user_importer::storage::init_storage;
use user_importer::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = parse_config_path(std::env::args());
    let config = Config::load(config_path.as_deref())?;
    init_tracing(config.logging.format);

    info!("Starting user-importer");

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
    let save_user = events.get_or_insert_with(SAVE_USER_QUEUE, || {
        SaveUserEvent::new(broker.clone(), uow_factory.clone(), service.clone())
    })?;

    let import = &config.import;
    let backup = BackupFile::new(&import.backup_dir);
    info!(
        capacity = import.capacity,
        admission = ?import.admission,
        max_retries = import.max_retries,
        backup = %backup.path().display(),
        "Import pipeline configured"
    );

    let tiers: Vec<Arc<dyn PersistStrategy>> = vec![
        Arc::new(DirectWrite::new(uow_factory.clone(), service.clone())),
        Arc::new(QueuePublish::new(
            save_user,
            import.max_retries,
            import.retry_delay(),
        )),
        Arc::new(backup),
    ];
    let importer = Importer::new(tiers, Admission::new(import.capacity, import.admission));

    let users = load_batch(&import.source).await.map_err(|e| {
        error!("Failed to load batch: {}", e);
        e
    })?;
    info!(source = %import.source.display(), count = users.len(), "Batch loaded");

    let report = importer.run(users).await;
    if report.lost > 0 {
        error!(lost = report.lost, "Some records could not be stored anywhere");
    }

    if let Err(e) = broker.close().await {
        error!("Failed to close broker connection: {}", e);
    }

    info!("user-importer finished");
    Ok(())
}
