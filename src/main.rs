use std::sync::Arc;

use tracing::info;

use reservd::config::Config;
use reservd::directory::InMemoryDirectory;
use reservd::model;
use reservd::store::WalStore;
use reservd::Engine;

/// Open the reservation log, compact it if it has grown past the threshold,
/// and print upcoming reservations as JSON lines.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    reservd::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.wal_path();
    let store = Arc::new(WalStore::open(&wal_path)?);
    if store.compact_if_needed(config.compact_threshold).await? {
        info!("compacted {}", wal_path.display());
    }

    info!("reservd data_dir: {}", config.data_dir.display());
    info!("  store_timeout: {:?}", config.engine.store_timeout);
    info!("  read_retries: {}", config.engine.read_retries);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let engine = Engine::new(store, Arc::new(InMemoryDirectory::new()), config.engine.clone());
    let upcoming = engine.upcoming(model::now()).await?;
    info!("{} upcoming reservations", upcoming.len());
    for view in &upcoming {
        println!("{}", serde_json::to_string(view)?);
    }
    Ok(())
}
