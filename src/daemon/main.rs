/**
 * syncd - Offline Sync Daemon
 *
 * Runs the synchronization engine as a background process: loads the
 * configuration, opens the local store and keeps it in sync with the backend
 * until interrupted.
 */

use std::sync::Arc;

use offline_sync::local_db::LocalDatabase;
use offline_sync::remote::HttpBackend;
use offline_sync::shared::{SyncConfig, SyncEvent};
use offline_sync::sync::SyncEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    tracing::info!("[STARTUP] syncd starting");

    let config = match std::env::args().nth(1).or_else(|| std::env::var("SYNC_CONFIG").ok()) {
        Some(path) => {
            tracing::info!("[STARTUP] Loading configuration from {}", path);
            SyncConfig::from_file(&path)?
        }
        None => SyncConfig::default(),
    }
    .from_env()?;
    config.validate()?;

    let db_path = std::env::var("SYNC_DB_PATH")
        .map(Into::into)
        .unwrap_or_else(|_| LocalDatabase::default_path());
    let db = Arc::new(LocalDatabase::open(&db_path).await?);
    let backend = Arc::new(HttpBackend::from_config(&config)?);

    let engine = SyncEngine::new(config, db, backend)?;
    engine.add_event_listener(|event| match event {
        SyncEvent::SyncError { error } => tracing::warn!("[Engine] {}", error),
        SyncEvent::UserNotification { message, severity } => {
            tracing::info!("[Notify] {:?}: {}", severity, message)
        }
        _ => {}
    });
    engine.start()?;
    tracing::info!("[STARTUP] Engine running against {}", db_path.display());

    tokio::signal::ctrl_c().await?;
    tracing::info!("[SHUTDOWN] Interrupted, stopping engine");

    if let Ok(status) = engine.get_status().await {
        tracing::info!(
            "[SHUTDOWN] {} pending and {} failed operations left in the queue",
            status.pending_operations,
            status.failed_operations
        );
    }
    engine.destroy();
    Ok(())
}
