use std::path::PathBuf;
use std::sync::Arc;

use kumo_extension::{
    catalog, ExtensionBank, ExtensionLoader, HookManager, RuntimeConfig, RuntimeManager,
};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod metrics_worker;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RuntimeConfig::from_env();
    let extension_dir =
        std::env::var("EXTENSION_DIR").unwrap_or_else(|_| "/data/extensions".to_string());
    tracing::info!(
        pool_size = config.pool_size,
        acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
        dir = %extension_dir,
        "starting extension host"
    );

    let manager = Arc::new(RuntimeManager::new(config.pool_size));
    let bank = Arc::new(ExtensionBank::new());
    let hooks = Arc::new(HookManager::new());
    let loader = ExtensionLoader::new(config, Arc::clone(&manager), Arc::clone(&bank), hooks);

    let descriptors = match catalog::discover(&PathBuf::from(&extension_dir)).await {
        Ok(found) => catalog::descriptors(found),
        Err(e) => {
            tracing::error!("extension discovery failed: {e}");
            Vec::new()
        }
    };

    let report = loader.load_all(descriptors).await;
    for (id, e) in &report.failed {
        tracing::warn!(extension = %id, "not loaded: {e}");
    }
    tracing::info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        extensions = ?bank.ids(),
        "extension host ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = metrics_worker::interval_from_env()
        .map(|every| metrics_worker::spawn(Arc::clone(&manager), every, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    tracing::info!("shutting down extension host");

    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    manager.report();
    manager.teardown_all();
}
