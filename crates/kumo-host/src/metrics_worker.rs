//! Metrics worker: periodically logs per-extension pool metrics.

use std::sync::Arc;
use std::time::Duration;

use kumo_extension::RuntimeManager;
use tokio::sync::watch;

/// Default reporting interval (60 seconds).
const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Read `EXTENSION_METRICS_INTERVAL_SECS`; `0` disables reporting.
pub fn interval_from_env() -> Option<Duration> {
    let secs = std::env::var("EXTENSION_METRICS_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Spawn the metrics worker. It stops when `shutdown` flips to `true`.
pub fn spawn(
    manager: Arc<RuntimeManager>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = every.as_secs(), "metrics worker started");
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately; skip it so the first report
        // covers a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pools = manager.report().len();
                    tracing::debug!(pools, "extension pool metrics reported");
                },
                _ = shutdown.changed() => {
                    tracing::debug!("metrics worker stopping");
                    break;
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_interval_is_one_minute() {
        assert_eq!(DEFAULT_INTERVAL_SECS, 60);
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let manager = Arc::new(RuntimeManager::new(1));
        let (tx, rx) = watch::channel(false);
        let handle = spawn(manager, Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
