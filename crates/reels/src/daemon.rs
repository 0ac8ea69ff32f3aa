//! Daemon command for running the Reels pipeline.
//!
//! On start every stored item resumes from the state it was saved in.
//! The daemon then serves until Ctrl-C, logging each transition and a
//! periodic queue summary, and shuts down gracefully.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use reels_scheduler::{ItemStore, JsonFileStore, Orchestrator, OrchestratorConfig};

use crate::backends::{CannedBackend, DryRunPublisher};

/// Default interval between queue summaries in seconds.
const DEFAULT_SUMMARY_INTERVAL: u64 = 60;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub store_path: PathBuf,
    pub orchestrator: OrchestratorConfig,
    /// Simulated latency of the demo backend and publisher.
    pub demo_latency: Duration,
}

/// Where items are kept when no store path is given.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("reels/items.json"))
        .unwrap_or_else(|| PathBuf::from("reels-items.json"))
}

/// Open the JSON item store.
pub async fn open_store(path: &Path) -> Result<Arc<JsonFileStore>> {
    let store = JsonFileStore::open(path)
        .await
        .map_err(|e| miette::miette!("failed to open store {}: {}", path.display(), e))?;
    Ok(Arc::new(store))
}

/// Start an orchestrator over `store` with the demo backend and publisher.
pub fn start_orchestrator(
    store: Arc<JsonFileStore>,
    config: OrchestratorConfig,
    demo_latency: Duration,
) -> Orchestrator {
    Orchestrator::start(
        config,
        store,
        Arc::new(CannedBackend::new(demo_latency)),
        Arc::new(DryRunPublisher::new(demo_latency)),
    )
}

/// Run the daemon until interrupted.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        store = %config.store_path.display(),
        gen_workers = config.orchestrator.generation.workers,
        gen_retries = config.orchestrator.generation.retry.max_retries,
        publish_workers = config.orchestrator.publish.workers,
        publish_retries = config.orchestrator.publish.retry.max_retries,
        tick_ms = config.orchestrator.scheduler.tick_interval.as_millis() as u64,
        "starting reels daemon"
    );

    let store = open_store(&config.store_path).await?;
    let orchestrator =
        start_orchestrator(Arc::clone(&store), config.orchestrator, config.demo_latency);

    let resumed = orchestrator
        .recover()
        .await
        .map_err(|e| miette::miette!("failed to resume stored items: {}", e))?;
    info!(resumed, "resumed stored items");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Spawn shutdown handler
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let events = orchestrator.subscribe();
    let event_log = tokio::spawn(log_events(events, shutdown_rx.clone()));
    let summary = tokio::spawn(log_summaries(
        Arc::clone(&store),
        Duration::from_secs(DEFAULT_SUMMARY_INTERVAL),
        shutdown_rx.clone(),
    ));

    let _ = shutdown_rx.wait_for(|stop| *stop).await;

    orchestrator.shutdown().await;
    let _ = event_log.await;
    let _ = summary.await;

    info!("daemon stopped");
    Ok(())
}

/// Log every state change until shutdown.
async fn log_events(
    mut events: broadcast::Receiver<reels_scheduler::ItemEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            event = events.recv() => match event {
                Ok(event) => info!(
                    id = %event.id,
                    from = %event.from,
                    to = %event.to,
                    version = event.version,
                    "item transitioned"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("event log stopped");
}

/// Periodically log how many items sit in each state.
async fn log_summaries(
    store: Arc<JsonFileStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let items = match store.list(None).await {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(error = %e, "failed to summarize queue");
                        continue;
                    }
                };

                let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
                for item in &items {
                    *counts.entry(item.state.as_str()).or_default() += 1;
                }
                info!(total = items.len(), ?counts, "queue summary");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_loops_stop_on_shutdown() {
        let path = std::env::temp_dir().join(format!("reels-loops-{}.json", std::process::id()));
        let store = open_store(&path).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let summary = tokio::spawn(log_summaries(
            Arc::clone(&store),
            Duration::from_millis(10),
            shutdown_rx.clone(),
        ));
        let events = tokio::spawn(log_events(store.subscribe(), shutdown_rx));

        // Let the summary loop list the store a few times
        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), summary)
            .await
            .expect("summary loop ignored shutdown")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), events)
            .await
            .expect("event loop ignored shutdown")
            .unwrap();
    }

    #[test]
    fn test_default_store_path() {
        let path = default_store_path();
        assert!(path.ends_with("items.json") || path.ends_with("reels-items.json"));
    }
}
