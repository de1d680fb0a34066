mod bencode;
mod config;
mod crawler;
mod fetcher;
mod krpc;
mod metrics;
mod pipeline;
mod store;
mod swarm;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crawler::Crawler;
use crate::fetcher::Fetcher;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::swarm::SwarmClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Arc::new(Config::load()?);
    std::fs::create_dir_all(&cfg.data_dir).context("create data dir")?;

    // Failures up to the task spawns are startup errors and exit non-zero;
    // after that everything runs until cancelled.
    let store = Arc::new(Store::open(&cfg.data_dir.join("sled")).context("open store")?);
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    let known: HashSet<String> = store
        .all_torrent_hashes()
        .context("load indexed hashes")?
        .into_iter()
        .collect();
    tracing::info!(
        torrents = store.torrent_count(),
        pending = store.pending_count(),
        "store loaded"
    );

    let (pipe_tx, pipe_rx) = pipeline::channel(cfg.max_pipeline_depth);

    let swarm = Arc::new(SwarmClient::new(cfg.clone()));
    swarm.listen(cancel.clone()).await?;

    // Journal replay goes in before the crawler exists so pending hashes run
    // ahead of fresh traffic.
    let fetcher = Fetcher::new(
        cfg.clone(),
        store.clone(),
        metrics.clone(),
        swarm,
        known.clone(),
    );
    fetcher
        .replay_pending(&pipe_tx)
        .context("replay pending hashes")?;
    let fetcher_task = tokio::spawn(fetcher.run(pipe_rx, cancel.clone()));

    let socket = crawler::bind_socket(&cfg)?;
    let crawler = Crawler::new(
        cfg.clone(),
        store.clone(),
        metrics.clone(),
        socket,
        pipe_tx,
        known,
    );
    let crawler_task = tokio::spawn(crawler.run(cancel.clone()));

    // Periodic status line: the same counter surface an external dashboard
    // would read.
    let status_metrics = metrics.clone();
    let status_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.tick().await; // the first tick is immediate
        loop {
            tokio::select! {
                _ = status_cancel.cancelled() => break,
                _ = tick.tick() => {
                    let s = status_metrics.snapshot();
                    let latest = status_metrics.recent_names().pop().unwrap_or_default();
                    tracing::info!(
                        sent = s.packets_sent,
                        recv = s.packets_received,
                        queue = s.queue_size,
                        nodes = s.nodes_discovered,
                        hashes = s.hashes_discovered,
                        unique = s.unique_hashes,
                        indexed = s.successes,
                        timeouts = s.timeouts,
                        errors = s.errors,
                        active = s.active,
                        latest = %latest,
                        "status"
                    );
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();

    let drain = async {
        let _ = crawler_task.await;
        let _ = fetcher_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        tracing::warn!("shutdown drain timed out");
    }
    let _ = store.flush();
    Ok(())
}
