//! The metadata fetcher: drains the hash pipeline and turns hashes into
//! indexed torrent records.
//!
//! Dispatch is semaphore-capped; each admitted hash runs as its own task
//! against the swarm collaborator, polling for metadata under a wall-clock
//! deadline. The pending journal makes the work set survive restarts: a row
//! is written when a hash is admitted and deleted only on success or on
//! permanent rejection, so timeouts and errors leave a retry marker behind.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::{self, Metrics};
use crate::pipeline::{HashReceiver, HashSender};
use crate::store::{now_unix_ms, FileEntry, Store, TorrentRecord};
use crate::swarm::{Swarm, TorrentMeta};

pub struct Fetcher<S: Swarm> {
    cfg: Arc<Config>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    swarm: Arc<S>,
    processed: Arc<Mutex<HashSet<String>>>,
}

impl<S: Swarm> Fetcher<S> {
    /// `known` arrives pre-seeded with every persisted hash so nothing
    /// already indexed is fetched again.
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        swarm: Arc<S>,
        known: HashSet<String>,
    ) -> Self {
        Self {
            cfg,
            store,
            metrics,
            swarm,
            processed: Arc::new(Mutex::new(known)),
        }
    }

    /// Replays the pending journal into the pipeline. Called before the
    /// crawler starts so journaled hashes run ahead of live traffic.
    pub fn replay_pending(&self, pipeline: &HashSender) -> anyhow::Result<usize> {
        let rows = self.store.pending_hashes()?;
        let count = rows.len();
        for row in rows {
            pipeline.submit(row.info_hash);
        }
        if count > 0 {
            tracing::info!(count, "fetcher: replayed pending hashes");
        }
        Ok(count)
    }

    pub async fn run(self, mut rx: HashReceiver, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent_fetches));
        let mut workers = tokio::task::JoinSet::new();

        loop {
            // Reap finished workers so the set does not grow with uptime.
            while workers.try_join_next().is_some() {}

            let hash = tokio::select! {
                _ = cancel.cancelled() => break,
                hash = rx.recv() => match hash {
                    Some(hash) => hash,
                    None => break,
                },
            };
            metrics::inc(&self.metrics.fetcher.received);

            // Canonical form is upper hex; the store, the journal, and the
            // dedup sets all key on it.
            let hash = hash.to_ascii_uppercase();
            if !is_valid_hash(&hash) {
                // Permanently unfetchable; drop any journal row it may have.
                let _ = self.store.delete_pending(&hash);
                tracing::debug!(hash = %hash, "fetcher: dropped malformed hash");
                continue;
            }

            if !self
                .processed
                .lock()
                .expect("processed lock")
                .insert(hash.clone())
            {
                continue;
            }
            match self.store.has_torrent(&hash) {
                Ok(false) => {}
                Ok(true) => {
                    let _ = self.store.delete_pending(&hash);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%err, "fetcher: store lookup failed");
                    metrics::inc(&self.metrics.fetcher.errors);
                    continue;
                }
            }
            if let Err(err) = self.store.upsert_pending(&hash) {
                tracing::warn!(%err, "fetcher: journaling failed");
                metrics::inc(&self.metrics.fetcher.errors);
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            metrics::inc(&self.metrics.fetcher.attempts);
            metrics::inc(&self.metrics.fetcher.active);

            let cfg = self.cfg.clone();
            let store = self.store.clone();
            let metrics = self.metrics.clone();
            let swarm = self.swarm.clone();
            let task_cancel = cancel.clone();
            workers.spawn(async move {
                fetch_one(cfg, store, metrics.clone(), swarm, hash, task_cancel).await;
                metrics::dec(&metrics.fetcher.active);
                drop(permit);
            });
        }

        // In-flight workers observe the cancellation promptly; wait for them
        // so every session is stopped before we report done.
        while workers.join_next().await.is_some() {}
        tracing::info!("fetcher: stopped");
    }
}

enum Outcome {
    Metadata,
    Deadline,
    Cancelled,
}

async fn fetch_one<S: Swarm>(
    cfg: Arc<Config>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    swarm: Arc<S>,
    hash: String,
    cancel: CancellationToken,
) {
    // Validated upstream; by now the hash always decodes.
    let mut info_hash = [0u8; 20];
    if hex::decode_to_slice(&hash, &mut info_hash).is_err() {
        return;
    }

    let session = match swarm.start(info_hash).await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(hash = %hash, %err, "fetcher: session start failed");
            metrics::inc(&metrics.fetcher.errors);
            return;
        }
    };

    // Wall-clock deadline rather than a scheduler timeout: the poll loop
    // re-checks elapsed time each turn, so clock jitter cannot extend it.
    let deadline = Instant::now() + Duration::from_secs(cfg.timeout_secs);
    let poll = Duration::from_millis(cfg.poll_interval_ms);

    let outcome = loop {
        if session.has_metadata() {
            break Outcome::Metadata;
        }
        if Instant::now() >= deadline {
            break Outcome::Deadline;
        }
        tokio::select! {
            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = sleep(poll) => {}
        }
    };

    match outcome {
        Outcome::Metadata => match session.metadata() {
            Some(meta) => persist(&store, &metrics, &hash, meta),
            None => metrics::inc(&metrics.fetcher.errors),
        },
        Outcome::Deadline => {
            // The journal row stays; a later run retries this hash.
            metrics::inc(&metrics.fetcher.timeouts);
            tracing::debug!(hash = %hash, "fetcher: metadata deadline expired");
        }
        Outcome::Cancelled => {}
    }

    session.stop();
}

fn persist(store: &Store, metrics: &Metrics, hash: &str, meta: TorrentMeta) {
    let record = build_record(hash, meta);
    match store.insert_torrent(&record) {
        Ok(inserted) => {
            if let Err(err) = store.delete_pending(hash) {
                tracing::warn!(%err, "fetcher: pending cleanup failed");
            }
            if inserted {
                metrics::inc(&metrics.fetcher.successes);
                metrics.push_recent_name(&record.name);
                tracing::info!(
                    hash = %hash,
                    name = %record.name,
                    size = record.total_size_bytes,
                    files = record.file_count,
                    "fetcher: indexed"
                );
            }
            // A lost insert race means another worker indexed it; that is
            // success-by-race and moves no counter.
        }
        Err(err) => {
            tracing::warn!(hash = %hash, %err, "fetcher: insert failed");
            metrics::inc(&metrics.fetcher.errors);
        }
    }
}

fn build_record(hash: &str, meta: TorrentMeta) -> TorrentRecord {
    let piece_count = if meta.piece_length_bytes > 0 {
        meta.total_size_bytes.div_ceil(meta.piece_length_bytes)
    } else {
        0
    };
    TorrentRecord {
        info_hash: hash.to_string(),
        name: meta.name,
        total_size_bytes: meta.total_size_bytes,
        discovered_at_unix_ms: now_unix_ms(),
        creation_date: meta.creation_date,
        comment: meta.comment,
        created_by: meta.created_by,
        is_private: meta.is_private,
        piece_length_bytes: meta.piece_length_bytes,
        piece_count,
        file_count: meta.files.len() as u64,
        trackers: meta.trackers,
        files: meta
            .files
            .into_iter()
            .map(|f| FileEntry {
                path: f.path,
                size_bytes: f.size_bytes,
            })
            .collect(),
    }
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
