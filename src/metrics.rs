//! Process-wide counters, handed to each subsystem at construction.
//!
//! Everything here is read-mostly: the crawler and fetcher bump atomics on
//! their hot paths, and consumers (the status line, an external dashboard)
//! take cheap snapshots. The recent-names ring is the one mutexed piece and
//! is only touched on successful fetches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bound on the recent-names ring; oldest entries are dropped on write.
pub const RECENT_NAMES_CAP: usize = 50;

#[derive(Debug, Default)]
pub struct CrawlerMetrics {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub queue_size: AtomicU64,
    pub nodes_discovered: AtomicU64,
    pub hashes_discovered: AtomicU64,
    pub unique_hashes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct FetcherMetrics {
    pub received: AtomicU64,
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
    pub active: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub crawler: CrawlerMetrics,
    pub fetcher: FetcherMetrics,
    recent_names: Mutex<VecDeque<String>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_recent_name(&self, name: &str) {
        let mut ring = self.recent_names.lock().expect("recent names lock");
        if ring.len() == RECENT_NAMES_CAP {
            ring.pop_front();
        }
        ring.push_back(name.to_string());
    }

    /// Oldest-first copy of the ring.
    pub fn recent_names(&self) -> Vec<String> {
        self.recent_names
            .lock()
            .expect("recent names lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            packets_sent: self.crawler.packets_sent.load(Ordering::Relaxed),
            packets_received: self.crawler.packets_received.load(Ordering::Relaxed),
            queue_size: self.crawler.queue_size.load(Ordering::Relaxed),
            nodes_discovered: self.crawler.nodes_discovered.load(Ordering::Relaxed),
            hashes_discovered: self.crawler.hashes_discovered.load(Ordering::Relaxed),
            unique_hashes: self.crawler.unique_hashes.load(Ordering::Relaxed),
            received: self.fetcher.received.load(Ordering::Relaxed),
            attempts: self.fetcher.attempts.load(Ordering::Relaxed),
            successes: self.fetcher.successes.load(Ordering::Relaxed),
            timeouts: self.fetcher.timeouts.load(Ordering::Relaxed),
            errors: self.fetcher.errors.load(Ordering::Relaxed),
            active: self.fetcher.active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter, for the status line.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub queue_size: u64,
    pub nodes_discovered: u64,
    pub hashes_discovered: u64,
    pub unique_hashes: u64,
    pub received: u64,
    pub attempts: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub active: u64,
}

/// Relaxed increment; every counter here is a statistic, not a synchroniser.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn dec(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_at_cap() {
        let metrics = Metrics::new();
        for i in 0..RECENT_NAMES_CAP + 7 {
            metrics.push_recent_name(&format!("torrent-{i}"));
        }

        let names = metrics.recent_names();
        assert_eq!(names.len(), RECENT_NAMES_CAP);
        assert_eq!(names.first().map(String::as_str), Some("torrent-7"));
        assert_eq!(
            names.last().map(String::as_str),
            Some(format!("torrent-{}", RECENT_NAMES_CAP + 6).as_str())
        );
    }

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = Metrics::new();
        inc(&metrics.fetcher.received);
        inc(&metrics.fetcher.received);
        inc(&metrics.fetcher.attempts);
        inc(&metrics.fetcher.active);
        dec(&metrics.fetcher.active);

        let snap = metrics.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.attempts, 1);
        assert_eq!(snap.active, 0);
    }
}
