//! The crawler→fetcher seam: a multi-producer FIFO of info-hash strings.
//!
//! Submission is fire-and-forget. The channel is unbounded by default; when a
//! depth bound is configured, overflow is discarded rather than blocking —
//! stalling the crawler would starve discovery, while a dropped hash will be
//! observed again.
//!
//! Validation happens at the seams, not here: the crawler only emits
//! canonical upper-hex, and the fetcher re-checks whatever it dequeues, so
//! replayed journal rows and test injections flow through untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

pub fn channel(max_depth: usize) -> (HashSender, HashReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        HashSender {
            tx,
            depth: depth.clone(),
            max_depth,
        },
        HashReceiver { rx, depth },
    )
}

#[derive(Clone)]
pub struct HashSender {
    tx: mpsc::UnboundedSender<String>,
    depth: Arc<AtomicUsize>,
    max_depth: usize,
}

impl HashSender {
    /// Offers a hash to the fetcher. Silently discards on overflow or when
    /// the receiving side has shut down.
    pub fn submit(&self, hash: String) {
        if self.max_depth > 0 && self.depth.load(Ordering::Relaxed) >= self.max_depth {
            tracing::trace!(hash = %hash, "pipeline full; discarding");
            return;
        }
        if self.tx.send(hash).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

pub struct HashReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    depth: Arc<AtomicUsize>,
}

impl HashReceiver {
    /// Next hash in submission order; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<String> {
        let hash = self.rx.recv().await;
        if hash.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let (tx, mut rx) = channel(0);
        tx.submit("AAAA".to_string());
        tx.submit("BBBB".to_string());

        assert_eq!(rx.recv().await.as_deref(), Some("AAAA"));
        assert_eq!(rx.recv().await.as_deref(), Some("BBBB"));
    }

    #[tokio::test]
    async fn many_writers_share_one_queue() {
        let (tx, mut rx) = channel(0);
        let tx2 = tx.clone();
        tx.submit("AAAA".to_string());
        tx2.submit("BBBB".to_string());
        drop((tx, tx2));

        let mut got = Vec::new();
        while let Some(hash) = rx.recv().await {
            got.push(hash);
        }
        assert_eq!(got, vec!["AAAA".to_string(), "BBBB".to_string()]);
    }

    #[tokio::test]
    async fn bounded_channel_discards_overflow() {
        let (tx, mut rx) = channel(2);
        for i in 0..5 {
            tx.submit(format!("HASH{i}"));
        }
        assert_eq!(tx.depth(), 2);

        assert_eq!(rx.recv().await.as_deref(), Some("HASH0"));
        assert_eq!(rx.recv().await.as_deref(), Some("HASH1"));
        // Room again after draining.
        tx.submit("HASH5".to_string());
        assert_eq!(rx.recv().await.as_deref(), Some("HASH5"));
    }

    #[tokio::test]
    async fn recv_ends_when_senders_dropped() {
        let (tx, mut rx) = channel(0);
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }
}
