//! sled-backed persistence: indexed torrents, the pending-hash journal, and
//! warm-start nodes.
//!
//! Keys are canonical upper-hex info-hashes (torrents, pending) and
//! `ip:port` strings (nodes); values are serde_json records. sled gives us
//! concurrent readers and writers; each insert is atomic, which is all the
//! record shapes here need.

use std::net::SocketAddrV4;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size_bytes: u64,
}

/// One indexed torrent. Write-once: a second insert under the same hash is
/// rejected, never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub info_hash: String,
    pub name: String,
    pub total_size_bytes: u64,
    pub discovered_at_unix_ms: i64,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub is_private: bool,
    pub piece_length_bytes: u64,
    pub piece_count: u64,
    pub file_count: u64,
    pub trackers: Vec<String>,
    pub files: Vec<FileEntry>,
}

/// Journal row for a hash the fetcher has accepted but not yet resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHash {
    pub info_hash: String,
    pub queued_at_unix_ms: i64,
}

/// A DHT endpoint that answered us, persisted for warm starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownNode {
    pub ip: String,
    pub port: u16,
    pub responses: u64,
    pub last_seen_unix_ms: i64,
}

impl KnownNode {
    pub fn addr(&self) -> Option<SocketAddrV4> {
        format!("{}:{}", self.ip, self.port).parse().ok()
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct Store {
    db: sled::Db,
    torrents: sled::Tree,
    pending: sled::Tree,
    nodes: sled::Tree,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = sled::open(path).context("open sled db")?;
        Self::with_db(db)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> anyhow::Result<Self> {
        let torrents = db.open_tree("torrents").context("open torrents tree")?;
        let pending = db.open_tree("pending").context("open pending tree")?;
        let nodes = db.open_tree("nodes").context("open nodes tree")?;
        Ok(Self {
            db,
            torrents,
            pending,
            nodes,
        })
    }

    /// Inserts a torrent record if the hash is not already indexed.
    ///
    /// Returns `false` when another writer got there first; callers treat
    /// that as success-by-race.
    pub fn insert_torrent(&self, record: &TorrentRecord) -> anyhow::Result<bool> {
        let value = serde_json::to_vec(record)?;
        let swap = self.torrents.compare_and_swap(
            record.info_hash.as_bytes(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        Ok(swap.is_ok())
    }

    pub fn has_torrent(&self, info_hash: &str) -> anyhow::Result<bool> {
        Ok(self.torrents.contains_key(info_hash.as_bytes())?)
    }

    pub fn torrent(&self, info_hash: &str) -> anyhow::Result<Option<TorrentRecord>> {
        let Some(bytes) = self.torrents.get(info_hash.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    /// Every indexed hash, for seeding the in-memory dedup sets at startup.
    pub fn all_torrent_hashes(&self) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        for item in self.torrents.iter() {
            let (key, _) = item?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }

    /// Journals a hash, keeping the original queue time if it is already there.
    pub fn upsert_pending(&self, info_hash: &str) -> anyhow::Result<()> {
        if self.pending.contains_key(info_hash.as_bytes())? {
            return Ok(());
        }
        let row = PendingHash {
            info_hash: info_hash.to_string(),
            queued_at_unix_ms: now_unix_ms(),
        };
        self.pending
            .insert(info_hash.as_bytes(), serde_json::to_vec(&row)?)?;
        Ok(())
    }

    pub fn delete_pending(&self, info_hash: &str) -> anyhow::Result<()> {
        self.pending.remove(info_hash.as_bytes())?;
        Ok(())
    }

    pub fn has_pending(&self, info_hash: &str) -> anyhow::Result<bool> {
        Ok(self.pending.contains_key(info_hash.as_bytes())?)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Full journal scan, oldest first, for restart replay.
    pub fn pending_hashes(&self) -> anyhow::Result<Vec<PendingHash>> {
        let mut out = Vec::new();
        for item in self.pending.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice::<PendingHash>(&value)?);
        }
        out.sort_by_key(|p| p.queued_at_unix_ms);
        Ok(out)
    }

    /// Upserts a batch of warm-start nodes, keyed by endpoint.
    pub fn record_nodes(&self, nodes: &[KnownNode]) -> anyhow::Result<()> {
        for node in nodes {
            let key = format!("{}:{}", node.ip, node.port);
            self.nodes
                .insert(key.as_bytes(), serde_json::to_vec(node)?)?;
        }
        Ok(())
    }

    /// The `n` most recently seen nodes, freshest first.
    pub fn top_nodes(&self, n: usize) -> anyhow::Result<Vec<KnownNode>> {
        let mut out = Vec::new();
        for item in self.nodes.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice::<KnownNode>(&value)?);
        }
        out.sort_by(|a, b| b.last_seen_unix_ms.cmp(&a.last_seen_unix_ms));
        out.truncate(n);
        Ok(out)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush().context("flush sled db")?;
        Ok(())
    }
}
