//! Swarm-side metadata acquisition.
//!
//! The fetcher only depends on the [`Swarm`] trait: start a session for an
//! info-hash, poll [`SessionHandle::has_metadata`], read the assembled
//! [`TorrentMeta`], stop. [`SwarmClient`] is the real implementation: an
//! ephemeral `get_peers` walk to find swarm peers, concurrent TCP peers
//! running the BEP-10/BEP-9 exchange, and a listener that routes inbound
//! peers to whichever session their handshake names.

mod error;
mod lookup;
mod metadata;
mod peer;
mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rand::Rng as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

pub use error::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaFile {
    pub path: String,
    pub size_bytes: u64,
}

/// The read-only torrent view a session exposes once metadata is assembled.
///
/// Only what travels in the info dictionary can be filled by the swarm;
/// outer-metainfo fields (comment, creation date, trackers) stay empty unless
/// some other source supplies them.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub name: String,
    pub total_size_bytes: u64,
    pub piece_length_bytes: u64,
    pub is_private: bool,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub trackers: Vec<String>,
    pub files: Vec<MetaFile>,
}

/// The peer-wire collaborator surface the fetcher is written against.
pub trait Swarm: Send + Sync + 'static {
    /// Starts a metadata session. The returned handle observes the session;
    /// dropping or stopping it tears the session down.
    fn start(
        &self,
        info_hash: [u8; 20],
    ) -> impl std::future::Future<Output = anyhow::Result<SessionHandle>> + Send;
}

#[derive(Debug, Default)]
struct SessionState {
    meta: Mutex<Option<TorrentMeta>>,
    ready: AtomicBool,
}

/// Observer side of one metadata session.
///
/// `has_metadata` is monotonic: once true it stays true until the session is
/// stopped. Stopping is idempotent and also happens on drop, so every exit
/// path of a fetch task releases the session.
#[derive(Debug)]
pub struct SessionHandle {
    state: Arc<SessionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new_pair() -> (SessionHandle, MetadataPublisher) {
        let state = Arc::new(SessionState::default());
        let cancel = CancellationToken::new();
        (
            SessionHandle {
                state: state.clone(),
                cancel: cancel.clone(),
            },
            MetadataPublisher { state, cancel },
        )
    }

    pub fn has_metadata(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn metadata(&self) -> Option<TorrentMeta> {
        if !self.has_metadata() {
            return None;
        }
        self.state.meta.lock().expect("session meta lock").clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer side of one session, held by the session task (or a test stub).
#[derive(Debug, Clone)]
pub(crate) struct MetadataPublisher {
    state: Arc<SessionState>,
    cancel: CancellationToken,
}

impl MetadataPublisher {
    pub(crate) fn publish(&self, meta: TorrentMeta) {
        *self.state.meta.lock().expect("session meta lock") = Some(meta);
        self.state.ready.store(true, Ordering::Release);
    }

    /// Cancelled when the handle is stopped or dropped.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// An accepted TCP peer whose handshake has been read but not yet answered.
struct InboundPeer {
    stream: peer::PeerStream,
    handshake: peer::Handshake,
}

type SessionMap = Arc<Mutex<HashMap<[u8; 20], mpsc::Sender<InboundPeer>>>>;

/// The in-tree swarm stack.
pub struct SwarmClient {
    cfg: Arc<Config>,
    peer_id: [u8; 20],
    sessions: SessionMap,
}

impl SwarmClient {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            peer_id: generate_peer_id(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds the metadata listener and spawns the accept loop. A bind failure
    /// is a startup error and is returned to the caller.
    pub async fn listen(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.cfg.tcp_listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind metadata listener on {addr}"))?;
        tracing::info!(bind = %addr, "swarm: metadata listener up");

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, from)) = accepted else {
                    continue;
                };
                tokio::spawn(route_inbound(stream, from, sessions.clone()));
            }
        });
        Ok(())
    }
}

/// Reads the inbound handshake and hands the connection to the session it
/// names. Connections for hashes we are not fetching are dropped.
async fn route_inbound(stream: TcpStream, from: std::net::SocketAddr, sessions: SessionMap) {
    let accepted = match peer::PeerStream::accept(stream).await {
        Ok(accepted) => accepted,
        Err(err) => {
            tracing::trace!(%from, %err, "swarm: inbound handshake failed");
            return;
        }
    };
    let (stream, handshake) = accepted;

    let session = {
        let sessions = sessions.lock().expect("session map lock");
        sessions.get(&handshake.info_hash).cloned()
    };
    let Some(session) = session else {
        return;
    };

    // The session may be saturated or already finished; either way the
    // connection is expendable.
    let _ = session.try_send(InboundPeer { stream, handshake });
}

impl Swarm for SwarmClient {
    async fn start(&self, info_hash: [u8; 20]) -> anyhow::Result<SessionHandle> {
        let (handle, publisher) = SessionHandle::new_pair();
        let (inbound_tx, inbound_rx) = mpsc::channel(4);

        self.sessions
            .lock()
            .expect("session map lock")
            .insert(info_hash, inbound_tx);

        let ctx = session::SessionCtx {
            cfg: self.cfg.clone(),
            peer_id: self.peer_id,
            info_hash,
            publisher,
            inbound: inbound_rx,
            sessions: self.sessions.clone(),
        };
        tokio::spawn(session::run(ctx));

        Ok(handle)
    }
}

fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-TW0001-");
    rand::rng().fill(&mut id[8..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TorrentMeta {
        TorrentMeta {
            name: "demo".to_string(),
            total_size_bytes: 1024,
            piece_length_bytes: 256,
            is_private: false,
            creation_date: None,
            comment: None,
            created_by: None,
            trackers: vec![],
            files: vec![MetaFile {
                path: "demo.bin".to_string(),
                size_bytes: 1024,
            }],
        }
    }

    #[test]
    fn metadata_is_monotonic_once_published() {
        let (handle, publisher) = SessionHandle::new_pair();
        assert!(!handle.has_metadata());
        assert!(handle.metadata().is_none());

        publisher.publish(meta());
        assert!(handle.has_metadata());
        assert_eq!(handle.metadata().unwrap().name, "demo");
        // Still observable after stop; the handle state outlives the task.
        handle.stop();
        assert!(handle.has_metadata());
    }

    #[test]
    fn stop_cancels_the_session_task_token() {
        let (handle, publisher) = SessionHandle::new_pair();
        let token = publisher.cancel_token();
        assert!(!token.is_cancelled());
        handle.stop();
        assert!(token.is_cancelled());
    }

    #[test]
    fn dropping_the_handle_cancels_too() {
        let (handle, publisher) = SessionHandle::new_pair();
        let token = publisher.cancel_token();
        drop(handle);
        assert!(token.is_cancelled());
    }

    #[test]
    fn peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-TW0001-");
    }
}
