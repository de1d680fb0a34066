//! One metadata session: find peers, race the BEP-9 exchange across several
//! of them, publish the first info dictionary that survives the SHA-1 check.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::error::WireError;
use super::lookup;
use super::metadata::{
    self, ExtendedHandshake, MetadataMsg, EXTENSION_HANDSHAKE_ID, MAX_METADATA_SIZE,
};
use super::peer::{Handshake, PeerStream};
use super::{InboundPeer, MetadataPublisher, SessionMap, TorrentMeta};
use crate::config::Config;

pub(super) struct SessionCtx {
    pub(super) cfg: Arc<Config>,
    pub(super) peer_id: [u8; 20],
    pub(super) info_hash: [u8; 20],
    pub(super) publisher: MetadataPublisher,
    pub(super) inbound: mpsc::Receiver<InboundPeer>,
    pub(super) sessions: SessionMap,
}

pub(super) async fn run(mut ctx: SessionCtx) {
    let cancel = ctx.publisher.cancel_token();
    if let Some(meta) = drive(&mut ctx, &cancel).await {
        tracing::debug!(
            hash = %hex::encode_upper(ctx.info_hash),
            name = %meta.name,
            "swarm: metadata assembled"
        );
        ctx.publisher.publish(meta);
    }
    // Deregister; the router drops late inbound connections for this hash.
    ctx.sessions
        .lock()
        .expect("session map lock")
        .remove(&ctx.info_hash);
}

async fn drive(ctx: &mut SessionCtx, cancel: &CancellationToken) -> Option<TorrentMeta> {
    let peers = tokio::select! {
        _ = cancel.cancelled() => return None,
        found = lookup::find_peers(&ctx.cfg, ctx.info_hash, cancel) => match found {
            Ok(peers) => peers,
            Err(err) => {
                tracing::debug!(%err, "swarm: peer lookup failed");
                Vec::new()
            }
        },
    };
    tracing::debug!(
        hash = %hex::encode_upper(ctx.info_hash),
        peers = peers.len(),
        "swarm: lookup done"
    );

    let per_peer = Duration::from_secs(ctx.cfg.timeout_secs);
    let mut candidates = peers.into_iter();
    let mut tasks: JoinSet<Result<TorrentMeta, WireError>> = JoinSet::new();
    for _ in 0..ctx.cfg.metadata_peers_inflight {
        let Some(addr) = candidates.next() else { break };
        spawn_outbound(&mut tasks, addr, ctx.info_hash, ctx.peer_id, per_peer);
    }

    // Even with no outbound candidates the session stays up: an inbound peer
    // may still bring the metadata before the fetcher's deadline stops us.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tasks.abort_all();
                return None;
            }
            Some(inbound) = ctx.inbound.recv() => {
                let info_hash = ctx.info_hash;
                let peer_id = ctx.peer_id;
                tasks.spawn(async move {
                    timeout(per_peer, fetch_from_inbound(inbound, info_hash, peer_id))
                        .await
                        .map_err(|_| WireError::Timeout)?
                });
            }
            // Disabled while the set is empty; inbound peers can still
            // arrive and re-arm it.
            Some(joined) = tasks.join_next() => {
                match joined {
                    Ok(Ok(meta)) => {
                        tasks.abort_all();
                        return Some(meta);
                    }
                    Ok(Err(err)) => {
                        tracing::trace!(%err, "swarm: peer failed");
                    }
                    Err(_join) => {}
                }
                if let Some(addr) = candidates.next() {
                    spawn_outbound(&mut tasks, addr, ctx.info_hash, ctx.peer_id, per_peer);
                }
            }
        }
    }
}

fn spawn_outbound(
    tasks: &mut JoinSet<Result<TorrentMeta, WireError>>,
    addr: std::net::SocketAddrV4,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    per_peer: Duration,
) {
    tasks.spawn(async move {
        timeout(per_peer, fetch_from_peer(addr, info_hash, peer_id))
            .await
            .map_err(|_| WireError::Timeout)?
    });
}

async fn fetch_from_peer(
    addr: std::net::SocketAddrV4,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<TorrentMeta, WireError> {
    let mut stream = PeerStream::connect(addr, info_hash, peer_id).await?;
    exchange(&mut stream, info_hash).await
}

async fn fetch_from_inbound(
    inbound: InboundPeer,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<TorrentMeta, WireError> {
    let InboundPeer {
        mut stream,
        handshake,
    } = inbound;
    if !handshake.supports_extensions() {
        return Err(WireError::NoExtensionSupport);
    }
    stream
        .send_handshake(&Handshake::new(info_hash, peer_id))
        .await?;
    exchange(&mut stream, info_hash).await
}

/// The BEP-10/BEP-9 exchange against one connected peer, through to a
/// SHA-1-validated, parsed info dictionary.
async fn exchange(stream: &mut PeerStream, info_hash: [u8; 20]) -> Result<TorrentMeta, WireError> {
    let ours = ExtendedHandshake::ours().encode();
    stream.send_extended(EXTENSION_HANDSHAKE_ID, &ours).await?;

    let (their_ut_id, mut metadata_size) = loop {
        let (id, payload) = stream.recv_extended().await?;
        if id != EXTENSION_HANDSHAKE_ID {
            continue;
        }
        let theirs = ExtendedHandshake::decode(&payload)?;
        let Some(ut_id) = theirs.ut_metadata else {
            return Err(WireError::Extension("peer does not advertise ut_metadata".into()));
        };
        break (ut_id, theirs.metadata_size);
    };

    // Some clients omit metadata_size from the handshake; the data message
    // for piece 0 carries it too.
    let mut piece0: Option<Bytes> = None;
    if metadata_size.is_none() {
        request_piece(stream, their_ut_id, 0).await?;
        loop {
            match recv_metadata_msg(stream).await? {
                MetadataMsg::Data {
                    piece: 0,
                    total_size,
                    data,
                } => {
                    metadata_size = total_size;
                    piece0 = Some(data);
                    break;
                }
                MetadataMsg::Reject { piece } => return Err(WireError::MetadataRejected(piece)),
                _ => continue,
            }
        }
    }

    let total = metadata_size
        .and_then(|size| usize::try_from(size).ok())
        .filter(|size| *size > 0 && *size <= MAX_METADATA_SIZE)
        .ok_or_else(|| WireError::Extension("unusable metadata_size".into()))?;

    let count = metadata::piece_count(total);
    let mut pieces: Vec<Option<Bytes>> = vec![None; count];
    if let Some(data) = piece0 {
        pieces[0] = Some(data);
    }

    for (piece, slot) in pieces.iter().enumerate() {
        if slot.is_none() {
            request_piece(stream, their_ut_id, piece as u32).await?;
        }
    }

    while pieces.iter().any(Option::is_none) {
        match recv_metadata_msg(stream).await? {
            MetadataMsg::Data { piece, data, .. } => {
                let idx = piece as usize;
                if idx < pieces.len() && pieces[idx].is_none() {
                    pieces[idx] = Some(data);
                }
            }
            MetadataMsg::Reject { piece } => return Err(WireError::MetadataRejected(piece)),
            // We serve nothing; requests from the peer are ignored.
            MetadataMsg::Request { .. } => {}
        }
    }

    let mut assembled = Vec::with_capacity(total);
    for (piece, data) in pieces.into_iter().enumerate() {
        let data = data.ok_or(WireError::ConnectionClosed)?;
        if data.len() != metadata::piece_size(piece, total) {
            return Err(WireError::Extension(format!("piece {piece} has wrong size")));
        }
        assembled.extend_from_slice(&data);
    }

    if Sha1::digest(&assembled).as_slice() != info_hash {
        return Err(WireError::HashMismatch);
    }

    metadata::parse_info_dict(&assembled)
}

async fn request_piece(stream: &mut PeerStream, ut_id: u8, piece: u32) -> Result<(), WireError> {
    let payload = MetadataMsg::request(piece).encode();
    stream.send_extended(ut_id, &payload).await
}

/// Next parseable ut_metadata message, skipping handshakes and any extended
/// traffic a hostile or chatty peer interleaves.
async fn recv_metadata_msg(stream: &mut PeerStream) -> Result<MetadataMsg, WireError> {
    loop {
        let (id, payload) = stream.recv_extended().await?;
        if id == EXTENSION_HANDSHAKE_ID {
            continue;
        }
        match MetadataMsg::decode(&payload) {
            Ok(msg) => return Ok(msg),
            Err(_) => continue,
        }
    }
}
