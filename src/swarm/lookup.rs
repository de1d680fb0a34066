//! Ephemeral per-session peer lookup: an iterative `get_peers` walk from the
//! bootstrap routers toward the target hash.
//!
//! Unlike the crawler this walk does match responses to queries, keeps a
//! bounded in-flight window, and prefers nodes XOR-closer to the target so
//! the frontier converges instead of wandering.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::krpc;

/// Queries with no answer after this long free their window slot.
const QUERY_TIMEOUT: Duration = Duration::from_millis(900);

pub(crate) async fn find_peers(
    cfg: &Config,
    info_hash: [u8; 20],
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<SocketAddrV4>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let node_id = krpc::random_id();

    // Min-heap over XOR distance via Reverse; bootstrap seeds get distance
    // zero so they are asked first.
    let mut frontier: BinaryHeap<(Reverse<[u8; 20]>, SocketAddrV4)> = BinaryHeap::new();
    let mut seen_nodes: HashSet<SocketAddrV4> = HashSet::new();
    for addr in resolve_bootstrap(&cfg.bootstrap_hosts).await {
        if seen_nodes.insert(addr) {
            frontier.push((Reverse([0u8; 20]), addr));
        }
    }
    if frontier.is_empty() {
        anyhow::bail!("no bootstrap nodes resolved");
    }

    let mut peers: Vec<SocketAddrV4> = Vec::new();
    let mut seen_peers: HashSet<SocketAddrV4> = HashSet::new();
    let mut inflight: HashMap<[u8; 2], Instant> = HashMap::new();
    let mut tx: u16 = 0;
    let mut queries = 0usize;
    let mut buf = vec![0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(cfg.lookup_deadline_secs);
    let recv_timeout = Duration::from_millis(cfg.lookup_recv_timeout_ms);

    while Instant::now() < deadline && !cancel.is_cancelled() {
        if peers.len() >= cfg.max_peers_per_session || queries >= cfg.lookup_max_queries {
            break;
        }

        let now = Instant::now();
        inflight.retain(|_, sent_at| now.saturating_duration_since(*sent_at) <= QUERY_TIMEOUT);

        // Fill the in-flight window from the closest frontier nodes.
        while inflight.len() < cfg.lookup_inflight && queries < cfg.lookup_max_queries {
            let Some((_, addr)) = frontier.pop() else {
                break;
            };
            tx = tx.wrapping_add(1);
            let txid = tx.to_be_bytes();
            let msg = krpc::get_peers_query(&txid, &node_id, &info_hash);
            let _ = socket.send_to(&msg, SocketAddr::V4(addr)).await;
            inflight.insert(txid, Instant::now());
            queries += 1;
        }

        if inflight.is_empty() && frontier.is_empty() {
            break;
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            recv = timeout(recv_timeout, socket.recv_from(&mut buf)) => match recv {
                Ok(Ok((n, _from))) => n,
                Ok(Err(_)) | Err(_) => continue,
            },
        };

        let Some(reply) = krpc::parse_get_peers_reply(&buf[..n]) else {
            continue;
        };
        // Only accept replies to transactions we actually sent.
        let Ok(txid) = <[u8; 2]>::try_from(reply.tx.as_slice()) else {
            continue;
        };
        if inflight.remove(&txid).is_none() {
            continue;
        }

        for node in reply.nodes {
            if krpc::is_contactable(&node.addr) && seen_nodes.insert(node.addr) {
                frontier.push((Reverse(xor_distance(&node.id, &info_hash)), node.addr));
            }
        }
        for peer in reply.peers {
            if peer.port() != 0 && seen_peers.insert(peer) {
                peers.push(peer);
                if peers.len() >= cfg.max_peers_per_session {
                    break;
                }
            }
        }
    }

    Ok(peers)
}

async fn resolve_bootstrap(hosts: &[String]) -> Vec<SocketAddrV4> {
    let mut out = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host).await {
            Ok(addrs) => out.extend(addrs.filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })),
            Err(err) => {
                tracing::debug!(%err, host = %host, "lookup: bootstrap resolve failed");
            }
        }
    }
    out
}

fn xor_distance(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_distance_orders_by_closeness() {
        let target = [0u8; 20];
        let near = {
            let mut id = [0u8; 20];
            id[19] = 1;
            id
        };
        let far = [0xff; 20];

        assert!(xor_distance(&near, &target) < xor_distance(&far, &target));
        assert_eq!(xor_distance(&target, &target), [0u8; 20]);
    }
}
