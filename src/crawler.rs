//! The Sybil crawler: saturate the DHT with `find_node` queries under
//! ever-changing node ids, and harvest the traffic that comes back at us.
//!
//! Two tasks share one UDPv4 socket. The send loop drains the crawl queue at
//! a paced rate, each query under a fresh random identity so different
//! regions of the id space learn our address. The receive loop classifies
//! every datagram: queries leak info-hashes into the pipeline, responses
//! feed the crawl queue with new endpoints. A third loop periodically saves
//! the best responders for the next process's warm start.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::krpc::{self, Packet};
use crate::metrics::{self, Metrics};
use crate::pipeline::HashSender;
use crate::store::{now_unix_ms, KnownNode, Store};

/// Binds the crawl socket with an enlarged receive buffer. Inbound traffic
/// is bursty; the default kernel buffer drops datagrams under load.
pub fn bind_socket(cfg: &Config) -> anyhow::Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.dht_port));
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
    if let Err(err) = socket.set_recv_buffer_size(cfg.recv_buffer_bytes) {
        tracing::warn!(%err, "crawler: could not grow the receive buffer");
    }
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp {addr}"))?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("register udp socket")
}

pub struct Crawler {
    cfg: Arc<Config>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    socket: Arc<UdpSocket>,
    pipeline: HashSender,
    seen_hashes: HashSet<String>,
}

impl Crawler {
    /// `seen_hashes` arrives pre-seeded with every already-indexed hash so
    /// the crawler never re-emits what the store already holds.
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        socket: UdpSocket,
        pipeline: HashSender,
        seen_hashes: HashSet<String>,
    ) -> Self {
        Self {
            cfg,
            store,
            metrics,
            socket: Arc::new(socket),
            pipeline,
            seen_hashes,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        // Warm start from persisted responders; fall back to the public
        // routers when there are too few to be useful.
        let warm: Vec<SocketAddrV4> = self
            .store
            .top_nodes(self.cfg.max_nodes_to_save)
            .unwrap_or_else(|err| {
                tracing::warn!(%err, "crawler: warm-start load failed");
                Vec::new()
            })
            .iter()
            .filter_map(KnownNode::addr)
            .filter(krpc::is_contactable)
            .collect();

        if warm.len() >= self.cfg.min_nodes_for_warm_start {
            tracing::info!(nodes = warm.len(), "crawler: warm start");
            for addr in warm {
                enqueue(&self.metrics, &queue_tx, addr);
            }
        } else {
            tracing::info!("crawler: bootstrapping from public routers");
            for addr in resolve_bootstrap(&self.cfg.bootstrap_hosts).await {
                enqueue(&self.metrics, &queue_tx, addr);
            }
        }

        let responsive: Arc<Mutex<HashMap<SocketAddrV4, u64>>> = Arc::default();

        let send_task = tokio::spawn(send_loop(
            self.socket.clone(),
            queue_rx,
            queue_tx.clone(),
            self.cfg.clone(),
            self.metrics.clone(),
            cancel.clone(),
        ));

        let recv_state = RecvState {
            cfg: self.cfg.clone(),
            metrics: self.metrics.clone(),
            pipeline: self.pipeline,
            queue: queue_tx,
            seen_hashes: self.seen_hashes,
            seen_nodes: HashSet::new(),
            responsive: responsive.clone(),
        };
        let recv_task = tokio::spawn(recv_loop(self.socket.clone(), recv_state, cancel.clone()));

        let mut save_tick = interval(Duration::from_secs(self.cfg.node_save_period_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = save_tick.tick() => {
                    save_responsive(&self.store, &responsive, &self.cfg);
                }
            }
        }

        // Best-effort final save so a clean restart can skip bootstrap.
        save_responsive(&self.store, &responsive, &self.cfg);
        let _ = send_task.await;
        let _ = recv_task.await;
        tracing::info!("crawler: stopped");
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::UnboundedReceiver<SocketAddrV4>,
    feedback: mpsc::UnboundedSender<SocketAddrV4>,
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let gap = Duration::from_millis(1000 / cfg.max_queries_per_second.max(1) as u64);
    let backoff = Duration::from_secs(cfg.rebootstrap_backoff_secs);

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match queue.try_recv() {
            Ok(addr) => {
                metrics::dec(&metrics.crawler.queue_size);
                // A fresh identity per query is the Sybil trick: every query
                // plants our address in a different region of the id space.
                let msg = krpc::find_node_query(&krpc::random_id(), &krpc::random_id());
                let _ = socket.send_to(&msg, SocketAddr::V4(addr)).await;
                metrics::inc(&metrics.crawler.packets_sent);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(gap) => {}
                }
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                tracing::info!("crawler: queue drained; re-bootstrapping");
                for addr in resolve_bootstrap(&cfg.bootstrap_hosts).await {
                    enqueue(&metrics, &feedback, addr);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, mut state: RecvState, cancel: CancellationToken) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            recv = socket.recv_from(&mut buf) => match recv {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::trace!(%err, "crawler: recv error");
                    continue;
                }
            },
        };
        let SocketAddr::V4(from) = from else {
            continue;
        };
        state.handle_datagram(&buf[..n], from);
    }
}

/// Everything the receive loop mutates, separated from the socket so the
/// classification path can be exercised with synthetic datagrams.
struct RecvState {
    cfg: Arc<Config>,
    metrics: Arc<Metrics>,
    pipeline: HashSender,
    queue: mpsc::UnboundedSender<SocketAddrV4>,
    seen_hashes: HashSet<String>,
    seen_nodes: HashSet<SocketAddrV4>,
    responsive: Arc<Mutex<HashMap<SocketAddrV4, u64>>>,
}

impl RecvState {
    fn handle_datagram(&mut self, raw: &[u8], from: SocketAddrV4) {
        metrics::inc(&self.metrics.crawler.packets_received);
        let Some(packet) = krpc::classify(raw) else {
            return;
        };

        match packet {
            Packet::Query { info_hash } => self.harvest(info_hash),
            Packet::Response { nodes, samples } => {
                for sample in samples {
                    self.harvest(sample);
                }
                for node in nodes {
                    if !krpc::is_contactable(&node.addr) {
                        continue;
                    }
                    if self.seen_nodes.insert(node.addr) {
                        metrics::inc(&self.metrics.crawler.nodes_discovered);
                        enqueue(&self.metrics, &self.queue, node.addr);
                    }
                }
                // Bounded-memory approximation: forget everything at the cap
                // and let live endpoints re-appear in later responses.
                if self.seen_nodes.len() > self.cfg.max_seen_nodes {
                    self.seen_nodes.clear();
                }

                *self
                    .responsive
                    .lock()
                    .expect("responsive lock")
                    .entry(from)
                    .or_insert(0) += 1;
            }
        }
    }

    fn harvest(&mut self, info_hash: [u8; 20]) {
        metrics::inc(&self.metrics.crawler.hashes_discovered);
        let hash = hex::encode_upper(info_hash);
        if self.seen_hashes.insert(hash.clone()) {
            metrics::inc(&self.metrics.crawler.unique_hashes);
            self.pipeline.submit(hash);
        }
    }
}

fn enqueue(metrics: &Metrics, queue: &mpsc::UnboundedSender<SocketAddrV4>, addr: SocketAddrV4) {
    if queue.send(addr).is_ok() {
        metrics::inc(&metrics.crawler.queue_size);
    }
}

fn save_responsive(
    store: &Store,
    responsive: &Mutex<HashMap<SocketAddrV4, u64>>,
    cfg: &Config,
) {
    let snapshot: Vec<(SocketAddrV4, u64)> = {
        let mut map = responsive.lock().expect("responsive lock");
        // The counter map grows with every responder; shed the one-shot
        // entries when it gets large.
        if map.len() > cfg.max_seen_nodes {
            map.retain(|_, count| *count > 1);
        }
        map.iter().map(|(addr, count)| (*addr, *count)).collect()
    };
    if snapshot.is_empty() {
        return;
    }

    let mut top = snapshot;
    top.sort_by(|a, b| b.1.cmp(&a.1));
    top.truncate(cfg.max_nodes_to_save);

    let now = now_unix_ms();
    let nodes: Vec<KnownNode> = top
        .into_iter()
        .map(|(addr, responses)| KnownNode {
            ip: addr.ip().to_string(),
            port: addr.port(),
            responses,
            last_seen_unix_ms: now,
        })
        .collect();

    match store.record_nodes(&nodes) {
        Ok(()) => tracing::debug!(saved = nodes.len(), "crawler: warm-start nodes saved"),
        Err(err) => tracing::warn!(%err, "crawler: warm-start save failed"),
    }
}

async fn resolve_bootstrap(hosts: &[String]) -> Vec<SocketAddrV4> {
    let mut out = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host).await {
            Ok(addrs) => out.extend(addrs.filter_map(|addr| match addr {
                SocketAddr::V4(v4) if krpc::is_contactable(&v4) => Some(v4),
                _ => None,
            })),
            Err(err) => {
                tracing::debug!(%err, host = %host, "crawler: bootstrap resolve failed");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline;
    use std::sync::atomic::Ordering;

    fn test_state(
        cfg: Config,
    ) -> (
        RecvState,
        crate::pipeline::HashReceiver,
        mpsc::UnboundedReceiver<SocketAddrV4>,
        Arc<Metrics>,
    ) {
        let metrics = Arc::new(Metrics::new());
        let (pipe_tx, pipe_rx) = pipeline::channel(0);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let state = RecvState {
            cfg: Arc::new(cfg),
            metrics: metrics.clone(),
            pipeline: pipe_tx,
            queue: queue_tx,
            seen_hashes: HashSet::new(),
            seen_nodes: HashSet::new(),
            responsive: Arc::default(),
        };
        (state, pipe_rx, queue_rx, metrics)
    }

    fn query_datagram(hash: [u8; 20]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:ad2:id20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(b"9:info_hash20:");
        raw.extend_from_slice(&hash);
        raw.extend_from_slice(b"e1:q13:announce_peer1:t2:aa1:y1:qe");
        raw
    }

    fn response_datagram(addrs: &[SocketAddrV4]) -> Vec<u8> {
        let mut nodes = Vec::new();
        for addr in addrs {
            nodes.extend_from_slice(&[0u8; 20]);
            nodes.extend_from_slice(&addr.ip().octets());
            nodes.extend_from_slice(&addr.port().to_be_bytes());
        }
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:rd2:id20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(format!("5:nodes{}:", nodes.len()).as_bytes());
        raw.extend_from_slice(&nodes);
        raw.extend_from_slice(b"e1:t2:aa1:y1:re");
        raw
    }

    const FROM: &str = "93.184.216.34:6881";

    #[tokio::test]
    async fn query_hash_reaches_pipeline_in_upper_hex() {
        let (mut state, mut pipe, _queue, metrics) = test_state(Config::default());
        let hash = [0xabu8; 20];

        state.handle_datagram(&query_datagram(hash), FROM.parse().unwrap());
        state.handle_datagram(&query_datagram(hash), FROM.parse().unwrap());

        // Two observations, one unique hash, one pipeline emission.
        assert_eq!(metrics.crawler.hashes_discovered.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.crawler.unique_hashes.load(Ordering::Relaxed), 1);
        let emitted = pipe.recv().await.unwrap();
        assert_eq!(emitted, "AB".repeat(20));
    }

    #[tokio::test]
    async fn seeded_hashes_are_not_re_emitted() {
        let (mut state, _pipe, _queue, metrics) = test_state(Config::default());
        let hash = [0xcdu8; 20];
        state.seen_hashes.insert(hex::encode_upper(hash));

        state.handle_datagram(&query_datagram(hash), FROM.parse().unwrap());

        assert_eq!(metrics.crawler.hashes_discovered.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.crawler.unique_hashes.load(Ordering::Relaxed), 0);
        assert_eq!(state.pipeline.depth(), 0);
    }

    #[tokio::test]
    async fn response_nodes_feed_the_queue_once() {
        let (mut state, _pipe, mut queue, metrics) = test_state(Config::default());
        let node: SocketAddrV4 = "93.184.216.1:6881".parse().unwrap();
        let private: SocketAddrV4 = "192.168.1.1:6881".parse().unwrap();

        let datagram = response_datagram(&[node, private, node]);
        state.handle_datagram(&datagram, FROM.parse().unwrap());

        assert_eq!(queue.try_recv().unwrap(), node);
        assert!(queue.try_recv().is_err());
        assert_eq!(metrics.crawler.nodes_discovered.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.crawler.queue_size.load(Ordering::Relaxed), 1);

        // The responder is remembered for warm starts.
        let from: SocketAddrV4 = FROM.parse().unwrap();
        assert_eq!(state.responsive.lock().unwrap().get(&from), Some(&1));
    }

    #[tokio::test]
    async fn seen_nodes_clear_at_the_cap() {
        let cfg = Config {
            max_seen_nodes: 3,
            ..Config::default()
        };
        let (mut state, _pipe, _queue, _metrics) = test_state(cfg);

        for i in 0..4u8 {
            let addr: SocketAddrV4 = format!("93.184.216.{}:6881", i + 1).parse().unwrap();
            state.handle_datagram(&response_datagram(&[addr]), FROM.parse().unwrap());
        }
        // Crossing the cap wipes the whole set.
        assert!(state.seen_nodes.is_empty());

        // The next insert starts the set over.
        let again: SocketAddrV4 = "93.184.216.1:6881".parse().unwrap();
        state.handle_datagram(&response_datagram(&[again]), FROM.parse().unwrap());
        assert_eq!(state.seen_nodes.len(), 1);
    }

    #[tokio::test]
    async fn malformed_datagrams_only_count_received() {
        let (mut state, _pipe, mut queue, metrics) = test_state(Config::default());

        state.handle_datagram(b"junk", FROM.parse().unwrap());
        state.handle_datagram(b"d1:t2:aae", FROM.parse().unwrap());

        assert_eq!(metrics.crawler.packets_received.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.crawler.hashes_discovered.load(Ordering::Relaxed), 0);
        assert!(queue.try_recv().is_err());
        assert!(state.responsive.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bind_socket_on_ephemeral_port() {
        let cfg = Config {
            dht_port: 0,
            ..Config::default()
        };
        let socket = bind_socket(&cfg).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }
}
