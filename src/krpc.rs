//! KRPC (BEP-5) message building and datagram classification.
//!
//! The crawler cares about exactly two inbound shapes: queries that carry an
//! `info_hash` argument (what we harvest) and responses that carry compact
//! node lists (what keeps the crawl queue fed). Everything else is dropped.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use rand::Rng as _;

use crate::bencode::{self, Value};

/// On-wire size of one compact node record: 20-byte id, 4-byte IPv4, 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

/// On-wire size of one compact peer record: 4-byte IPv4, 2-byte port.
pub const COMPACT_PEER_LEN: usize = 6;

/// Transaction id carried by every crawler query.
///
/// The crawler never matches responses back to queries; any well-formed reply
/// is useful on its own, so a constant id is deliberate. The swarm lookup,
/// which does match replies, uses real transaction ids.
pub const CRAWL_TRANSACTION_ID: &[u8] = b"aa";

/// BEP-51 responses may carry large sample blocks; cap what we take per packet.
const MAX_SAMPLES_PER_PACKET: usize = 256;

/// A node learned from a compact node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: [u8; 20],
    pub addr: SocketAddrV4,
}

/// An inbound datagram reduced to what the crawler acts on.
#[derive(Debug)]
pub enum Packet {
    /// A query addressed to us whose arguments carry an info-hash.
    Query { info_hash: [u8; 20] },
    /// A response: freshly learned endpoints, plus any BEP-51 hash samples.
    Response {
        nodes: Vec<NodeInfo>,
        samples: Vec<[u8; 20]>,
    },
}

/// A fresh random 20-byte id, used both for Sybil node ids and lookup targets.
pub fn random_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::rng().fill(&mut id[..]);
    id
}

/// Builds a `find_node` query with the constant crawl transaction id.
pub fn find_node_query(id: &[u8; 20], target: &[u8; 20]) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), bytes_value(id));
    args.insert(Bytes::from_static(b"target"), bytes_value(target));
    bencode::encode(&query_value(b"find_node", CRAWL_TRANSACTION_ID, args))
}

/// Builds a `get_peers` query with a caller-chosen transaction id.
pub fn get_peers_query(tx: &[u8], id: &[u8; 20], info_hash: &[u8; 20]) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), bytes_value(id));
    args.insert(Bytes::from_static(b"info_hash"), bytes_value(info_hash));
    bencode::encode(&query_value(b"get_peers", tx, args))
}

fn query_value(method: &'static [u8], tx: &[u8], args: BTreeMap<Bytes, Value>) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
    dict.insert(Bytes::from_static(b"q"), Value::Bytes(Bytes::from_static(method)));
    dict.insert(Bytes::from_static(b"t"), Value::Bytes(Bytes::copy_from_slice(tx)));
    dict.insert(Bytes::from_static(b"y"), Value::Bytes(Bytes::from_static(b"q")));
    Value::Dict(dict)
}

fn bytes_value(b: &[u8]) -> Value {
    Value::Bytes(Bytes::copy_from_slice(b))
}

/// Classifies an inbound datagram. Returns `None` for anything the crawler
/// ignores: malformed bencode, errors, queries without an info-hash, or an
/// info-hash of the wrong length.
pub fn classify(raw: &[u8]) -> Option<Packet> {
    let value = bencode::decode(raw).ok()?;
    let y = value.bytes_at(b"y")?;

    if y == b"q" {
        let info_hash = value.get(b"a")?.bytes_at(b"info_hash")?;
        Some(Packet::Query {
            info_hash: to_hash(info_hash)?,
        })
    } else if y == b"r" {
        let r = value.get(b"r")?;
        let nodes = r
            .bytes_at(b"nodes")
            .map(parse_compact_nodes)
            .unwrap_or_default();
        let samples = r
            .bytes_at(b"samples")
            .map(|buf| {
                buf.chunks_exact(20)
                    .take(MAX_SAMPLES_PER_PACKET)
                    .filter_map(to_hash)
                    .collect()
            })
            .unwrap_or_default();
        Some(Packet::Response { nodes, samples })
    } else {
        None
    }
}

/// A decoded `get_peers` response, as used by the swarm lookup.
#[derive(Debug)]
pub struct GetPeersReply {
    pub tx: Vec<u8>,
    pub nodes: Vec<NodeInfo>,
    pub peers: Vec<SocketAddrV4>,
}

/// Decodes a response datagram into transaction id, nodes, and peer values.
/// Returns `None` for anything that is not a well-formed response.
pub fn parse_get_peers_reply(raw: &[u8]) -> Option<GetPeersReply> {
    let value = bencode::decode(raw).ok()?;
    if value.bytes_at(b"y")? != b"r" {
        return None;
    }
    let tx = value.bytes_at(b"t")?.to_vec();
    let r = value.get(b"r")?;

    let nodes = r
        .bytes_at(b"nodes")
        .map(parse_compact_nodes)
        .unwrap_or_default();

    let peers = r
        .list_at(b"values")
        .map(|values| {
            values
                .iter()
                .filter_map(|item| item.as_bytes())
                .filter_map(parse_compact_peer)
                .collect()
        })
        .unwrap_or_default();

    Some(GetPeersReply { tx, nodes, peers })
}

/// Parses a buffer of compact node records. A buffer whose length is not a
/// multiple of 26 yields `floor(len / 26)` nodes; the tail is discarded.
pub fn parse_compact_nodes(buf: &[u8]) -> Vec<NodeInfo> {
    buf.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            NodeInfo {
                id,
                addr: SocketAddrV4::new(ip, port),
            }
        })
        .collect()
}

/// Parses one 6-byte compact peer record.
pub fn parse_compact_peer(buf: &[u8]) -> Option<SocketAddrV4> {
    if buf.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    Some(SocketAddrV4::new(ip, port))
}

/// Whether an endpoint is worth contacting. The crawl queue is dominated by
/// garbage endpoints; dropping the obviously unroutable ones early keeps the
/// paced send loop busy with real candidates.
pub fn is_contactable(addr: &SocketAddrV4) -> bool {
    if addr.port() == 0 {
        return false;
    }
    let ip = addr.ip();
    if ip.is_private() || ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    if ip.is_link_local() || ip.is_multicast() || ip.is_broadcast() {
        return false;
    }
    true
}

fn to_hash(bytes: &[u8]) -> Option<[u8; 20]> {
    if bytes.len() != 20 {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_node_wire_layout() {
        let id = [0x11u8; 20];
        let target = [0x22u8; 20];
        let msg = find_node_query(&id, &target);

        // Canonical key order is a/q/t/y, matching the BEP-5 examples.
        let mut expected = Vec::new();
        expected.extend_from_slice(b"d1:ad2:id20:");
        expected.extend_from_slice(&id);
        expected.extend_from_slice(b"6:target20:");
        expected.extend_from_slice(&target);
        expected.extend_from_slice(b"e1:q9:find_node1:t2:aa1:y1:qe");
        assert_eq!(msg, expected);
    }

    #[test]
    fn classify_query_with_info_hash() {
        let hash = [0xabu8; 20];
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:ad2:id20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(b"9:info_hash20:");
        raw.extend_from_slice(&hash);
        raw.extend_from_slice(b"e1:q9:get_peers1:t2:xy1:y1:qe");

        match classify(&raw) {
            Some(Packet::Query { info_hash }) => assert_eq!(info_hash, hash),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn classify_query_without_info_hash_dropped() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:ad2:id20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(b"e1:q4:ping1:t2:xy1:y1:qe");
        assert!(classify(&raw).is_none());
    }

    #[test]
    fn classify_wrong_length_info_hash_dropped() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:ad9:info_hash5:shorte1:q9:get_peers1:t2:xy1:y1:qe");
        assert!(classify(&raw).is_none());
    }

    #[test]
    fn classify_missing_y_dropped() {
        assert!(classify(b"d1:t2:aae").is_none());
    }

    #[test]
    fn classify_malformed_dropped() {
        assert!(classify(b"not bencode at all").is_none());
        assert!(classify(b"").is_none());
        assert!(classify(b"d1:y1:q").is_none());
    }

    #[test]
    fn classify_response_with_nodes() {
        let mut nodes = Vec::new();
        for i in 0..3u8 {
            nodes.extend_from_slice(&[i; 20]);
            nodes.extend_from_slice(&[10, 0, 0, i]);
            nodes.extend_from_slice(&(6881u16 + i as u16).to_be_bytes());
        }

        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:rd2:id20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(format!("5:nodes{}:", nodes.len()).as_bytes());
        raw.extend_from_slice(&nodes);
        raw.extend_from_slice(b"e1:t2:aa1:y1:re");

        match classify(&raw) {
            Some(Packet::Response { nodes, samples }) => {
                assert_eq!(nodes.len(), 3);
                assert_eq!(nodes[1].addr, "10.0.0.1:6882".parse().unwrap());
                assert!(samples.is_empty());
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn classify_response_with_empty_nodes() {
        // Zero-length node blocks are valid and yield no endpoints.
        let raw = b"d1:rd5:nodes0:e1:t2:aa1:y1:re";
        match classify(raw) {
            Some(Packet::Response { nodes, samples }) => {
                assert!(nodes.is_empty());
                assert!(samples.is_empty());
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn compact_nodes_discard_tail() {
        let buf = vec![0u8; COMPACT_NODE_LEN * 4 + 13];
        assert_eq!(parse_compact_nodes(&buf).len(), 4);
        assert_eq!(parse_compact_nodes(&buf[..25]).len(), 0);
        assert_eq!(parse_compact_nodes(&[]).len(), 0);
    }

    #[test]
    fn get_peers_reply_values() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d1:rd2:id20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(b"6:valuesl6:");
        raw.extend_from_slice(&[1, 2, 3, 4, 0x1a, 0xe1]);
        raw.extend_from_slice(b"ee1:t2:ab1:y1:re");

        let reply = parse_get_peers_reply(&raw).unwrap();
        assert_eq!(reply.tx, b"ab");
        assert_eq!(reply.peers, vec!["1.2.3.4:6881".parse().unwrap()]);
        assert!(reply.nodes.is_empty());
    }

    #[test]
    fn contactable_filters_garbage() {
        let ok: SocketAddrV4 = "93.184.216.34:6881".parse().unwrap();
        assert!(is_contactable(&ok));

        let cases = ["127.0.0.1:6881", "10.1.2.3:6881", "0.0.0.0:6881", "93.184.216.34:0"];
        for case in cases {
            let addr: SocketAddrV4 = case.parse().unwrap();
            assert!(!is_contactable(&addr), "{case} should be filtered");
        }
    }
}
