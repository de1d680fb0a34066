//! BEP-10 extended handshake and BEP-9 ut_metadata messages, plus the parse
//! of an assembled info dictionary into a [`TorrentMeta`].

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::WireError;
use super::{MetaFile, TorrentMeta};
use crate::bencode::{self, Value};

/// Metadata travels in 16 KiB pieces.
pub const METADATA_PIECE_SIZE: usize = 16384;

/// The id we advertise for ut_metadata in our extended handshake; peers send
/// their metadata messages to us under this id.
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// Extended message id reserved for the handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Info dictionaries larger than this are nonsense and refused outright.
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// The subset of the BEP-10 handshake dictionary we read and write.
#[derive(Debug, Clone, Default)]
pub struct ExtendedHandshake {
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<i64>,
    pub client: Option<String>,
}

impl ExtendedHandshake {
    /// The handshake we send: we support ut_metadata, nothing else.
    pub fn ours() -> Self {
        Self {
            ut_metadata: Some(UT_METADATA_LOCAL_ID),
            metadata_size: None,
            client: Some("trawler 0.1".to_string()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut extensions = BTreeMap::new();
        if let Some(id) = self.ut_metadata {
            extensions.insert(Bytes::from_static(b"ut_metadata"), Value::Int(id as i64));
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(extensions));
        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::text(client));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Int(size));
        }
        bencode::encode(&Value::Dict(dict))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let value = bencode::decode(payload)?;
        if value.as_dict().is_none() {
            return Err(WireError::Extension("handshake is not a dict".into()));
        }

        let ut_metadata = value
            .get(b"m")
            .and_then(|extensions| extensions.int_at(b"ut_metadata"))
            .filter(|id| (1..=255).contains(id))
            .map(|id| id as u8);

        Ok(Self {
            ut_metadata,
            metadata_size: value.int_at(b"metadata_size"),
            client: value.utf8_at(b"v").map(String::from),
        })
    }
}

/// One ut_metadata message. Data messages carry the raw piece bytes after
/// the bencoded header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMsg {
    Request { piece: u32 },
    Data { piece: u32, total_size: Option<i64>, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMsg {
    pub fn request(piece: u32) -> Self {
        MetadataMsg::Request { piece }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece, total_size, data) = match self {
            MetadataMsg::Request { piece } => (MSG_REQUEST, *piece, None, None),
            MetadataMsg::Data {
                piece,
                total_size,
                data,
            } => (MSG_DATA, *piece, *total_size, Some(data)),
            MetadataMsg::Reject { piece } => (MSG_REJECT, *piece, None, None),
        };

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"msg_type"), Value::Int(msg_type));
        dict.insert(Bytes::from_static(b"piece"), Value::Int(piece as i64));
        if let Some(size) = total_size {
            dict.insert(Bytes::from_static(b"total_size"), Value::Int(size));
        }

        let mut out = bencode::encode(&Value::Dict(dict));
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let (header, used) = bencode::decode_prefix(payload)?;

        let msg_type = header
            .int_at(b"msg_type")
            .ok_or_else(|| WireError::Extension("missing msg_type".into()))?;
        let piece = header
            .int_at(b"piece")
            .and_then(|piece| u32::try_from(piece).ok())
            .ok_or_else(|| WireError::Extension("missing piece".into()))?;

        match msg_type {
            MSG_REQUEST => Ok(MetadataMsg::Request { piece }),
            MSG_DATA => Ok(MetadataMsg::Data {
                piece,
                total_size: header.int_at(b"total_size"),
                data: Bytes::copy_from_slice(&payload[used..]),
            }),
            MSG_REJECT => Ok(MetadataMsg::Reject { piece }),
            other => Err(WireError::Extension(format!("unknown msg_type {other}"))),
        }
    }
}

pub fn piece_count(total_size: usize) -> usize {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Size of one metadata piece; the last piece is the remainder.
pub fn piece_size(piece: usize, total_size: usize) -> usize {
    let offset = piece * METADATA_PIECE_SIZE;
    if offset >= total_size {
        0
    } else {
        (total_size - offset).min(METADATA_PIECE_SIZE)
    }
}

/// Parses a validated info dictionary into the torrent view.
///
/// Single-file torrents are normalised to a one-entry file list so the rest
/// of the system never branches on the mode.
pub fn parse_info_dict(raw: &[u8]) -> Result<TorrentMeta, WireError> {
    let value = bencode::decode(raw)?;
    if value.as_dict().is_none() {
        return Err(WireError::BadInfoDict("not a dict".into()));
    }

    let name = value
        .utf8_at(b"name.utf-8")
        .or_else(|| value.utf8_at(b"name"))
        .ok_or_else(|| WireError::BadInfoDict("missing name".into()))?
        .to_string();

    let piece_length_bytes = value
        .int_at(b"piece length")
        .filter(|len| *len >= 0)
        .unwrap_or(0) as u64;

    let is_private = value.int_at(b"private") == Some(1);

    let files = match value.list_at(b"files") {
        Some(list) => {
            let mut files = Vec::with_capacity(list.len());
            for entry in list {
                let size = entry
                    .int_at(b"length")
                    .filter(|len| *len >= 0)
                    .ok_or_else(|| WireError::BadInfoDict("file without length".into()))?;
                let path = entry
                    .list_at(b"path.utf-8")
                    .or_else(|| entry.list_at(b"path"))
                    .ok_or_else(|| WireError::BadInfoDict("file without path".into()))?;
                let path = path
                    .iter()
                    .filter_map(|part| part.as_utf8())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(MetaFile {
                    path,
                    size_bytes: size as u64,
                });
            }
            files
        }
        None => {
            let size = value
                .int_at(b"length")
                .filter(|len| *len >= 0)
                .ok_or_else(|| WireError::BadInfoDict("missing length".into()))?;
            vec![MetaFile {
                path: name.clone(),
                size_bytes: size as u64,
            }]
        }
    };

    let total_size_bytes = files.iter().map(|f| f.size_bytes).sum();

    Ok(TorrentMeta {
        name,
        total_size_bytes,
        piece_length_bytes,
        is_private,
        creation_date: None,
        comment: None,
        created_by: None,
        trackers: Vec::new(),
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let msg = MetadataMsg::request(5);
        let decoded = MetadataMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, MetadataMsg::Request { piece: 5 });
    }

    #[test]
    fn data_carries_trailing_bytes() {
        let msg = MetadataMsg::Data {
            piece: 2,
            total_size: Some(1000),
            data: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let decoded = MetadataMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn reject_roundtrip() {
        let msg = MetadataMsg::Reject { piece: 10 };
        let decoded = MetadataMsg::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_without_msg_type_fails() {
        assert!(MetadataMsg::decode(b"d5:piecei0ee").is_err());
        assert!(MetadataMsg::decode(b"garbage").is_err());
    }

    #[test]
    fn piece_math() {
        assert_eq!(piece_count(0), 0);
        assert_eq!(piece_count(1), 1);
        assert_eq!(piece_count(METADATA_PIECE_SIZE), 1);
        assert_eq!(piece_count(METADATA_PIECE_SIZE + 1), 2);

        assert_eq!(piece_size(0, 20_000), METADATA_PIECE_SIZE);
        assert_eq!(piece_size(1, 20_000), 20_000 - METADATA_PIECE_SIZE);
        assert_eq!(piece_size(2, 20_000), 0);
    }

    #[test]
    fn extended_handshake_roundtrip() {
        let decoded = ExtendedHandshake::decode(&ExtendedHandshake::ours().encode()).unwrap();
        assert_eq!(decoded.ut_metadata, Some(UT_METADATA_LOCAL_ID));
        assert_eq!(decoded.client.as_deref(), Some("trawler 0.1"));
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn extended_handshake_without_ut_metadata() {
        let decoded = ExtendedHandshake::decode(b"d1:md6:ut_pexi2eee").unwrap();
        assert_eq!(decoded.ut_metadata, None);
    }

    #[test]
    fn parse_single_file_info() {
        let raw = b"d6:lengthi1024e4:name8:demo.bin12:piece lengthi262144ee";
        let meta = parse_info_dict(raw).unwrap();
        assert_eq!(meta.name, "demo.bin");
        assert_eq!(meta.total_size_bytes, 1024);
        assert_eq!(meta.piece_length_bytes, 262144);
        assert!(!meta.is_private);
        assert_eq!(
            meta.files,
            vec![MetaFile {
                path: "demo.bin".to_string(),
                size_bytes: 1024,
            }]
        );
    }

    #[test]
    fn parse_multi_file_info() {
        let raw = b"d5:filesld6:lengthi100e4:pathl3:sub5:a.txteed6:lengthi200e4:pathl5:b.bineee4:name4:demo12:piece lengthi16384e7:privatei1ee";
        let meta = parse_info_dict(raw).unwrap();
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.total_size_bytes, 300);
        assert!(meta.is_private);
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, "sub/a.txt");
        assert_eq!(meta.files[1].path, "b.bin");
    }

    #[test]
    fn parse_rejects_broken_info() {
        assert!(parse_info_dict(b"d6:lengthi1024ee").is_err()); // no name
        assert!(parse_info_dict(b"4:name").is_err()); // not a dict
        assert!(parse_info_dict(b"d4:name4:demoe").is_err()); // no length, no files
    }
}
