use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors on the peer-wire path. Per-peer failures are expected background
/// noise; a session only fails as a whole when every peer does.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("peer does not support the extension protocol")]
    NoExtensionSupport,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("extension error: {0}")]
    Extension(String),

    #[error("peer rejected metadata piece {0}")]
    MetadataRejected(u32),

    #[error("assembled metadata failed the info-hash check")]
    HashMismatch,

    #[error("bad info dictionary: {0}")]
    BadInfoDict(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),
}
