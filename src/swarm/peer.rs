//! BEP-3 handshake and message framing, reduced to what a metadata-only
//! client needs: we speak the handshake, send and receive extended messages,
//! and skip every other frame by id.

use std::net::SocketAddrV4;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::WireError;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// BEP-10 message id on the wire.
const MSG_EXTENDED: u8 = 20;

/// Frames above this are never legitimate in a metadata exchange.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const READ_TIMEOUT: Duration = Duration::from_secs(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// The fixed-size BEP-3 handshake. Only the BEP-10 extension bit is set in
/// the reserved bytes; we have no use for the other capabilities.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // extension protocol (BEP-10)
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(WireError::InvalidHandshake);
        }
        if data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(WireError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A framed peer connection.
pub struct PeerStream {
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerStream {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Outbound connection: dial, exchange handshakes, verify the hash and
    /// the extension bit.
    pub async fn connect(
        addr: SocketAddrV4,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<Self, WireError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout)??;
        let mut this = Self::new(stream);

        this.send_handshake(&Handshake::new(info_hash, peer_id))
            .await?;
        let theirs = this.receive_handshake().await?;

        if theirs.info_hash != info_hash {
            return Err(WireError::InfoHashMismatch);
        }
        if !theirs.supports_extensions() {
            return Err(WireError::NoExtensionSupport);
        }
        Ok(this)
    }

    /// Inbound connection: read the peer's handshake and hand it back so the
    /// caller can route the connection; our handshake is sent later by the
    /// owning session.
    pub async fn accept(stream: TcpStream) -> Result<(Self, Handshake), WireError> {
        let mut this = Self::new(stream);
        let theirs = this.receive_handshake().await?;
        Ok((this, theirs))
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), WireError> {
        let data = handshake.encode();
        timeout(WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| WireError::Timeout)??;
        Ok(())
    }

    async fn receive_handshake(&mut self) -> Result<Handshake, WireError> {
        while self.buf.len() < HANDSHAKE_LEN {
            self.fill().await?;
        }
        let data = self.buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Sends one extended message: `<len><20><ext id><payload>`.
    pub async fn send_extended(&mut self, ext_id: u8, payload: &[u8]) -> Result<(), WireError> {
        let mut frame = BytesMut::with_capacity(6 + payload.len());
        frame.extend_from_slice(&((2 + payload.len()) as u32).to_be_bytes());
        frame.extend_from_slice(&[MSG_EXTENDED, ext_id]);
        frame.extend_from_slice(payload);

        timeout(WRITE_TIMEOUT, self.stream.write_all(&frame))
            .await
            .map_err(|_| WireError::Timeout)??;
        Ok(())
    }

    /// Reads frames until the next extended message, skipping keep-alives and
    /// every other message type (bitfield, have, choke traffic, ...).
    pub async fn recv_extended(&mut self) -> Result<(u8, Bytes), WireError> {
        loop {
            let mut frame = self.recv_frame().await?;
            if frame.is_empty() {
                continue; // keep-alive
            }
            let id = frame.get_u8();
            if id != MSG_EXTENDED {
                continue;
            }
            if frame.is_empty() {
                return Err(WireError::Extension("empty extended frame".into()));
            }
            let ext_id = frame.get_u8();
            return Ok((ext_id, frame));
        }
    }

    /// One length-prefixed frame, without the length prefix.
    async fn recv_frame(&mut self) -> Result<Bytes, WireError> {
        while self.buf.len() < 4 {
            self.fill().await?;
        }
        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge(length));
        }

        let total = 4 + length;
        while self.buf.len() < total {
            self.fill().await?;
        }
        let mut data = self.buf.split_to(total);
        data.advance(4);
        Ok(data.freeze())
    }

    async fn fill(&mut self) -> Result<(), WireError> {
        let n = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .map_err(|_| WireError::Timeout)??;
        if n == 0 {
            return Err(WireError::ConnectionClosed);
        }
        Ok(())
    }
}
