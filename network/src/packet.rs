//! Packet framing: the fixed wire header, the content hash, and the
//! framed reader/writer pair.
//!
//! ## Wire format
//!
//! Every packet on the wire is a fixed 58-byte header followed by the
//! payload:
//!
//! | Field       | Size | Meaning |
//! |-------------|------|---------|
//! | magic       | 2    | constant preamble `0x5445` |
//! | version     | 1    | protocol version |
//! | flags       | 1    | bit 0 = force-send, bits 1-2 = destination kind |
//! | protocol    | 2    | top-level routing tag |
//! | subprotocol | 2    | sub tag |
//! | ttl         | 1    | hop budget, 0 = unlimited |
//! | priority    | 1    | 0..=6, lower is more urgent |
//! | src         | 20   | originator peer id |
//! | dest        | 20   | peer id, role bits, or broadcast tag |
//! | payload_len | 4    | big-endian |
//! | hash        | 4    | truncated content hash |
//!
//! The content hash is SHA3-256 over the routing-relevant fields
//! (destination, protocol tags, source, payload) and deliberately excludes
//! the TTL so the same packet keeps one hash across hops; the duplicate
//! pools key on it. The wire carries its first four bytes as an integrity
//! check; a mismatch is a framing error and the caller closes the
//! connection.

use {
    crate::{
        error::{NetworkError, Result},
        types::{BroadcastType, PeerID, RoleFlag, PEER_ID_LEN},
    },
    sha3::{Digest, Sha3_256},
    std::fmt,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
};

/// Constant preamble of every packet.
pub const PACKET_MAGIC: u16 = 0x5445;

/// Current wire protocol version.
pub const PACKET_VERSION: u8 = 1;

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 58;

/// Size of the full content hash kept in memory.
pub const HASH_LEN: usize = 32;

const FLAG_FORCE_SEND: u8 = 0b0000_0001;
const DEST_KIND_SHIFT: u8 = 1;
const DEST_KIND_MASK: u8 = 0b0000_0110;

// ── Destination ─────────────────────────────────────────────────────────────

/// Where a packet is going: one peer, every peer of a role, or a
/// broadcast fan-out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketDest {
    Peer(PeerID),
    Role(RoleFlag),
    Broadcast(BroadcastType),
}

impl PacketDest {
    fn kind(&self) -> u8 {
        match self {
            Self::Peer(_) => 0,
            Self::Role(_) => 1,
            Self::Broadcast(_) => 2,
        }
    }

    fn to_wire(self) -> [u8; PEER_ID_LEN] {
        let mut out = [0u8; PEER_ID_LEN];
        match self {
            Self::Peer(id) => out = id.to_wire(),
            Self::Role(r) => out[0] = r.bits(),
            Self::Broadcast(b) => out[0] = b as u8,
        }
        out
    }

    fn from_wire(kind: u8, bytes: [u8; PEER_ID_LEN]) -> Result<Self> {
        match kind {
            0 => Ok(Self::Peer(PeerID::from_wire(bytes))),
            1 => Ok(Self::Role(RoleFlag::from_bits(bytes[0]))),
            2 => BroadcastType::from_u8(bytes[0])
                .map(Self::Broadcast)
                .ok_or_else(|| {
                    NetworkError::Framing(format!("unknown broadcast type {}", bytes[0]))
                }),
            _ => Err(NetworkError::Framing(format!("unknown dest kind {kind}"))),
        }
    }
}

// ── Packet ──────────────────────────────────────────────────────────────────

/// One routed message.
#[derive(Clone)]
pub struct Packet {
    pub src: PeerID,
    pub dest: PacketDest,
    pub protocol: u16,
    pub sub_protocol: u16,
    pub ttl: u8,
    pub priority: u8,
    pub force_send: bool,
    pub payload: Vec<u8>,
    /// The neighbor that delivered this packet to us. `None` for locally
    /// originated packets; never on the wire.
    pub sender: Option<PeerID>,
    /// Opaque routing hints attached by local layers; never on the wire.
    pub ext: Vec<u8>,
    hash: [u8; HASH_LEN],
}

impl Packet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src: PeerID,
        dest: PacketDest,
        protocol: u16,
        sub_protocol: u16,
        payload: Vec<u8>,
        ttl: u8,
        priority: u8,
        force_send: bool,
    ) -> Self {
        let hash = content_hash(&dest, protocol, sub_protocol, &src, &payload);
        Self {
            src,
            dest,
            protocol,
            sub_protocol,
            ttl,
            priority,
            force_send,
            payload,
            sender: None,
            ext: Vec::new(),
            hash,
        }
    }

    /// The full 32-byte content hash used for duplicate suppression.
    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// The routing key pair of this packet.
    pub fn protocol_info(&self) -> crate::types::ProtocolInfo {
        crate::types::ProtocolInfo::new(self.protocol, self.sub_protocol)
    }

    /// Decrement the hop budget. TTL 0 is unlimited and stays 0.
    pub fn decrement_ttl(&mut self) {
        if self.ttl > 0 {
            self.ttl = self.ttl.saturating_sub(1);
        }
    }

    /// Whether the hop budget still allows forwarding after a decrement.
    pub fn forwardable(&self) -> bool {
        self.ttl != 1
    }

    fn encode_header(&self) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0..2].copy_from_slice(&PACKET_MAGIC.to_be_bytes());
        h[2] = PACKET_VERSION;
        let mut flags = (self.dest.kind() << DEST_KIND_SHIFT) & DEST_KIND_MASK;
        if self.force_send {
            flags |= FLAG_FORCE_SEND;
        }
        h[3] = flags;
        h[4..6].copy_from_slice(&self.protocol.to_be_bytes());
        h[6..8].copy_from_slice(&self.sub_protocol.to_be_bytes());
        h[8] = self.ttl;
        h[9] = self.priority;
        h[10..30].copy_from_slice(&self.src.to_wire());
        h[30..50].copy_from_slice(&self.dest.to_wire());
        h[50..54].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        h[54..58].copy_from_slice(&self.hash[..4]);
        h
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("src", &self.src)
            .field("dest", &self.dest)
            .field("protocol", &self.protocol)
            .field("sub_protocol", &self.sub_protocol)
            .field("ttl", &self.ttl)
            .field("priority", &self.priority)
            .field("payload_len", &self.payload.len())
            .field("hash", &hex::encode(&self.hash[..4]))
            .finish()
    }
}

fn content_hash(
    dest: &PacketDest,
    protocol: u16,
    sub_protocol: u16,
    src: &PeerID,
    payload: &[u8],
) -> [u8; HASH_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update([dest.kind()]);
    hasher.update(dest.to_wire());
    hasher.update(protocol.to_be_bytes());
    hasher.update(sub_protocol.to_be_bytes());
    hasher.update(src.to_wire());
    hasher.update(payload);
    hasher.finalize().into()
}

// ── Framed reader / writer ──────────────────────────────────────────────────

/// Reads framed packets from a byte stream.
pub struct PacketReader<R> {
    inner: BufReader<R>,
    max_payload_size: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R, max_payload_size: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_payload_size,
        }
    }

    /// Read one packet, validating magic, version, length, and hash.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        let mut header = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut header).await?;

        let magic = u16::from_be_bytes([header[0], header[1]]);
        if magic != PACKET_MAGIC {
            return Err(NetworkError::Framing(format!("bad magic {magic:#06x}")));
        }
        if header[2] != PACKET_VERSION {
            return Err(NetworkError::Framing(format!("bad version {}", header[2])));
        }
        let flags = header[3];
        let protocol = u16::from_be_bytes([header[4], header[5]]);
        let sub_protocol = u16::from_be_bytes([header[6], header[7]]);
        let ttl = header[8];
        let priority = header[9];
        let mut src = [0u8; PEER_ID_LEN];
        src.copy_from_slice(&header[10..30]);
        let mut dest = [0u8; PEER_ID_LEN];
        dest.copy_from_slice(&header[30..50]);
        let payload_len =
            u32::from_be_bytes([header[50], header[51], header[52], header[53]]) as usize;
        if payload_len > self.max_payload_size {
            return Err(NetworkError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }

        let mut payload = vec![0u8; payload_len];
        self.inner.read_exact(&mut payload).await?;

        let src = PeerID::from_wire(src);
        let dest = PacketDest::from_wire((flags & DEST_KIND_MASK) >> DEST_KIND_SHIFT, dest)?;
        let hash = content_hash(&dest, protocol, sub_protocol, &src, &payload);
        if hash[..4] != header[54..58] {
            return Err(NetworkError::Framing("content hash mismatch".into()));
        }

        Ok(Packet {
            src,
            dest,
            protocol,
            sub_protocol,
            ttl,
            priority,
            force_send: flags & FLAG_FORCE_SEND != 0,
            payload,
            sender: None,
            ext: Vec::new(),
            hash,
        })
    }
}

/// Writes framed packets to a byte stream.
pub struct PacketWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    /// Serialize one packet into the buffered stream.
    pub async fn write_packet(&mut self, pkt: &Packet) -> Result<()> {
        self.inner.write_all(&pkt.encode_header()).await?;
        self.inner.write_all(&pkt.payload).await?;
        Ok(())
    }

    /// Flush buffered bytes to the wire.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
