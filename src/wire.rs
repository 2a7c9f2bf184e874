//! Wire codec for the six discovery v4 packet kinds.
//!
//! Every datagram has the layout `hash[32] || signature[65] || kind[1] ||
//! payload`, where `hash` is the keccak256 of everything after it and the
//! recoverable secp256k1 signature covers `kind || payload`. Payloads are
//! RLP lists; trailing list elements are ignored for forward compatibility.

use crate::{
    error::{DecodePacketError, NodeValidationError, RequestError},
    Enr,
};
use enr::{
    k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    NodeId,
};
use rlp::{DecoderError, Rlp, RlpStream};
use sha3::{Digest, Keccak256};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Discovery packets are defined to be no larger than 1280 bytes. Packets
/// larger than this size will be cut at the end and treated as invalid
/// because their hash won't match.
pub const MAX_PACKET_SIZE: usize = 1280;

/// The maximum number of neighbor entries in a single Neighbors packet. More
/// entries than this would push the datagram past [`MAX_PACKET_SIZE`].
pub const MAX_NEIGHBORS: usize = 12;

/// Allowed clock drift when checking packet expirations.
pub const EXPIRATION_DRIFT: Duration = Duration::from_secs(10);

const HASH_SIZE: usize = 32;
const SIG_SIZE: usize = 65;
const HEAD_SIZE: usize = HASH_SIZE + SIG_SIZE;

/* Packet type IDs. */

/// Ping packet type.
pub const PING_PACKET: u8 = 1;
/// Pong packet type.
pub const PONG_PACKET: u8 = 2;
/// Findnode packet type.
pub const FINDNODE_PACKET: u8 = 3;
/// Neighbors packet type.
pub const NEIGHBORS_PACKET: u8 = 4;
/// ENRRequest packet type.
pub const ENR_REQUEST_PACKET: u8 = 5;
/// ENRResponse packet type.
pub const ENR_RESPONSE_PACKET: u8 = 6;

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whether an inbound packet's expiration timestamp has passed, allowing
/// [`EXPIRATION_DRIFT`] of clock skew.
pub fn expired(expiration: u64) -> bool {
    unix_now() > expiration.saturating_add(EXPIRATION_DRIFT.as_secs())
}

/// An absolute expiration timestamp `window` from now, for outgoing packets.
pub(crate) fn expiration_in(window: Duration) -> u64 {
    unix_now().saturating_add(window.as_secs())
}

/// An uncompressed secp256k1 public key (X || Y) as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pubkey(pub [u8; 64]);

impl Pubkey {
    /// The node ID derived from this key: keccak256 of the raw point.
    pub fn id(&self) -> NodeId {
        NodeId::new(&keccak256(&self.0))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&point.as_bytes()[1..]);
        Pubkey(raw)
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        Self::from_verifying_key(key.verifying_key())
    }

    /// Recovers the full public key, rejecting points not on the curve.
    pub fn verifying_key(&self) -> Result<VerifyingKey, NodeValidationError> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&self.0);
        VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| NodeValidationError::InvalidPublicKey)
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey(0x{})", hex::encode(&self.0[..8]))
    }
}

impl rlp::Encodable for Pubkey {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.to_vec());
    }
}

impl rlp::Decodable for Pubkey {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        let data = rlp.data()?;
        if data.len() != 64 {
            return Err(DecoderError::RlpInvalidLength);
        }
        let mut raw = [0u8; 64];
        raw.copy_from_slice(data);
        Ok(Pubkey(raw))
    }
}

/// A UDP endpoint statement: IP plus UDP and TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Endpoint {
            ip,
            udp_port,
            tcp_port,
        }
    }

    pub fn from_udp_socket(addr: SocketAddr, tcp_port: u16) -> Self {
        Endpoint {
            ip: addr.ip(),
            udp_port: addr.port(),
            tcp_port,
        }
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

/// An unknown address encodes as an empty byte string, a known one as its
/// 4 or 16 octets.
fn append_ip(s: &mut RlpStream, ip: &IpAddr) {
    let octets: Vec<u8> = match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => Vec::new(),
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    s.append(&octets);
}

/// Decoders accept empty, 4-byte and 16-byte addresses. IPv4-mapped IPv6
/// forms are canonicalized to IPv4 immediately so address comparisons never
/// see both representations.
fn decode_ip(rlp: &Rlp<'_>) -> Result<IpAddr, DecoderError> {
    let data = rlp.data()?;
    match data.len() {
        0 => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(data);
            Ok(IpAddr::V4(octets.into()))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            let v6: std::net::Ipv6Addr = octets.into();
            if let Some(v4) = v6.to_ipv4_mapped() {
                Ok(IpAddr::V4(v4))
            } else {
                Ok(IpAddr::V6(v6))
            }
        }
        _ => Err(DecoderError::RlpInvalidLength),
    }
}

impl rlp::Encodable for Endpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        append_ip(s, &self.ip);
        s.append(&self.udp_port);
        s.append(&self.tcp_port);
    }
}

impl rlp::Decodable for Endpoint {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        Ok(Endpoint {
            ip: decode_ip(&rlp.at(0)?)?,
            udp_port: rlp.val_at(1)?,
            tcp_port: rlp.val_at(2)?,
        })
    }
}

/// A node entry in a Neighbors packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub id: Pubkey,
}

impl rlp::Encodable for Node {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        append_ip(s, &self.ip);
        s.append(&self.udp_port);
        s.append(&self.tcp_port);
        s.append(&self.id);
    }
}

impl rlp::Decodable for Node {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        Ok(Node {
            ip: decode_ip(&rlp.at(0)?)?,
            udp_port: rlp.val_at(1)?,
            tcp_port: rlp.val_at(2)?,
            id: rlp.val_at(3)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
    /// Current sequence number of the sender's record, per EIP-868.
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    /// Hash of the ping packet this pong answers.
    pub reply_tok: Vec<u8>,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Findnode {
    pub target: Pubkey,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<Node>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrRequest {
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrResponse {
    /// Hash of the ENRRequest packet this responds to.
    pub reply_tok: Vec<u8>,
    pub record: Enr,
}

/// A decoded discovery v4 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    Findnode(Findnode),
    Neighbors(Neighbors),
    EnrRequest(EnrRequest),
    EnrResponse(EnrResponse),
}

impl Packet {
    pub fn kind(&self) -> u8 {
        match self {
            Packet::Ping(_) => PING_PACKET,
            Packet::Pong(_) => PONG_PACKET,
            Packet::Findnode(_) => FINDNODE_PACKET,
            Packet::Neighbors(_) => NEIGHBORS_PACKET,
            Packet::EnrRequest(_) => ENR_REQUEST_PACKET,
            Packet::EnrResponse(_) => ENR_RESPONSE_PACKET,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Ping(_) => "PING/v4",
            Packet::Pong(_) => "PONG/v4",
            Packet::Findnode(_) => "FINDNODE/v4",
            Packet::Neighbors(_) => "NEIGHBORS/v4",
            Packet::EnrRequest(_) => "ENRREQUEST/v4",
            Packet::EnrResponse(_) => "ENRRESPONSE/v4",
        }
    }

    fn append_payload(&self, s: &mut RlpStream) {
        match self {
            Packet::Ping(p) => {
                s.begin_list(if p.enr_seq.is_some() { 5 } else { 4 });
                s.append(&p.version);
                s.append(&p.from);
                s.append(&p.to);
                s.append(&p.expiration);
                if let Some(seq) = p.enr_seq {
                    s.append(&seq);
                }
            }
            Packet::Pong(p) => {
                s.begin_list(if p.enr_seq.is_some() { 4 } else { 3 });
                s.append(&p.to);
                s.append(&p.reply_tok);
                s.append(&p.expiration);
                if let Some(seq) = p.enr_seq {
                    s.append(&seq);
                }
            }
            Packet::Findnode(p) => {
                s.begin_list(2);
                s.append(&p.target);
                s.append(&p.expiration);
            }
            Packet::Neighbors(p) => {
                s.begin_list(2);
                s.append_list(&p.nodes);
                s.append(&p.expiration);
            }
            Packet::EnrRequest(p) => {
                s.begin_list(1);
                s.append(&p.expiration);
            }
            Packet::EnrResponse(p) => {
                s.begin_list(2);
                s.append(&p.reply_tok);
                s.append(&p.record);
            }
        }
    }

    fn decode_payload(kind: u8, rlp: &Rlp<'_>) -> Result<Self, DecodePacketError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList.into());
        }
        let packet = match kind {
            PING_PACKET => Packet::Ping(Ping {
                version: rlp.val_at(0)?,
                from: rlp.val_at(1)?,
                to: rlp.val_at(2)?,
                expiration: rlp.val_at(3)?,
                enr_seq: rlp.val_at(4).ok(),
            }),
            PONG_PACKET => Packet::Pong(Pong {
                to: rlp.val_at(0)?,
                reply_tok: rlp.val_at(1)?,
                expiration: rlp.val_at(2)?,
                enr_seq: rlp.val_at(3).ok(),
            }),
            FINDNODE_PACKET => Packet::Findnode(Findnode {
                target: rlp.val_at(0)?,
                expiration: rlp.val_at(1)?,
            }),
            NEIGHBORS_PACKET => Packet::Neighbors(Neighbors {
                nodes: rlp.list_at(0)?,
                expiration: rlp.val_at(1)?,
            }),
            ENR_REQUEST_PACKET => Packet::EnrRequest(EnrRequest {
                expiration: rlp.val_at(0)?,
            }),
            ENR_RESPONSE_PACKET => Packet::EnrResponse(EnrResponse {
                reply_tok: rlp.val_at(0)?,
                record: rlp.val_at(1)?,
            }),
            unknown => return Err(DecodePacketError::UnknownPacket(unknown)),
        };
        Ok(packet)
    }
}

/// Signs and serializes a packet. Returns the datagram and its hash; the
/// hash doubles as the reply token the receiver echoes back.
pub fn encode(key: &SigningKey, packet: &Packet) -> Result<(Vec<u8>, [u8; 32]), RequestError> {
    let mut payload = RlpStream::new();
    packet.append_payload(&mut payload);
    let payload = payload.out().to_vec();

    let mut signed = Vec::with_capacity(1 + payload.len());
    signed.push(packet.kind());
    signed.extend_from_slice(&payload);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&keccak256(&signed))
        .map_err(|e| RequestError::Encode(e.to_string()))?;

    let mut datagram = Vec::with_capacity(HEAD_SIZE + signed.len());
    datagram.extend_from_slice(&[0u8; HASH_SIZE]);
    datagram.extend_from_slice(&signature.to_bytes());
    datagram.push(recovery_id.to_byte());
    datagram.extend_from_slice(&signed);

    let hash = keccak256(&datagram[HASH_SIZE..]);
    datagram[..HASH_SIZE].copy_from_slice(&hash);
    Ok((datagram, hash))
}

/// Decodes and authenticates a raw datagram, recovering the sender's public
/// key from the signature.
pub fn decode(buf: &[u8]) -> Result<(Packet, Pubkey, [u8; 32]), DecodePacketError> {
    if buf.len() < HEAD_SIZE + 1 {
        return Err(DecodePacketError::TooSmall);
    }
    let hash = keccak256(&buf[HASH_SIZE..]);
    if hash[..] != buf[..HASH_SIZE] {
        return Err(DecodePacketError::HashMismatch);
    }

    let signature = Signature::from_slice(&buf[HASH_SIZE..HASH_SIZE + 64])
        .map_err(|_| DecodePacketError::InvalidSignature)?;
    let recovery_id =
        RecoveryId::from_byte(buf[HASH_SIZE + 64]).ok_or(DecodePacketError::InvalidSignature)?;
    let digest = keccak256(&buf[HEAD_SIZE..]);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|_| DecodePacketError::InvalidSignature)?;

    let kind = buf[HEAD_SIZE];
    let rlp = Rlp::new(&buf[HEAD_SIZE + 1..]);
    let packet = Packet::decode_payload(kind, &rlp)?;
    Ok((packet, Pubkey::from_verifying_key(&key), hash))
}
