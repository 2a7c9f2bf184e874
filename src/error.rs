use derive_more::Display;
use rlp::DecoderError;

/// An error decoding a raw discovery datagram.
///
/// The variants are deliberately distinct so that malformed traffic can be
/// classified: truncated input, an integrity failure, a signature failure,
/// an unknown packet type and RLP-level failures all surface differently.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum DecodePacketError {
    /// The datagram is smaller than the fixed packet header.
    #[display(fmt = "packet too small")]
    TooSmall,
    /// The leading hash does not match the rest of the datagram.
    #[display(fmt = "bad hash")]
    HashMismatch,
    /// The signature did not yield a valid secp256k1 public key.
    #[display(fmt = "invalid signature")]
    InvalidSignature,
    /// The packet type byte is not one of the six known kinds.
    #[display(fmt = "unknown packet type: {}", _0)]
    UnknownPacket(u8),
    /// The payload is not well-formed RLP for the declared packet kind.
    #[display(fmt = "bad rlp: {:?}", _0)]
    Rlp(DecoderError),
}

impl From<DecoderError> for DecodePacketError {
    fn from(err: DecoderError) -> Self {
        DecodePacketError::Rlp(err)
    }
}

/// An error returned for a caller-initiated request.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum RequestError {
    /// No matching reply arrived before the deadline.
    #[display(fmt = "RPC timeout")]
    Timeout,
    /// The request deadline was found too far in the future, which happens
    /// when the system clock jumps backwards after the deadline was set.
    #[display(fmt = "reply deadline too far in the future")]
    ClockWarp,
    /// The transport was shut down before the request completed.
    #[display(fmt = "socket closed")]
    Closed,
    /// A reply arrived but its contents failed validation.
    #[display(fmt = "invalid response: {}", _0)]
    InvalidResponse(String),
    /// The outgoing packet could not be encoded or signed.
    #[display(fmt = "packet encoding failed: {}", _0)]
    Encode(String),
}

/// The reasons an inbound packet is rejected before being handled.
///
/// These feed the string-keyed error counters exposed by
/// [`Discv4::errors`](crate::Discv4::errors), so the `Display` strings are
/// part of the observable surface.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum InboundError {
    /// The packet's expiration timestamp lies in the past.
    #[display(fmt = "expired")]
    Expired,
    /// A reply packet arrived with no outstanding request matching it.
    #[display(fmt = "unsolicited reply")]
    UnsolicitedReply,
    /// The sender has no recent endpoint proof; request packets from it are
    /// dropped to avoid being used for traffic amplification.
    #[display(fmt = "unknown node")]
    UnknownNode,
}

/// The reasons a node learned over the wire is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum NodeValidationError {
    /// The advertised UDP port is in the well-known range.
    #[display(fmt = "low port")]
    LowPort,
    /// The node's IP is not acceptable relative to the peer that relayed it.
    #[display(fmt = "{}", _0)]
    RelayIp(RelayIpError),
    /// The node's IP is outside the configured netrestrict whitelist.
    #[display(fmt = "not contained in netrestrict whitelist")]
    NotWhitelisted,
    /// The advertised node ID is not a valid secp256k1 public key.
    #[display(fmt = "invalid public key")]
    InvalidPublicKey,
    /// The node has no IP or no UDP port.
    #[display(fmt = "incomplete node")]
    Incomplete,
}

impl From<RelayIpError> for NodeValidationError {
    fn from(err: RelayIpError) -> Self {
        NodeValidationError::RelayIp(err)
    }
}

/// Violations of the relay-IP rule: a node's address must be routable from
/// the perspective of the peer that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RelayIpError {
    #[display(fmt = "unspecified IP")]
    Unspecified,
    #[display(fmt = "special-purpose IP")]
    Special,
    #[display(fmt = "loopback node relayed by non-loopback host")]
    LoopbackRelayed,
    #[display(fmt = "LAN node relayed by internet host")]
    LanRelayed,
}

/// Errors constructing the transport.
#[derive(Debug, Display)]
pub enum Discv4Error {
    /// Binding or configuring the UDP socket failed.
    #[display(fmt = "io error: {}", _0)]
    Io(std::io::Error),
    /// The local node record could not be built or signed.
    #[display(fmt = "invalid local record: {}", _0)]
    LocalRecord(String),
}

impl From<std::io::Error> for Discv4Error {
    fn from(err: std::io::Error) -> Self {
        Discv4Error::Io(err)
    }
}
