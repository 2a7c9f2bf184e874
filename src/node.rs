//! Node records and XOR-distance ordering over node IDs.

use crate::{
    error::NodeValidationError,
    wire::{self, Pubkey},
    Enr,
};
use enr::NodeId;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

/// A discovered node: identity plus last known endpoint.
///
/// Two records are the same node iff their IDs are equal. `seq` carries the
/// sequence number of the node's signed record, if one is known; `enr` holds
/// the record itself when it has been fetched and verified.
#[derive(Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub key: Pubkey,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub seq: u64,
    pub enr: Option<Enr>,
}

impl NodeRecord {
    /// A record built from an endpoint observation, with no signed record
    /// attached yet.
    pub fn new(key: Pubkey, ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        NodeRecord {
            id: key.id(),
            key,
            ip,
            udp_port,
            tcp_port,
            seq: 0,
            enr: None,
        }
    }

    /// Extracts identity and endpoint from a verified ENR.
    pub fn from_enr(enr: &Enr) -> Result<Self, NodeValidationError> {
        let key = Pubkey::from_verifying_key(&enr.public_key());
        let ip = enr
            .ip4()
            .map(IpAddr::V4)
            .or_else(|| enr.ip6().map(IpAddr::V6))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let udp_port = enr.udp4().or(enr.udp6()).unwrap_or(0);
        let tcp_port = enr.tcp4().or(enr.tcp6()).unwrap_or(0);
        let record = NodeRecord {
            id: key.id(),
            key,
            ip,
            udp_port,
            tcp_port,
            seq: enr.seq(),
            enr: Some(enr.clone()),
        };
        record.validate_complete()?;
        Ok(record)
    }

    /// A node is complete iff it has an IP and a UDP port to contact it on.
    pub fn validate_complete(&self) -> Result<(), NodeValidationError> {
        if self.ip.is_unspecified() || self.udp_port == 0 {
            return Err(NodeValidationError::Incomplete);
        }
        Ok(())
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// The wire representation used inside Neighbors packets.
    pub(crate) fn to_rpc(&self) -> wire::Node {
        wire::Node {
            ip: self.ip,
            udp_port: self.udp_port,
            tcp_port: self.tcp_port,
            id: self.key,
        }
    }
}

impl PartialEq for NodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeRecord {}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("id", &self.id)
            .field("udp", &self.udp_addr())
            .field("tcp_port", &self.tcp_port)
            .field("seq", &self.seq)
            .finish()
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node: {}, addr: {}", self.id, self.udp_addr())
    }
}

/// The XOR distance between two IDs.
pub(crate) fn distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let (a, b) = (a.raw(), b.raw());
    let mut xor = [0u8; 32];
    for (i, byte) in xor.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    xor
}

/// Compares the distances `target <-> a` and `target <-> b`.
pub(crate) fn distance_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> std::cmp::Ordering {
    distance(target, a).cmp(&distance(target, b))
}

/// The length of the common ID prefix, i.e. the number of leading zero bits
/// of the XOR distance. `None` for identical IDs.
pub(crate) fn common_prefix_len(a: &NodeId, b: &NodeId) -> Option<usize> {
    let xor = distance(a, b);
    let mut prefix = 0;
    for byte in xor {
        if byte == 0 {
            prefix += 8;
        } else {
            return Some(prefix + byte.leading_zeros() as usize);
        }
    }
    None
}

/// A bounded list of the nodes closest to a target, farthest entry evicted
/// first.
pub(crate) struct NodesByDistance {
    pub target: NodeId,
    pub entries: Vec<NodeRecord>,
    max_elems: usize,
}

impl NodesByDistance {
    pub fn new(target: NodeId, max_elems: usize) -> Self {
        NodesByDistance {
            target,
            entries: Vec::with_capacity(max_elems),
            max_elems,
        }
    }

    /// Inserts `record` keeping the list sorted by distance to the target.
    /// Nodes farther than the current maximum are dropped once the list is
    /// full.
    pub fn push(&mut self, record: NodeRecord) {
        if self.entries.iter().any(|n| n.id == record.id) {
            return;
        }
        let pos = self
            .entries
            .binary_search_by(|probe| distance_cmp(&self.target, &probe.id, &record.id))
            .unwrap_or_else(|pos| pos);
        if pos >= self.max_elems {
            return;
        }
        self.entries.insert(pos, record);
        self.entries.truncate(self.max_elems);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enr::k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn random_record() -> NodeRecord {
        let key = Pubkey::from_signing_key(&SigningKey::random(&mut OsRng));
        NodeRecord::new(key, "10.0.0.1".parse().unwrap(), 30303, 30303)
    }

    #[test]
    fn completeness() {
        let mut record = random_record();
        assert!(record.validate_complete().is_ok());
        record.udp_port = 0;
        assert_eq!(
            record.validate_complete().unwrap_err(),
            NodeValidationError::Incomplete
        );
        record.udp_port = 30303;
        record.ip = "0.0.0.0".parse().unwrap();
        assert_eq!(
            record.validate_complete().unwrap_err(),
            NodeValidationError::Incomplete
        );
    }

    #[test]
    fn id_derived_from_key() {
        let signing = SigningKey::random(&mut OsRng);
        let key = Pubkey::from_signing_key(&signing);
        let record = NodeRecord::new(key, "10.0.0.1".parse().unwrap(), 30303, 0);
        // Matches the ID the enr crate derives for the same key.
        let enr: Enr = enr::EnrBuilder::new("v4").build(&signing).unwrap();
        assert_eq!(record.id, enr.node_id());
    }

    #[test]
    fn prefix_length() {
        let a = NodeId::new(&[0u8; 32]);
        let mut raw = [0u8; 32];
        raw[0] = 0x80;
        assert_eq!(common_prefix_len(&a, &NodeId::new(&raw)), Some(0));
        raw[0] = 0x01;
        assert_eq!(common_prefix_len(&a, &NodeId::new(&raw)), Some(7));
        let mut raw = [0u8; 32];
        raw[31] = 0x01;
        assert_eq!(common_prefix_len(&a, &NodeId::new(&raw)), Some(255));
        assert_eq!(common_prefix_len(&a, &a), None);
    }

    #[test]
    fn nodes_by_distance_keeps_closest() {
        let target = NodeId::new(&[0u8; 32]);
        let mut list = NodesByDistance::new(target, 4);

        let mut ids = Vec::new();
        for i in 1u8..=8 {
            let mut raw = [0u8; 32];
            raw[0] = i;
            ids.push(NodeId::new(&raw));
        }
        // Insert in reverse so the farthest arrive first.
        for id in ids.iter().rev() {
            let mut record = random_record();
            record.id = *id;
            list.push(record);
        }

        assert_eq!(list.entries.len(), 4);
        let kept: Vec<_> = list.entries.iter().map(|n| n.id).collect();
        assert_eq!(kept, ids[..4].to_vec());
        // Sorted closest first.
        for pair in list.entries.windows(2) {
            assert_eq!(
                distance_cmp(&target, &pair[0].id, &pair[1].id),
                std::cmp::Ordering::Less
            );
        }
    }
}
