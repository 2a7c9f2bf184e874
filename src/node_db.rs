//! The node database seam.
//!
//! The discovery engine does not own a persistence schema; it reads and
//! writes a handful of keys per (node ID, IP) pair through this trait. The
//! in-memory implementation backs tests and deployments that do not need
//! endpoint proofs to survive a restart.

use crate::node::NodeRecord;
use enr::NodeId;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, SystemTime},
};

/// Persisted per-peer discovery state.
///
/// Implementations must be safe for concurrent use; reads for absent keys
/// return `None` (respectively zero for counters).
pub trait NodeDatabase: Send + Sync {
    /// When the last valid ping from this peer was received.
    fn last_ping_received(&self, id: NodeId, ip: IpAddr) -> Option<SystemTime>;
    fn update_last_ping_received(&self, id: NodeId, ip: IpAddr, at: SystemTime);

    /// When the last pong proving this peer's endpoint was received.
    fn last_pong_received(&self, id: NodeId, ip: IpAddr) -> Option<SystemTime>;
    fn update_last_pong_received(&self, id: NodeId, ip: IpAddr, at: SystemTime);

    /// The number of consecutive findnode failures for this peer.
    fn find_fails(&self, id: NodeId, ip: IpAddr) -> u32;
    fn update_find_fails(&self, id: NodeId, ip: IpAddr, fails: u32);

    /// Stores a node record for later seeding.
    fn update_node(&self, record: &NodeRecord);

    /// Returns up to `count` stored nodes whose endpoint proof is younger
    /// than `max_age`, used to seed the routing table on startup.
    fn seed_nodes(&self, count: usize, max_age: Duration) -> Vec<NodeRecord>;
}

#[derive(Default)]
struct PeerState {
    last_ping_received: Option<SystemTime>,
    last_pong_received: Option<SystemTime>,
    find_fails: u32,
}

/// A [`NodeDatabase`] held entirely in memory.
#[derive(Default)]
pub struct InMemoryNodeDb {
    peers: RwLock<HashMap<(NodeId, IpAddr), PeerState>>,
    records: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl InMemoryNodeDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeDatabase for InMemoryNodeDb {
    fn last_ping_received(&self, id: NodeId, ip: IpAddr) -> Option<SystemTime> {
        self.peers
            .read()
            .get(&(id, ip))
            .and_then(|peer| peer.last_ping_received)
    }

    fn update_last_ping_received(&self, id: NodeId, ip: IpAddr, at: SystemTime) {
        self.peers
            .write()
            .entry((id, ip))
            .or_default()
            .last_ping_received = Some(at);
    }

    fn last_pong_received(&self, id: NodeId, ip: IpAddr) -> Option<SystemTime> {
        self.peers
            .read()
            .get(&(id, ip))
            .and_then(|peer| peer.last_pong_received)
    }

    fn update_last_pong_received(&self, id: NodeId, ip: IpAddr, at: SystemTime) {
        self.peers
            .write()
            .entry((id, ip))
            .or_default()
            .last_pong_received = Some(at);
    }

    fn find_fails(&self, id: NodeId, ip: IpAddr) -> u32 {
        self.peers
            .read()
            .get(&(id, ip))
            .map(|peer| peer.find_fails)
            .unwrap_or(0)
    }

    fn update_find_fails(&self, id: NodeId, ip: IpAddr, fails: u32) {
        self.peers.write().entry((id, ip)).or_default().find_fails = fails;
    }

    fn update_node(&self, record: &NodeRecord) {
        self.records.write().insert(record.id, record.clone());
    }

    fn seed_nodes(&self, count: usize, max_age: Duration) -> Vec<NodeRecord> {
        let peers = self.peers.read();
        let now = SystemTime::now();
        self.records
            .read()
            .values()
            .filter(|record| {
                peers
                    .get(&(record.id, record.ip))
                    .and_then(|peer| peer.last_pong_received)
                    .map(|at| now.duration_since(at).unwrap_or_default() < max_age)
                    .unwrap_or(false)
            })
            .take(count)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Pubkey;
    use enr::k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn record() -> NodeRecord {
        let key = Pubkey::from_signing_key(&SigningKey::random(&mut OsRng));
        NodeRecord::new(key, "10.0.0.9".parse().unwrap(), 30303, 0)
    }

    #[test]
    fn absent_keys_read_zero() {
        let db = InMemoryNodeDb::new();
        let n = record();
        assert_eq!(db.last_ping_received(n.id, n.ip), None);
        assert_eq!(db.last_pong_received(n.id, n.ip), None);
        assert_eq!(db.find_fails(n.id, n.ip), 0);
    }

    #[test]
    fn timestamps_and_fails_round_trip() {
        let db = InMemoryNodeDb::new();
        let n = record();
        let now = SystemTime::now();
        db.update_last_ping_received(n.id, n.ip, now);
        db.update_last_pong_received(n.id, n.ip, now);
        db.update_find_fails(n.id, n.ip, 3);
        assert_eq!(db.last_ping_received(n.id, n.ip), Some(now));
        assert_eq!(db.last_pong_received(n.id, n.ip), Some(now));
        assert_eq!(db.find_fails(n.id, n.ip), 3);
    }

    #[test]
    fn seeds_require_recent_pong() {
        let db = InMemoryNodeDb::new();
        let fresh = record();
        let stale = record();
        db.update_node(&fresh);
        db.update_node(&stale);
        db.update_last_pong_received(fresh.id, fresh.ip, SystemTime::now());
        db.update_last_pong_received(
            stale.id,
            stale.ip,
            SystemTime::now() - Duration::from_secs(7 * 24 * 3600),
        );

        let seeds = db.seed_nodes(10, Duration::from_secs(5 * 24 * 3600));
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, fresh.id);
    }
}
