//! Endpoint-proof (bond) bookkeeping.
//!
//! A peer is bonded when it has answered one of our pings recently enough.
//! Request packets (Findnode, ENRRequest) from unbonded peers are dropped:
//! answering them would let an attacker with a spoofed source address use
//! the protocol as a traffic amplifier.

use crate::node_db::NodeDatabase;
use enr::NodeId;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

pub(crate) struct BondTracker {
    db: Arc<dyn NodeDatabase>,
    bond_expiration: Duration,
    max_find_failures: u32,
}

impl BondTracker {
    pub fn new(
        db: Arc<dyn NodeDatabase>,
        bond_expiration: Duration,
        max_find_failures: u32,
    ) -> Self {
        BondTracker {
            db,
            bond_expiration,
            max_find_failures,
        }
    }

    fn since(at: Option<SystemTime>) -> Duration {
        at.and_then(|at| SystemTime::now().duration_since(at).ok())
            .unwrap_or(Duration::MAX)
    }

    /// Whether the peer has a recent enough endpoint proof for us to answer
    /// its requests.
    pub fn has_bond(&self, id: NodeId, ip: IpAddr) -> bool {
        Self::since(self.db.last_pong_received(id, ip)) < self.bond_expiration
    }

    /// Whether we should ping the peer before sending it a request, so a
    /// valid endpoint proof exists on the remote end.
    pub fn needs_ping(&self, id: NodeId, ip: IpAddr) -> bool {
        Self::since(self.db.last_ping_received(id, ip)) > self.bond_expiration
            || self.db.find_fails(id, ip) > self.max_find_failures
    }

    pub fn note_ping_received(&self, id: NodeId, ip: IpAddr) {
        self.db.update_last_ping_received(id, ip, SystemTime::now());
    }

    pub fn note_pong_received(&self, id: NodeId, ip: IpAddr) {
        self.db.update_last_pong_received(id, ip, SystemTime::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{node_db::InMemoryNodeDb, wire::Pubkey};
    use enr::k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn tracker(db: Arc<InMemoryNodeDb>) -> BondTracker {
        BondTracker::new(db, Duration::from_secs(24 * 3600), 5)
    }

    fn peer() -> (NodeId, IpAddr) {
        let key = Pubkey::from_signing_key(&SigningKey::random(&mut OsRng));
        (key.id(), "10.0.0.1".parse().unwrap())
    }

    #[test]
    fn bond_requires_recent_pong() {
        let db = Arc::new(InMemoryNodeDb::new());
        let bonds = tracker(db.clone());
        let (id, ip) = peer();

        assert!(!bonds.has_bond(id, ip));
        bonds.note_pong_received(id, ip);
        assert!(bonds.has_bond(id, ip));

        db.update_last_pong_received(id, ip, SystemTime::now() - Duration::from_secs(25 * 3600));
        assert!(!bonds.has_bond(id, ip));
    }

    #[test]
    fn ping_needed_when_stale_or_failing() {
        let db = Arc::new(InMemoryNodeDb::new());
        let bonds = tracker(db.clone());
        let (id, ip) = peer();

        assert!(bonds.needs_ping(id, ip));
        bonds.note_ping_received(id, ip);
        assert!(!bonds.needs_ping(id, ip));

        db.update_find_fails(id, ip, 6);
        assert!(bonds.needs_ping(id, ip));
        db.update_find_fails(id, ip, 5);
        assert!(!bonds.needs_ping(id, ip));
    }
}
