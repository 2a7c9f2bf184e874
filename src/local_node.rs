//! The local node: signing key, self record and endpoint prediction.

use crate::{
    error::Discv4Error,
    node::NodeRecord,
    node_db::NodeDatabase,
    wire::Pubkey,
    Enr,
};
use enr::{k256::ecdsa::SigningKey, EnrBuilder, NodeId};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::info;

/// How long an endpoint statement or an outbound contact stays relevant.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// The minimum number of agreeing statements before the predicted endpoint
/// replaces the one in our record.
const MIN_STATEMENTS: usize = 10;

/// Statements about our external endpoint, reported by peers we contacted.
///
/// Statements from hosts we never pinged are ignored, which stops a single
/// peer from steering our advertised endpoint with fabricated traffic.
struct EndpointPredictor {
    contacted: HashMap<IpAddr, Instant>,
    votes: HashMap<SocketAddr, (SocketAddr, Instant)>,
    min_statements: usize,
}

impl EndpointPredictor {
    fn new(min_statements: usize) -> Self {
        EndpointPredictor {
            contacted: HashMap::new(),
            votes: HashMap::new(),
            min_statements,
        }
    }

    fn note_contact(&mut self, addr: SocketAddr) {
        self.contacted.insert(addr.ip(), Instant::now());
        self.contacted
            .retain(|_, at| at.elapsed() < STATEMENT_TIMEOUT);
    }

    fn add_statement(&mut self, from: SocketAddr, stated: SocketAddr) {
        if !self.contacted.contains_key(&from.ip()) {
            return;
        }
        self.votes.insert(from, (stated, Instant::now()));
    }

    /// The majority endpoint, if enough fresh statements agree.
    fn predict(&mut self) -> Option<SocketAddr> {
        self.votes
            .retain(|_, (_, at)| at.elapsed() < STATEMENT_TIMEOUT);

        let mut counts: FnvHashMap<SocketAddr, usize> = FnvHashMap::default();
        for (stated, _) in self.votes.values() {
            *counts.entry(*stated).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .filter(|(_, votes)| *votes >= self.min_statements)
            .max_by_key(|(_, votes)| *votes)
            .map(|(stated, _)| stated)
    }
}

/// Process-wide owner of the local private key and the current self record.
pub struct LocalNode {
    key: SigningKey,
    id: NodeId,
    enr: RwLock<Enr>,
    db: Arc<dyn NodeDatabase>,
    listen_port: u16,
    predictor: Mutex<EndpointPredictor>,
}

impl LocalNode {
    pub fn new(
        key: SigningKey,
        listen_addr: SocketAddr,
        db: Arc<dyn NodeDatabase>,
    ) -> Result<Self, Discv4Error> {
        let mut builder = EnrBuilder::new("v4");
        if !listen_addr.ip().is_unspecified() {
            builder.ip(listen_addr.ip());
        }
        match listen_addr {
            SocketAddr::V4(_) => builder.udp4(listen_addr.port()),
            SocketAddr::V6(_) => builder.udp6(listen_addr.port()),
        };
        let enr = builder
            .build(&key)
            .map_err(|e| Discv4Error::LocalRecord(format!("{e:?}")))?;
        let id = enr.node_id();
        Ok(LocalNode {
            key,
            id,
            enr: RwLock::new(enr),
            db,
            listen_port: listen_addr.port(),
            predictor: Mutex::new(EndpointPredictor::new(MIN_STATEMENTS)),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_min_statements(self, min_statements: usize) -> Self {
        *self.predictor.lock() = EndpointPredictor::new(min_statements);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// The current signed self record.
    pub fn record(&self) -> Enr {
        self.enr.read().clone()
    }

    pub fn seq(&self) -> u64 {
        self.enr.read().seq()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    pub fn database(&self) -> Arc<dyn NodeDatabase> {
        self.db.clone()
    }

    /// The local node as seen by peers.
    pub fn node_record(&self) -> NodeRecord {
        let enr = self.enr.read();
        let ip = enr
            .ip4()
            .map(IpAddr::V4)
            .or_else(|| enr.ip6().map(IpAddr::V6))
            .unwrap_or_else(|| IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let udp_port = enr.udp4().or(enr.udp6()).unwrap_or(self.listen_port);
        let tcp_port = enr.tcp4().or(enr.tcp6()).unwrap_or(0);
        NodeRecord {
            id: self.id,
            key: Pubkey::from_signing_key(&self.key),
            ip,
            udp_port,
            tcp_port,
            seq: enr.seq(),
            enr: Some(enr.clone()),
        }
    }

    /// Notes that we are about to send a packet to `addr`. Only hosts we
    /// contacted may influence endpoint prediction.
    pub fn udp_contact(&self, addr: SocketAddr) {
        self.predictor.lock().note_contact(addr);
    }

    /// Records a peer's statement of our external endpoint and updates the
    /// self record when a fresh majority emerges.
    pub fn udp_endpoint_statement(&self, observed_from: SocketAddr, stated: SocketAddr) {
        let prediction = {
            let mut predictor = self.predictor.lock();
            predictor.add_statement(observed_from, stated);
            predictor.predict()
        };
        let Some(endpoint) = prediction else {
            return;
        };
        if endpoint.ip().is_unspecified() || endpoint.port() == 0 {
            return;
        }

        let mut enr = self.enr.write();
        let current_udp = match endpoint {
            SocketAddr::V4(_) => enr.udp4_socket().map(SocketAddr::V4),
            SocketAddr::V6(_) => enr.udp6_socket().map(SocketAddr::V6),
        };
        if current_udp == Some(endpoint) {
            return;
        }
        if enr.set_udp_socket(endpoint, &self.key).is_ok() {
            info!(%endpoint, seq = enr.seq(), "Updated local endpoint");
        }
    }
}
