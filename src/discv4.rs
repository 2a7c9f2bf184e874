//! The application-level handle to the discovery v4 transport.

use crate::{
    config::Discv4Config,
    error::{Discv4Error, RequestError},
    local_node::LocalNode,
    lookup::LookupIterator,
    metrics::{Metrics, METRICS},
    node::NodeRecord,
    node_db::InMemoryNodeDb,
    pending::ReplyRegistry,
    service::Service,
    socket::{RecvHandler, SendHandler},
    wire::Pubkey,
    Enr,
};
use enr::{k256::ecdsa::SigningKey, NodeId};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
};
use tracing::debug;

/// Sized to absorb the request fan-out of a full recursive lookup.
const INGRESS_BUFFER: usize = 1024;
const EGRESS_BUFFER: usize = 1024;
const LOOKUP_KEY_BUFFER: usize = 64;

/// The UDP discovery v4 transport.
///
/// [`Discv4::spawn`] binds the socket and starts the background tasks (the
/// socket read/write pair, the reply dispatcher, the packet handler and the
/// table maintenance loops). Request methods may be called from any task;
/// [`Discv4::shutdown`] stops everything and fails outstanding requests
/// with [`RequestError::Closed`].
pub struct Discv4 {
    service: Arc<Service>,
    local_addr: SocketAddr,
    exits: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Discv4 {
    /// Binds `listen_addr` and starts the discovery service.
    pub async fn spawn(
        key: SigningKey,
        listen_addr: SocketAddr,
        config: Discv4Config,
    ) -> Result<Discv4, Discv4Error> {
        let socket = UdpSocket::bind(listen_addr).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let db = config
            .node_db
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryNodeDb::new()));
        let local_node = Arc::new(LocalNode::new(key, local_addr, db)?);

        let (registry, registry_exit) = ReplyRegistry::spawn(
            config.reply_timeout,
            config.clock(),
            config.on_clock_drift.clone(),
        );

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_BUFFER);
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_BUFFER);
        let (lookup_keys_tx, lookup_keys_rx) = mpsc::channel(LOOKUP_KEY_BUFFER);

        let recv_exit = RecvHandler::spawn(socket.clone(), ingress_tx);
        let send_exit = SendHandler::spawn(socket, egress_rx);

        let lookup_workers = config.lookup_workers;
        let service = Service::new(local_node, registry, egress_tx, lookup_keys_tx, config);
        service.seed_table();

        let (read_exit, read_exit_rx) = oneshot::channel();
        tokio::spawn(service.clone().run_read(ingress_rx, read_exit_rx));

        let (maintenance_exit, maintenance_exit_rx) = oneshot::channel();
        tokio::spawn(service.clone().run_maintenance(maintenance_exit_rx));

        let lookup_keys_rx = Arc::new(tokio::sync::Mutex::new(lookup_keys_rx));
        for _ in 0..lookup_workers {
            tokio::spawn(service.clone().run_lookup_worker(lookup_keys_rx.clone()));
        }

        debug!(addr = %local_addr, id = %service.local_node.node_id(), "Discovery v4 listening");
        Ok(Discv4 {
            service,
            local_addr,
            exits: Mutex::new(vec![
                read_exit,
                maintenance_exit,
                registry_exit,
                recv_exit,
                send_exit,
            ]),
        })
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_id(&self) -> NodeId {
        self.service.local_node.node_id()
    }

    /// The current signed self record.
    pub fn self_enr(&self) -> Enr {
        self.service.local_node.record()
    }

    /// The local node as advertised to peers.
    pub fn self_node(&self) -> NodeRecord {
        self.service.local_node.node_record()
    }

    /// Sends a ping and waits for the pong. Returns the peer's record
    /// sequence number.
    pub async fn ping(&self, node: &NodeRecord) -> Result<u64, RequestError> {
        self.service.ping(node).await
    }

    /// Asks `node` for its neighbors closest to `target`. Returns up to
    /// the bucket size of validated nodes.
    pub async fn find_node(
        &self,
        node: &NodeRecord,
        target: Pubkey,
    ) -> Result<Vec<NodeRecord>, RequestError> {
        self.service.find_node(node, target).await
    }

    /// Fetches and verifies the peer's signed record.
    pub async fn request_enr(&self, node: &NodeRecord) -> Result<NodeRecord, RequestError> {
        self.service.request_enr(node).await
    }

    /// Searches for the most recent version of a node record. Returns the
    /// input unchanged if nothing better can be found.
    pub async fn resolve(&self, node: &NodeRecord) -> NodeRecord {
        self.service.resolve(node).await
    }

    /// Iterative lookup of the nodes closest to the given public key.
    pub async fn lookup_pubkey(&self, key: Pubkey) -> Vec<NodeRecord> {
        self.service.lookup(key).await
    }

    /// An iterator yielding nodes from repeated random walks of the DHT.
    pub fn random_nodes(&self) -> LookupIterator {
        self.service.random_walk_iterator()
    }

    /// The number of nodes currently in the routing table.
    pub fn table_len(&self) -> usize {
        self.service.table.lock().len()
    }

    /// All nodes currently in the routing table.
    pub fn table_nodes(&self) -> Vec<NodeRecord> {
        self.service.table.lock().nodes()
    }

    /// Counters of rejected inbound packets, keyed by rejection reason.
    pub fn errors(&self) -> HashMap<String, u64> {
        self.service.errors()
    }

    /// The number of nodes cached from unsolicited packets.
    pub fn len_unsolicited(&self) -> usize {
        self.service.len_unsolicited()
    }

    /// A snapshot of the server metrics.
    pub fn metrics(&self) -> Metrics {
        Metrics::from(&METRICS)
    }

    /// Stops all background tasks and closes the socket. Outstanding
    /// requests fail with [`RequestError::Closed`]; repeated calls are
    /// no-ops.
    pub fn shutdown(&self) {
        let exits = std::mem::take(&mut *self.exits.lock());
        if exits.is_empty() {
            return;
        }
        debug!("Discovery v4 shutting down");
        self.service.closed.store(true, Ordering::Release);
        self.service.close_lookup_feed();
        for exit in exits {
            let _ = exit.send(());
        }
    }
}

impl Drop for Discv4 {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use std::time::Duration;

    fn init_log() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    async fn build_node(config: Discv4Config) -> Discv4 {
        let key = SigningKey::random(&mut OsRng);
        Discv4::spawn(key, "127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap()
    }

    fn fast_config() -> Discv4Config {
        let mut builder = Discv4Config::builder();
        builder
            .reply_timeout(Duration::from_millis(300))
            .revalidate_interval(Duration::from_millis(100));
        builder.build()
    }

    #[tokio::test]
    async fn ping_between_two_nodes() {
        init_log();
        let a = build_node(fast_config()).await;
        let b = build_node(fast_config()).await;

        let seq = a.ping(&b.self_node()).await.unwrap();
        assert_eq!(seq, b.self_enr().seq());

        // The pong left an endpoint proof on a's side.
        let b_node = b.self_node();
        assert!(a
            .service
            .db
            .last_pong_received(b_node.id, b_node.ip)
            .is_some());

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn nodes_discover_each_other_via_bootstrap() {
        init_log();
        let bootstrap = build_node(fast_config()).await;

        let mut config = fast_config();
        config.bootnodes = vec![bootstrap.self_node()];
        let a = build_node(config.clone()).await;
        let b = build_node(config).await;

        // Both nodes bootstrap through the same seed; eventually a lookup
        // from a must surface b.
        let target = b.self_node().key;
        let mut found = false;
        for _ in 0..100 {
            let nodes = a.lookup_pubkey(target).await;
            if nodes.iter().any(|n| n.id == b.node_id()) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(found, "b never surfaced in a's lookups");

        bootstrap.shutdown();
        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn shutdown_fails_requests_with_closed() {
        init_log();
        let a = build_node(fast_config()).await;
        let blackhole = {
            // A peer record nobody answers for.
            let key = SigningKey::random(&mut OsRng);
            NodeRecord::new(
                Pubkey::from_signing_key(&key),
                "127.0.0.1".parse().unwrap(),
                9,
                0,
            )
        };

        a.shutdown();
        assert_eq!(
            a.ping(&blackhole).await.unwrap_err(),
            RequestError::Closed
        );
        // Idempotent.
        a.shutdown();
    }
}
