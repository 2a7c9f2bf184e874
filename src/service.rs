//! The transport controller.
//!
//! The [`Service`] hosts the inbound packet state machine (preverify then
//! handle, per packet kind), the caller-facing request methods, the table
//! maintenance loops and the diversion of unsolicited replies into caches
//! and background lookups. It communicates with the socket tasks purely
//! over channels and with the reply dispatcher through [`ReplyRegistry`].

use crate::{
    bond::BondTracker,
    config::Discv4Config,
    error::{InboundError, NodeValidationError, RequestError},
    local_node::LocalNode,
    lookup::{Lookup, LookupIterator, QueryFunc},
    metrics::{
        METRICS, SEND_FAIL, UNKNOWN_KEYS_EVICTION, UNSOLICITED_CACHE_EVICTION,
        UNSOLICITED_LOOKUP_DROPPED,
    },
    netutil,
    node::NodeRecord,
    node_db::NodeDatabase,
    pending::{PendingReply, Reply, ReplyMatch, ReplyRegistry},
    socket::{InboundDatagram, OutboundDatagram},
    table::{Table, BUCKET_SIZE, SEED_COUNT, SEED_MAX_AGE},
    wire::{self, Packet, Pubkey},
};
use enr::{k256::ecdsa::SigningKey, NodeId};
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

pub(crate) struct Service {
    pub(crate) local_node: Arc<LocalNode>,
    pub(crate) db: Arc<dyn NodeDatabase>,
    pub(crate) table: Arc<Mutex<Table>>,
    bonds: BondTracker,
    registry: ReplyRegistry,
    egress: mpsc::Sender<OutboundDatagram>,
    pub(crate) config: Discv4Config,
    /// Counters of rejected inbound packets, keyed by rejection reason.
    errors: Mutex<HashMap<String, u64>>,
    /// Nodes referenced by unsolicited packets, kept around to seed future
    /// lookups without trusting the sender.
    unsolicited_nodes: Mutex<LruCache<NodeId, NodeRecord>>,
    /// Sender keys of unsolicited pongs we already scheduled a lookup for.
    unknown_keys: Mutex<LruCache<Pubkey, ()>>,
    /// Feed of the background lookup workers. Dropped on shutdown so the
    /// workers drain and exit.
    lookup_keys: Mutex<Option<mpsc::Sender<Pubkey>>>,
    pub(crate) closed: Arc<AtomicBool>,
    /// Back-reference handed to spawned tasks and lookup closures.
    this: Weak<Service>,
}

impl Service {
    pub(crate) fn new(
        local_node: Arc<LocalNode>,
        registry: ReplyRegistry,
        egress: mpsc::Sender<OutboundDatagram>,
        lookup_keys: mpsc::Sender<Pubkey>,
        config: Discv4Config,
    ) -> Arc<Self> {
        let db = local_node.database();
        let unsolicited_capacity = NonZeroUsize::new(config.unsolicited_cache_size)
            .unwrap_or(NonZeroUsize::new(500).expect("nonzero"));
        let unknown_capacity = NonZeroUsize::new(config.unknown_keys_cache_size)
            .unwrap_or(NonZeroUsize::new(100).expect("nonzero"));
        Arc::new_cyclic(|this| Service {
            bonds: BondTracker::new(
                db.clone(),
                config.bond_expiration,
                config.max_find_failures,
            ),
            table: Arc::new(Mutex::new(Table::new(local_node.node_id()))),
            db,
            local_node,
            registry,
            egress,
            errors: Mutex::new(HashMap::new()),
            unsolicited_nodes: Mutex::new(LruCache::new(unsolicited_capacity)),
            unknown_keys: Mutex::new(LruCache::new(unknown_capacity)),
            lookup_keys: Mutex::new(Some(lookup_keys)),
            config,
            closed: Arc::new(AtomicBool::new(false)),
            this: this.clone(),
        })
    }

    /// A strong handle to this service. Infallible while any caller holds
    /// a reference.
    fn this(&self) -> Arc<Service> {
        self.this.upgrade().expect("service is referenced")
    }

    /// Inserts bootnodes and persisted seeds into the (unverified) table.
    pub(crate) fn seed_table(&self) {
        let local_id = self.local_node.node_id();
        let mut table = self.table.lock();
        for record in self
            .config
            .bootnodes
            .iter()
            .cloned()
            .chain(self.db.seed_nodes(SEED_COUNT, SEED_MAX_AGE))
        {
            if record.id == local_id || record.validate_complete().is_err() {
                continue;
            }
            table.add_seen_node(record);
        }
    }

    pub(crate) fn errors(&self) -> HashMap<String, u64> {
        self.errors.lock().clone()
    }

    /// Drops the worker feed; the lookup workers exit once it drains.
    pub(crate) fn close_lookup_feed(&self) {
        self.lookup_keys.lock().take();
    }

    pub(crate) fn len_unsolicited(&self) -> usize {
        self.unsolicited_nodes.lock().len()
    }

    fn count_error(&self, err: &InboundError) {
        *self.errors.lock().entry(err.to_string()).or_insert(0) += 1;
    }

    fn expiration(&self) -> u64 {
        wire::expiration_in(self.config.request_expiration)
    }

    fn our_endpoint(&self) -> wire::Endpoint {
        let node = self.local_node.node_record();
        wire::Endpoint::new(node.ip, node.udp_port, node.tcp_port)
    }

    /* Inbound path */

    /// Consumes raw datagrams from the socket until the channel closes or
    /// the exit fires.
    pub(crate) async fn run_read(
        self: Arc<Self>,
        mut ingress: mpsc::Receiver<InboundDatagram>,
        mut exit: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut exit => break,
                inbound = ingress.recv() => {
                    let Some(datagram) = inbound else { break };
                    self.handle_datagram(datagram).await;
                }
            }
        }
        debug!("Packet handler shutting down");
    }

    async fn handle_datagram(&self, datagram: InboundDatagram) {
        let InboundDatagram { src, payload } = datagram;
        let (packet, from_key, hash) = match wire::decode(&payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                trace!(addr = %src, %err, "Bad discovery packet");
                self.forward_unhandled(src, payload).await;
                return;
            }
        };
        let from_id = from_key.id();

        let verdict = self.preverify(&packet, src, from_id).await;
        trace!(
            packet = packet.name(),
            id = %from_id,
            addr = %src,
            ok = verdict.is_ok(),
            "<< packet"
        );
        match verdict {
            Ok(()) => self.handle(packet, src, from_id, from_key, hash).await,
            Err(InboundError::UnsolicitedReply) => {
                self.divert_unsolicited(packet, src, from_key).await
            }
            Err(_) => self.forward_unhandled(src, payload).await,
        }
    }

    async fn preverify(
        &self,
        packet: &Packet,
        from: SocketAddr,
        from_id: NodeId,
    ) -> Result<(), InboundError> {
        let verdict = match packet {
            Packet::Ping(ping) => self.verify_expiration(ping.expiration),
            Packet::Pong(pong) => self.verify_pong(pong, from, from_id).await,
            Packet::Findnode(findnode) => self.verify_request(findnode.expiration, from, from_id),
            Packet::Neighbors(neighbors) => {
                self.verify_reply(neighbors.expiration, packet, from, from_id)
                    .await
            }
            Packet::EnrRequest(request) => self.verify_request(request.expiration, from, from_id),
            Packet::EnrResponse(_) => {
                if self
                    .registry
                    .dispatch(from_id, from.ip(), from.port(), packet.clone())
                    .await
                {
                    Ok(())
                } else {
                    Err(InboundError::UnsolicitedReply)
                }
            }
        };
        if let Err(err) = &verdict {
            self.count_error(err);
        }
        verdict
    }

    fn verify_expiration(&self, expiration: u64) -> Result<(), InboundError> {
        if wire::expired(expiration) {
            return Err(InboundError::Expired);
        }
        Ok(())
    }

    /// Findnode and ENRRequest are only answered for bonded peers; anything
    /// else would let spoofed sources turn us into a traffic amplifier.
    fn verify_request(
        &self,
        expiration: u64,
        from: SocketAddr,
        from_id: NodeId,
    ) -> Result<(), InboundError> {
        self.verify_expiration(expiration)?;
        if !self.bonds.has_bond(from_id, from.ip()) {
            return Err(InboundError::UnknownNode);
        }
        Ok(())
    }

    async fn verify_reply(
        &self,
        expiration: u64,
        packet: &Packet,
        from: SocketAddr,
        from_id: NodeId,
    ) -> Result<(), InboundError> {
        self.verify_expiration(expiration)?;
        if !self
            .registry
            .dispatch(from_id, from.ip(), from.port(), packet.clone())
            .await
        {
            return Err(InboundError::UnsolicitedReply);
        }
        Ok(())
    }

    async fn verify_pong(
        &self,
        pong: &wire::Pong,
        from: SocketAddr,
        from_id: NodeId,
    ) -> Result<(), InboundError> {
        self.verify_expiration(pong.expiration)?;
        if !self
            .registry
            .dispatch(from_id, from.ip(), from.port(), Packet::Pong(pong.clone()))
            .await
        {
            return Err(InboundError::UnsolicitedReply);
        }
        self.local_node
            .udp_endpoint_statement(from, pong.to.udp_socket());
        self.bonds.note_pong_received(from_id, from.ip());
        Ok(())
    }

    async fn handle(
        &self,
        packet: Packet,
        from: SocketAddr,
        from_id: NodeId,
        from_key: Pubkey,
        hash: [u8; 32],
    ) {
        match packet {
            Packet::Ping(ping) => self.handle_ping(ping, from, from_id, from_key, hash).await,
            Packet::Findnode(findnode) => self.handle_findnode(findnode, from, from_id).await,
            Packet::EnrRequest(_) => self.handle_enr_request(from, from_id, hash).await,
            // Replies are fully consumed by the matcher dispatch in preverify.
            Packet::Pong(_) | Packet::Neighbors(_) | Packet::EnrResponse(_) => {}
        }
    }

    async fn handle_ping(
        &self,
        ping: wire::Ping,
        from: SocketAddr,
        from_id: NodeId,
        from_key: Pubkey,
        hash: [u8; 32],
    ) {
        let pong = Packet::Pong(wire::Pong {
            to: wire::Endpoint::from_udp_socket(from, ping.from.tcp_port),
            reply_tok: hash.to_vec(),
            expiration: self.expiration(),
            enr_seq: Some(self.local_node.seq()),
        });
        self.send_packet(from, from_id, pong).await;

        // The sender's UDP port is taken from the datagram, not its claimed
        // endpoint.
        let node = NodeRecord::new(from_key, from.ip(), from.port(), ping.from.tcp_port);
        if self.bonds.has_bond(from_id, from.ip()) {
            self.add_verified(node);
        } else {
            // Ping back; the node enters the table once our own endpoint
            // proof for it completes.
            let service = self.this();
            tokio::spawn(async move {
                let handle = service.send_ping(node.id, node.udp_addr()).await;
                if handle.resolve().await.is_ok() {
                    service.add_verified(node);
                }
            });
        }

        self.bonds.note_ping_received(from_id, from.ip());
        self.local_node
            .udp_endpoint_statement(from, ping.to.udp_socket());
    }

    async fn handle_findnode(
        &self,
        findnode: wire::Findnode,
        from: SocketAddr,
        from_id: NodeId,
    ) {
        let target = findnode.target.id();
        let closest = self.table.lock().find_closest(&target, BUCKET_SIZE, true);

        // Send neighbors in chunks with at most MAX_NEIGHBORS per packet to
        // stay below the datagram size limit.
        let mut chunk: Vec<wire::Node> = Vec::with_capacity(wire::MAX_NEIGHBORS);
        let mut sent = false;
        for record in closest {
            if netutil::check_relay_ip(from.ip(), record.ip).is_ok() {
                chunk.push(record.to_rpc());
            }
            if chunk.len() == wire::MAX_NEIGHBORS {
                let neighbors = Packet::Neighbors(wire::Neighbors {
                    nodes: std::mem::take(&mut chunk),
                    expiration: self.expiration(),
                });
                self.send_packet(from, from_id, neighbors).await;
                sent = true;
            }
        }
        if !chunk.is_empty() || !sent {
            let neighbors = Packet::Neighbors(wire::Neighbors {
                nodes: chunk,
                expiration: self.expiration(),
            });
            self.send_packet(from, from_id, neighbors).await;
        }
    }

    async fn handle_enr_request(&self, from: SocketAddr, from_id: NodeId, hash: [u8; 32]) {
        let response = Packet::EnrResponse(wire::EnrResponse {
            reply_tok: hash.to_vec(),
            record: self.local_node.record(),
        });
        self.send_packet(from, from_id, response).await;
    }

    /// Routes a reply with no outstanding matcher: pong sender keys feed the
    /// background lookup workers (once per cache window), neighbors feed the
    /// unsolicited-node cache. Nothing here enters the routing table.
    async fn divert_unsolicited(&self, packet: Packet, src: SocketAddr, from_key: Pubkey) {
        match packet {
            Packet::Pong(_) => {
                let schedule = {
                    let mut keys = self.unknown_keys.lock();
                    if keys.contains(&from_key) {
                        false
                    } else {
                        if keys.len() == keys.cap().get() {
                            METRICS.event(UNKNOWN_KEYS_EVICTION);
                        }
                        keys.push(from_key, ());
                        true
                    }
                };
                if schedule {
                    trace!(addr = %src, "Unsolicited pong, scheduling lookup");
                    let feed = self.lookup_keys.lock();
                    match feed.as_ref().map(|tx| tx.try_send(from_key)) {
                        Some(Ok(())) => {}
                        _ => METRICS.event(UNSOLICITED_LOOKUP_DROPPED),
                    }
                }
            }
            Packet::Neighbors(neighbors) => {
                for raw in neighbors.nodes {
                    match self.node_from_rpc(src, raw) {
                        Ok(record) => self.cache_unsolicited_node(record),
                        Err(err) => {
                            trace!(addr = %src, %err, "Invalid neighbor node received")
                        }
                    }
                }
            }
            other => {
                trace!(packet = other.name(), addr = %src, "Unsolicited packet");
            }
        }
    }

    fn cache_unsolicited_node(&self, record: NodeRecord) {
        let mut cache = self.unsolicited_nodes.lock();
        if cache.len() == cache.cap().get() && !cache.contains(&record.id) {
            METRICS.event(UNSOLICITED_CACHE_EVICTION);
        }
        cache.push(record.id, record);
    }

    async fn forward_unhandled(&self, src: SocketAddr, payload: Vec<u8>) {
        if let Some(sink) = &self.config.unhandled {
            let _ = sink.try_send(InboundDatagram { src, payload });
        }
    }

    /// Validates a node learned over the wire relative to the peer that
    /// reported it.
    fn node_from_rpc(
        &self,
        sender: SocketAddr,
        raw: wire::Node,
    ) -> Result<NodeRecord, NodeValidationError> {
        if raw.udp_port <= 1024 {
            return Err(NodeValidationError::LowPort);
        }
        netutil::check_relay_ip(sender.ip(), raw.ip)?;
        if let Some(netrestrict) = &self.config.netrestrict {
            if !netrestrict.contains(&raw.ip) {
                return Err(NodeValidationError::NotWhitelisted);
            }
        }
        raw.id.verifying_key()?;
        let record = NodeRecord::new(raw.id, raw.ip, raw.udp_port, raw.tcp_port);
        record.validate_complete()?;
        Ok(record)
    }

    fn nodes_from_rpc(&self, sender: SocketAddr, raw: Vec<wire::Node>) -> Vec<NodeRecord> {
        raw.into_iter()
            .filter_map(|node| match self.node_from_rpc(sender, node) {
                Ok(record) => Some(record),
                Err(err) => {
                    trace!(addr = %sender, %err, "Invalid neighbor node received");
                    None
                }
            })
            .collect()
    }

    fn add_verified(&self, record: NodeRecord) {
        self.db.update_node(&record);
        self.table.lock().add_verified_node(record);
    }

    /* Outbound requests */

    async fn write(&self, to: SocketAddr, to_id: NodeId, what: &'static str, payload: Vec<u8>) {
        trace!(packet = what, id = %to_id, addr = %to, ">> packet");
        if self.egress.send(OutboundDatagram { dst: to, payload }).await.is_err() {
            METRICS.event(SEND_FAIL);
        }
    }

    async fn send_packet(&self, to: SocketAddr, to_id: NodeId, packet: Packet) {
        match wire::encode(self.local_node.signing_key(), &packet) {
            Ok((datagram, _)) => self.write(to, to_id, packet.name(), datagram).await,
            Err(err) => warn!(%err, packet = packet.name(), "Failed to encode outgoing packet"),
        }
    }

    /// Sends a ping and registers a matcher for the pong referencing it.
    pub(crate) async fn send_ping(&self, to_id: NodeId, to: SocketAddr) -> PendingReply {
        let ping = Packet::Ping(wire::Ping {
            version: 4,
            from: self.our_endpoint(),
            to: wire::Endpoint::from_udp_socket(to, 0),
            expiration: self.expiration(),
            enr_seq: Some(self.local_node.seq()),
        });
        let (datagram, hash) = match wire::encode(self.local_node.signing_key(), &ping) {
            Ok(encoded) => encoded,
            Err(err) => return PendingReply::failed(err),
        };
        let handle = self
            .registry
            .pending(to_id, to.ip(), to.port(), ReplyMatch::PongOf(hash))
            .await;
        self.local_node.udp_contact(to);
        self.write(to, to_id, ping.name(), datagram).await;
        handle
    }

    /// Round-trip ping. Returns the peer's record sequence number.
    pub(crate) async fn ping(&self, node: &NodeRecord) -> Result<u64, RequestError> {
        match self.send_ping(node.id, node.udp_addr()).await.resolve().await? {
            Reply::Pong(pong) => Ok(pong.enr_seq.unwrap_or(0)),
            _ => Err(RequestError::InvalidResponse("expected pong".into())),
        }
    }

    /// Pings the peer first when our endpoint proof on its side may be
    /// missing or stale, then waits out the configured delay so the peer's
    /// reverse ping/pong can complete.
    pub(crate) async fn ensure_bond(&self, to_id: NodeId, to: SocketAddr) {
        if self.bonds.needs_ping(to_id, to.ip()) {
            let _ = self.send_ping(to_id, to).await.resolve().await;
            if !self.config.ping_back_delay.is_zero() {
                tokio::time::sleep(self.config.ping_back_delay).await;
            }
        }
    }

    /// Sends a findnode and collects up to [`BUCKET_SIZE`] validated
    /// neighbors, which may arrive over several packets.
    pub(crate) async fn find_node(
        &self,
        node: &NodeRecord,
        target: Pubkey,
    ) -> Result<Vec<NodeRecord>, RequestError> {
        self.ensure_bond(node.id, node.udp_addr()).await;
        let handle = self
            .registry
            .pending(
                node.id,
                node.ip,
                node.udp_port,
                ReplyMatch::NeighborsUpTo(BUCKET_SIZE),
            )
            .await;
        let findnode = Packet::Findnode(wire::Findnode {
            target,
            expiration: self.expiration(),
        });
        self.send_packet(node.udp_addr(), node.id, findnode).await;
        match handle.resolve().await? {
            Reply::Neighbors(raw) => Ok(self.nodes_from_rpc(node.udp_addr(), raw)),
            _ => Err(RequestError::InvalidResponse("expected neighbors".into())),
        }
    }

    /// Fetches the peer's signed record and returns it if it is newer than
    /// what we know; an older record yields the input unchanged.
    pub(crate) async fn request_enr(&self, node: &NodeRecord) -> Result<NodeRecord, RequestError> {
        self.ensure_bond(node.id, node.udp_addr()).await;
        let request = Packet::EnrRequest(wire::EnrRequest {
            expiration: self.expiration(),
        });
        let (datagram, hash) = wire::encode(self.local_node.signing_key(), &request)?;
        let handle = self
            .registry
            .pending(
                node.id,
                node.ip,
                node.udp_port,
                ReplyMatch::EnrResponseOf(hash),
            )
            .await;
        self.write(node.udp_addr(), node.id, request.name(), datagram).await;

        let reply = handle.resolve().await?;
        let Reply::EnrResponse(response) = reply else {
            return Err(RequestError::InvalidResponse("expected ENR response".into()));
        };
        // The record signature was verified during packet decoding.
        let record = NodeRecord::from_enr(&response.record)
            .map_err(|err| RequestError::InvalidResponse(err.to_string()))?;
        if record.id != node.id {
            return Err(RequestError::InvalidResponse(
                "record ID does not match queried node".into(),
            ));
        }
        if record.seq < node.seq {
            // Response record is older than what we already have.
            return Ok(node.clone());
        }
        netutil::check_relay_ip(node.ip, record.ip)
            .map_err(|err| RequestError::InvalidResponse(format!("invalid IP in record: {err}")))?;
        Ok(record)
    }

    /// Finds the most recent version of a node: direct record request,
    /// newer table entry, then a network lookup. Never fails; at worst the
    /// input is returned unchanged.
    pub(crate) async fn resolve(&self, node: &NodeRecord) -> NodeRecord {
        // Try asking directly. This works if the node is still responding
        // on the endpoint we have.
        if let Ok(record) = self.request_enr(node).await {
            return record;
        }
        // Check the table; we might have a newer endpoint there.
        let mut best = node.clone();
        let in_table = self.table.lock().get_node(&node.id);
        if let Some(record) = in_table {
            if record.seq > best.seq {
                best = record;
                if let Ok(refreshed) = self.request_enr(&best).await {
                    return refreshed;
                }
            }
        }
        // Otherwise run a network lookup for its key.
        for found in self.lookup(node.key).await {
            if found.id == node.id {
                if let Ok(refreshed) = self.request_enr(&found).await {
                    return refreshed;
                }
            }
        }
        best
    }

    /* Lookups */

    fn query_func(&self, target: Pubkey) -> QueryFunc {
        let service = self.this();
        Arc::new(move |node: NodeRecord| {
            let service = service.clone();
            async move { service.find_node(&node, target).await }.boxed()
        })
    }

    async fn run_lookup(&self, target: Pubkey) -> Vec<NodeRecord> {
        Lookup::new(
            target.id(),
            self.table.clone(),
            self.db.clone(),
            self.config.max_find_failures,
            self.query_func(target),
        )
        .run()
        .await
    }

    /// Finds the nodes closest to the given key.
    pub(crate) async fn lookup(&self, target: Pubkey) -> Vec<NodeRecord> {
        if self.table.lock().is_empty() {
            // All nodes were dropped, or this is the very first query:
            // run the bootstrapping logic.
            self.refresh().await;
        }
        self.run_lookup(target).await
    }

    pub(crate) async fn lookup_self(&self) -> Vec<NodeRecord> {
        self.run_lookup(Pubkey::from_signing_key(self.local_node.signing_key()))
            .await
    }

    fn random_target(&self) -> Pubkey {
        match &self.config.key_generator {
            Some(generator) => Pubkey::from_signing_key(&generator()),
            None => Pubkey::from_signing_key(&SigningKey::random(&mut OsRng)),
        }
    }

    pub(crate) async fn lookup_random(&self) -> Vec<NodeRecord> {
        let target = self.random_target();
        self.run_lookup(target).await
    }

    async fn refresh(&self) {
        self.seed_table();
        let _ = self.lookup_self().await;
    }

    /// A lazy stream of nodes discovered by repeated random walks.
    pub(crate) fn random_walk_iterator(&self) -> LookupIterator {
        let service = self.this();
        LookupIterator::new(
            self.closed.clone(),
            Box::new(move || {
                let service = service.clone();
                async move {
                    let target = service.random_target();
                    service.lookup(target).await
                }
                .boxed()
            }),
        )
    }

    /* Background loops */

    /// Revalidation and refresh timers. Also performs the initial
    /// bootstrap lookup.
    pub(crate) async fn run_maintenance(self: Arc<Self>, mut exit: oneshot::Receiver<()>) {
        tokio::select! {
            _ = &mut exit => return,
            _ = self.refresh() => {}
        }

        let mut revalidate = tokio::time::interval(self.config.revalidate_interval);
        revalidate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Both intervals fire immediately once; the bootstrap above already
        // covered that round.
        revalidate.tick().await;
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = &mut exit => break,
                _ = revalidate.tick() => self.revalidate().await,
                _ = refresh.tick() => {
                    debug!("Refreshing routing table");
                    self.refresh().await;
                    for _ in 0..2 {
                        let _ = self.lookup_random().await;
                    }
                }
            }
        }
        debug!("Table maintenance shutting down");
    }

    /// Pings the tail entry of a random bucket. Success moves it to the
    /// front; failure evicts it in favor of a replacement candidate.
    async fn revalidate(&self) {
        let candidate = {
            let table = self.table.lock();
            table.revalidation_target(&mut rand::thread_rng())
        };
        let Some(record) = candidate else { return };
        match self.ping(&record).await {
            Ok(_) => {
                trace!(node = %record, "Revalidated node");
                self.table.lock().note_live(&record.id);
            }
            Err(_) => {
                let promoted = self.table.lock().replace_dead(&record.id);
                debug!(node = %record, replaced = promoted.is_some(), "Removed dead node");
            }
        }
    }

    /// Services lookups scheduled for unknown sender keys. The worker pool
    /// bounds how much work a flood of unsolicited pongs can cause.
    pub(crate) async fn run_lookup_worker(
        self: Arc<Self>,
        keys: Arc<tokio::sync::Mutex<mpsc::Receiver<Pubkey>>>,
    ) {
        loop {
            let key = { keys.lock().await.recv().await };
            let Some(key) = key else { break };
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            for record in self.lookup(key).await {
                self.cache_unsolicited_node(record);
            }
        }
        debug!("Lookup worker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{node_db::InMemoryNodeDb, pending::ReplyRegistry};
    use std::time::{Duration, SystemTime};

    struct Harness {
        service: Arc<Service>,
        egress: mpsc::Receiver<OutboundDatagram>,
        lookup_keys: mpsc::Receiver<Pubkey>,
        _registry_exit: oneshot::Sender<()>,
    }

    fn init_log() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn new_harness(config: Discv4Config) -> Harness {
        init_log();
        let db = Arc::new(InMemoryNodeDb::new());
        let key = SigningKey::random(&mut OsRng);
        let local_node = Arc::new(
            LocalNode::new(key, "127.0.0.1:30301".parse().unwrap(), db).unwrap(),
        );
        let (registry, registry_exit) =
            ReplyRegistry::spawn(config.reply_timeout, config.clock(), None);
        let (egress_tx, egress_rx) = mpsc::channel(64);
        let (keys_tx, keys_rx) = mpsc::channel(16);
        let service = Service::new(local_node, registry, egress_tx, keys_tx, config);
        Harness {
            service,
            egress: egress_rx,
            lookup_keys: keys_rx,
            _registry_exit: registry_exit,
        }
    }

    /// A scripted remote peer that signs its own packets.
    struct Peer {
        key: SigningKey,
        pubkey: Pubkey,
        id: NodeId,
        addr: SocketAddr,
    }

    impl Peer {
        fn new(port: u16) -> Self {
            let key = SigningKey::random(&mut OsRng);
            let pubkey = Pubkey::from_signing_key(&key);
            Peer {
                id: pubkey.id(),
                pubkey,
                key,
                addr: SocketAddr::new("127.0.0.1".parse().unwrap(), port),
            }
        }

        fn record(&self) -> NodeRecord {
            NodeRecord::new(self.pubkey, self.addr.ip(), self.addr.port(), 0)
        }

        fn datagram(&self, packet: &Packet) -> InboundDatagram {
            let (payload, _) = wire::encode(&self.key, packet).unwrap();
            InboundDatagram {
                src: self.addr,
                payload,
            }
        }

        fn expiration(&self) -> u64 {
            wire::unix_now() + 20
        }

        fn ping(&self, to: SocketAddr) -> Packet {
            Packet::Ping(wire::Ping {
                version: 4,
                from: wire::Endpoint::from_udp_socket(self.addr, 0),
                to: wire::Endpoint::from_udp_socket(to, 0),
                expiration: self.expiration(),
                enr_seq: Some(1),
            })
        }

        fn bond_with(&self, service: &Service) {
            let now = SystemTime::now();
            service
                .db
                .update_last_pong_received(self.id, self.addr.ip(), now);
            service
                .db
                .update_last_ping_received(self.id, self.addr.ip(), now);
        }
    }

    fn decode_outbound(outbound: &OutboundDatagram) -> (Packet, [u8; 32]) {
        let (packet, _, hash) = wire::decode(&outbound.payload).unwrap();
        (packet, hash)
    }

    fn random_table_record(n: u8) -> NodeRecord {
        let key = Pubkey::from_signing_key(&SigningKey::random(&mut OsRng));
        NodeRecord::new(
            key,
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 1, n)),
            30303,
            30303,
        )
    }

    #[tokio::test]
    async fn ping_records_endpoint_proof() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40001);
        let record = peer.record();

        let service = harness.service.clone();
        let ping_task =
            tokio::spawn(async move { service.ping(&record).await });

        // Our ping goes out; answer it with a pong referencing its hash.
        let outbound = harness.egress.recv().await.unwrap();
        assert_eq!(outbound.dst, peer.addr);
        let (packet, hash) = decode_outbound(&outbound);
        assert!(matches!(packet, Packet::Ping(_)));

        let pong = Packet::Pong(wire::Pong {
            to: wire::Endpoint::from_udp_socket(outbound.dst, 0),
            reply_tok: hash.to_vec(),
            expiration: peer.expiration(),
            enr_seq: Some(9),
        });
        harness.service.handle_datagram(peer.datagram(&pong)).await;

        assert_eq!(ping_task.await.unwrap(), Ok(9));
        assert!(harness
            .service
            .db
            .last_pong_received(peer.id, peer.addr.ip())
            .is_some());
        assert!(harness.service.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_to_blackhole_times_out() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40002);

        let service = harness.service.clone();
        let record = peer.record();
        let ping_task = tokio::spawn(async move { service.ping(&record).await });

        let _ = harness.egress.recv().await.unwrap();
        assert_eq!(ping_task.await.unwrap(), Err(RequestError::Timeout));
    }

    #[tokio::test]
    async fn unbonded_findnode_is_rejected() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40003);

        let findnode = Packet::Findnode(wire::Findnode {
            target: peer.pubkey,
            expiration: peer.expiration(),
        });
        harness
            .service
            .handle_datagram(peer.datagram(&findnode))
            .await;

        assert!(harness.egress.try_recv().is_err(), "no reply may be sent");
        assert_eq!(harness.service.errors().get("unknown node"), Some(&1));
    }

    #[tokio::test]
    async fn bonded_findnode_gets_chunked_neighbors() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40004);
        peer.bond_with(&harness.service);

        // 25 live nodes; the closest 16 are served in chunks of 12 and 4.
        {
            let mut table = harness.service.table.lock();
            for n in 0..25 {
                let record = random_table_record(n);
                table.add_verified_node(record.clone());
                table.note_live(&record.id);
            }
        }

        let findnode = Packet::Findnode(wire::Findnode {
            target: peer.pubkey,
            expiration: peer.expiration(),
        });
        harness
            .service
            .handle_datagram(peer.datagram(&findnode))
            .await;

        let first = harness.egress.recv().await.unwrap();
        let second = harness.egress.recv().await.unwrap();
        assert!(harness.egress.try_recv().is_err(), "exactly two datagrams");

        for (outbound, expected) in [(&first, 12), (&second, 4)] {
            assert!(outbound.payload.len() <= wire::MAX_PACKET_SIZE);
            assert_eq!(outbound.dst, peer.addr);
            match decode_outbound(outbound).0 {
                Packet::Neighbors(neighbors) => assert_eq!(neighbors.nodes.len(), expected),
                other => panic!("expected neighbors, got {}", other.name()),
            }
        }
    }

    #[tokio::test]
    async fn inbound_ping_gets_pong_and_ping_back() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40005);

        harness
            .service
            .handle_datagram(peer.datagram(&peer.ping("127.0.0.1:30301".parse().unwrap())))
            .await;

        let outbound = harness.egress.recv().await.unwrap();
        let (packet, _) = decode_outbound(&outbound);
        match packet {
            Packet::Pong(pong) => assert_eq!(pong.to.udp_socket(), peer.addr),
            other => panic!("expected pong, got {}", other.name()),
        }
        assert!(harness
            .service
            .db
            .last_ping_received(peer.id, peer.addr.ip())
            .is_some());

        // We have no endpoint proof for the peer yet, so a ping back goes
        // out; answering it admits the peer into the table.
        let outbound = harness.egress.recv().await.unwrap();
        let (packet, hash) = decode_outbound(&outbound);
        assert!(matches!(packet, Packet::Ping(_)));
        let pong = Packet::Pong(wire::Pong {
            to: wire::Endpoint::from_udp_socket(outbound.dst, 0),
            reply_tok: hash.to_vec(),
            expiration: peer.expiration(),
            enr_seq: None,
        });
        harness.service.handle_datagram(peer.datagram(&pong)).await;

        let mut admitted = false;
        for _ in 0..50 {
            if harness.service.table.lock().get_node(&peer.id).is_some() {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(admitted, "peer never entered the table");
    }

    #[tokio::test]
    async fn bonded_ping_admits_peer_directly() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40006);
        peer.bond_with(&harness.service);

        harness
            .service
            .handle_datagram(peer.datagram(&peer.ping("127.0.0.1:30301".parse().unwrap())))
            .await;

        let (packet, _) = decode_outbound(&harness.egress.recv().await.unwrap());
        assert!(matches!(packet, Packet::Pong(_)));
        assert!(harness.service.table.lock().get_node(&peer.id).is_some());
    }

    #[tokio::test]
    async fn expired_packets_are_counted_and_ignored() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40007);

        let stale = Packet::Ping(wire::Ping {
            version: 4,
            from: wire::Endpoint::from_udp_socket(peer.addr, 0),
            to: wire::Endpoint::from_udp_socket("127.0.0.1:30301".parse().unwrap(), 0),
            expiration: wire::unix_now() - 30,
            enr_seq: None,
        });
        harness.service.handle_datagram(peer.datagram(&stale)).await;

        assert!(harness.egress.try_recv().is_err());
        assert_eq!(harness.service.errors().get("expired"), Some(&1));
    }

    #[tokio::test]
    async fn unsolicited_neighbors_fill_cache_not_table() {
        let harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40008);

        let mut nodes: Vec<wire::Node> = (0..3)
            .map(|n| wire::Node {
                ip: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 2, n)),
                udp_port: 30303,
                tcp_port: 0,
                id: Pubkey::from_signing_key(&SigningKey::random(&mut OsRng)),
            })
            .collect();
        // One entry with a low port must be dropped.
        nodes.push(wire::Node {
            ip: "10.0.2.77".parse().unwrap(),
            udp_port: 80,
            tcp_port: 0,
            id: Pubkey::from_signing_key(&SigningKey::random(&mut OsRng)),
        });

        let neighbors = Packet::Neighbors(wire::Neighbors {
            nodes,
            expiration: peer.expiration(),
        });
        harness
            .service
            .handle_datagram(peer.datagram(&neighbors))
            .await;

        assert_eq!(
            harness.service.errors().get("unsolicited reply"),
            Some(&1)
        );
        assert_eq!(harness.service.len_unsolicited(), 3);
        assert!(harness.service.table.lock().is_empty());
    }

    #[tokio::test]
    async fn unsolicited_pong_schedules_one_lookup_per_key() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40009);

        let pong = Packet::Pong(wire::Pong {
            to: wire::Endpoint::from_udp_socket(peer.addr, 0),
            reply_tok: vec![1u8; 32],
            expiration: peer.expiration(),
            enr_seq: None,
        });
        harness.service.handle_datagram(peer.datagram(&pong)).await;
        harness.service.handle_datagram(peer.datagram(&pong)).await;

        assert_eq!(harness.lookup_keys.recv().await.unwrap(), peer.pubkey);
        assert!(harness.lookup_keys.try_recv().is_err());
        assert_eq!(
            harness.service.errors().get("unsolicited reply"),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn request_enr_returns_newer_record() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40010);
        peer.bond_with(&harness.service);

        let peer_enr: crate::Enr = enr::EnrBuilder::new("v4")
            .ip4("127.0.0.1".parse().unwrap())
            .udp4(peer.addr.port())
            .build(&peer.key)
            .unwrap();

        let service = harness.service.clone();
        let record = peer.record();
        let request_task = tokio::spawn(async move { service.request_enr(&record).await });

        let outbound = harness.egress.recv().await.unwrap();
        let (packet, hash) = decode_outbound(&outbound);
        assert!(matches!(packet, Packet::EnrRequest(_)));

        let response = Packet::EnrResponse(wire::EnrResponse {
            reply_tok: hash.to_vec(),
            record: peer_enr.clone(),
        });
        harness
            .service
            .handle_datagram(peer.datagram(&response))
            .await;

        let resolved = request_task.await.unwrap().unwrap();
        assert_eq!(resolved.id, peer.id);
        assert_eq!(resolved.seq, peer_enr.seq());
        assert!(resolved.enr.is_some());
    }

    #[tokio::test]
    async fn request_enr_keeps_newer_known_record() {
        let mut harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40011);
        peer.bond_with(&harness.service);

        let peer_enr: crate::Enr = enr::EnrBuilder::new("v4")
            .ip4("127.0.0.1".parse().unwrap())
            .udp4(peer.addr.port())
            .build(&peer.key)
            .unwrap();

        // We already know a higher sequence number than the response's.
        let mut known = peer.record();
        known.seq = peer_enr.seq() + 3;

        let service = harness.service.clone();
        let known_clone = known.clone();
        let request_task =
            tokio::spawn(async move { service.request_enr(&known_clone).await });

        let outbound = harness.egress.recv().await.unwrap();
        let (_, hash) = decode_outbound(&outbound);
        let response = Packet::EnrResponse(wire::EnrResponse {
            reply_tok: hash.to_vec(),
            record: peer_enr,
        });
        harness
            .service
            .handle_datagram(peer.datagram(&response))
            .await;

        let resolved = request_task.await.unwrap().unwrap();
        assert_eq!(resolved.seq, known.seq);
        assert!(resolved.enr.is_none(), "older response must be discarded");
    }

    #[tokio::test]
    async fn seeding_loads_bootnodes_and_database_seeds() {
        let bootnode = random_table_record(1);
        let mut incomplete = random_table_record(2);
        incomplete.udp_port = 0;

        let config = {
            let mut builder = Discv4Config::builder();
            builder.add_bootnodes([bootnode.clone(), incomplete.clone()]);
            builder.build()
        };
        let harness = new_harness(config);

        let persisted = random_table_record(3);
        harness.service.db.update_node(&persisted);
        harness.service.db.update_last_pong_received(
            persisted.id,
            persisted.ip,
            SystemTime::now(),
        );

        harness.service.seed_table();
        let table = harness.service.table.lock();
        assert!(table.get_node(&bootnode.id).is_some());
        assert!(table.get_node(&persisted.id).is_some());
        assert!(table.get_node(&incomplete.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_returns_input_for_unreachable_node() {
        let harness = new_harness(Discv4Config::default());
        let peer = Peer::new(40013);

        let record = peer.record();
        let resolved = harness.service.resolve(&record).await;
        assert_eq!(resolved.id, record.id);
        assert_eq!(resolved.seq, record.seq);
    }

    #[tokio::test]
    async fn garbage_datagrams_go_to_the_unhandled_sink() {
        let (sink_tx, mut sink_rx) = mpsc::channel(4);
        let config = {
            let mut builder = Discv4Config::builder();
            builder.unhandled(sink_tx);
            builder.build()
        };
        let harness = new_harness(config);

        let datagram = InboundDatagram {
            src: "127.0.0.1:40012".parse().unwrap(),
            payload: vec![0u8; 200],
        };
        harness.service.handle_datagram(datagram).await;

        let forwarded = sink_rx.recv().await.unwrap();
        assert_eq!(forwarded.payload.len(), 200);
    }
}
