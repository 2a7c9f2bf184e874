//! A set of configuration parameters to tune the discovery protocol.

use crate::{netutil::Netlist, node::NodeRecord, node_db::NodeDatabase, socket::InboundDatagram};
use enr::k256::ecdsa::SigningKey;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};

/// The time source used for request deadlines. Injectable so tests can warp
/// time; wall-clock time is only consulted for packet expirations and NTP
/// drift warnings.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Generates the ephemeral keys whose public halves serve as random-walk
/// lookup targets.
pub type KeyGenerator = Arc<dyn Fn() -> SigningKey + Send + Sync>;

/// Configuration parameters that define the performance of the discovery
/// network.
#[derive(Clone)]
pub struct Discv4Config {
    /// The timeout for each UDP request. Default: 750 milliseconds.
    pub reply_timeout: Duration,

    /// The validity window stamped into outgoing packets. Default: 20
    /// seconds.
    pub request_expiration: Duration,

    /// How long an endpoint proof remains valid. Default: 24 hours.
    pub bond_expiration: Duration,

    /// Time to sleep after pinging an unbonded peer, so the peer's reverse
    /// ping/pong round trip can complete before we send it a request.
    /// Default: zero.
    pub ping_back_delay: Duration,

    /// The number of findnode failures after which a node is considered
    /// questionable and re-pinged before further requests. Default: 5.
    pub max_find_failures: u32,

    /// The interval between liveness checks of random table entries.
    /// Default: 10 seconds.
    pub revalidate_interval: Duration,

    /// The interval between table refreshes (self lookup plus random
    /// lookups). Default: 30 minutes.
    pub refresh_interval: Duration,

    /// Nodes used to bootstrap the table.
    pub bootnodes: Vec<NodeRecord>,

    /// An optional CIDR whitelist. Nodes with addresses outside it are
    /// rejected.
    pub netrestrict: Option<Netlist>,

    /// Capacity of the cache of nodes learned from unsolicited packets.
    /// Default: 500.
    pub unsolicited_cache_size: usize,

    /// Capacity of the cache gating background lookups for unknown sender
    /// keys. Default: 100.
    pub unknown_keys_cache_size: usize,

    /// The number of worker tasks servicing background lookups triggered by
    /// unsolicited pongs. Default: 2.
    pub lookup_workers: usize,

    /// The node database holding endpoint proofs and seed nodes. Defaults
    /// to an in-memory database.
    pub node_db: Option<Arc<dyn NodeDatabase>>,

    /// A sink receiving raw datagrams the engine rejected, for outer layers
    /// sharing the socket.
    pub unhandled: Option<mpsc::Sender<InboundDatagram>>,

    /// Invoked (at most once per cooldown window) when continuous request
    /// timeouts suggest the system clock has drifted.
    pub on_clock_drift: Option<Arc<dyn Fn() + Send + Sync>>,

    /// The deadline clock. Overridden in tests.
    pub clock: Option<Clock>,

    /// The generator for random lookup targets. Overridden in tests that
    /// need deterministic walks.
    pub key_generator: Option<KeyGenerator>,
}

impl Default for Discv4Config {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(750),
            request_expiration: Duration::from_secs(20),
            bond_expiration: Duration::from_secs(24 * 3600),
            ping_back_delay: Duration::ZERO,
            max_find_failures: 5,
            revalidate_interval: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30 * 60),
            bootnodes: Vec::new(),
            netrestrict: None,
            unsolicited_cache_size: 500,
            unknown_keys_cache_size: 100,
            lookup_workers: 2,
            node_db: None,
            unhandled: None,
            on_clock_drift: None,
            clock: None,
            key_generator: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Discv4ConfigBuilder {
    config: Discv4Config,
}

impl Discv4ConfigBuilder {
    pub fn new() -> Self {
        Discv4ConfigBuilder::default()
    }

    /// The timeout for each UDP request.
    pub fn reply_timeout(&mut self, timeout: Duration) -> &mut Self {
        if timeout.is_zero() {
            panic!("A zero reply timeout would fail every request immediately");
        }
        self.config.reply_timeout = timeout;
        self
    }

    /// The validity window stamped into outgoing packets.
    pub fn request_expiration(&mut self, expiration: Duration) -> &mut Self {
        self.config.request_expiration = expiration;
        self
    }

    /// How long an endpoint proof remains valid.
    pub fn bond_expiration(&mut self, expiration: Duration) -> &mut Self {
        self.config.bond_expiration = expiration;
        self
    }

    /// Time to sleep after pinging an unbonded peer.
    pub fn ping_back_delay(&mut self, delay: Duration) -> &mut Self {
        self.config.ping_back_delay = delay;
        self
    }

    /// The number of allowed findnode failures per peer.
    pub fn max_find_failures(&mut self, max: u32) -> &mut Self {
        self.config.max_find_failures = max;
        self
    }

    /// The interval between liveness checks of random table entries.
    pub fn revalidate_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.revalidate_interval = interval;
        self
    }

    /// The interval between table refreshes.
    pub fn refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.refresh_interval = interval;
        self
    }

    /// Adds nodes used to bootstrap the table.
    pub fn add_bootnodes(&mut self, nodes: impl IntoIterator<Item = NodeRecord>) -> &mut Self {
        self.config.bootnodes.extend(nodes);
        self
    }

    /// Restricts acceptable peer addresses to the given CIDR whitelist.
    pub fn netrestrict(&mut self, netlist: Netlist) -> &mut Self {
        self.config.netrestrict = Some(netlist);
        self
    }

    /// Capacity of the unsolicited-node cache.
    pub fn unsolicited_cache_size(&mut self, size: usize) -> &mut Self {
        if size == 0 {
            panic!("The unsolicited-node cache cannot have zero capacity");
        }
        self.config.unsolicited_cache_size = size;
        self
    }

    /// Capacity of the unknown-keys cache.
    pub fn unknown_keys_cache_size(&mut self, size: usize) -> &mut Self {
        if size == 0 {
            panic!("The unknown-keys cache cannot have zero capacity");
        }
        self.config.unknown_keys_cache_size = size;
        self
    }

    /// The number of background lookup workers.
    pub fn lookup_workers(&mut self, workers: usize) -> &mut Self {
        self.config.lookup_workers = workers;
        self
    }

    /// The node database holding endpoint proofs and seed nodes.
    pub fn node_db(&mut self, db: Arc<dyn NodeDatabase>) -> &mut Self {
        self.config.node_db = Some(db);
        self
    }

    /// A sink receiving raw datagrams the engine rejected.
    pub fn unhandled(&mut self, sink: mpsc::Sender<InboundDatagram>) -> &mut Self {
        self.config.unhandled = Some(sink);
        self
    }

    /// A hook invoked when continuous timeouts suggest clock drift.
    pub fn on_clock_drift(&mut self, hook: Arc<dyn Fn() + Send + Sync>) -> &mut Self {
        self.config.on_clock_drift = Some(hook);
        self
    }

    /// Overrides the deadline clock.
    pub fn clock(&mut self, clock: Clock) -> &mut Self {
        self.config.clock = Some(clock);
        self
    }

    /// Overrides the random lookup target generator.
    pub fn key_generator(&mut self, generator: KeyGenerator) -> &mut Self {
        self.config.key_generator = Some(generator);
        self
    }

    pub fn build(&mut self) -> Discv4Config {
        self.config.clone()
    }
}

impl Discv4Config {
    /// Returns a new default builder instance.
    pub fn builder() -> Discv4ConfigBuilder {
        Default::default()
    }

    pub(crate) fn clock(&self) -> Clock {
        self.clock.clone().unwrap_or_else(|| Arc::new(Instant::now))
    }
}

impl std::fmt::Debug for Discv4Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builder = f.debug_struct("Discv4Config");
        let _ = builder.field("reply_timeout", &self.reply_timeout);
        let _ = builder.field("request_expiration", &self.request_expiration);
        let _ = builder.field("bond_expiration", &self.bond_expiration);
        let _ = builder.field("ping_back_delay", &self.ping_back_delay);
        let _ = builder.field("max_find_failures", &self.max_find_failures);
        let _ = builder.field("revalidate_interval", &self.revalidate_interval);
        let _ = builder.field("refresh_interval", &self.refresh_interval);
        let _ = builder.field("bootnodes", &self.bootnodes.len());
        let _ = builder.field("netrestrict", &self.netrestrict);
        let _ = builder.field("unsolicited_cache_size", &self.unsolicited_cache_size);
        let _ = builder.field("unknown_keys_cache_size", &self.unknown_keys_cache_size);
        let _ = builder.field("lookup_workers", &self.lookup_workers);
        builder.finish()
    }
}
