#![deny(rustdoc::broken_intra_doc_links)]
//! An implementation of the [Node Discovery Protocol
//! v4](https://github.com/ethereum/devp2p/blob/master/discv4.md).
//!
//! # Overview
//!
//! Discovery v4 maintains a Kademlia-like routing table of nodes identified
//! by the keccak256 hash of their secp256k1 public key. Peers exchange
//! signed UDP packets: endpoint proofs are established with PING/PONG
//! round trips, neighbor sets are queried with FINDNODE and signed node
//! records are fetched with ENRREQUEST. Iterative lookups walk the DHT
//! towards a target key, yielding its closest known nodes.
//!
//! The crate is split into the following layers:
//!
//! - [`wire`]: the packet codec. Every datagram carries a keccak256
//!   integrity hash and a recoverable signature over its RLP payload.
//! - `socket`: a task pair owning the UDP socket halves, exchanging raw
//!   datagrams with the service over channels.
//! - `pending`: the reply matcher registry. A dispatcher task pairs
//!   inbound replies with outstanding requests and enforces per-request
//!   deadlines, clock-warp eviction and NTP drift warnings.
//! - `table`/`lookup`: the k-bucket routing table with its revalidation
//!   and refresh machinery, and the iterative lookup engine.
//! - `service`: the protocol logic. Verifies and answers inbound packets,
//!   gates requests on endpoint proofs and diverts unsolicited replies
//!   into bounded caches.
//! - [`Discv4`]: the application-level handle that spawns the tasks and
//!   exposes the request API.
//!
//! # Usage
//!
//! A tokio runtime with timing and io enabled is required.
//!
//! ```rust,no_run
//! use discv4::{enr::k256::ecdsa::SigningKey, Discv4, Discv4Config};
//!
//! # async fn run() {
//! let key = SigningKey::random(&mut rand::rngs::OsRng);
//! let config = Discv4Config::builder().build();
//!
//! // In order to bootstrap the routing table, add boot nodes via
//! // Discv4Config::builder().add_bootnodes(..).
//! let discv4 = Discv4::spawn(key, "0.0.0.0:30303".parse().unwrap(), config)
//!     .await
//!     .unwrap();
//!
//! let target = discv4.self_node().key;
//! let found = discv4.lookup_pubkey(target).await;
//! println!("Found nodes: {found:?}");
//! # }
//! ```

mod bond;
mod config;
mod discv4;
mod error;
mod local_node;
mod lookup;
pub mod metrics;
mod netutil;
mod node;
mod node_db;
mod pending;
mod service;
mod socket;
mod table;
pub mod wire;

#[macro_use]
extern crate lazy_static;

/// A signed node record carrying a secp256k1 identity key.
pub type Enr = enr::Enr<enr::k256::ecdsa::SigningKey>;

pub use crate::discv4::Discv4;
pub use config::{Clock, Discv4Config, Discv4ConfigBuilder, KeyGenerator};
pub use error::{
    DecodePacketError, Discv4Error, InboundError, NodeValidationError, RelayIpError, RequestError,
};
pub use local_node::LocalNode;
pub use lookup::LookupIterator;
pub use netutil::Netlist;
pub use node::NodeRecord;
pub use node_db::{InMemoryNodeDb, NodeDatabase};
pub use socket::InboundDatagram;
pub use wire::{Endpoint, Pubkey};
// re-export the ENR crate
pub use enr;
