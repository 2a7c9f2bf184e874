//! Iterative Kademlia lookups.
//!
//! A lookup walks the DHT towards a target key: at each step the closest
//! unqueried nodes from the running result set are asked for their
//! neighbors, in parallel, until the closest known nodes have all been
//! queried and nothing closer turns up.

use crate::{
    error::RequestError,
    node::{NodeRecord, NodesByDistance},
    node_db::NodeDatabase,
    table::{Table, BUCKET_SIZE},
};
use enr::NodeId;
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, trace};

/// The number of nodes queried in parallel at each lookup step.
pub(crate) const ALPHA: usize = 3;

/// Issues a findnode to one node and returns the validated nodes it
/// answered with.
pub(crate) type QueryFunc = Arc<
    dyn Fn(NodeRecord) -> BoxFuture<'static, Result<Vec<NodeRecord>, RequestError>> + Send + Sync,
>;

pub(crate) struct Lookup {
    asked: HashSet<NodeId>,
    seen: HashSet<NodeId>,
    result: NodesByDistance,
    query: QueryFunc,
    table: Arc<Mutex<Table>>,
    db: Arc<dyn NodeDatabase>,
    max_find_failures: u32,
}

impl Lookup {
    pub fn new(
        target: NodeId,
        table: Arc<Mutex<Table>>,
        db: Arc<dyn NodeDatabase>,
        max_find_failures: u32,
        query: QueryFunc,
    ) -> Self {
        let mut result = NodesByDistance::new(target, BUCKET_SIZE);
        let mut seen = HashSet::new();
        for record in table.lock().find_closest(&target, BUCKET_SIZE, false) {
            seen.insert(record.id);
            result.push(record);
        }
        Lookup {
            asked: HashSet::new(),
            seen,
            result,
            query,
            table,
            db,
            max_find_failures,
        }
    }

    /// Runs the lookup to completion and returns the closest nodes found.
    pub async fn run(mut self) -> Vec<NodeRecord> {
        loop {
            let batch: Vec<NodeRecord> = self
                .result
                .entries
                .iter()
                .filter(|record| !self.asked.contains(&record.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut queries = FuturesUnordered::new();
            for record in batch {
                self.asked.insert(record.id);
                let query = (self.query)(record.clone());
                queries.push(async move { (record, query.await) });
            }
            let mut closed = false;
            while let Some((record, result)) = queries.next().await {
                closed |= self.process_reply(record, result);
            }
            if closed {
                break;
            }
        }
        self.result.entries
    }

    /// Folds one query result into the lookup state. Returns `true` when
    /// the transport shut down and the walk should stop.
    fn process_reply(
        &mut self,
        queried: NodeRecord,
        result: Result<Vec<NodeRecord>, RequestError>,
    ) -> bool {
        match result {
            Err(RequestError::Closed) => return true,
            Ok(nodes) if !nodes.is_empty() => {
                if self.db.find_fails(queried.id, queried.ip) > 0 {
                    self.db.update_find_fails(queried.id, queried.ip, 0);
                }
                for found in nodes {
                    if self.seen.insert(found.id) {
                        self.table.lock().add_seen_node(found.clone());
                        self.result.push(found);
                    }
                }
            }
            _ => {
                // An empty or failed reply counts against the node; nodes
                // failing too often are dropped from the table.
                let fails = self.db.find_fails(queried.id, queried.ip) + 1;
                self.db.update_find_fails(queried.id, queried.ip, fails);
                trace!(node = %queried, fails, "Findnode failed");
                if fails >= self.max_find_failures {
                    debug!(node = %queried, "Too many findnode failures, dropping node");
                    self.table.lock().delete_node(&queried.id);
                }
            }
        }
        false
    }
}

/// A lazy, restartable stream over nodes discovered by random walks of the
/// DHT. Whenever the current walk is exhausted a new one starts from a
/// fresh random target.
pub struct LookupIterator {
    next_lookup: Box<dyn FnMut() -> BoxFuture<'static, Vec<NodeRecord>> + Send>,
    buffer: VecDeque<NodeRecord>,
    closed: Arc<AtomicBool>,
}

impl LookupIterator {
    pub(crate) fn new(
        closed: Arc<AtomicBool>,
        next_lookup: Box<dyn FnMut() -> BoxFuture<'static, Vec<NodeRecord>> + Send>,
    ) -> Self {
        LookupIterator {
            next_lookup,
            buffer: VecDeque::new(),
            closed,
        }
    }

    /// The next discovered node. Returns `None` once the transport shuts
    /// down; an empty network makes this wait for the next walk.
    pub async fn next(&mut self) -> Option<NodeRecord> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(record);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let nodes = (self.next_lookup)().await;
            if nodes.is_empty() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            self.buffer.extend(nodes);
        }
    }
}
