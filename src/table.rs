//! The Kademlia routing table.
//!
//! 256 buckets indexed by the length of the common ID prefix with the local
//! node. Each bucket holds up to [`BUCKET_SIZE`] entries ordered
//! most-recently-seen first, plus a bounded cache of replacement candidates
//! promoted when an entry fails revalidation. The table is a plain data
//! structure; the service owns its mutex and runs the revalidation and
//! refresh loops against it.

use crate::node::{common_prefix_len, NodeRecord, NodesByDistance};
use enr::NodeId;
use rand::Rng;
use std::time::{Duration, Instant};

/// Maximum number of nodes in a bucket, i.e. the `k` parameter.
pub(crate) const BUCKET_SIZE: usize = 16;

/// Maximum number of replacement candidates kept per bucket.
pub(crate) const MAX_REPLACEMENTS: usize = 10;

const N_BUCKETS: usize = 256;

/// How many database seeds to load on startup and the maximum age of their
/// endpoint proof.
pub(crate) const SEED_COUNT: usize = 30;
pub(crate) const SEED_MAX_AGE: Duration = Duration::from_secs(5 * 24 * 3600);

/// A table entry.
#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub record: NodeRecord,
    /// How many times revalidation has confirmed this node alive.
    pub liveness_checks: u32,
    pub added_at: Instant,
}

#[derive(Default)]
struct Bucket {
    /// Live entries, most recently seen first.
    entries: Vec<NodeEntry>,
    /// Fallback candidates, most recently added first.
    replacements: Vec<NodeRecord>,
}

pub(crate) struct Table {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl Table {
    pub fn new(local_id: NodeId) -> Self {
        Table {
            local_id,
            buckets: (0..N_BUCKETS).map(|_| Bucket::default()).collect(),
        }
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        common_prefix_len(&self.local_id, id).map(|prefix| prefix.min(N_BUCKETS - 1))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_node(&self, id: &NodeId) -> Option<NodeRecord> {
        let bucket = &self.buckets[self.bucket_index(id)?];
        bucket
            .entries
            .iter()
            .find(|entry| entry.record.id == *id)
            .map(|entry| entry.record.clone())
    }

    pub fn delete_node(&mut self, id: &NodeId) {
        let Some(index) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        bucket.entries.retain(|entry| entry.record.id != *id);
        bucket.replacements.retain(|record| record.id != *id);
    }

    /// Adds a node whose endpoint proof just completed. Present nodes move
    /// to the bucket front; new ones are inserted at the front of a
    /// non-full bucket and become replacement candidates otherwise.
    pub fn add_verified_node(&mut self, record: NodeRecord) {
        let Some(index) = self.bucket_index(&record.id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket
            .entries
            .iter()
            .position(|entry| entry.record.id == record.id)
        {
            let mut entry = bucket.entries.remove(pos);
            entry.record = record;
            bucket.entries.insert(0, entry);
            return;
        }
        if bucket.entries.len() < BUCKET_SIZE {
            bucket.replacements.retain(|r| r.id != record.id);
            bucket.entries.insert(
                0,
                NodeEntry {
                    record,
                    liveness_checks: 0,
                    added_at: Instant::now(),
                },
            );
        } else {
            Self::add_replacement(bucket, record);
        }
    }

    /// Adds a node merely observed in a neighbors response. It joins the
    /// back of its bucket and does not displace anything.
    pub fn add_seen_node(&mut self, record: NodeRecord) {
        let Some(index) = self.bucket_index(&record.id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if bucket
            .entries
            .iter()
            .any(|entry| entry.record.id == record.id)
        {
            return;
        }
        if bucket.entries.len() < BUCKET_SIZE {
            bucket.replacements.retain(|r| r.id != record.id);
            bucket.entries.push(NodeEntry {
                record,
                liveness_checks: 0,
                added_at: Instant::now(),
            });
        } else {
            Self::add_replacement(bucket, record);
        }
    }

    fn add_replacement(bucket: &mut Bucket, record: NodeRecord) {
        bucket.replacements.retain(|r| r.id != record.id);
        bucket.replacements.insert(0, record);
        bucket.replacements.truncate(MAX_REPLACEMENTS);
    }

    /// Records a successful liveness check: the entry moves to the front of
    /// its bucket with its counter bumped.
    pub fn note_live(&mut self, id: &NodeId) {
        let Some(index) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.entries.iter().position(|entry| entry.record.id == *id) {
            let mut entry = bucket.entries.remove(pos);
            entry.liveness_checks += 1;
            bucket.entries.insert(0, entry);
        }
    }

    /// Evicts an entry that failed revalidation and promotes the newest
    /// replacement candidate in its place. Returns the promoted node.
    pub fn replace_dead(&mut self, id: &NodeId) -> Option<NodeRecord> {
        let index = self.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.entries.iter().position(|entry| entry.record.id == *id)?;
        bucket.entries.remove(pos);
        if bucket.replacements.is_empty() {
            return None;
        }
        let promoted = bucket.replacements.remove(0);
        bucket.entries.push(NodeEntry {
            record: promoted.clone(),
            liveness_checks: 0,
            added_at: Instant::now(),
        });
        Some(promoted)
    }

    /// The `count` entries closest to `target` by XOR distance, across all
    /// buckets. With `live_only`, entries that never passed a liveness
    /// check are skipped.
    pub fn find_closest(&self, target: &NodeId, count: usize, live_only: bool) -> Vec<NodeRecord> {
        let mut closest = NodesByDistance::new(*target, count);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                if live_only && entry.liveness_checks == 0 {
                    continue;
                }
                closest.push(entry.record.clone());
            }
        }
        closest.entries
    }

    /// Every entry currently in the table.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.entries.iter().map(|entry| entry.record.clone()))
            .collect()
    }

    /// The tail entry of a random non-empty bucket, the next candidate for
    /// revalidation.
    pub fn revalidation_target<R: Rng>(&self, rng: &mut R) -> Option<NodeRecord> {
        let non_empty: Vec<usize> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, _)| i)
            .collect();
        if non_empty.is_empty() {
            return None;
        }
        let bucket = &self.buckets[non_empty[rng.gen_range(0..non_empty.len())]];
        bucket.entries.last().map(|entry| entry.record.clone())
    }

    #[cfg(test)]
    pub fn liveness_checks(&self, id: &NodeId) -> Option<u32> {
        let bucket = &self.buckets[self.bucket_index(id)?];
        bucket
            .entries
            .iter()
            .find(|entry| entry.record.id == *id)
            .map(|entry| entry.liveness_checks)
    }
}
