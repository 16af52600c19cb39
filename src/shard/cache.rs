//! Lease cache
//!
//! Signature → lease map where every entry carries its own renewable
//! deadline. The cache never evicts on its own; the owning `ShardState`
//! sweeps it on a timer and decides what happens to dead entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Immutable, ordered list of shard IDs granted to one lease
pub type ShardIds = Arc<[u32]>;

/// A single live lease
#[derive(Debug, Clone)]
pub struct Lease {
    shard_ids: ShardIds,
    deadline: Instant,
}

impl Lease {
    /// Shard IDs held by this lease
    pub fn shard_ids(&self) -> &ShardIds {
        &self.shard_ids
    }

    /// True once the deadline has passed
    pub fn is_dead(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// A lease removed from the cache because its deadline passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLease {
    pub signature: String,
    pub shard_ids: ShardIds,
}

/// TTL map of leases keyed by signature
#[derive(Debug)]
pub struct LeaseCache {
    lifetime: Duration,
    entries: HashMap<String, Lease>,
}

#[allow(clippy::len_without_is_empty)]
impl LeaseCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, signature: &str) -> Option<&Lease> {
        self.entries.get(signature)
    }

    /// Insert a lease expiring `lifetime` from now
    pub fn insert(&mut self, signature: String, shard_ids: ShardIds) {
        let deadline = Instant::now() + self.lifetime;
        self.entries.insert(signature, Lease { shard_ids, deadline });
    }

    /// Push the deadline of an existing lease to `lifetime` from now.
    /// Returns false if the signature is unknown.
    pub fn renew(&mut self, signature: &str) -> bool {
        match self.entries.get_mut(signature) {
            Some(lease) => {
                lease.deadline = Instant::now() + self.lifetime;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, signature: &str) -> Option<Lease> {
        self.entries.remove(signature)
    }

    /// Remove and return every lease whose deadline is at or before `now`
    pub fn drain_expired(&mut self, now: Instant) -> Vec<DeadLease> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, lease)| lease.is_dead(now))
            .map(|(signature, _)| signature.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|signature| {
                self.entries.remove(&signature).map(|lease| DeadLease {
                    signature,
                    shard_ids: lease.shard_ids,
                })
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Lease)> {
        self.entries.iter()
    }

    /// Drop every entry without reporting it as dead
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
