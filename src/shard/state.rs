//! Shard state tracking
//!
//! One `ShardState` per channel holds the available shard IDs and the live
//! leases. Every read-modify-write goes through `ShardState::lock`, which
//! hands out a `ShardGuard`; dropping the guard releases the lock and
//! republishes the lock-free snapshot.

use crate::metrics;
use crate::shard::cache::{DeadLease, Lease, LeaseCache, ShardIds};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Default lease lifetime without a heartbeat
pub const LIFETIME: Duration = Duration::from_secs(30);

/// Default period between expiry sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Timing knobs for leases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// How long a lease survives without a heartbeat
    pub lifetime: Duration,
    /// How often dead leases are looked for
    pub sweep_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            lifetime: LIFETIME,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

/// Called once per expired lease, after its IDs are back in the available
/// set and while the state lock is still held. Hooks must not lock the
/// state themselves; anything slow belongs in a spawned task.
pub type DeadHook = Arc<dyn Fn(&DeadLease) + Send + Sync>;

/// Point-in-time copy of a channel's shard bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardSnapshot {
    pub used: BTreeMap<String, Vec<u32>>,
    pub not_used: Vec<u32>,
}

/// The data protected by the state lock
#[derive(Debug)]
pub struct ShardBook {
    available: Vec<u32>,
    used: LeaseCache,
}

impl ShardBook {
    fn new(shard_count: u32, lifetime: Duration) -> Self {
        Self {
            available: (0..shard_count).collect(),
            used: LeaseCache::new(lifetime),
        }
    }

    /// Shard IDs not held by any lease, in reclaim order
    pub fn available(&self) -> &[u32] {
        &self.available
    }

    pub fn lease(&self, signature: &str) -> Option<&Lease> {
        self.used.get(signature)
    }

    pub fn lease_count(&self) -> usize {
        self.used.len()
    }

    /// Remove up to `count` IDs from the front of the available set
    pub fn take(&mut self, count: usize) -> ShardIds {
        let count = count.min(self.available.len());
        self.available.drain(..count).collect()
    }

    /// Record a new lease, expiring one lifetime from now
    pub fn register_lease(&mut self, signature: String, shard_ids: ShardIds) {
        self.used.insert(signature, shard_ids);
    }

    /// Move a lease's IDs back into the available set and forget the lease
    pub fn reclaim(&mut self, signature: &str) -> Option<ShardIds> {
        let lease = self.used.remove(signature)?;
        self.available.extend(lease.shard_ids().iter().copied());
        Some(Arc::clone(lease.shard_ids()))
    }

    /// Extend a lease by one lifetime from now
    pub fn renew(&mut self, signature: &str) -> bool {
        self.used.renew(signature)
    }

    fn reclaim_expired(&mut self, now: Instant) -> Vec<DeadLease> {
        let dead = self.used.drain_expired(now);
        for lease in &dead {
            self.available.extend(lease.shard_ids.iter().copied());
        }
        dead
    }

    fn clear(&mut self) {
        self.available.clear();
        self.used.clear();
    }

    fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            used: self
                .used
                .iter()
                .map(|(signature, lease)| (signature.clone(), lease.shard_ids().to_vec()))
                .collect(),
            not_used: self.available.clone(),
        }
    }
}

/// Exclusive view of a channel's `ShardBook`
pub struct ShardGuard<'a> {
    book: MutexGuard<'a, ShardBook>,
    shared: &'a Shared,
}

impl Deref for ShardGuard<'_> {
    type Target = ShardBook;

    fn deref(&self) -> &ShardBook {
        &self.book
    }
}

impl DerefMut for ShardGuard<'_> {
    fn deref_mut(&mut self) -> &mut ShardBook {
        &mut self.book
    }
}

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        self.shared.publish(&self.book);
    }
}

struct Shared {
    channel: String,
    book: Mutex<ShardBook>,
    snapshot: watch::Sender<Arc<ShardSnapshot>>,
    hooks: Vec<DeadHook>,
}

impl Shared {
    async fn lock(&self) -> ShardGuard<'_> {
        ShardGuard {
            book: self.book.lock().await,
            shared: self,
        }
    }

    fn publish(&self, book: &ShardBook) {
        metrics::set_shards_available(&self.channel, book.available().len());
        self.snapshot.send_replace(Arc::new(book.snapshot()));
    }

    /// Reclaim every lease past its deadline, then run the dead hooks
    async fn expire(&self, now: Instant) -> usize {
        let mut guard = self.lock().await;
        let dead = guard.reclaim_expired(now);

        for lease in &dead {
            info!(
                channel = %self.channel,
                signature = %lease.signature,
                shard_ids = ?lease.shard_ids,
                "Lease expired without heartbeat, shards reclaimed"
            );
            metrics::record_lease_expired(&self.channel);
        }

        for lease in &dead {
            for hook in &self.hooks {
                hook(lease);
            }
        }

        dead.len()
    }
}

/// Lock-guarded shard bookkeeping for one channel
pub struct ShardState {
    shared: Arc<Shared>,
    sweeper: JoinHandle<()>,
}

impl ShardState {
    /// Create a state with IDs `0..shard_count` available and start its
    /// expiry sweeper. Must be called from within a Tokio runtime.
    pub fn new(
        channel: &str,
        shard_count: u32,
        settings: LeaseSettings,
        hooks: Vec<DeadHook>,
    ) -> Self {
        let book = ShardBook::new(shard_count, settings.lifetime);
        let (snapshot, _) = watch::channel(Arc::new(book.snapshot()));
        metrics::set_shards_available(channel, book.available().len());

        let shared = Arc::new(Shared {
            channel: channel.to_string(),
            book: Mutex::new(book),
            snapshot,
            hooks,
        });

        let sweeper = tokio::spawn(sweep(Arc::downgrade(&shared), settings.sweep_interval));

        Self { shared, sweeper }
    }

    /// Wait for exclusive access. Waiters are served in arrival order.
    pub async fn lock(&self) -> ShardGuard<'_> {
        self.shared.lock().await
    }

    /// Copy of `(used, not_used)` as of the last released lock, read
    /// without waiting for the lock. May be stale.
    pub fn bypass_snapshot(&self) -> Arc<ShardSnapshot> {
        Arc::clone(&self.shared.snapshot.borrow())
    }

    /// Stop the sweeper and drop every lease and available ID. Leases are
    /// discarded silently: no dead hooks run.
    ///
    /// Bypasses `ShardGuard` so nothing is republished: a replacement state
    /// for the same channel already owns the channel's gauge.
    pub async fn teardown(&self) {
        self.sweeper.abort();
        let mut book = self.shared.book.lock().await;
        let discarded = book.lease_count();
        book.clear();
        debug!(channel = %self.shared.channel, discarded, "Shard state torn down");
    }
}

impl Drop for ShardState {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.expire(Instant::now()).await;
    }
}
