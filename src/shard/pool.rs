//! Shard pool implementation
//!
//! One pool per channel. Owns the channel's `ShardState` and its dead-lease
//! callback registry, and implements the lease protocol on top of them.

use crate::error::BeaconError;
use crate::metrics;
use crate::rpc::{PeerId, RemoteInvoker};
use crate::shard::cache::{DeadLease, ShardIds};
use crate::shard::notify::{DeadCallbacks, RetryPolicy};
use crate::shard::state::{DeadHook, LeaseSettings, ShardSnapshot, ShardState};

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lease protocol for one channel
pub struct ShardPool {
    channel: String,
    settings: LeaseSettings,
    state: RwLock<Arc<ShardState>>,
    callbacks: Arc<DeadCallbacks>,
}

impl ShardPool {
    /// Create a pool with IDs `0..shard_count` available
    ///
    /// # Arguments
    /// * `channel` - Channel (bot cluster) name
    /// * `shard_count` - Size of the shard ID range
    /// * `settings` - Lease lifetime and sweep period
    /// * `invoker` - Transport used to call dead-lease subscribers
    /// * `retry` - Delivery retry budget for dead-lease notifications
    pub fn new(
        channel: &str,
        shard_count: u32,
        settings: LeaseSettings,
        invoker: Arc<dyn RemoteInvoker>,
        retry: RetryPolicy,
    ) -> Self {
        let callbacks = Arc::new(DeadCallbacks::new(channel, invoker, retry));
        let state = Self::build_state(channel, shard_count, settings, &callbacks);

        info!(channel, shard_count, "Shard pool created");

        Self {
            channel: channel.to_string(),
            settings,
            state: RwLock::new(Arc::new(state)),
            callbacks,
        }
    }

    fn build_state(
        channel: &str,
        shard_count: u32,
        settings: LeaseSettings,
        callbacks: &Arc<DeadCallbacks>,
    ) -> ShardState {
        let callbacks = Arc::clone(callbacks);
        let hook: DeadHook = Arc::new(move |lease: &DeadLease| callbacks.notify(lease));
        ShardState::new(channel, shard_count, settings, vec![hook])
    }

    /// Get the channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn current(&self) -> Arc<ShardState> {
        let slot = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot)
    }

    /// Fresh lease signature: channel, random component and timestamp
    fn signature(&self) -> String {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        format!("{}_{}_{}", self.channel, Uuid::new_v4(), timestamp)
    }

    /// Lease up to `count` shard IDs.
    ///
    /// Grants `min(count, available)` IDs. A partial grant is NOT an error:
    /// callers must compare the length of the returned list with what they
    /// asked for. Only a completely empty pool fails, with `NoCapacity`.
    pub async fn acquire(&self, count: u64) -> Result<(String, ShardIds), BeaconError> {
        if count == 0 {
            return Err(BeaconError::InvalidCount { count });
        }
        let wanted = usize::try_from(count).unwrap_or(usize::MAX);

        let state = self.current();
        let mut guard = state.lock().await;

        if guard.available().is_empty() {
            return Err(BeaconError::NoCapacity {
                channel: self.channel.clone(),
            });
        }

        let shard_ids = guard.take(wanted);
        let signature = self.signature();
        guard.register_lease(signature.clone(), Arc::clone(&shard_ids));
        drop(guard);

        if shard_ids.len() < wanted {
            debug!(
                channel = %self.channel,
                requested = count,
                granted = shard_ids.len(),
                "Partial shard grant"
            );
        }
        info!(channel = %self.channel, %signature, ?shard_ids, "Lease acquired");
        metrics::record_lease_acquired(&self.channel, shard_ids.len());

        Ok((signature, shard_ids))
    }

    /// Return a lease's IDs to the pool. Dead-lease subscribers are not
    /// notified for explicit releases.
    pub async fn release(&self, signature: &str) -> Result<(), BeaconError> {
        let state = self.current();
        let mut guard = state.lock().await;

        let shard_ids = guard
            .reclaim(signature)
            .ok_or_else(|| BeaconError::UnknownSignature {
                signature: signature.to_string(),
            })?;
        drop(guard);

        info!(channel = %self.channel, signature, ?shard_ids, "Lease released");
        metrics::record_lease_released(&self.channel);
        Ok(())
    }

    /// Extend a lease by one lifetime from now.
    ///
    /// Must be called more often than the lease lifetime (30s by default).
    /// `LeaseExpired` means the deadline already passed and the shards may
    /// belong to someone else: the caller must stop working on them.
    pub async fn process_heartbeat(&self, signature: &str) -> Result<(), BeaconError> {
        let state = self.current();
        let mut guard = state.lock().await;

        let lease = guard
            .lease(signature)
            .ok_or_else(|| BeaconError::UnknownSignature {
                signature: signature.to_string(),
            })?;

        if lease.is_dead(Instant::now()) {
            warn!(channel = %self.channel, signature, "Heartbeat after lease deadline");
            return Err(BeaconError::LeaseExpired {
                signature: signature.to_string(),
            });
        }

        guard.renew(signature);
        drop(guard);

        debug!(channel = %self.channel, signature, "Heartbeat processed");
        metrics::record_heartbeat(&self.channel);
        Ok(())
    }

    /// Replace the shard state with a fresh one holding `0..shard_count`.
    ///
    /// Outstanding leases are discarded without notifying their holders or
    /// the dead-lease subscribers; a holder finds out on its next heartbeat
    /// (`UnknownSignature`). Racing this against live leases can hand the
    /// same shard to two clients until the old holder heartbeats.
    pub async fn reset(&self, shard_count: u32) {
        let fresh = Arc::new(Self::build_state(
            &self.channel,
            shard_count,
            self.settings,
            &self.callbacks,
        ));

        let old = {
            let mut slot = self.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, fresh)
        };
        old.teardown().await;

        info!(channel = %self.channel, shard_count, "Shard pool reset");
    }

    /// Lock-free, possibly stale view of `(used, not_used)`
    pub fn snapshot(&self) -> Arc<ShardSnapshot> {
        self.current().bypass_snapshot()
    }

    /// Register `route` on `peer` for dead-lease notifications
    pub fn add_dead_callback(&self, peer: &str, route: &str) {
        if self.callbacks.add(peer, route) {
            debug!(channel = %self.channel, peer, route, "Dead callback registered");
        }
    }

    /// Unregister `route` on `peer`; unknown pairs are ignored
    pub fn remove_dead_callback(&self, peer: &str, route: &str) {
        if self.callbacks.remove(peer, route) {
            debug!(channel = %self.channel, peer, route, "Dead callback removed");
        }
    }

    /// Registered `(peer, route)` dead-lease callbacks
    #[cfg(test)]
    pub fn dead_callbacks(&self) -> Vec<(PeerId, String)> {
        self.callbacks.registrations()
    }

    /// Drop all dead-lease registrations of a disconnected peer
    pub fn on_subscriber_disconnect(&self, peer: &str) {
        let removed = self.callbacks.remove_subscriber(peer);
        if removed > 0 {
            debug!(channel = %self.channel, peer, removed, "Dead callbacks dropped on disconnect");
        }
    }

    /// Stop the expiry sweeper and drop all leases
    pub async fn teardown(&self) {
        self.current().teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::shards_available;
    use crate::shard::notify::tests::RecordingInvoker;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn pool(shard_count: u32, invoker: Arc<RecordingInvoker>) -> ShardPool {
        ShardPool::new(
            "main",
            shard_count,
            LeaseSettings::default(),
            invoker,
            RetryPolicy::default(),
        )
    }

    fn assert_partition(pool: &ShardPool, shard_count: u32) {
        let snapshot = pool.snapshot();
        let mut all = snapshot.not_used.clone();
        for ids in snapshot.used.values() {
            all.extend(ids);
        }
        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "shard leased twice: {snapshot:?}");
        all.sort_unstable();
        assert_eq!(all, (0..shard_count).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_walkthrough() {
        let invoker = RecordingInvoker::ok();
        let pool = pool(4, invoker.clone());
        pool.add_dead_callback("bot-1", "on_dead");

        let (sig_a, ids) = pool.acquire(3).await.unwrap();
        assert_eq!(&*ids, &[0, 1, 2]);
        assert_eq!(pool.snapshot().not_used, vec![3]);

        let (sig_b, ids) = pool.acquire(3).await.unwrap();
        assert_eq!(&*ids, &[3]);
        assert_partition(&pool, 4);

        let err = pool.acquire(1).await.unwrap_err();
        assert!(matches!(err, BeaconError::NoCapacity { .. }));

        pool.release(&sig_a).await.unwrap();
        assert_eq!(pool.snapshot().not_used, vec![0, 1, 2]);

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            pool.process_heartbeat(&sig_b).await.unwrap();
        }
        assert!(pool.snapshot().used.contains_key(&sig_b));

        tokio::time::sleep(Duration::from_secs(32)).await;
        let snapshot = pool.snapshot();
        assert!(snapshot.used.is_empty());
        assert_eq!(snapshot.not_used, vec![0, 1, 2, 3]);

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "bot-1");
        assert_eq!(calls[0].1, "on_dead");
        assert_eq!(calls[0].2, vec![json!(sig_b), json!([3])]);

        let err = pool.process_heartbeat(&sig_b).await.unwrap_err();
        assert!(matches!(err, BeaconError::UnknownSignature { .. }));
    }

    #[tokio::test]
    async fn test_acquire_zero_is_rejected_without_mutation() {
        let pool = pool(2, RecordingInvoker::ok());
        let err = pool.acquire(0).await.unwrap_err();
        assert!(matches!(err, BeaconError::InvalidCount { count: 0 }));
        assert_eq!(pool.snapshot().not_used, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_no_capacity_causes_no_mutation() {
        let pool = pool(1, RecordingInvoker::ok());
        let (sig, _) = pool.acquire(5).await.unwrap();
        let before = pool.snapshot();

        assert!(pool.acquire(1).await.is_err());
        assert_eq!(pool.snapshot(), before);
        assert!(before.used.contains_key(&sig));
    }

    #[tokio::test]
    async fn test_signatures_are_unique() {
        let pool = pool(64, RecordingInvoker::ok());
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let (sig, _) = pool.acquire(1).await.unwrap();
            assert!(sig.starts_with("main_"));
            pool.release(&sig).await.unwrap();
            assert!(seen.insert(sig));
        }
    }

    #[tokio::test]
    async fn test_released_signature_is_unknown_afterwards() {
        let invoker = RecordingInvoker::ok();
        let pool = pool(3, invoker.clone());
        pool.add_dead_callback("bot-1", "on_dead");
        let (sig, _) = pool.acquire(2).await.unwrap();

        pool.release(&sig).await.unwrap();

        assert!(matches!(
            pool.release(&sig).await,
            Err(BeaconError::UnknownSignature { .. })
        ));
        assert!(matches!(
            pool.process_heartbeat(&sig).await,
            Err(BeaconError::UnknownSignature { .. })
        ));
        tokio::task::yield_now().await;
        assert!(invoker.calls().is_empty(), "release must not notify");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_deadline_is_lease_expired() {
        let settings = LeaseSettings {
            lifetime: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3600),
        };
        let pool = ShardPool::new(
            "main",
            2,
            settings,
            RecordingInvoker::ok(),
            RetryPolicy::default(),
        );
        let (sig, _) = pool.acquire(1).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(matches!(
            pool.process_heartbeat(&sig).await,
            Err(BeaconError::LeaseExpired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_leases_silently() {
        let invoker = RecordingInvoker::ok();
        let pool = pool(4, invoker.clone());
        pool.add_dead_callback("bot-1", "on_dead");
        let (sig, _) = pool.acquire(2).await.unwrap();

        pool.reset(6).await;

        let snapshot = pool.snapshot();
        assert!(snapshot.used.is_empty());
        assert_eq!(snapshot.not_used, vec![0, 1, 2, 3, 4, 5]);
        assert!(matches!(
            pool.process_heartbeat(&sig).await,
            Err(BeaconError::UnknownSignature { .. })
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_available_gauge_follows_reset() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _local = ::metrics::set_default_local_recorder(&recorder);

        let pool = pool(4, RecordingInvoker::ok());
        assert_eq!(shards_available(&handle.render(), "main"), Some(4.0));

        pool.acquire(1).await.unwrap();
        assert_eq!(shards_available(&handle.render(), "main"), Some(3.0));

        pool.reset(6).await;
        assert_eq!(pool.snapshot().not_used.len(), 6);
        assert_eq!(shards_available(&handle.render(), "main"), Some(6.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_notifications() {
        let invoker = RecordingInvoker::ok();
        let pool = pool(2, invoker.clone());
        pool.add_dead_callback("bot-1", "on_dead");
        pool.add_dead_callback("bot-2", "on_dead");
        pool.on_subscriber_disconnect("bot-1");

        pool.acquire(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(32)).await;

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "bot-2");
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_overlap() {
        let pool = Arc::new(pool(50, RecordingInvoker::ok()));
        let mut handles = Vec::new();
        for i in 0..20u64 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.acquire(i % 4 + 1).await }));
        }

        let mut granted = Vec::new();
        for handle in handles {
            if let Ok((_, ids)) = handle.await.unwrap() {
                granted.extend(ids.iter().copied());
            }
        }

        let unique: HashSet<u32> = granted.iter().copied().collect();
        assert_eq!(unique.len(), granted.len());
        assert_partition(&pool, 50);
    }
}
