//! Pool registry
//!
//! Channel name → `ShardPool`, populated by `setup_shard_pool` requests.

use crate::error::BeaconError;
use crate::rpc::RemoteInvoker;
use crate::shard::notify::RetryPolicy;
use crate::shard::pool::ShardPool;
use crate::shard::state::{LeaseSettings, ShardSnapshot};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// All configured shard pools
pub struct PoolRegistry {
    pools: DashMap<String, Arc<ShardPool>>,
    settings: LeaseSettings,
    retry: RetryPolicy,
    invoker: Arc<dyn RemoteInvoker>,
}

#[allow(clippy::len_without_is_empty)]
impl PoolRegistry {
    pub fn new(settings: LeaseSettings, retry: RetryPolicy, invoker: Arc<dyn RemoteInvoker>) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
            retry,
            invoker,
        }
    }

    /// Create the pool for `channel`, replacing (and tearing down) any
    /// existing one. Leases and dead-callback registrations of the old pool
    /// are dropped.
    pub async fn setup(&self, channel: &str, shard_count: u32) -> Arc<ShardPool> {
        let pool = Arc::new(ShardPool::new(
            channel,
            shard_count,
            self.settings,
            Arc::clone(&self.invoker),
            self.retry,
        ));

        let previous = self.pools.insert(channel.to_string(), Arc::clone(&pool));
        if let Some(previous) = previous {
            info!(channel, shard_count, "Replacing existing shard pool");
            previous.teardown().await;
        }

        pool
    }

    /// Pool for `channel`, or `ChannelNotReady`
    pub fn get(&self, channel: &str) -> Result<Arc<ShardPool>, BeaconError> {
        self.pools
            .get(channel)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BeaconError::ChannelNotReady {
                channel: channel.to_string(),
            })
    }

    /// Number of configured channels
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    fn pools(&self) -> Vec<Arc<ShardPool>> {
        self.pools.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Bypass snapshot of every channel, keyed by channel name
    pub fn snapshots(&self) -> BTreeMap<String, Arc<ShardSnapshot>> {
        self.pools()
            .into_iter()
            .map(|pool| (pool.channel().to_string(), pool.snapshot()))
            .collect()
    }

    /// Forward a peer disconnect to every pool
    pub fn on_subscriber_disconnect(&self, peer: &str) {
        for pool in self.pools() {
            pool.on_subscriber_disconnect(peer);
        }
    }

    /// Tear down every pool (shutdown)
    pub async fn teardown_all(&self) {
        for pool in self.pools() {
            pool.teardown().await;
        }
        self.pools.clear();
    }
}
