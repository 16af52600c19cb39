//! Prometheus metrics module
//!
//! Recording functions are free functions over the global `metrics`
//! recorder so the shard core can record without holding a handle. They are
//! no-ops until `BeaconMetrics::install` has run (e.g. in unit tests).

use crate::error::BeaconError;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Handle to the installed Prometheus recorder
#[derive(Clone)]
pub struct BeaconMetrics {
    handle: Arc<PrometheusHandle>,
}

impl BeaconMetrics {
    /// Install the global recorder and register metric descriptions
    pub fn install() -> Result<Self, BeaconError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| BeaconError::MetricsInstall(Box::new(e)))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "beacon_leases_acquired_total",
            Unit::Count,
            "Leases granted by acquire"
        );
        describe_counter!(
            "beacon_shards_granted_total",
            Unit::Count,
            "Shard IDs handed out across all leases"
        );
        describe_counter!(
            "beacon_leases_released_total",
            Unit::Count,
            "Leases returned by explicit release"
        );
        describe_counter!(
            "beacon_leases_expired_total",
            Unit::Count,
            "Leases reclaimed after a missed heartbeat"
        );
        describe_counter!(
            "beacon_heartbeats_total",
            Unit::Count,
            "Successful lease heartbeats"
        );
        describe_counter!(
            "beacon_dead_callbacks_delivered_total",
            Unit::Count,
            "Dead-lease notifications acknowledged by a subscriber"
        );
        describe_counter!(
            "beacon_dead_callbacks_failed_total",
            Unit::Count,
            "Dead-lease notifications dropped after the retry budget"
        );
        describe_counter!(
            "beacon_rpc_requests_total",
            Unit::Count,
            "Inbound RPC requests by route and outcome"
        );

        describe_gauge!(
            "beacon_shards_available",
            Unit::Count,
            "Shard IDs not held by any lease"
        );
        describe_gauge!(
            "beacon_peers_connected",
            Unit::Count,
            "Authenticated WebSocket peers"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a granted lease
pub fn record_lease_acquired(channel: &str, shard_count: usize) {
    counter!("beacon_leases_acquired_total", "channel" => channel.to_string()).increment(1);
    counter!("beacon_shards_granted_total", "channel" => channel.to_string())
        .increment(shard_count as u64);
}

/// Record an explicit release
pub fn record_lease_released(channel: &str) {
    counter!("beacon_leases_released_total", "channel" => channel.to_string()).increment(1);
}

/// Record a lease reclaimed by the sweeper
pub fn record_lease_expired(channel: &str) {
    counter!("beacon_leases_expired_total", "channel" => channel.to_string()).increment(1);
}

/// Record heartbeat
pub fn record_heartbeat(channel: &str) {
    // Heartbeats are frequent; a counter is enough
    counter!("beacon_heartbeats_total", "channel" => channel.to_string()).increment(1);
}

/// Set available shard count for a channel
pub fn set_shards_available(channel: &str, count: usize) {
    gauge!("beacon_shards_available", "channel" => channel.to_string()).set(count as f64);
}

/// Record the final outcome of one dead-lease notification
pub fn record_dead_callback(channel: &str, delivered: bool) {
    let name = if delivered {
        "beacon_dead_callbacks_delivered_total"
    } else {
        "beacon_dead_callbacks_failed_total"
    };
    counter!(name, "channel" => channel.to_string()).increment(1);
}

/// Record an inbound request; `outcome` is "ok" or an error type label
pub fn record_request(route: &str, outcome: &'static str) {
    counter!(
        "beacon_rpc_requests_total",
        "route" => route.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Set connected peer count
pub fn set_peers_connected(count: usize) {
    gauge!("beacon_peers_connected").set(count as f64);
}
