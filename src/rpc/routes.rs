//! Route table
//!
//! Every route the beacon answers is listed here. `shard.pool.*` routes take
//! the channel name as their first argument; the remaining arguments are
//! those of the pool operation.

use crate::data::SharedData;
use crate::error::BeaconError;
use crate::shard::PoolRegistry;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// `[channel, shard_count]` → creates or replaces the channel's pool
pub const SETUP_SHARD_POOL: &str = "setup_shard_pool";

/// `[op, ...]` → shared key/value store
pub const DATA: &str = "data";

/// Default ceiling for `shard_count` arguments
pub const MAX_SHARD_COUNT: u32 = 65_536;

/// Shard pool operations, addressed as `shard.pool.<name>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Acquire,
    Release,
    ProcessHeartbeat,
    Reset,
    Get,
    AddDeadCallback,
    RemoveDeadCallback,
}

impl PoolOp {
    pub const ALL: [PoolOp; 7] = [
        PoolOp::Acquire,
        PoolOp::Release,
        PoolOp::ProcessHeartbeat,
        PoolOp::Reset,
        PoolOp::Get,
        PoolOp::AddDeadCallback,
        PoolOp::RemoveDeadCallback,
    ];

    /// Full route name
    pub fn route(self) -> &'static str {
        match self {
            PoolOp::Acquire => "shard.pool.acquire",
            PoolOp::Release => "shard.pool.release",
            PoolOp::ProcessHeartbeat => "shard.pool.process_heartbeat",
            PoolOp::Reset => "shard.pool.reset",
            PoolOp::Get => "shard.pool.get",
            PoolOp::AddDeadCallback => "shard.pool.add_dead_callback",
            PoolOp::RemoveDeadCallback => "shard.pool.remove_dead_callback",
        }
    }

    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.route() == route)
    }
}

/// Everything a route handler can reach
pub struct RouteContext {
    pub registry: Arc<PoolRegistry>,
    pub data: Arc<SharedData>,
    max_shard_count: u32,
}

impl RouteContext {
    pub fn new(registry: Arc<PoolRegistry>, data: Arc<SharedData>) -> Self {
        Self {
            registry,
            data,
            max_shard_count: MAX_SHARD_COUNT,
        }
    }

    /// Reject `setup_shard_pool`/`reset` sizes above `max`
    pub fn with_max_shard_count(mut self, max: u32) -> Self {
        self.max_shard_count = max;
        self
    }

    fn shard_count(&self, route: &str, args: &[Value], index: usize) -> Result<u32, BeaconError> {
        let shard_count: u32 = arg(route, args, index)?;
        if shard_count > self.max_shard_count {
            return Err(BeaconError::bad_arguments(
                route,
                format!(
                    "shard count {shard_count} exceeds the limit of {}",
                    self.max_shard_count
                ),
            ));
        }
        Ok(shard_count)
    }

    /// Run `route` on behalf of `caller`
    pub async fn dispatch(
        &self,
        caller: &str,
        route: &str,
        args: &[Value],
    ) -> Result<Value, BeaconError> {
        match route {
            SETUP_SHARD_POOL => {
                let channel: String = arg(route, args, 0)?;
                let shard_count = self.shard_count(route, args, 1)?;
                self.registry.setup(&channel, shard_count).await;
                Ok(Value::Null)
            }
            DATA => self.data.apply(args),
            _ => {
                let op = PoolOp::from_route(route).ok_or_else(|| BeaconError::UnknownRoute {
                    route: route.to_string(),
                })?;
                let channel: String = arg(route, args, 0)?;
                self.route_to(&channel, op, caller, &args[1..]).await
            }
        }
    }

    /// Run a pool operation against `channel`'s pool
    pub async fn route_to(
        &self,
        channel: &str,
        op: PoolOp,
        caller: &str,
        args: &[Value],
    ) -> Result<Value, BeaconError> {
        let pool = self.registry.get(channel)?;
        let route = op.route();

        match op {
            PoolOp::Acquire => {
                let count: u64 = arg(route, args, 0)?;
                let (signature, shard_ids) = pool.acquire(count).await?;
                Ok(json!([signature, shard_ids.to_vec()]))
            }
            PoolOp::Release => {
                let signature: String = arg(route, args, 0)?;
                pool.release(&signature).await?;
                Ok(Value::Null)
            }
            PoolOp::ProcessHeartbeat => {
                let signature: String = arg(route, args, 0)?;
                pool.process_heartbeat(&signature).await?;
                Ok(Value::Null)
            }
            PoolOp::Reset => {
                let shard_count = self.shard_count(route, args, 0)?;
                pool.reset(shard_count).await;
                Ok(Value::Null)
            }
            PoolOp::Get => {
                let snapshot = pool.snapshot();
                let text = serde_json::to_string(&*snapshot).map_err(|source| {
                    BeaconError::SerializationFailed {
                        what: "shard snapshot",
                        source,
                    }
                })?;
                Ok(Value::String(text))
            }
            PoolOp::AddDeadCallback => {
                let callback: String = arg(route, args, 0)?;
                pool.add_dead_callback(caller, &callback);
                Ok(Value::Null)
            }
            PoolOp::RemoveDeadCallback => {
                let callback: String = arg(route, args, 0)?;
                pool.remove_dead_callback(caller, &callback);
                Ok(Value::Null)
            }
        }
    }
}

/// Positional argument `index`, deserialized
pub(crate) fn arg<T: DeserializeOwned>(
    route: &str,
    args: &[Value],
    index: usize,
) -> Result<T, BeaconError> {
    let value = args
        .get(index)
        .ok_or_else(|| BeaconError::bad_arguments(route, format!("missing argument {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| BeaconError::bad_arguments(route, format!("argument {index}: {e}")))
}
