//! Shard lease management
//!
//! Per-channel pools of shard IDs leased to bot processes, kept alive by
//! heartbeats and reclaimed on expiry.

mod cache;
mod notify;
mod pool;
mod registry;
mod state;

pub use notify::RetryPolicy;
pub use registry::PoolRegistry;
pub use state::{LeaseSettings, ShardSnapshot};

#[cfg(test)]
pub(crate) use notify::tests::RecordingInvoker;
