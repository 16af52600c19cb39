//! Dead-lease notification fan-out
//!
//! Remote subscribers register route names per channel. When a lease in the
//! channel expires, every registered route is called on its subscriber with
//! `[signature, [shard_ids...]]`, each delivery on its own task with a
//! bounded exponential-backoff retry.

use crate::error::InvokeError;
use crate::metrics;
use crate::rpc::{PeerId, RemoteInvoker};
use crate::shard::cache::DeadLease;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delivery attempts per notification
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before the second attempt; doubles for each later one
pub const BASE_DELAY: Duration = Duration::from_millis(500);

/// Retry budget for one dead-lease notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Per-channel registry of subscriber callback routes
pub struct DeadCallbacks {
    channel: String,
    routes: DashMap<PeerId, HashSet<String>>,
    invoker: Arc<dyn RemoteInvoker>,
    retry: RetryPolicy,
}

impl DeadCallbacks {
    pub fn new(channel: &str, invoker: Arc<dyn RemoteInvoker>, retry: RetryPolicy) -> Self {
        Self {
            channel: channel.to_string(),
            routes: DashMap::new(),
            invoker,
            retry,
        }
    }

    /// Register `route` for `peer`. Returns false if it was already registered.
    pub fn add(&self, peer: &str, route: &str) -> bool {
        self.routes
            .entry(peer.to_string())
            .or_default()
            .insert(route.to_string())
    }

    /// Unregister `route` for `peer`. Returns false if it was not registered.
    pub fn remove(&self, peer: &str, route: &str) -> bool {
        let removed = match self.routes.get_mut(peer) {
            Some(mut routes) => routes.remove(route),
            None => false,
        };
        self.routes.remove_if(peer, |_, routes| routes.is_empty());
        removed
    }

    /// Drop every registration of `peer`, returning how many there were
    pub fn remove_subscriber(&self, peer: &str) -> usize {
        self.routes
            .remove(peer)
            .map(|(_, routes)| routes.len())
            .unwrap_or(0)
    }

    /// All `(peer, route)` pairs currently registered
    pub fn registrations(&self) -> Vec<(PeerId, String)> {
        self.routes
            .iter()
            .flat_map(|entry| {
                let peer = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(move |route| (peer.clone(), route.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Spawn one delivery task per registration. Never blocks.
    pub fn notify(&self, lease: &DeadLease) {
        let args = vec![
            json!(lease.signature),
            json!(lease.shard_ids.to_vec()),
        ];

        for (peer, route) in self.registrations() {
            tokio::spawn(deliver(
                Arc::clone(&self.invoker),
                self.retry,
                self.channel.clone(),
                peer,
                route,
                args.clone(),
            ));
        }
    }
}

async fn deliver(
    invoker: Arc<dyn RemoteInvoker>,
    retry: RetryPolicy,
    channel: String,
    peer: PeerId,
    route: String,
    args: Vec<Value>,
) {
    let mut attempt = 1;
    loop {
        match invoker.request(&peer, &route, args.clone()).await {
            Ok(_) => {
                debug!(%channel, %peer, %route, attempt, "Dead-lease notification delivered");
                metrics::record_dead_callback(&channel, true);
                return;
            }
            Err(e) if e.is_transport() && attempt < retry.max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(
                    %channel,
                    %peer,
                    %route,
                    attempt,
                    ?delay,
                    error = %e,
                    "Dead-lease notification failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                give_up(&channel, &peer, &route, attempt, &e);
                return;
            }
        }
    }
}

fn give_up(channel: &str, peer: &str, route: &str, attempts: u32, error: &InvokeError) {
    warn!(
        channel,
        peer,
        route,
        attempts,
        error = %error,
        "Dead-lease notification dropped"
    );
    metrics::record_dead_callback(channel, false);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call; the first `fail_first` calls fail with `error`
    pub(crate) struct RecordingInvoker {
        pub calls: Mutex<Vec<(PeerId, String, Vec<Value>)>>,
        fail_first: usize,
        error: InvokeError,
    }

    impl RecordingInvoker {
        pub(crate) fn ok() -> Arc<Self> {
            Self::failing(0, InvokeError::NotConnected { peer: String::new() })
        }

        pub(crate) fn failing(fail_first: usize, error: InvokeError) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_first,
                error,
            })
        }

        pub(crate) fn calls(&self) -> Vec<(PeerId, String, Vec<Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteInvoker for RecordingInvoker {
        async fn request(
            &self,
            peer: &str,
            route: &str,
            args: Vec<Value>,
        ) -> Result<Value, InvokeError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((peer.to_string(), route.to_string(), args));
            if calls.len() <= self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(Value::Null)
            }
        }
    }

    fn dead(signature: &str, ids: &[u32]) -> DeadLease {
        DeadLease {
            signature: signature.to_string(),
            shard_ids: Arc::from(ids),
        }
    }

    fn timeout() -> InvokeError {
        InvokeError::Timeout {
            peer: "bot-1".into(),
            route: "on_dead".into(),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_after(1), Duration::from_millis(500));
        assert_eq!(retry.delay_after(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_after(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_add_remove_registrations() {
        let callbacks = DeadCallbacks::new("main", RecordingInvoker::ok(), RetryPolicy::default());

        assert!(callbacks.add("bot-1", "on_dead"));
        assert!(!callbacks.add("bot-1", "on_dead"));
        assert!(callbacks.add("bot-1", "on_dead_2"));
        assert!(callbacks.add("bot-2", "on_dead"));
        assert_eq!(callbacks.registrations().len(), 3);

        assert!(callbacks.remove("bot-1", "on_dead"));
        assert!(!callbacks.remove("bot-1", "on_dead"));
        assert!(!callbacks.remove("bot-9", "on_dead"));
        assert_eq!(callbacks.registrations().len(), 2);

        assert_eq!(callbacks.remove_subscriber("bot-1"), 1);
        assert_eq!(callbacks.remove_subscriber("bot-1"), 0);
        assert_eq!(
            callbacks.registrations(),
            vec![("bot-2".to_string(), "on_dead".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_calls_every_registration_once() {
        let invoker = RecordingInvoker::ok();
        let callbacks = DeadCallbacks::new("main", invoker.clone(), RetryPolicy::default());
        callbacks.add("bot-1", "on_dead");
        callbacks.add("bot-2", "on_dead");

        callbacks.notify(&dead("sigB", &[3]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut calls = invoker.calls();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "bot-1");
        assert_eq!(calls[1].0, "bot-2");
        for (_, route, args) in &calls {
            assert_eq!(route, "on_dead");
            assert_eq!(args, &vec![json!("sigB"), json!([3])]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_retried_until_success() {
        let invoker = RecordingInvoker::failing(2, timeout());
        let callbacks = DeadCallbacks::new("main", invoker.clone(), RetryPolicy::default());
        callbacks.add("bot-1", "on_dead");

        callbacks.notify(&dead("sig", &[0, 1]));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_budget() {
        let invoker = RecordingInvoker::failing(usize::MAX, timeout());
        let callbacks = DeadCallbacks::new("main", invoker.clone(), RetryPolicy::default());
        callbacks.add("bot-1", "on_dead");

        callbacks.notify(&dead("sig", &[0]));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(invoker.calls().len(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_is_not_retried() {
        let invoker = RecordingInvoker::failing(
            usize::MAX,
            InvokeError::Remote {
                peer: "bot-1".into(),
                route: "on_dead".into(),
                kind: "unknown_route".into(),
                message: "no such route".into(),
            },
        );
        let callbacks = DeadCallbacks::new("main", invoker.clone(), RetryPolicy::default());
        callbacks.add("bot-1", "on_dead");

        callbacks.notify(&dead("sig", &[0]));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_subscriber_gets_nothing() {
        let invoker = RecordingInvoker::ok();
        let callbacks = DeadCallbacks::new("main", invoker.clone(), RetryPolicy::default());
        callbacks.add("bot-1", "on_dead");
        callbacks.add("bot-1", "on_dead_again");
        callbacks.remove_subscriber("bot-1");

        callbacks.notify(&dead("sig", &[0]));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(invoker.calls().is_empty());
    }
}
