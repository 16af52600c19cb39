//! Domain error types for the shard beacon
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All application code returns Result<T, BeaconError>.

use thiserror::Error;

/// Beacon domain errors
///
/// Every lease-protocol variant is returned synchronously to the remote
/// caller. The `error_type_label()` doubles as the `kind` field of an error
/// reply frame so clients can branch without parsing message strings.
///
/// ```text
/// BeaconError::NoCapacity { channel: "main" }
/// → kind "no_capacity", message "no shards left in pool 'main'"
/// ```
#[derive(Error, Debug)]
pub enum BeaconError {
    /// `acquire` on a pool whose available set is empty
    #[error("no shards left in pool '{channel}'")]
    NoCapacity { channel: String },

    /// Release/heartbeat for a signature that is not (or no longer) leased
    #[error("unknown lease signature '{signature}'")]
    UnknownSignature { signature: String },

    /// Heartbeat arrived after the deadline but before the sweeper reclaimed it.
    /// The holder must assume another client may already own these shards.
    #[error("lease '{signature}' has expired")]
    LeaseExpired { signature: String },

    /// Operation addressed to a channel with no configured pool
    #[error("shard pool for channel '{channel}' is not set up yet")]
    ChannelNotReady { channel: String },

    /// `acquire` with a non-positive count
    #[error("shard count must be positive, got {count}")]
    InvalidCount { count: u64 },

    /// No handler is registered under this route name
    #[error("unknown route '{route}'")]
    UnknownRoute { route: String },

    /// Route arguments did not match the expected shape
    #[error("bad arguments for route '{route}': {reason}")]
    BadArguments { route: String, reason: String },

    /// Reply payload could not be serialized
    #[error("failed to serialize {what}")]
    SerializationFailed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Connection presented no bearer token or a wrong one
    #[error("missing or invalid bearer credential")]
    Unauthorized,

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Prometheus recorder could not be installed
    #[error("failed to install metrics recorder")]
    MetricsInstall(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BeaconError {
    /// Returns a static label string suitable for Prometheus metrics and
    /// the `kind` field of error replies.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::NoCapacity { .. } => "no_capacity",
            Self::UnknownSignature { .. } => "unknown_signature",
            Self::LeaseExpired { .. } => "lease_expired",
            Self::ChannelNotReady { .. } => "channel_not_ready",
            Self::InvalidCount { .. } => "invalid_count",
            Self::UnknownRoute { .. } => "unknown_route",
            Self::BadArguments { .. } => "bad_arguments",
            Self::SerializationFailed { .. } => "serialization",
            Self::Unauthorized => "unauthorized",
            Self::Config(_) => "config",
            Self::MetricsInstall(_) => "metrics_install",
        }
    }

    pub(crate) fn bad_arguments(route: &str, reason: impl Into<String>) -> Self {
        Self::BadArguments {
            route: route.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of a server-to-client request
///
/// Everything except `Remote` is a transport failure and may be retried;
/// `Remote` means the peer received the call and its handler failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// No live connection for this peer id
    #[error("peer '{peer}' is not connected")]
    NotConnected { peer: String },

    /// The peer did not answer in time
    #[error("request '{route}' to peer '{peer}' timed out")]
    Timeout { peer: String, route: String },

    /// The connection went away before the reply arrived
    #[error("connection to peer '{peer}' closed before reply")]
    ConnectionClosed { peer: String },

    /// The peer answered with an error reply
    #[error("peer '{peer}' failed route '{route}' ({kind}): {message}")]
    Remote {
        peer: String,
        route: String,
        kind: String,
        message: String,
    },
}

impl InvokeError {
    /// True for failures where a later attempt may succeed
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Remote { .. })
    }
}
