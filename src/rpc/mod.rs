//! JSON-over-WebSocket RPC
//!
//! Peers and the beacon exchange request/response frames over one socket.
//! Either side may call a named route on the other.

pub mod frame;
mod hub;
pub mod routes;
mod server;

pub use hub::ConnectionHub;
pub use routes::RouteContext;
pub use server::{router, ServerState};

use crate::error::InvokeError;
use async_trait::async_trait;
use serde_json::Value;

/// Identity of a connected peer (its `X-Client-Id`, or an assigned UUID)
pub type PeerId = String;

/// Calls a route on a connected peer and waits for its reply
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn request(&self, peer: &str, route: &str, args: Vec<Value>) -> Result<Value, InvokeError>;
}
