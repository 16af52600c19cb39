//! Connection hub
//!
//! Tracks the outbound queue of every live peer and the beacon's own
//! in-flight requests, so shard pools can call routes on clients.

use crate::error::InvokeError;
use crate::rpc::frame::{Frame, Outcome, Request, Response};
use crate::rpc::{PeerId, RemoteInvoker};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct Pending {
    peer: PeerId,
    reply: oneshot::Sender<Response>,
}

/// Live peers and pending server-to-client requests
pub struct ConnectionHub {
    peers: DashMap<PeerId, mpsc::UnboundedSender<Frame>>,
    pending: DashMap<String, Pending>,
    request_timeout: Duration,
}

impl ConnectionHub {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            pending: DashMap::new(),
            request_timeout,
        }
    }

    /// Claim `peer` and get the queue of frames to write to its socket.
    /// Returns None if a peer with this id is already connected.
    pub fn register(&self, peer: &str) -> Option<mpsc::UnboundedReceiver<Frame>> {
        match self.peers.entry(peer.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                Some(rx)
            }
        }
    }

    /// Forget `peer` and fail its in-flight requests with `ConnectionClosed`
    pub fn unregister(&self, peer: &str) {
        self.peers.remove(peer);
        // Dropping the reply senders wakes the waiters
        self.pending.retain(|_, pending| pending.peer != peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue a frame for `peer`
    pub fn send(&self, peer: &str, frame: Frame) -> Result<(), InvokeError> {
        let tx = self
            .peers
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InvokeError::NotConnected {
                peer: peer.to_string(),
            })?;

        tx.send(frame).map_err(|_| InvokeError::ConnectionClosed {
            peer: peer.to_string(),
        })
    }

    /// Hand a reply from `peer` to the request waiting for it.
    /// Returns false for unknown ids or replies from the wrong peer.
    pub fn complete(&self, peer: &str, response: Response) -> bool {
        let Some((_, pending)) = self
            .pending
            .remove_if(&response.id, |_, pending| pending.peer == peer)
        else {
            return false;
        };
        pending.reply.send(response).is_ok()
    }
}

#[async_trait]
impl RemoteInvoker for ConnectionHub {
    async fn request(&self, peer: &str, route: &str, args: Vec<Value>) -> Result<Value, InvokeError> {
        let request = Request::new(route, args);
        let id = request.id.clone();

        let (reply, waiter) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Pending {
                peer: peer.to_string(),
                reply,
            },
        );

        if let Err(e) = self.send(peer, Frame::Request(request)) {
            self.pending.remove(&id);
            return Err(e);
        }
        debug!(peer, route, %id, "Request sent to peer");

        let outcome = tokio::time::timeout(self.request_timeout, waiter).await;
        self.pending.remove(&id);

        match outcome {
            Err(_) => Err(InvokeError::Timeout {
                peer: peer.to_string(),
                route: route.to_string(),
            }),
            Ok(Err(_)) => Err(InvokeError::ConnectionClosed {
                peer: peer.to_string(),
            }),
            Ok(Ok(response)) => match response.outcome {
                Outcome::Ok { result } => Ok(result),
                Outcome::Error { kind, message } => Err(InvokeError::Remote {
                    peer: peer.to_string(),
                    route: route.to_string(),
                    kind,
                    message,
                }),
            },
        }
    }
}
