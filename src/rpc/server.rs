//! WebSocket endpoint
//!
//! Authenticates the upgrade request, then runs one read loop and one
//! writer task per peer until the socket closes.

use crate::auth::BearerAuth;
use crate::metrics;
use crate::rpc::frame::{Frame, Request, Response};
use crate::rpc::hub::ConnectionHub;
use crate::rpc::routes::RouteContext;
use crate::rpc::PeerId;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header a peer may use to choose its own identity
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared state of the RPC endpoint
#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<ConnectionHub>,
    pub routes: Arc<RouteContext>,
    pub auth: Arc<BearerAuth>,
}

/// Create the RPC router (WebSocket upgrade at `/`)
pub fn router(state: ServerState) -> Router {
    Router::new().route("/", get(upgrade_handler)).with_state(state)
}

async fn upgrade_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> HttpResponse {
    let (peer, outbound) = match admit(&state, &headers) {
        Ok(admitted) => admitted,
        Err(status) => return status.into_response(),
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            state.hub.unregister(&peer);
            return rejection.into_response();
        }
    };

    let hub = Arc::clone(&state.hub);
    let failed_peer = peer.clone();
    upgrade
        .on_failed_upgrade(move |error| {
            warn!(peer = %failed_peer, %error, "WebSocket upgrade failed");
            hub.unregister(&failed_peer);
        })
        .on_upgrade(move |socket| serve_peer(socket, peer, outbound, state))
}

/// Authenticate the request and claim its peer id
fn admit(
    state: &ServerState,
    headers: &HeaderMap,
) -> Result<(PeerId, mpsc::UnboundedReceiver<Frame>), StatusCode> {
    if state.auth.verify(headers).is_err() {
        info!("Rejected connection with invalid credentials");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let peer: PeerId = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state.hub.register(&peer) {
        Some(outbound) => Ok((peer, outbound)),
        None => {
            warn!(%peer, "Rejected connection: peer id already connected");
            Err(StatusCode::CONFLICT)
        }
    }
}

async fn serve_peer(
    socket: WebSocket,
    peer: PeerId,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    state: ServerState,
) {
    info!(%peer, "Peer connected");
    metrics::set_peers_connected(state.hub.peer_count());

    let (mut sink, mut stream) = socket.split();

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %writer_peer, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket read failed");
                break;
            }
        };

        let frame = match &message {
            Message::Text(text) => serde_json::from_str::<Frame>(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice::<Frame>(bytes),
            Message::Close(_) => break,
            _ => continue,
        };

        match frame {
            Ok(frame) => handle_frame(&state, &peer, frame),
            Err(e) => warn!(%peer, error = %e, "Dropping malformed frame"),
        }
    }

    // Disconnect event: pending requests fail, dead callbacks are dropped
    state.hub.unregister(&peer);
    state.routes.registry.on_subscriber_disconnect(&peer);
    writer.abort();

    metrics::set_peers_connected(state.hub.peer_count());
    info!(%peer, "Peer disconnected");
}

fn handle_frame(state: &ServerState, peer: &str, frame: Frame) {
    match frame {
        Frame::Request(request) => {
            let state = state.clone();
            let peer = peer.to_string();
            tokio::spawn(async move {
                let response = answer(&state.routes, &peer, request).await;
                if let Err(e) = state.hub.send(&peer, Frame::Response(response)) {
                    debug!(%peer, error = %e, "Reply dropped");
                }
            });
        }
        Frame::Response(response) => {
            if !state.hub.complete(peer, response) {
                debug!(peer, "Ignoring reply to unknown request");
            }
        }
    }
}

async fn answer(routes: &RouteContext, peer: &str, request: Request) -> Response {
    match routes.dispatch(peer, &request.route, &request.args).await {
        Ok(result) => {
            metrics::record_request(&request.route, "ok");
            Response::ok(request.id, result)
        }
        Err(e) => {
            debug!(peer, route = %request.route, error = %e, "Request failed");
            metrics::record_request(&request.route, e.error_type_label());
            Response::error(request.id, &e)
        }
    }
}
