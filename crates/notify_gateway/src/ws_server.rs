//! WebSocket server handler using Axum.

use crate::auth::Authenticator;
use crate::client_ip;
use crate::config::ConnectionConfig;
use crate::hub::Hub;
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use metrics::counter;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

/// Shared application state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub authenticator: Authenticator,
    pub config: ConnectionConfig,
}

/// Create the HTTP router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// upgrade handler needs the peer address.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "connections": state.hub.len() }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let address = client_ip::resolve(&headers, peer.ip());
    let max = state.config.max_message_size;

    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, address, state))
}

/// Handshake a freshly upgraded connection.
///
/// On success the connection's actors own it from here on.
async fn handle_socket(socket: WebSocket, address: IpAddr, state: Arc<AppState>) {
    counter!("gateway_connections_total").increment(1);
    debug!("Connection upgraded for {}", address);

    let (sink, stream) = socket.split();
    if let Err(e) = state.authenticator.authenticate(sink, stream, address).await {
        info!("Connection from {} not registered: {}", address, e);
    }
}
