//! Route handlers for the collaborative sync server.
//!
//! The HTTP surface is deliberately small: a health check and the WebSocket
//! upgrade. Everything stateful happens over the socket.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::{Json, Response},
    routing::get,
};
use serde::Serialize;
use tracing::info;

use crate::server::hub::Hub;
use crate::server::websocket::handle_connection;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: u64,
    pub documents: usize,
}

/// Basic health check endpoint
pub async fn health(State(hub): State<Arc<Hub>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: hub.node_id(),
        documents: hub.document_count(),
    })
}

/// WebSocket upgrade handler for collaborative sessions
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    info!("websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_connection(socket, hub))
}

/// Creates and configures the main application router
pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(hub)
}
