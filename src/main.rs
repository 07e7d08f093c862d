//! Main entry point for the collaborative sync server.
//!
//! Wires the hub together with an in-memory store and permissive rules,
//! starts the background presence sweeper and serves the Axum router.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use collab_sync::auth::AllowAll;
use collab_sync::config::SyncConfig;
use collab_sync::server::{Hub, create_router};
use collab_sync::storage::MemoryStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::from_env();
    let addr = config.bind;
    info!(node = "collab-sync", %addr, "starting server");

    let hub = Hub::new(config, Arc::new(MemoryStore::new()), Arc::new(AllowAll));

    // Background sweep of idle presence sessions.
    let sweeper = hub.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweeper.config().sweep_interval);
        loop {
            ticker.tick().await;
            sweeper.sweep_presence();
        }
    });

    let app = create_router(hub);

    info!("Available endpoints:");
    info!("  GET /health - Health check");
    info!("  GET /ws     - Collaborative WebSocket session");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
