//! Web server module for the collaborative sync service.
//!
//! This module contains the Axum server implementation: the shared hub
//! state, the WebSocket wire protocol, the per-session handler and the
//! HTTP routes.

pub mod hub;
pub mod protocol;
pub mod routes;
pub mod websocket;

pub use hub::Hub;
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::create_router;
