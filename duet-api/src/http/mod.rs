//! HTTP router
//!
//! - `GET /ws` - signaling WebSocket
//! - `GET /health` - liveness check
//! - `GET /api/ice-servers` - STUN/TURN servers for the peer transport
//! - `GET /api/rooms/{room_id}` - current membership of a room

pub mod error;
pub mod room;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use duet_core::Config;
use duet_hub::SignalingRelay;

pub use error::{AppError, AppResult};

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: SignalingRelay,
    pub config: Arc<Config>,
}

/// Create the HTTP router with all routes
pub fn create_router(relay: SignalingRelay, config: Arc<Config>) -> Router {
    let state = AppState { relay, config };

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/ice-servers", get(room::get_ice_servers))
        .route("/api/rooms/{room_id}", get(room::get_room));

    // Browsers connect from any origin
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}

/// Liveness check; answers as long as the process serves requests
async fn health_check() -> &'static str {
    "OK"
}
