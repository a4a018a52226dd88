//! REST/WebSocket façade for the dashboard.
//!
//! Loopback-only surface: session listings, single-APDU enqueueing,
//! queue clearing, server status and the `/ws` event stream. The façade
//! holds the session manager and the event bus; session state itself
//! stays confined to the session tasks.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tokio_util::sync::CancellationToken;

use crate::services::event_bus::EventBus;
use crate::services::session_manager::SessionManager;

pub(crate) mod errors;
mod server;
mod sessions;
mod ws;

/// Shared state of the façade handlers.
pub(crate) struct ApiState {
    pub(crate) manager: SessionManager,
    pub(crate) bus: EventBus,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cancellation_token: CancellationToken,
}

/// Builds the façade router.
pub(crate) fn routes(state: ApiState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/api/sessions", get(sessions::list))
        .route("/api/sessions/{id}", get(sessions::get_one))
        .route("/api/sessions/{id}/apdus", post(sessions::enqueue_apdu))
        .route("/api/sessions/{id}/apdus", delete(sessions::clear_queue))
        .route("/api/server/status", get(server::status))
        .route("/ws", get(ws::stream))
        .with_state(state)
}
