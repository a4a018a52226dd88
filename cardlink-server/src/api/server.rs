//! Server status handler.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::api::ApiState;

#[derive(Debug, Serialize)]
pub(crate) struct ServerStatus {
    running: bool,
    host: String,
    port: u16,
    active_sessions: usize,
    total_sessions: u64,
}

pub(crate) async fn status(State(state): State<Arc<ApiState>>) -> Json<ServerStatus> {
    Json(ServerStatus {
        running: !state.cancellation_token.is_cancelled(),
        host: state.host.clone(),
        port: state.port,
        active_sessions: state.manager.active_count(),
        total_sessions: state.manager.total_count(),
    })
}
