//! Session listing and queue manipulation handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use cardlink_types::SessionId;
use cardlink_types::apdu::Apdu;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiState;
use crate::api::errors::ApiError;
use crate::services::session::{SessionSnapshot, SessionSummary};

pub(crate) async fn list(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list().await)
}

pub(crate) async fn get_one(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = SessionId::from(id);
    state
        .manager
        .get(id)
        .await
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnqueueApduRequest {
    hex: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EnqueueApduResponse {
    queued_position: usize,
}

pub(crate) async fn enqueue_apdu(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<EnqueueApduRequest>,
) -> Result<Json<EnqueueApduResponse>, ApiError> {
    let id = SessionId::from(id);
    let bytes = hex::decode(request.hex.trim())
        .map_err(|err| ApiError::BadRequest(format!("invalid hex: {err}")))?;
    let apdu = Apdu::decode(&bytes)
        .map_err(|err| ApiError::BadRequest(format!("invalid apdu: {err}")))?;
    let queued_position = state.manager.enqueue_apdu(id, apdu).await?;
    Ok(Json(EnqueueApduResponse { queued_position }))
}

#[derive(Debug, Serialize)]
pub(crate) struct ClearQueueResponse {
    cleared: usize,
}

pub(crate) async fn clear_queue(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClearQueueResponse>, ApiError> {
    let id = SessionId::from(id);
    let cleared = state.manager.clear_queue(id).await?;
    Ok(Json(ClearQueueResponse { cleared }))
}
