//! Error responses of the REST façade.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cardlink_types::SessionId;
use serde_json::json;

use crate::services::session_manager::SessionManagerError;

/// Everything a façade handler can fail with.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    /// No session with this id, live or retained.
    #[error("unknown session {0}")]
    NotFound(SessionId),
    /// The request payload is unusable.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The session exists but no longer takes commands.
    #[error("session {0} is shutting down")]
    Gone(SessionId),
}

impl From<SessionManagerError> for ApiError {
    fn from(value: SessionManagerError) -> Self {
        match value {
            SessionManagerError::UnknownSession(id) => Self::NotFound(id),
            SessionManagerError::SessionClosed(id) => Self::Gone(id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Gone(_) => StatusCode::GONE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
