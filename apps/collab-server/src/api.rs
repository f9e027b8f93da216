/// Read-only introspection endpoints
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use collaboration::{RelayStats, SessionId, SessionInfo};
use serde_json::json;

use crate::AppState;

/// API error type
pub enum ApiError {
    NotFound,
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// GET /api/sessions - Summaries of every live session
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let mut sessions = Vec::new();
    for id in state.relay.sessions() {
        if let Some(info) = state.relay.session_info(&id).await {
            sessions.push(info);
        }
    }
    Json(sessions)
}

/// GET /api/sessions/:id - One session
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session_id = SessionId::parse(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .relay
        .session_info(&session_id)
        .await
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// GET /api/stats - Relay counters
pub async fn get_stats(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.relay.stats())
}
