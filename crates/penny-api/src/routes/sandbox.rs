//! `POST /v1/sandbox/execute[/stream]`, session lifecycle.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::sse::execution_chunk_stream;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub allow_network: bool,
}

pub async fn execute(
    State(state): State<AppState>,
    Principal(_principal): Principal,
    Json(req): Json<SandboxExecuteRequest>,
) -> Result<Response, ApiError> {
    let outcome = state
        .sandbox
        .execute(req.session_id.as_deref(), &req.code, req.allow_network)
        .await?;
    Ok(Json(outcome).into_response())
}

pub async fn execute_stream(
    State(state): State<AppState>,
    Principal(_principal): Principal,
    Json(req): Json<SandboxExecuteRequest>,
) -> Result<Response, ApiError> {
    let rx = state
        .sandbox
        .execute_stream(req.session_id.as_deref(), &req.code, req.allow_network)
        .await?;
    Ok(execution_chunk_stream(rx).into_response())
}

pub async fn create_session(State(state): State<AppState>, Principal(_principal): Principal) -> Json<serde_json::Value> {
    let session_id = state.sandbox_sessions.create();
    Json(json!({ "sessionId": session_id }))
}

pub async fn close_session(
    State(state): State<AppState>,
    Principal(_principal): Principal,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sandbox_sessions.close(&session_id)?;
    Ok(StatusCode::NO_CONTENT)
}
