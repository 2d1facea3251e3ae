//! `POST /v1/tools/{name}/execute`.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use penny_core::tools::executor::ExecuteOptions;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn execute_tool(
    State(state): State<AppState>,
    Principal(principal): Principal,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let started = std::time::Instant::now();
    // This endpoint calls the executor directly, outside the job queue, so
    // there is no job-level cancellation to forward; an unfired token is
    // the correct "never cancelled" input here.
    let cancel = CancellationToken::new();
    let execution = state
        .tool_executor
        .execute(&name, params, &principal.tenant_id, &principal.principal_id, ExecuteOptions::default(), &cancel)
        .await?;

    let success = execution.status == penny_core::tools::definition::ExecutionStatus::Completed;
    Ok(Json(json!({
        "success": success,
        "data": execution.result,
        "error": execution.error,
        "usage": execution.metrics,
        "duration": started.elapsed().as_millis() as u64,
        "executionId": execution.id,
    })))
}
