//! `POST /v1/messages`: submits a user message, either waiting for
//! the final assistant reply or streaming progress over SSE.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use penny_core::CoreError;
use penny_core::conversation::Message;
use penny_core::queue::{ExecutionJob, JobQueue};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::sse::render_processing_event;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools_enabled: Option<Vec<String>>,
    #[serde(default)]
    pub artifacts_enabled: Option<bool>,
    #[serde(default)]
    pub stream: bool,
}

/// Cancels the job it guards when dropped, unless the job already reached a
/// terminal state — [`JobQueue::cancel`] is a no-op on terminal jobs, so a
/// guard that outlives a normal completion costs nothing. This is what turns
/// an axum client-disconnect (the handler future gets dropped mid-flight)
/// into a `CANCELLED` job rather than an orphaned worker.
struct JobCancelGuard {
    queue: Arc<JobQueue>,
    job_id: String,
}

impl Drop for JobCancelGuard {
    fn drop(&mut self) {
        let _ = self.queue.cancel(&self.job_id);
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    Principal(principal): Principal,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    // Ownership check: a cross-tenant conversation id surfaces as 404, never
    // 403 — existence of another tenant's conversation is not revealed.
    state.conversations.get(&principal.tenant_id, &req.conversation_id)?;

    let user_message = Message::user(&req.conversation_id, &req.content);
    let message_id = user_message.id.clone();
    state.conversations.append_message(&principal.tenant_id, user_message)?;

    let payload = json!({
        "model": req.model,
        "temperature": req.temperature,
        "maxTokens": req.max_tokens,
        "toolsEnabled": req.tools_enabled,
        "artifactsEnabled": req.artifacts_enabled.unwrap_or(true),
        "stream": req.stream,
    });

    let job = ExecutionJob::new(req.conversation_id.clone(), message_id, principal, 0, payload);
    let job_id = job.job_id.clone();

    if req.stream {
        // Must subscribe before enqueuing so no early chunk is lost.
        let rx = state.processor.subscribe(&job_id);
        state.queue.enqueue(job).await?;
        let guard = JobCancelGuard { queue: state.queue.clone(), job_id };

        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (Ok::<_, std::convert::Infallible>(render_processing_event(event)), (rx, guard)))
        });
        let sse = axum::response::sse::Sse::new(stream).keep_alive(crate::sse::keep_alive());
        return Ok(sse.into_response());
    }

    state.queue.enqueue(job).await?;
    let guard = JobCancelGuard { queue: state.queue.clone(), job_id: job_id.clone() };

    let result = poll_until_terminal(&state.queue, &job_id).await?;
    drop(guard);
    Ok(Json(result).into_response())
}

async fn poll_until_terminal(queue: &Arc<JobQueue>, job_id: &str) -> Result<Value, ApiError> {
    use penny_core::queue::JobStatus;

    loop {
        match queue.status(job_id) {
            Some(JobStatus::Completed) => return Ok(queue.result(job_id).unwrap_or(Value::Null)),
            Some(JobStatus::Failed) => {
                let err = queue.error(job_id).unwrap_or(CoreError::TemporaryError("job failed".into()));
                return Err(err.into());
            }
            Some(JobStatus::Cancelled) => return Err(CoreError::Cancelled.into()),
            Some(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            None => {
                warn!(job_id, "polled status for an unknown job");
                return Err(CoreError::NotFound.into());
            }
        }
    }
}
