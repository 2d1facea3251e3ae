//! SSE rendering for streaming chat and sandbox routes: `text/event-stream`,
//! `data: {json}\n\n`, terminated by `{type:"done"}` or
//! `{type:"error",...}`.
//!
//! `querymt-service` builds its SSE body with `futures::stream::scan` +
//! `flat_map` over a provider's native stream. This workspace's progress
//! channels are `tokio::sync::mpsc` receivers instead (one per job/
//! execution), so the adapter here is `futures::stream::unfold` over
//! `recv()` — no `tokio-stream` dependency is in the workspace, and
//! `unfold` needs none.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;

use penny_core::processor::ProcessingEvent;
use penny_sandbox::ExecutionChunk;

const KEEP_ALIVE_SECS: u64 = 15;

pub(crate) fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(std::time::Duration::from_secs(KEEP_ALIVE_SECS))
        .text("keep-alive")
}

/// Renders one [`ProcessingEvent`] into the `POST /v1/messages` SSE shape.
pub(crate) fn render_processing_event(event: ProcessingEvent) -> Event {
    let payload = match event {
        ProcessingEvent::Content { text } => json!({ "type": "content", "text": text }),
        ProcessingEvent::ToolCall { name, id } => json!({ "type": "tool_call", "name": name, "id": id }),
        ProcessingEvent::Done { finish_reason } => json!({ "type": "done", "finishReason": finish_reason }),
        ProcessingEvent::Error { code, message } => json!({ "type": "error", "code": code, "message": message }),
    };
    Event::default().data(payload.to_string())
}

/// Renders one [`ExecutionChunk`] into the `POST /v1/sandbox/execute/stream`
/// SSE shape.
fn render_execution_chunk(chunk: ExecutionChunk) -> Event {
    let payload = match chunk {
        ExecutionChunk::Stdout { text } => json!({ "type": "stdout", "text": text }),
        ExecutionChunk::Stderr { text } => json!({ "type": "stderr", "text": text }),
        ExecutionChunk::Plot { path } => json!({ "type": "plot", "path": path }),
        ExecutionChunk::Variable { name, value } => json!({ "type": "variable", "name": name, "value": value }),
        ExecutionChunk::Done { exit_code, duration_ms } => {
            json!({ "type": "done", "exitCode": exit_code, "durationMs": duration_ms })
        }
        ExecutionChunk::Error { code, message } => json!({ "type": "error", "code": code, "message": message }),
    };
    Event::default().data(payload.to_string())
}

/// Adapts a [`SandboxRunner::execute_stream`](penny_sandbox::SandboxRunner::execute_stream)
/// channel into the sandbox streaming SSE response.
pub fn execution_chunk_stream(
    rx: mpsc::Receiver<ExecutionChunk>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(render_execution_chunk(chunk)), rx))
    });
    Sse::new(stream).keep_alive(keep_alive())
}
