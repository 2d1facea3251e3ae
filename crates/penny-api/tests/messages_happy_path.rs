//! A streamed `POST /v1/messages` against the mock provider must persist
//! the assistant reply, record exactly one usage record, and deliver the
//! SSE client `content, ..., done` with no chunk dropped or duplicated.

mod common;

use http_body_util::BodyExt;
use tower::ServiceExt;

use axum::body::Body;
use axum::http::{Request, StatusCode};

use penny_core::rate_limit::RateLimitSpec;
use penny_core::usage::Metric;

#[tokio::test]
async fn streamed_reply_is_persisted_and_usage_is_recorded_once() {
    let app = common::build_app(RateLimitSpec { requests: 60, window_sec: 60, burst: None });
    let conversation_id = app.conversations.create(common::TENANT_A);
    let auth = common::auth_header(&app.api_keys, common::TENANT_A, "user-1");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("authorization", auth)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "conversationId": conversation_id,
                "content": "Hello",
                "stream": true,
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(body.to_vec()).unwrap();

    let events: Vec<serde_json::Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|payload| !payload.is_empty())
        .filter_map(|payload| serde_json::from_str(payload).ok())
        .collect();

    // Exactly one terminal chunk, and it comes last.
    let terminal_count = events.iter().filter(|e| e["type"] == "done" || e["type"] == "error").count();
    assert_eq!(terminal_count, 1, "expected exactly one terminal chunk, got {events:?}");
    assert_eq!(events.last().unwrap()["type"], "done");

    // Concatenating content chunks in delivery order equals the persisted
    // assistant message's content.
    let streamed_text: String = events
        .iter()
        .filter(|e| e["type"] == "content")
        .map(|e| e["text"].as_str().unwrap_or_default())
        .collect();

    let conversation = app.conversations.get(common::TENANT_A, &conversation_id).unwrap();
    let assistant_message = conversation
        .messages
        .iter()
        .find(|m| matches!(m.role, penny_provider::chat::ChatRole::Assistant))
        .expect("assistant message must be persisted");
    assert_eq!(assistant_message.text(), streamed_text);

    // Exactly one usage record for the completion.
    let records = app.usage.records_for_tenant(common::TENANT_A);
    let token_out_records: Vec<_> = records.iter().filter(|r| r.metric == Metric::TokensOut).collect();
    assert_eq!(token_out_records.len(), 1);
}
