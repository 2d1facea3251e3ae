//! `POST /v1/sandbox/execute` with code containing `import os` must be
//! rejected with a `CRITICAL` policy violation before any session state
//! changes.

mod common;

use tower::ServiceExt;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;

use penny_core::rate_limit::RateLimitSpec;

#[tokio::test]
async fn critical_import_is_rejected_without_touching_sessions() {
    let app = common::build_app(RateLimitSpec { requests: 60, window_sec: 60, burst: None });
    let auth = common::auth_header(&app.api_keys, common::TENANT_A, "user-1");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/sandbox/execute")
        .header("authorization", &auth)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "code": "import os\nos.system('rm -rf /')" }).to_string(),
        ))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "POLICY_VIOLATION");
}
