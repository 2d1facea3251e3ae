//! Maps `CoreError`/`SandboxError` onto HTTP status codes and the
//! `{code, message, retryable}` response body every failure shares.
//!
//! Grounded on `querymt-service`'s `handle_chat` returning `Result<Response,
//! (StatusCode, String)>` — generalized here into a proper `IntoResponse`
//! type so every route can use `?` against `CoreError`/`SandboxError`
//! instead of hand-mapping a tuple at each call site.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use penny_core::CoreError;
use penny_sandbox::SandboxError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retryable: bool,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self { status, code, message: message.into(), retryable }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": penny_core::error::redact(serde_json::Value::String(self.message))
                .as_str()
                .unwrap_or("internal error")
                .to_string(),
            "retryable": self.retryable,
        }));
        (self.status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let (code, message, retryable) = err.to_response();
        let status = match err {
            CoreError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            CoreError::Unauthorized(_) => StatusCode::FORBIDDEN,
            CoreError::TenantDisabled(_) => StatusCode::CONFLICT,
            CoreError::InvalidParams(_) | CoreError::InvalidResult(_) => StatusCode::BAD_REQUEST,
            CoreError::ToolNotFound(_) | CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::RateLimitExceeded | CoreError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Timeout | CoreError::NetworkError(_) | CoreError::TemporaryError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CoreError::ServiceUnavailable(_) | CoreError::Overloaded(_) | CoreError::NoProvider => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::MemoryLimitExceeded
            | CoreError::CpuLimitExceeded
            | CoreError::SecurityPolicyViolation(_) => StatusCode::BAD_REQUEST,
            // 499 isn't a registered status; axum's `StatusCode` accepts any
            // valid 3-digit code, and nginx's "client closed request" (499)
            // is the closest fit for a cancelled request.
            CoreError::Cancelled => StatusCode::from_u16(499).unwrap(),
        };
        ApiError::new(status, code, message, retryable)
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        let status = match &err {
            SandboxError::PolicyViolation { .. }
            | SandboxError::MemoryLimitExceeded(_)
            | SandboxError::CpuLimitExceeded(_) => StatusCode::BAD_REQUEST,
            SandboxError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::Timeout | SandboxError::Spawn(_) | SandboxError::Codec(_) | SandboxError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.code(), err.to_string(), err.retryable())
    }
}
