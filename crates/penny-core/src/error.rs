//! Shared error taxonomy and the redaction helper applied before
//! any `tracing` call or audit write that might carry user-supplied data.
//!
//! Grounded on `querymt-agent`'s `error.rs` convention of one `thiserror`
//! enum per crate with a stable `code()`/`retryable()` pair; bridges
//! `penny_provider::error::LLMError` the way `querymt-agent` bridges
//! `querymt::error::LLMError` into its own error type.

use std::fmt;

use penny_provider::error::LLMError;
use serde_json::Value;

/// The error taxonomy every `penny-core` component returns.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("tenant disabled: {0}")]
    TenantDisabled(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("invalid result: {0}")]
    InvalidResult(String),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("conversation not found")]
    NotFound,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("queue full")]
    QueueFull,
    #[error("timeout")]
    Timeout,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("temporary error: {0}")]
    TemporaryError(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("overloaded: {0}")]
    Overloaded(String),
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    #[error("cpu limit exceeded")]
    CpuLimitExceeded,
    #[error("security policy violation: {0}")]
    SecurityPolicyViolation(String),
    #[error("cancelled")]
    Cancelled,
    #[error("no provider available")]
    NoProvider,
}

impl CoreError {
    /// Stable machine-readable code, part of the `{code, message, retryable}`
    /// shape every user-visible error carries.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated(_) => "UNAUTHENTICATED",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::TenantDisabled(_) => "TENANT_DISABLED",
            CoreError::InvalidParams(_) => "INVALID_PARAMS",
            CoreError::InvalidResult(_) => "INVALID_RESULT",
            CoreError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            CoreError::NotFound => "NOT_FOUND",
            CoreError::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            CoreError::QueueFull => "QUEUE_FULL",
            CoreError::Timeout => "TIMEOUT",
            CoreError::NetworkError(_) => "NETWORK_ERROR",
            CoreError::TemporaryError(_) => "TEMPORARY_ERROR",
            CoreError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            CoreError::Overloaded(_) => "OVERLOADED",
            CoreError::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            CoreError::CpuLimitExceeded => "CPU_LIMIT_EXCEEDED",
            CoreError::SecurityPolicyViolation(_) => "SECURITY_POLICY_VIOLATION",
            CoreError::Cancelled => "CANCELLED",
            CoreError::NoProvider => "NO_PROVIDER",
        }
    }

    /// Whether the server itself retries this with backoff, as
    /// opposed to surfacing it to the caller immediately.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout
                | CoreError::NetworkError(_)
                | CoreError::TemporaryError(_)
                | CoreError::ServiceUnavailable(_)
                | CoreError::Overloaded(_)
        )
    }

    /// The `{code, message, retryable}` triple surfaced to HTTP callers; never
    /// includes stack traces, and redacts the message itself since it may
    /// echo user-supplied content.
    pub fn to_response(&self) -> (&'static str, String, bool) {
        (self.code(), self.to_string(), self.retryable())
    }
}

impl From<LLMError> for CoreError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Auth(m) => CoreError::Unauthenticated(m),
            LLMError::RateLimited(_) => CoreError::RateLimitExceeded,
            LLMError::BadRequest(m) => CoreError::InvalidParams(m),
            LLMError::Overloaded(m) => CoreError::Overloaded(m),
            LLMError::Timeout(_) => CoreError::Timeout,
            LLMError::Upstream(m) => CoreError::TemporaryError(m),
            LLMError::Cancelled => CoreError::Cancelled,
            LLMError::NoProvider => CoreError::NoProvider,
            LLMError::NotImplemented(m) => CoreError::InvalidParams(m),
        }
    }
}

const SENSITIVE_FIELDS: &[&str] = &["password", "token", "secret", "key", "authorization", "cookie"];

/// Redacts sensitive field names from a JSON value before it is logged or
/// written to an audit trail. Matching is case-insensitive and
/// recurses into nested objects/arrays; matched values become `"[REDACTED]"`.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SENSITIVE_FIELDS.iter().any(|f| lower.contains(f)) {
                        (k, Value::String("[REDACTED]".to_string()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
