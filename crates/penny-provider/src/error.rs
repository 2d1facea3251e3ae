use std::fmt;

/// Failure taxonomy surfaced by provider adapters.
///
/// [`LLMError::retryable`] encodes which of these the server itself retries
/// with backoff, so callers never have to match on variants themselves.
#[derive(Debug, Clone)]
pub enum LLMError {
    /// Missing/invalid credentials.
    Auth(String),
    /// Upstream rejected the request due to rate limiting.
    RateLimited(String),
    /// Malformed or semantically invalid request; never retried.
    BadRequest(String),
    /// Upstream is overloaded (a 429/503-style signal distinct from rate limiting).
    Overloaded(String),
    /// The request exceeded its deadline.
    Timeout(String),
    /// Unclassified upstream failure (5xx, malformed response body, etc).
    Upstream(String),
    /// The caller cancelled the request.
    Cancelled,
    /// No provider/adapter could serve the request.
    NoProvider,
    /// Feature genuinely not implemented by this adapter.
    NotImplemented(String),
}

impl LLMError {
    /// Whether this error should be retried with backoff by the caller,
    /// as opposed to surfaced immediately.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LLMError::RateLimited(_)
                | LLMError::Overloaded(_)
                | LLMError::Timeout(_)
                | LLMError::Upstream(_)
        )
    }

    /// Stable machine-readable code for the `{code, message, retryable}` shape
    /// user-visible errors must carry.
    pub fn code(&self) -> &'static str {
        match self {
            LLMError::Auth(_) => "AUTH",
            LLMError::RateLimited(_) => "RATE_LIMITED",
            LLMError::BadRequest(_) => "BAD_REQUEST",
            LLMError::Overloaded(_) => "OVERLOADED",
            LLMError::Timeout(_) => "TIMEOUT",
            LLMError::Upstream(_) => "UPSTREAM",
            LLMError::Cancelled => "CANCELLED",
            LLMError::NoProvider => "NO_PROVIDER",
            LLMError::NotImplemented(_) => "NOT_IMPLEMENTED",
        }
    }
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMError::Auth(e) => write!(f, "auth error: {e}"),
            LLMError::RateLimited(e) => write!(f, "rate limited: {e}"),
            LLMError::BadRequest(e) => write!(f, "bad request: {e}"),
            LLMError::Overloaded(e) => write!(f, "overloaded: {e}"),
            LLMError::Timeout(e) => write!(f, "timeout: {e}"),
            LLMError::Upstream(e) => write!(f, "upstream error: {e}"),
            LLMError::Cancelled => write!(f, "cancelled"),
            LLMError::NoProvider => write!(f, "no provider available"),
            LLMError::NotImplemented(e) => write!(f, "not implemented: {e}"),
        }
    }
}

impl std::error::Error for LLMError {}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LLMError::Timeout(err.to_string())
        } else {
            LLMError::Upstream(err.to_string())
        }
    }
}

impl From<http::Error> for LLMError {
    fn from(err: http::Error) -> Self {
        LLMError::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::BadRequest(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<url::ParseError> for LLMError {
    fn from(err: url::ParseError) -> Self {
        LLMError::BadRequest(format!("error parsing provided url: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_covers_transient_upstream_failures() {
        assert!(LLMError::RateLimited("x".into()).retryable());
        assert!(LLMError::Overloaded("x".into()).retryable());
        assert!(LLMError::Timeout("x".into()).retryable());
        assert!(LLMError::Upstream("x".into()).retryable());
        assert!(!LLMError::Auth("x".into()).retryable());
        assert!(!LLMError::BadRequest("x".into()).retryable());
        assert!(!LLMError::Cancelled.retryable());
    }
}
