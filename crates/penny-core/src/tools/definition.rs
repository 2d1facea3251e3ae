//! Tool definitions and their execution state machine.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid regex"));

/// Per-tool rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_sec: u32,
    pub burst: Option<u32>,
}

/// Execution limits and policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retryable_error_codes: HashSet<String>,
    pub non_retryable_error_codes: HashSet<String>,
    pub requires_sandbox: bool,
    pub rate_limit: Option<RateLimitConfig>,
    pub required_scopes: HashSet<String>,
    pub max_memory_mb: u64,
    pub max_cpu_percent: u32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            retryable_error_codes: HashSet::new(),
            non_retryable_error_codes: HashSet::new(),
            requires_sandbox: false,
            rate_limit: None,
            required_scopes: HashSet::new(),
            max_memory_mb: 512,
            max_cpu_percent: 50,
        }
    }
}

/// A registered tool. Its handler is looked up by name in the executor's
/// handler map rather than stored inline, so definitions stay
/// `Clone`/`Serialize` for registry listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub version: String,
    pub category: String,
    pub author: String,
    pub parameter_schema: penny_provider::chat::ParametersSchema,
    pub config: ToolConfig,
    pub dependencies: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("tool name {0:?} must match ^[a-z][a-z0-9_]*$")]
    InvalidName(String),
    #[error("tool version {0:?} is not valid semver")]
    InvalidVersion(String),
}

impl ToolDefinition {
    /// Validates `name`/`version` shape. Schema validity is the caller's
    /// responsibility to construct correctly; `schemars`-derived types
    /// can't themselves be malformed.
    pub fn validate_shape(&self) -> Result<(), DefinitionError> {
        if !NAME_RE.is_match(&self.name) {
            return Err(DefinitionError::InvalidName(self.name.clone()));
        }
        if semver_parse(&self.version).is_none() {
            return Err(DefinitionError::InvalidVersion(self.version.clone()));
        }
        Ok(())
    }
}

/// Minimal `major.minor.patch` semver check; no pre-release/build-metadata
/// parsing, only a basic shape gate.
fn semver_parse(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// `ToolExecution` state machine: `QUEUED -> RUNNING -> (retry: RETRYING ->
/// RUNNING)* -> (COMPLETED | FAILED | TIMEOUT | CANCELLED)`. Terminal
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    pub fn is_cancellable(self) -> bool {
        matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }
}

/// Per-execution resource/latency metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub duration_ms: Option<u64>,
}

/// One invocation of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: String,
    pub tool_name: String,
    pub params: Value,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metrics: ExecutionMetrics,
    pub logs: Vec<String>,
}

impl ToolExecution {
    pub fn new(tool_name: impl Into<String>, params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            params,
            status: ExecutionStatus::Queued,
            started_at: Utc::now(),
            completed_at: None,
            retries: 0,
            result: None,
            error: None,
            metrics: ExecutionMetrics::default(),
            logs: Vec::new(),
        }
    }

    /// Transitions to a terminal status, recording completion time.
    /// Invariant: once terminal, further calls are rejected — every
    /// execution reaches exactly one terminal state.
    pub fn finish(&mut self, status: ExecutionStatus) -> Result<(), &'static str> {
        if self.status.is_terminal() {
            return Err("execution already in a terminal state");
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn schema() -> penny_provider::chat::ParametersSchema {
        penny_provider::chat::ParametersSchema {
            schema_type: "object".into(),
            properties: HashMap::new(),
            required: Vec::new(),
        }
    }

    fn definition(name: &str, version: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            version: version.into(),
            category: "general".into(),
            author: "penny".into(),
            parameter_schema: schema(),
            config: ToolConfig::default(),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn rejects_uppercase_name() {
        assert!(definition("BadName", "1.0.0").validate_shape().is_err());
    }

    #[test]
    fn accepts_snake_case_name() {
        assert!(definition("python_code", "1.0.0").validate_shape().is_ok());
    }

    #[test]
    fn rejects_non_semver_version() {
        assert!(definition("python_code", "v1").validate_shape().is_err());
    }

    #[test]
    fn terminal_state_is_final() {
        let mut exec = ToolExecution::new("python_code", serde_json::json!({}));
        exec.status = ExecutionStatus::Running;
        assert!(exec.finish(ExecutionStatus::Completed).is_ok());
        assert!(exec.finish(ExecutionStatus::Failed).is_err());
    }

    #[test]
    fn only_queued_or_running_are_cancellable() {
        assert!(ExecutionStatus::Queued.is_cancellable());
        assert!(ExecutionStatus::Running.is_cancellable());
        assert!(!ExecutionStatus::Completed.is_cancellable());
        assert!(!ExecutionStatus::Retrying.is_cancellable());
    }
}
