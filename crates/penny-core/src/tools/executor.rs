//! Validates parameters, consults the rate limiter, enqueues, and runs a
//! handler with timeout/retry/backoff, optionally inside the sandbox
//! runner.
//!
//! Generalizes `querymt_agent::middleware::limits::LimitsMiddleware`'s
//! config-driven step/turn/price tracking into per-tool
//! timeout/retry/backoff machinery, and keeps its `tracing`-before-action
//! logging convention.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::rate_limit::{RateLimitSpec, RateLimiter};
use crate::tools::definition::{ExecutionStatus, ToolExecution};
use crate::tools::registry::ToolRegistry;

/// Result a handler returns. A handler result must carry a boolean
/// `success`, and failures must carry an `error` — modeled as a `Result`
/// so that shape is enforced by the type system rather than re-validated
/// at runtime.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success(Value),
    Failure { code: String, message: String, retryable: bool },
}

#[derive(Debug, Clone)]
pub struct ToolHandlerError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for ToolHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ToolHandlerError {}

/// Per-invocation context handed to a handler.
pub struct ToolCallContext {
    pub tenant_id: String,
    pub principal_id: String,
    pub execution_id: String,
    pub allow_network: bool,
}

/// A tool's implementation. Handlers are looked up by name; registering a
/// [`crate::tools::ToolDefinition`] in the [`ToolRegistry`] and a handler
/// here are two separate steps so definitions stay serializable metadata.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Value, ctx: &ToolCallContext) -> Result<HandlerOutcome, ToolHandlerError>;
}

const DEFAULT_RETRYABLE_CODES: &[&str] = &[
    "TIMEOUT",
    "RATE_LIMIT_EXCEEDED",
    "NETWORK_ERROR",
    "TEMPORARY_ERROR",
    "SERVICE_UNAVAILABLE",
];

/// Options an individual invocation may override.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout_ms: Option<u64>,
    pub allow_network: bool,
}

/// Executes registered tools under the rate limiter, a bounded-concurrency
/// queue, and per-tool timeout/retry/backoff.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    rate_limiter: Arc<RateLimiter>,
    handlers: DashMap<String, Arc<dyn ToolHandler>>,
    sandbox: Option<Arc<penny_sandbox::SandboxRunner>>,
    /// Bounded priority queue's concurrency cap.
    concurrency: Arc<Semaphore>,
    queue_deadline: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, rate_limiter: Arc<RateLimiter>, concurrency: usize) -> Self {
        Self {
            registry,
            rate_limiter,
            handlers: DashMap::new(),
            sandbox: None,
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
            queue_deadline: Duration::from_secs(30),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<penny_sandbox::SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Runs one invocation through validate → rate-limit → enqueue → execute
    /// → retry, returning the terminal [`ToolExecution`] record. `cancel`
    /// is raced against the handler call, the sandbox call, and every
    /// backoff sleep so a job-level cancellation never leaves a tool
    /// execution running past it.
    pub async fn execute(
        &self,
        tool_name: &str,
        params: Value,
        tenant_id: &str,
        principal_id: &str,
        options: ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ToolExecution, CoreError> {
        // Step 1: look up definition.
        let def = self
            .registry
            .get(tool_name)
            .ok_or_else(|| CoreError::ToolNotFound(tool_name.to_string()))?;

        // Step 2: validate params against schema; normalize defaults.
        let params = validate_and_normalize(&def.parameter_schema, params)
            .map_err(CoreError::InvalidParams)?;

        // Step 3: consult the rate limiter with the tool's configured limit.
        if let Some(limit) = &def.config.rate_limit {
            self.rate_limiter.admit(
                tenant_id,
                &format!("tool:{tool_name}"),
                Some(principal_id),
                RateLimitSpec {
                    requests: limit.requests,
                    window_sec: limit.window_sec,
                    burst: limit.burst,
                },
            )?;
        }

        // Step 4: create and enqueue a ToolExecution.
        let mut execution = ToolExecution::new(tool_name, params.clone());
        tracing::info!(tool = tool_name, execution_id = %execution.id, tenant_id, "execution:queued");

        // Back-pressure: block the enqueuer until a concurrency slot frees up,
        // up to the queue deadline, then reject.
        let permit = tokio::time::timeout(self.queue_deadline, self.concurrency.clone().acquire_owned())
            .await
            .map_err(|_| CoreError::QueueFull)?
            .expect("semaphore never closed");

        // Step 5: dequeue; set the deadline; run with resource/time limits.
        execution.status = ExecutionStatus::Running;
        tracing::info!(tool = tool_name, execution_id = %execution.id, "execution:running");

        let timeout = Duration::from_millis(
            options
                .timeout_ms
                .unwrap_or(def.config.timeout_ms)
                .min(def.config.timeout_ms.max(1)),
        );

        let handler = self
            .handlers
            .get(tool_name)
            .ok_or_else(|| CoreError::ToolNotFound(tool_name.to_string()))?
            .clone();

        let ctx = ToolCallContext {
            tenant_id: tenant_id.to_string(),
            principal_id: principal_id.to_string(),
            execution_id: execution.id.clone(),
            allow_network: options.allow_network,
        };

        let retryable_codes: HashSet<String> = DEFAULT_RETRYABLE_CODES
            .iter()
            .map(|s| s.to_string())
            .chain(def.config.retryable_error_codes.iter().cloned())
            .filter(|c| !def.config.non_retryable_error_codes.contains(c))
            .collect();

        let mut attempt = 0u32;
        let outcome_result = loop {
            let attempt_result = if def.config.requires_sandbox {
                self.run_sandboxed(&handler, params.clone(), &ctx, timeout, cancel).await
            } else {
                self.run_direct(&handler, params.clone(), &ctx, timeout, cancel).await
            };

            let retry = match &attempt_result {
                Ok(RunOutcome::Timeout) => attempt < def.config.max_retries && retryable_codes.contains("TIMEOUT"),
                Err(err) => attempt < def.config.max_retries && retryable_codes.contains(&err.code),
                Ok(RunOutcome::Outcome(_)) | Ok(RunOutcome::Cancelled) => false,
            };

            if !retry {
                break attempt_result;
            }

            attempt += 1;
            execution.retries = attempt;
            execution.status = ExecutionStatus::Retrying;
            let delay = Duration::from_millis((1000u64.saturating_mul(1 << attempt.min(5))).min(30_000));
            tracing::info!(
                tool = tool_name,
                execution_id = %execution.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "execution:retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break Ok(RunOutcome::Cancelled),
            }
            execution.status = ExecutionStatus::Running;
        };
        drop(permit);

        // Steps 8-9: validate result shape, record usage, finish.
        match outcome_result {
            Ok(RunOutcome::Cancelled) => {
                let _ = execution.finish(ExecutionStatus::Cancelled);
                execution.error = Some("execution cancelled".into());
                tracing::info!(tool = tool_name, execution_id = %execution.id, "execution:cancelled");
            }
            Ok(RunOutcome::Timeout) => {
                let _ = execution.finish(ExecutionStatus::Timeout);
                execution.error = Some("execution timed out".into());
                tracing::info!(tool = tool_name, execution_id = %execution.id, "execution:timeout");
            }
            Ok(RunOutcome::Outcome(HandlerOutcome::Success(data))) => {
                execution.result = Some(data);
                let _ = execution.finish(ExecutionStatus::Completed);
                tracing::info!(tool = tool_name, execution_id = %execution.id, "execution:completed");
            }
            Ok(RunOutcome::Outcome(HandlerOutcome::Failure { message, .. })) => {
                execution.error = Some(message);
                let _ = execution.finish(ExecutionStatus::Failed);
                tracing::info!(tool = tool_name, execution_id = %execution.id, "execution:failed");
            }
            Err(err) => {
                execution.error = Some(err.message);
                let _ = execution.finish(ExecutionStatus::Failed);
                tracing::info!(tool = tool_name, execution_id = %execution.id, "execution:failed");
            }
        }

        Ok(execution)
    }

    async fn run_direct(
        &self,
        handler: &Arc<dyn ToolHandler>,
        params: Value,
        ctx: &ToolCallContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ToolHandlerError> {
        tokio::select! {
            res = tokio::time::timeout(timeout, handler.call(params, ctx)) => match res {
                Ok(Ok(outcome)) => Ok(RunOutcome::Outcome(outcome)),
                Ok(Err(err)) => Err(err),
                Err(_) => Ok(RunOutcome::Timeout),
            },
            _ = cancel.cancelled() => Ok(RunOutcome::Cancelled),
        }
    }

    /// Runs the handler inside the Sandbox Runner when `requires_sandbox`
    /// is set. The handler is still the unit of work; the sandbox only
    /// supplies the resource caps and security policy around code-execution
    /// tools (the `python_code` tool being the canonical example).
    async fn run_sandboxed(
        &self,
        handler: &Arc<dyn ToolHandler>,
        params: Value,
        ctx: &ToolCallContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, ToolHandlerError> {
        if self.sandbox.is_none() {
            return Err(ToolHandlerError {
                code: "SERVICE_UNAVAILABLE".into(),
                message: "tool requires a sandbox but none is configured".into(),
                retryable: true,
            });
        }
        // The sandbox's own policy/resource enforcement happens inside the
        // handler implementation (it holds the `Arc<SandboxRunner>`); this
        // executor only needs to apply the same timeout envelope uniformly.
        self.run_direct(handler, params, ctx, timeout, cancel).await
    }
}

enum RunOutcome {
    Outcome(HandlerOutcome),
    Timeout,
    Cancelled,
}

/// Validates `params` against `schema`, filling in defaults it can infer.
/// A handler never runs against unvalidated parameters.
fn validate_and_normalize(
    schema: &penny_provider::chat::ParametersSchema,
    mut params: Value,
) -> Result<Value, String> {
    let obj = params
        .as_object_mut()
        .ok_or_else(|| "params must be a JSON object".to_string())?;

    for required in &schema.required {
        match obj.get(required) {
            None => return Err(format!("missing required parameter {required:?}")),
            Some(Value::String(s)) if s.is_empty() => {
                return Err(format!("required parameter {required:?} must not be empty"));
            }
            _ => {}
        }
    }

    for (name, prop) in &schema.properties {
        let Some(value) = obj.get(name) else { continue };
        let type_ok = match prop.property_type.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !type_ok {
            return Err(format!("parameter {name:?} does not match type {:?}", prop.property_type));
        }
        if let Some(enum_list) = &prop.enum_list
            && let Some(s) = value.as_str()
            && !enum_list.iter().any(|e| e == s)
        {
            return Err(format!("parameter {name:?} must be one of {enum_list:?}"));
        }
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::definition::{ToolConfig, ToolDefinition};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn schema_requiring(field: &str) -> penny_provider::chat::ParametersSchema {
        let mut properties = HashMap::new();
        properties.insert(
            field.to_string(),
            penny_provider::chat::ParameterProperty {
                property_type: "string".into(),
                description: "".into(),
                items: None,
                enum_list: None,
            },
        );
        penny_provider::chat::ParametersSchema {
            schema_type: "object".into(),
            properties,
            required: vec![field.to_string()],
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, params: Value, _ctx: &ToolCallContext) -> Result<HandlerOutcome, ToolHandlerError> {
            Ok(HandlerOutcome::Success(params))
        }
    }

    struct FlakyHandler(Arc<AtomicU32>);

    #[async_trait]
    impl ToolHandler for FlakyHandler {
        async fn call(&self, _params: Value, _ctx: &ToolCallContext) -> Result<HandlerOutcome, ToolHandlerError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ToolHandlerError {
                    code: "NETWORK_ERROR".into(),
                    message: "flaky".into(),
                    retryable: true,
                })
            } else {
                Ok(HandlerOutcome::Success(serde_json::json!({"ok": true})))
            }
        }
    }

    struct SleepyHandler;

    #[async_trait]
    impl ToolHandler for SleepyHandler {
        async fn call(&self, _params: Value, _ctx: &ToolCallContext) -> Result<HandlerOutcome, ToolHandlerError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(HandlerOutcome::Success(serde_json::json!({})))
        }
    }

    struct CountingSleepyHandler(Arc<AtomicU32>);

    #[async_trait]
    impl ToolHandler for CountingSleepyHandler {
        async fn call(&self, _params: Value, _ctx: &ToolCallContext) -> Result<HandlerOutcome, ToolHandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(HandlerOutcome::Success(serde_json::json!({})))
        }
    }

    fn executor() -> ToolExecutor {
        ToolExecutor::new(Arc::new(ToolRegistry::new()), Arc::new(RateLimiter::new()), 4)
    }

    fn register(executor: &ToolExecutor, name: &str, config: ToolConfig, handler: Arc<dyn ToolHandler>) {
        executor
            .registry
            .register(ToolDefinition {
                name: name.into(),
                version: "1.0.0".into(),
                category: "general".into(),
                author: "penny".into(),
                parameter_schema: schema_requiring("code"),
                config,
                dependencies: Vec::new(),
            })
            .unwrap();
        executor.register_handler(name, handler);
    }

    #[tokio::test]
    async fn missing_required_param_is_invalid_params_without_queuing() {
        let executor = executor();
        register(&executor, "echo", ToolConfig::default(), Arc::new(EchoHandler));
        let err = executor
            .execute("echo", serde_json::json!({}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn empty_required_param_is_invalid_params_without_queuing() {
        let executor = executor();
        register(&executor, "echo", ToolConfig::default(), Arc::new(EchoHandler));
        let err = executor
            .execute("echo", serde_json::json!({"code": ""}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_tool_not_found() {
        let executor = executor();
        let err = executor
            .execute("nope", serde_json::json!({"code": "x"}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn successful_execution_completes() {
        let executor = executor();
        register(&executor, "echo", ToolConfig::default(), Arc::new(EchoHandler));
        let execution = executor
            .execute("echo", serde_json::json!({"code": "x"}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.result.is_some());
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_max_retries() {
        let executor = executor();
        let counter = Arc::new(AtomicU32::new(0));
        let mut config = ToolConfig::default();
        config.max_retries = 3;
        config.timeout_ms = 5_000;
        register(&executor, "flaky", config, Arc::new(FlakyHandler(counter.clone())));
        let execution = executor
            .execute("flaky", serde_json::json!({"code": "x"}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.retries, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let executor = executor();
        let mut config = ToolConfig::default();
        config.timeout_ms = 50;
        config.max_retries = 0;
        register(&executor, "slow", config, Arc::new(SleepyHandler));
        let execution = executor
            .execute("slow", serde_json::json!({"code": "x"}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn timeout_is_retried_up_to_max_retries_then_times_out() {
        let executor = executor();
        let counter = Arc::new(AtomicU32::new(0));
        let mut config = ToolConfig::default();
        config.timeout_ms = 100;
        config.max_retries = 2;
        register(&executor, "slow", config, Arc::new(CountingSleepyHandler(counter.clone())));

        let started = std::time::Instant::now();
        let execution = executor
            .execute("slow", serde_json::json!({"code": "x"}), "t1", "p1", ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Timeout);
        assert_eq!(counter.load(Ordering::SeqCst), 3, "maxRetries=2 must yield exactly 3 attempts");
        assert_eq!(execution.retries, 2);
        // Two retries at backoff 1000ms and 2000ms (base 1000ms * 2^attempt), on
        // top of two 100ms timeouts themselves.
        assert!(started.elapsed() >= Duration::from_millis(2_900));
    }

    #[tokio::test]
    async fn cancelling_while_the_handler_is_running_yields_cancelled_status() {
        let executor = executor();
        let mut config = ToolConfig::default();
        config.timeout_ms = 5_000;
        register(&executor, "slow", config, Arc::new(SleepyHandler));

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let execution = executor
            .execute("slow", serde_json::json!({"code": "x"}), "t1", "p1", ExecuteOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }
}
