//! The one tool this workspace ships compiled-in: `python_code`, the
//! canonical sandboxed-execution tool. It is the concrete link between the
//! tool registry/executor and the sandbox runner: a handler that holds an
//! `Arc<SandboxRunner>` and nothing else.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use penny_provider::chat::{ParameterProperty, ParametersSchema};
use penny_sandbox::SandboxRunner;

use crate::tools::definition::{ToolConfig, ToolDefinition};
use crate::tools::executor::{HandlerOutcome, ToolCallContext, ToolHandler, ToolHandlerError};

/// Runs the `code` parameter inside the sandbox, threading the caller's
/// optional `sessionId` through for per-session variable persistence.
pub struct PythonCodeHandler {
    sandbox: Arc<SandboxRunner>,
}

impl PythonCodeHandler {
    pub fn new(sandbox: Arc<SandboxRunner>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for PythonCodeHandler {
    async fn call(&self, params: Value, ctx: &ToolCallContext) -> Result<HandlerOutcome, ToolHandlerError> {
        let code = params
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolHandlerError {
                code: "INVALID_PARAMS".into(),
                message: "missing required parameter \"code\"".into(),
                retryable: false,
            })?;
        let session_id = params.get("sessionId").and_then(|v| v.as_str());

        match self.sandbox.execute(session_id, code, ctx.allow_network).await {
            Ok(outcome) => Ok(HandlerOutcome::Success(serde_json::json!({
                "sessionId": outcome.session_id,
                "stdout": outcome.stdout,
                "stderr": outcome.stderr,
                "exitCode": outcome.exit_code,
                "durationMs": outcome.duration_ms,
                "variables": outcome.variables,
                "plotFiles": outcome.plot_files,
            }))),
            Err(err) => Err(ToolHandlerError {
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: err.retryable(),
            }),
        }
    }
}

/// The `python_code` tool's definition, with `requiresSandbox` set so the
/// executor routes every invocation through [`PythonCodeHandler`].
pub fn python_code_definition() -> ToolDefinition {
    let mut properties = HashMap::new();
    properties.insert(
        "code".to_string(),
        ParameterProperty {
            property_type: "string".into(),
            description: "Python source to run in the sandbox".into(),
            items: None,
            enum_list: None,
        },
    );
    properties.insert(
        "sessionId".to_string(),
        ParameterProperty {
            property_type: "string".into(),
            description: "Existing sandbox session to reuse, or omitted to start a new one".into(),
            items: None,
            enum_list: None,
        },
    );

    ToolDefinition {
        name: "python_code".into(),
        version: "1.0.0".into(),
        category: "code_execution".into(),
        author: "penny".into(),
        parameter_schema: ParametersSchema {
            schema_type: "object".into(),
            properties,
            required: vec!["code".to_string()],
        },
        config: ToolConfig {
            requires_sandbox: true,
            max_retries: 1,
            ..ToolConfig::default()
        },
        dependencies: Vec::new(),
    }
}
