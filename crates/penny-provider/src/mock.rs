//! Canned in-process adapter shipped alongside the HTTP adapters.
//!
//! Used by `penny-api`'s default configuration and by every crate's test
//! suite so tests never depend on network access or real credentials.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::{
    chat::{ChatMessage, FinishReason, StreamChunk, Tool, Usage},
    error::LLMError,
    model::{Capabilities, ModelInfo, ModelPricing},
    Completion, ProviderAdapter,
};

/// Replays a fixed script of responses, or echoes the last user message back
/// if no script was configured. Records every call it receives so tests can
/// assert on what was sent.
pub struct MockAdapter {
    models: Vec<ModelInfo>,
    script: Mutex<Vec<Result<String, LLMError>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    available: bool,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            models: vec![ModelInfo {
                id: "mock-standard".into(),
                display_name: "Mock Standard".into(),
                context_window: 128_000,
                max_output_tokens: 4_096,
                capabilities: Capabilities {
                    tool_calling: true,
                    streaming: true,
                    vision: false,
                    json_mode: true,
                },
                pricing: ModelPricing {
                    input_per_million: 0.0,
                    output_per_million: 0.0,
                },
            }],
            script: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            available: true,
        }
    }

    /// Queues a canned response, returned in FIFO order by successive calls.
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.script.lock().unwrap().push(Ok(text.into()));
        self
    }

    pub fn with_error(self, err: LLMError) -> Self {
        self.script.lock().unwrap().push(Err(err));
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub async fn recorded_calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    async fn next_reply(&self, messages: &[ChatMessage]) -> Result<String, LLMError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let mut script = self.script.lock().unwrap();
        if !script.is_empty() {
            return script.remove(0);
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::chat::ChatRole::User))
            .map(|m| m.text())
            .unwrap_or_default();
        Ok(format!("echo: {last_user}"))
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn complete(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: Option<&[Tool]>,
    ) -> Result<Completion, LLMError> {
        let text = self.next_reply(messages).await?;
        Ok(Completion {
            message: ChatMessage::assistant(text, None),
            finish_reason: FinishReason::Stop,
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
        })
    }

    async fn stream(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: Option<&[Tool]>,
    ) -> Result<BoxStream<'static, StreamChunk>, LLMError> {
        let text = self.next_reply(messages).await?;
        let chunks = vec![
            StreamChunk::Content { text },
            StreamChunk::Done {
                finish_reason: FinishReason::Stop,
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                }),
            },
        ];
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    #[tokio::test]
    async fn echoes_last_user_message_by_default() {
        let adapter = MockAdapter::new();
        let messages = vec![ChatMessage::user("hello there")];
        let completion = adapter.complete("mock-standard", &messages, None).await.unwrap();
        assert_eq!(completion.message.text(), "echo: hello there");
    }

    #[tokio::test]
    async fn scripted_responses_are_returned_in_order() {
        let adapter = MockAdapter::new().with_response("first").with_response("second");
        let messages = vec![ChatMessage::user("x")];
        let first = adapter.complete("mock-standard", &messages, None).await.unwrap();
        let second = adapter.complete("mock-standard", &messages, None).await.unwrap();
        assert_eq!(first.message.text(), "first");
        assert_eq!(second.message.text(), "second");
    }

    #[tokio::test]
    async fn unavailable_adapter_reports_down() {
        let adapter = MockAdapter::new().unavailable();
        assert!(!adapter.is_available().await);
    }
}
