//! Bridges a sync HTTP request/response translator to [`ProviderAdapter`].
//!
//! Grounded on `querymt::adapters::LLMProviderFromHTTP`, generalized from
//! `querymt`'s split chat/completion/embedding traits to this crate's single
//! `ProviderAdapter` surface.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::{
    auth::ApiKeyResolver,
    chat::{ChatMessage, FinishReason, StreamChunk, Tool, Usage},
    error::LLMError,
    model::ModelInfo,
    outbound::call_outbound,
    params::LLMParams,
    Completion, ProviderAdapter,
};

/// Translates this crate's wire-agnostic request/response types to and from
/// whatever shape a specific upstream HTTP API expects.
///
/// Implementations are synchronous and side-effect free; [`HttpAdapter`]
/// owns the actual network I/O so every backend shares one retry-free
/// outbound path.
pub trait HttpTranslator: Send + Sync {
    fn chat_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        api_key: &str,
    ) -> Result<http::Request<Vec<u8>>, LLMError>;

    fn parse_chat(&self, resp: http::Response<Vec<u8>>) -> Result<Completion, LLMError>;
}

/// An HTTP-backed [`ProviderAdapter`] built from a [`HttpTranslator`] and a
/// credential resolver.
pub struct HttpAdapter {
    name: String,
    models: Vec<ModelInfo>,
    translator: Arc<dyn HttpTranslator>,
    key_resolver: Arc<dyn ApiKeyResolver>,
    defaults: LLMParams,
}

impl HttpAdapter {
    pub fn new(
        name: impl Into<String>,
        models: Vec<ModelInfo>,
        translator: Arc<dyn HttpTranslator>,
        key_resolver: Arc<dyn ApiKeyResolver>,
    ) -> Self {
        Self {
            name: name.into(),
            models,
            translator,
            key_resolver,
            defaults: LLMParams::default(),
        }
    }

    /// Attaches adapter-construction-time defaults (system prompt parts,
    /// sampling hints). Every completion is run with these applied ahead of
    /// the caller's own messages, since `ProviderAdapter::complete` takes no
    /// per-call params of its own.
    pub fn with_defaults(mut self, defaults: LLMParams) -> Self {
        self.defaults = defaults;
        self
    }

    fn prepare_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        if self.defaults.system.is_empty() {
            return messages.to_vec();
        }
        let mut out: Vec<ChatMessage> =
            self.defaults.system.iter().map(ChatMessage::system).collect();
        out.extend_from_slice(messages);
        out
    }

    async fn do_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Completion, LLMError> {
        self.key_resolver.resolve().await?;
        let messages = self.prepare_messages(messages);
        let req = self
            .translator
            .chat_request(model, &messages, tools, &self.key_resolver.current())?;
        let resp = call_outbound(req)
            .await
            .map_err(|e| LLMError::Upstream(e.to_string()))?;
        self.translator.parse_chat(resp)
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn is_available(&self) -> bool {
        self.key_resolver.resolve().await.is_ok()
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Completion, LLMError> {
        self.do_chat(model, messages, tools).await
    }

    /// `HttpAdapter` has no native streaming transport in this crate;
    /// callers that want a progressive UX over it get one synthetic chunk
    /// followed by `Done`, which still satisfies the finite,
    /// non-restartable contract every stream must honor: exactly one
    /// `Done` or `Error` chunk, ever.
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<BoxStream<'static, StreamChunk>, LLMError> {
        let completion = self.do_chat(model, messages, tools).await;
        let chunks: Vec<StreamChunk> = match completion {
            Ok(c) => vec![
                StreamChunk::Content { text: c.message.text() },
                StreamChunk::Done {
                    finish_reason: c.finish_reason,
                    usage: c.usage,
                },
            ],
            Err(e) => vec![StreamChunk::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            }],
        };
        Ok(stream::iter(chunks).boxed())
    }
}

/// Default finish-reason/usage mapping helper for translators that only know
/// their upstream's native vocabulary.
pub fn finish_reason_or_stop(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("length") | Some("max_tokens") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") | Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

pub fn zero_usage() -> Usage {
    Usage::default()
}
