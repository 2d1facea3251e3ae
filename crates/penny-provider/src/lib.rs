//! Provider Adapter layer: a unified interface over upstream LLM APIs.
//!
//! This crate provides a consistent API for sending chat completions (plain
//! or streamed) to whichever upstream backend a tenant's routed model lives
//! behind, abstracting away provider-specific request/response shapes.
//!
//! # Architecture
//!
//! [`ProviderAdapter`] is the trait every backend implements: list the
//! models it serves, answer a liveness probe, and run a completion either to
//! completion or as a [`chat::StreamChunk`] stream. [`adapters::HttpAdapter`]
//! bridges any OpenAI/Anthropic/Ollama-style HTTP API to this trait;
//! [`mock::MockAdapter`] is a canned in-process adapter used by tests and by
//! `penny-api` when no upstream credentials are configured.

use async_trait::async_trait;
use futures::stream::BoxStream;

use chat::{ChatMessage, StreamChunk, Tool};
use error::LLMError;
use model::ModelInfo;

pub mod adapters;
pub mod auth;
pub mod builder;
pub mod chat;
pub mod error;
pub mod mock;
pub mod model;
#[cfg(feature = "http-client")]
pub mod outbound;
pub mod params;

/// The result of a non-streamed completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub message: ChatMessage,
    pub finish_reason: chat::FinishReason,
    pub usage: Option<chat::Usage>,
}

/// A single upstream model backend.
///
/// Implementors are responsible only for translating between this crate's
/// wire-agnostic types and whatever shape the upstream API speaks; retry
/// policy, rate limiting and routing all live above this trait in
/// `penny-core`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier used in routing tables and usage records.
    fn name(&self) -> &str;

    /// Models this adapter can currently serve.
    fn list_models(&self) -> Vec<ModelInfo>;

    /// Cheap liveness probe: no token spend, used by the router to skip
    /// adapters that are known-down before a routing decision is made.
    async fn is_available(&self) -> bool;

    /// Run a completion to its natural end and return the whole message.
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<Completion, LLMError>;

    /// Run a completion as a stream of [`StreamChunk`]s. The stream is
    /// finite and non-restartable: it terminates after exactly one `Done`
    /// or `Error` chunk.
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
    ) -> Result<BoxStream<'static, StreamChunk>, LLMError>;
}
