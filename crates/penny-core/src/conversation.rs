//! Conversation/Message/Artifact data model and store.
//!
//! Sharded by conversation ID the same way [`crate::rate_limit::RateLimiter`]
//! shards by `(tenant_id, scope)` and `penny_sandbox::session::SessionStore`
//! shards by session ID — the one store-shape this workspace uses throughout
//! for process-local, tenant-scoped state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use penny_provider::chat::{ChatMessage, ChatRole, ContentPart, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::tenant::TenantId;

pub type ConversationId = String;
pub type MessageId = String;

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: ChatRole,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// The assistant message this `tool`-role message is answering. Every
    /// `tool`-role message carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl Message {
    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(conversation_id, ChatRole::User, vec![ContentPart::Text { text: text.into() }])
    }

    fn new(conversation_id: impl Into<String>, role: ChatRole, content: Vec<ContentPart>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            parent_id: None,
            token_count: 0,
            created_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    pub fn assistant(
        conversation_id: impl Into<String>,
        text: impl Into<String>,
        tool_calls: Option<Vec<ToolCall>>,
        token_count: u32,
    ) -> Self {
        let mut message = Self::new(conversation_id, ChatRole::Assistant, vec![ContentPart::Text { text: text.into() }]);
        message.tool_calls = tool_calls;
        message.token_count = token_count;
        message
    }

    pub fn tool_result(
        conversation_id: impl Into<String>,
        parent_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(conversation_id, ChatRole::Tool, vec![ContentPart::Text { text: text.into() }]);
        message.parent_id = Some(parent_id.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    /// Projects into the wire-agnostic [`ChatMessage`] the provider adapter
    /// layer speaks, dropping the storage-only fields.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A generated resource attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub message_id: MessageId,
    pub artifact_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Ordered sequence of messages, tenant-owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub messages: Vec<Message>,
    pub artifacts: Vec<Artifact>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            messages: Vec::new(),
            artifacts: Vec::new(),
        }
    }
}

/// Persists conversations, messages, and artifacts. Tenant ownership is
/// enforced at every call so a cross-tenant lookup surfaces as
/// [`CoreError::NotFound`], never `Unauthorized` — a 404 reveals nothing
/// about whether the resource exists in another tenant.
pub trait ConversationStore: Send + Sync {
    fn get(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation, CoreError>;
    fn append_message(&self, tenant_id: &str, message: Message) -> Result<(), CoreError>;
    fn append_artifact(&self, tenant_id: &str, conversation_id: &str, artifact: Artifact) -> Result<(), CoreError>;
    /// Marks a message's metadata as failed without deleting it.
    fn mark_processing_failed(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        message_id: &str,
        error: &str,
    ) -> Result<(), CoreError>;
}

/// In-memory [`ConversationStore`], sharded by conversation ID.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<ConversationId, Conversation>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, tenant_id: impl Into<String>) -> ConversationId {
        let id = uuid::Uuid::new_v4().to_string();
        self.conversations.insert(id.clone(), Conversation::new(id.clone(), tenant_id));
        id
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn get(&self, tenant_id: &str, conversation_id: &str) -> Result<Conversation, CoreError> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .map(|c| c.clone())
            .ok_or(CoreError::NotFound)?;
        if conversation.tenant_id != tenant_id {
            return Err(CoreError::NotFound);
        }
        Ok(conversation)
    }

    fn append_message(&self, tenant_id: &str, message: Message) -> Result<(), CoreError> {
        let mut conversation = self
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or(CoreError::NotFound)?;
        if conversation.tenant_id != tenant_id {
            return Err(CoreError::NotFound);
        }
        conversation.messages.push(message);
        Ok(())
    }

    fn append_artifact(&self, tenant_id: &str, conversation_id: &str, artifact: Artifact) -> Result<(), CoreError> {
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or(CoreError::NotFound)?;
        if conversation.tenant_id != tenant_id {
            return Err(CoreError::NotFound);
        }
        conversation.artifacts.push(artifact);
        Ok(())
    }

    fn mark_processing_failed(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        message_id: &str,
        error: &str,
    ) -> Result<(), CoreError> {
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or(CoreError::NotFound)?;
        if conversation.tenant_id != tenant_id {
            return Err(CoreError::NotFound);
        }
        let message = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(CoreError::NotFound)?;
        message.metadata = serde_json::json!({
            "processingFailed": true,
            "error": crate::error::redact(Value::String(error.to_string())),
            "failedAt": Utc::now(),
        });
        Ok(())
    }
}

/// Most-recent-first message window bounded by a character budget, the
/// cheapest proxy for a token budget available without a tokenizer.
pub fn recent_window(conversation: &Conversation, char_budget: usize) -> Vec<Message> {
    let mut window = Vec::new();
    let mut used = 0usize;
    for message in conversation.messages.iter().rev() {
        let len = message.text().len();
        if used + len > char_budget && !window.is_empty() {
            break;
        }
        used += len;
        window.push(message.clone());
    }
    window.reverse();
    window
}

pub fn shared_store() -> Arc<dyn ConversationStore> {
    Arc::new(InMemoryConversationStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_tenant_lookup_is_not_found_not_unauthorized() {
        let store = InMemoryConversationStore::new();
        let id = store.create("t1");
        let err = store.get("t2", &id).unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[test]
    fn append_and_get_round_trips() {
        let store = InMemoryConversationStore::new();
        let id = store.create("t1");
        store.append_message("t1", Message::user(&id, "hi")).unwrap();
        let conversation = store.get("t1", &id).unwrap();
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn mark_processing_failed_preserves_the_message() {
        let store = InMemoryConversationStore::new();
        let id = store.create("t1");
        let message = Message::user(&id, "hi");
        let message_id = message.id.clone();
        store.append_message("t1", message).unwrap();
        store.mark_processing_failed("t1", &id, &message_id, "boom").unwrap();

        let conversation = store.get("t1", &id).unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].metadata["processingFailed"], true);
    }

    #[test]
    fn recent_window_trims_to_budget_keeping_newest() {
        let conversation_id = "c1";
        let mut conversation = Conversation::new(conversation_id, "t1");
        conversation.messages.push(Message::user(conversation_id, "a".repeat(50)));
        conversation.messages.push(Message::user(conversation_id, "b".repeat(50)));
        conversation.messages.push(Message::user(conversation_id, "c".repeat(50)));

        let window = recent_window(&conversation, 80);
        assert_eq!(window.len(), 1);
        assert!(window[0].text().starts_with('c'));
    }

    #[test]
    fn recent_window_always_includes_at_least_the_newest_message() {
        let conversation_id = "c1";
        let mut conversation = Conversation::new(conversation_id, "t1");
        conversation.messages.push(Message::user(conversation_id, "a".repeat(1_000)));

        let window = recent_window(&conversation, 1);
        assert_eq!(window.len(), 1);
    }
}
