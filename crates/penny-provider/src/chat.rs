//! Chat message and tool-call vocabulary shared by every provider adapter.
//!
//! Grounded on `querymt::chat`, generalized from a two-role (`User`/`Assistant`)
//! model to the four roles a multi-turn tool-calling conversation needs
//! (`user`, `assistant`, `system`, `tool`), and from a single `MessageType`
//! enum to content parts so a message can carry text and an image/tool-result
//! side by side.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

/// The supported MIME type of an image part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageMime {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageMime {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageMime::Jpeg => "image/jpeg",
            ImageMime::Png => "image/png",
            ImageMime::Gif => "image/gif",
            ImageMime::Webp => "image/webp",
        }
    }
}

/// One part of a message's content: text or a heterogeneous array of
/// text/image parts, represented as a discriminated union instead of
/// duck-typed JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { mime: ImageMime, data: Vec<u8> },
    ImageUrl { url: String },
}

/// A tool call the assistant asked to make.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as the upstream model emitted them.
    pub arguments: String,
}

/// Token usage reported by a provider for one completion.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Default)]
pub struct Usage {
    #[serde(
        alias = "prompt_tokens",
        alias = "input_tokens",
        alias = "prompt_eval_count"
    )]
    pub input_tokens: u32,
    #[serde(
        alias = "completion_tokens",
        alias = "output_tokens",
        alias = "eval_count"
    )]
    pub output_tokens: u32,
}

/// A single message in a conversation, minus the storage-only fields
/// `id`/`conversation_id`/`parent_id`/`created_at`, which are layered on
/// in `penny-core`'s conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present on `role: tool` messages: the call this is answering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: vec![ContentPart::Text { text: text.into() }],
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Concatenated text of all text parts, used for token-length heuristics.
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

    pub fn has_image(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. } | ContentPart::ImageUrl { .. }))
    }
}

/// Parameter schema for a tool, following JSON Schema's object-with-properties
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParameterProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterProperty>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "enum")]
    pub enum_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, ParameterProperty>,
    pub required: Vec<String>,
}

/// A tool definition as presented to a provider's function-calling API.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionTool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Why a completion (streaming or not) stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
}

/// One chunk of a streaming completion. The stream is finite and
/// non-restartable: it emits zero or more `content`/`tool_call_delta`
/// chunks, then terminates after exactly one `done` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Content { text: String },
    ToolCallDelta { index: usize, id: Option<String>, name: Option<String>, arguments_delta: String },
    Done { finish_reason: FinishReason, usage: Option<Usage> },
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_joins_only_text_parts() {
        let msg = ChatMessage {
            role: ChatRole::User,
            content: vec![
                ContentPart::Text { text: "hi".into() },
                ContentPart::ImageUrl { url: "http://x/y.png".into() },
                ContentPart::Text { text: "there".into() },
            ],
            tool_calls: None,
            tool_call_id: None,
        };
        assert_eq!(msg.text(), "hi\nthere");
        assert!(msg.has_image());
    }
}
