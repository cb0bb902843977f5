// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM endpoint trait: a streaming chat-completions call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MantisError;
use crate::stream::{EventStream, ToolCall};
use crate::tool::ToolDefinition;

/// One message in the LLM conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmMessage {
    /// "system", "user", "assistant" or "tool".
    pub role: String,
    pub content: String,
    /// Tool calls the assistant requested (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Id of the call this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl LlmMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        LlmMessage {
            role: role.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Parameters of one streaming chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<ToolDefinition>,
    /// "", "skip" or "inline", applied to `<think>` spans in the stream.
    pub thinking_mode: String,
}

/// A streaming chat-completions endpoint.
#[async_trait]
pub trait ChatStreamer: Send + Sync {
    /// Opens a streaming completion. The returned stream ends with either a
    /// final `tool_calls`, a natural close, or a final `error` event.
    async fn chat_stream(&self, req: ChatRequest) -> Result<EventStream, MantisError>;
}

/// An OpenAI-compatible vision endpoint.
#[async_trait]
pub trait VisionLlm: Send + Sync {
    async fn describe(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        image: &[u8],
        format: &str,
        prompt: &str,
    ) -> Result<String, MantisError>;
}
