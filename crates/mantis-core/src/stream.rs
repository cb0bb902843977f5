// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The in-process stream-event bus shared by the LLM client, the agent loop,
//! the pipeline and delivery.
//!
//! Producers emit a bounded sequence of [`StreamEvent`]s over a tokio mpsc
//! channel. `text` accumulates assistant content, `thinking` carries model
//! reasoning, `tool_start`/`tool_end` bracket one tool execution sharing a
//! `tool_id`, `tool_meta` carries late-binding metadata, and an `error` with
//! `is_final` ends the stream.

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::mpsc;

/// Buffer depth of every event channel. Slow consumers cost throughput but
/// never ordering.
pub const STREAM_BUFFER: usize = 32;

/// The receiving half of a stream of events.
pub type EventStream = mpsc::Receiver<StreamEvent>;

/// The sending half of a stream of events.
pub type EventSender = mpsc::Sender<StreamEvent>;

/// Discriminates what a [`StreamEvent`] carries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    #[default]
    Text,
    Thinking,
    ToolCalls,
    ToolStart,
    ToolMeta,
    ToolEnd,
    Error,
}

/// One collapsed tool invocation requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text, concatenated from streamed deltas.
    pub arguments: String,
}

/// A single event on the stream bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub iteration: usize,
    /// Text payload: content delta, serialized step, tool result or error.
    #[serde(default)]
    pub delta: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub is_final: bool,
}

impl StreamEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        StreamEvent {
            kind: EventKind::Text,
            delta: delta.into(),
            ..Default::default()
        }
    }

    pub fn thinking(delta: impl Into<String>) -> Self {
        StreamEvent {
            kind: EventKind::Thinking,
            delta: delta.into(),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        StreamEvent {
            kind: EventKind::ToolCalls,
            tool_calls: calls,
            is_final: true,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent {
            kind: EventKind::Error,
            delta: message.into(),
            is_final: true,
            ..Default::default()
        }
    }
}

/// Drains a stream, concatenating `text` deltas. An `error` event aborts with
/// its message.
pub async fn collect_text(mut stream: EventStream) -> Result<String, crate::error::MantisError> {
    let mut out = String::new();
    while let Some(event) = stream.recv().await {
        match event.kind {
            EventKind::Error => return Err(crate::error::MantisError::llm(event.delta)),
            EventKind::Text => out.push_str(&event.delta),
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_text_joins_deltas() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(StreamEvent::text("hello ")).await.unwrap();
        tx.send(StreamEvent::thinking("hm")).await.unwrap();
        tx.send(StreamEvent::text("world")).await.unwrap();
        drop(tx);
        assert_eq!(collect_text(rx).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn collect_text_surfaces_errors() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(StreamEvent::text("partial")).await.unwrap();
        tx.send(StreamEvent::error("stream broke")).await.unwrap();
        drop(tx);
        let err = collect_text(rx).await.unwrap_err();
        assert!(err.to_string().contains("stream broke"));
    }

    #[test]
    fn event_kind_display_is_snake_case() {
        assert_eq!(EventKind::ToolCalls.to_string(), "tool_calls");
        assert_eq!(EventKind::Text.to_string(), "text");
    }
}
