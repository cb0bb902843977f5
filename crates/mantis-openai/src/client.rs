// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming client for OpenAI-compatible chat-completions endpoints.
//!
//! Sends `stream: true` requests and converts the SSE response into
//! [`StreamEvent`]s using the `eventsource-stream` crate. Tool-call deltas
//! are collapsed by index; a single final `tool_calls` event is emitted on
//! `finish_reason = "tool_calls"` or on stream end with accumulated calls, since
//! some providers report `finish_reason = "stop"` while still emitting
//! tool-call deltas.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use mantis_core::traits::llm::{ChatRequest, ChatStreamer, LlmMessage};
use mantis_core::{
    EventSender, EventStream, MantisError, StreamEvent, ToolCall, ToolDefinition, STREAM_BUFFER,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::thinking::apply_thinking_stream;

/// HTTP client for OpenAI-compatible streaming chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new() -> Result<Self, MantisError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MantisError::Llm {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(OpenAiClient { client })
    }
}

#[derive(Serialize)]
struct ReqFunction<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct ReqToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: ReqFunction<'a>,
}

#[derive(Serialize)]
struct ReqMessage<'a> {
    role: &'a str,
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ReqToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ReqToolDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct ReqTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ReqToolDef<'a>,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<ReqMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ReqTool<'a>>,
    stream: bool,
}

#[derive(Deserialize, Default)]
struct DeltaFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: DeltaFunction,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning_content: String,
    #[serde(default)]
    tool_calls: Vec<DeltaToolCall>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

fn build_messages(messages: &[LlmMessage]) -> Vec<ReqMessage<'_>> {
    messages
        .iter()
        .map(|m| {
            let tool_calls: Vec<ReqToolCall<'_>> = m
                .tool_calls
                .iter()
                .map(|tc| ReqToolCall {
                    id: &tc.id,
                    kind: "function",
                    function: ReqFunction {
                        name: &tc.name,
                        arguments: &tc.arguments,
                    },
                })
                .collect();
            // An assistant message that only carries tool calls sends a null
            // content field.
            let content = if m.content.is_empty() && !tool_calls.is_empty() {
                None
            } else {
                Some(m.content.as_str())
            };
            ReqMessage {
                role: &m.role,
                content,
                tool_calls,
                tool_call_id: if m.tool_call_id.is_empty() {
                    None
                } else {
                    Some(&m.tool_call_id)
                },
            }
        })
        .collect()
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<ReqTool<'_>> {
    tools
        .iter()
        .map(|t| ReqTool {
            kind: "function",
            function: ReqToolDef {
                name: &t.name,
                description: &t.description,
                parameters: &t.parameters,
            },
        })
        .collect()
}

fn ordered_calls(calls: BTreeMap<u64, ToolCall>) -> Vec<ToolCall> {
    calls.into_values().collect()
}

async fn pump_sse(response: reqwest::Response, tx: EventSender) {
    let mut events = response.bytes_stream().eventsource();
    let mut seq: u64 = 0;
    // Collapsed by delta index. A BTreeMap keeps order stable even when a
    // provider reports sparse indices.
    let mut tool_calls: BTreeMap<u64, ToolCall> = BTreeMap::new();

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "LLM stream read error");
                let _ = tx.send(StreamEvent::error(e.to_string())).await;
                return;
            }
        };
        if event.data == "[DONE]" {
            debug!(events = seq, "LLM stream done");
            break;
        }
        let chunk: StreamChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(_) => continue,
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            continue;
        };

        if !choice.delta.reasoning_content.is_empty() {
            let mut ev = StreamEvent::thinking(choice.delta.reasoning_content);
            ev.sequence = seq;
            seq += 1;
            if tx.send(ev).await.is_err() {
                return;
            }
        }
        if !choice.delta.content.is_empty() {
            let mut ev = StreamEvent::text(choice.delta.content);
            ev.sequence = seq;
            seq += 1;
            if tx.send(ev).await.is_err() {
                return;
            }
        }

        for delta in choice.delta.tool_calls {
            let entry = tool_calls.entry(delta.index).or_default();
            if !delta.id.is_empty() {
                entry.id = delta.id;
            }
            if !delta.function.name.is_empty() {
                entry.name = delta.function.name;
            }
            entry.arguments.push_str(&delta.function.arguments);
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            let mut ev = StreamEvent::tool_calls(ordered_calls(tool_calls));
            ev.sequence = seq;
            let _ = tx.send(ev).await;
            return;
        }
    }

    // Emit accumulated tool calls even when finish_reason was not
    // "tool_calls" (LM Studio reports "stop" while streaming call deltas).
    if !tool_calls.is_empty() {
        let mut ev = StreamEvent::tool_calls(ordered_calls(tool_calls));
        ev.sequence = seq;
        let _ = tx.send(ev).await;
    }
}

#[async_trait]
impl ChatStreamer for OpenAiClient {
    async fn chat_stream(&self, req: ChatRequest) -> Result<EventStream, MantisError> {
        let payload = ChatReq {
            model: &req.model,
            messages: build_messages(&req.messages),
            tools: build_tools(&req.tools),
            stream: true,
        };

        let url = format!("{}/chat/completions", req.base_url.trim_end_matches('/'));
        debug!(
            url = url.as_str(),
            model = req.model.as_str(),
            messages = req.messages.len(),
            tools = req.tools.len(),
            "LLM stream request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&req.api_key)
            .header("Accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| MantisError::Llm {
                message: format!("LLM request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        debug!(status = %status, "LLM stream response");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MantisError::llm(format!("LLM API error {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_sse(response, tx));

        if req.thinking_mode.is_empty() {
            Ok(rx)
        } else {
            Ok(apply_thinking_stream(rx, req.thinking_mode))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_core::EventKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sse_server(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body.to_string()),
            )
            .mount(&server)
            .await;
        server
    }

    fn request(base_url: &str) -> ChatRequest {
        ChatRequest {
            base_url: base_url.to_string(),
            api_key: "test-key".into(),
            model: "test-model".into(),
            messages: vec![LlmMessage::new("user", "hi")],
            tools: vec![],
            thinking_mode: String::new(),
        }
    }

    async fn collect(mut stream: EventStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = stream.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn streams_text_and_thinking_deltas() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hm\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = sse_server(body).await;
        let client = OpenAiClient::new().unwrap();
        let events = collect(client.chat_stream(request(&server.uri())).await.unwrap()).await;

        assert_eq!(events[0].kind, EventKind::Thinking);
        let text: String = events
            .iter()
            .filter(|e| e.kind == EventKind::Text)
            .map(|e| e.delta.as_str())
            .collect();
        assert_eq!(text, "Hello");
        assert!(!events.iter().any(|e| e.kind == EventKind::Error));
    }

    #[tokio::test]
    async fn collapses_tool_call_deltas_on_finish_reason() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"sum\",\"arguments\":\"{\\\"num\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"bers\\\":[1,2]}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = sse_server(body).await;
        let client = OpenAiClient::new().unwrap();
        let events = collect(client.chat_stream(request(&server.uri())).await.unwrap()).await;

        let calls: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolCalls)
            .collect();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].is_final);
        assert_eq!(calls[0].tool_calls.len(), 1);
        assert_eq!(calls[0].tool_calls[0].id, "call_1");
        assert_eq!(calls[0].tool_calls[0].name, "sum");
        assert_eq!(calls[0].tool_calls[0].arguments, r#"{"numbers":[1,2]}"#);
    }

    #[tokio::test]
    async fn sparse_indices_with_stop_reason_still_emit_tool_calls() {
        // LM Studio compatibility: a call delta at a sparse index and
        // finish_reason "stop" must still produce exactly one tool_calls
        // event carrying the concatenated arguments.
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":3,\"id\":\"c3\",\"function\":{\"name\":\"sum\",\"arguments\":\"{\\\"a\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":3,\"function\":{\"arguments\":\"1}\"}}]},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = sse_server(body).await;
        let client = OpenAiClient::new().unwrap();
        let events = collect(client.chat_stream(request(&server.uri())).await.unwrap()).await;

        let calls: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolCalls)
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_calls.len(), 1);
        assert_eq!(calls[0].tool_calls[0].arguments, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let client = OpenAiClient::new().unwrap();
        let err = client.chat_stream(request(&server.uri())).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn malformed_chunks_are_skipped() {
        let body = concat!(
            "data: this is not json\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = sse_server(body).await;
        let client = OpenAiClient::new().unwrap();
        let events = collect(client.chat_stream(request(&server.uri())).await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delta, "ok");
    }
}
