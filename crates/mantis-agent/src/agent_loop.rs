// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The agent loop: iterate LLM stream -> collect tool calls -> dispatch tools ->
//! feed results back, up to a maximum number of iterations.
//!
//! Every `text`/`thinking`/`error` event is forwarded downstream stamped with
//! the iteration. Tool calls execute sequentially; `tool_start` and
//! `tool_end` strictly bracket each execution, with `tool_meta` emitted in
//! between as soon as the running tool publishes late-binding metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use mantis_core::traits::llm::{ChatRequest, ChatStreamer, LlmMessage};
use mantis_core::types::Step;
use mantis_core::{
    EventKind, EventSender, EventStream, StreamEvent, ToolContext, ToolDispatcher, ToolSpec,
    STREAM_BUFFER,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_MAX_ITERATIONS: usize = 10;

/// How often the tool-meta slot is polled while a tool runs.
const META_POLL: Duration = Duration::from_millis(50);

/// Parameters of one loop run.
pub struct LoopInput {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub tools: Vec<ToolSpec>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub thinking_mode: String,
    /// Zero selects the default of 10.
    pub max_iterations: usize,
    pub message_id: String,
    pub cancel: CancellationToken,
}

/// Runs streaming tool-calling loops against an LLM endpoint.
pub struct AgentLoop {
    llm: Arc<dyn ChatStreamer>,
}

impl AgentLoop {
    pub fn new(llm: Arc<dyn ChatStreamer>) -> Self {
        AgentLoop { llm }
    }

    /// Starts the loop, returning its event stream. The loop runs on its own
    /// task and ends the stream when it finishes.
    pub fn execute(&self, input: LoopInput) -> EventStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let llm = self.llm.clone();
        tokio::spawn(run_loop(llm, input, tx));
        rx
    }
}

async fn run_loop(llm: Arc<dyn ChatStreamer>, input: LoopInput, tx: EventSender) {
    let max_iter = if input.max_iterations == 0 {
        DEFAULT_MAX_ITERATIONS
    } else {
        input.max_iterations
    };

    let tool_map: HashMap<String, ToolSpec> = input
        .tools
        .iter()
        .map(|t| (t.name.clone(), t.clone()))
        .collect();
    let tool_defs: Vec<_> = input.tools.iter().map(ToolSpec::definition).collect();

    let mut messages = input.messages;

    for iteration in 0..max_iter {
        let request = ChatRequest {
            base_url: input.base_url.clone(),
            api_key: input.api_key.clone(),
            model: input.model.clone(),
            messages: messages.clone(),
            tools: tool_defs.clone(),
            thinking_mode: input.thinking_mode.clone(),
        };

        let mut stream = match llm.chat_stream(request).await {
            Ok(stream) => stream,
            Err(err) => {
                let mut event = StreamEvent::error(err.to_string());
                event.iteration = iteration;
                let _ = tx.send(event).await;
                return;
            }
        };

        let mut reply = String::new();
        let mut tool_calls = Vec::new();

        loop {
            let event = tokio::select! {
                _ = input.cancel.cancelled() => {
                    let mut event = StreamEvent::error("cancelled");
                    event.iteration = iteration;
                    let _ = tx.send(event).await;
                    return;
                }
                event = stream.recv() => event,
            };
            let Some(mut event) = event else { break };
            event.iteration = iteration;
            match event.kind {
                EventKind::Text => {
                    reply.push_str(&event.delta);
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                EventKind::Thinking => {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                EventKind::ToolCalls => {
                    tool_calls = event.tool_calls;
                }
                EventKind::Error => {
                    let _ = tx.send(event).await;
                    return;
                }
                _ => {}
            }
        }

        if tool_calls.is_empty() {
            return;
        }

        messages.push(LlmMessage {
            role: "assistant".into(),
            content: reply,
            tool_calls: tool_calls.clone(),
            tool_call_id: String::new(),
        });

        for call in tool_calls {
            let Some(spec) = tool_map.get(&call.name) else {
                messages.push(LlmMessage {
                    role: "tool".into(),
                    content: format!("error: unknown tool {}", call.name),
                    tool_call_id: call.id,
                    ..Default::default()
                });
                continue;
            };

            let step_id = Uuid::new_v4().to_string();
            let step = Step {
                id: step_id.clone(),
                tool: call.name.clone(),
                label: spec.label(&call.arguments),
                icon: spec.icon.to_string(),
                args: call.arguments.clone(),
                status: "running".into(),
                started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                ..Default::default()
            };
            let event = StreamEvent {
                kind: EventKind::ToolStart,
                delta: serde_json::to_string(&step).unwrap_or_default(),
                tool_id: step_id.clone(),
                iteration,
                ..Default::default()
            };
            if tx.send(event).await.is_err() {
                return;
            }

            let ctx = ToolContext {
                step_id: step_id.clone(),
                message_id: input.message_id.clone(),
                meta: Default::default(),
                cancel: input.cancel.clone(),
            };
            let meta_slot = ctx.meta.clone();

            let exec = input
                .dispatcher
                .dispatch(ctx, spec.kind.clone(), call.arguments.clone());
            tokio::pin!(exec);

            let mut ticker = tokio::time::interval(META_POLL);
            let mut meta_sent = false;
            let result = loop {
                tokio::select! {
                    result = &mut exec => break result,
                    _ = ticker.tick(), if !meta_sent => {
                        let meta = meta_slot.get();
                        if !meta.log_id.is_empty() {
                            meta_sent = true;
                            let event = StreamEvent {
                                kind: EventKind::ToolMeta,
                                tool_id: step_id.clone(),
                                log_id: meta.log_id,
                                model_name: meta.model_name,
                                iteration,
                                ..Default::default()
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = input.cancel.cancelled() => {
                        let mut event = StreamEvent::error("cancelled");
                        event.iteration = iteration;
                        let _ = tx.send(event).await;
                        return;
                    }
                }
            };

            let result_text = match result {
                Ok(text) => text,
                Err(err) => format!("error: {err}"),
            };
            let meta = meta_slot.get();
            let event = StreamEvent {
                kind: EventKind::ToolEnd,
                delta: result_text.clone(),
                tool_id: step_id,
                log_id: meta.log_id,
                model_name: meta.model_name,
                iteration,
                ..Default::default()
            };
            if tx.send(event).await.is_err() {
                return;
            }

            messages.push(LlmMessage {
                role: "tool".into(),
                content: result_text,
                tool_call_id: call.id,
                ..Default::default()
            });
        }
    }

    let _ = tx.send(StreamEvent::error("max iterations reached")).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_core::{MantisError, ToolCall, ToolKind};
    use mantis_test_utils::ScriptedLlm;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingDispatcher {
        result: String,
        seen_args: Mutex<Vec<String>>,
        log_id: Option<String>,
    }

    #[async_trait::async_trait]
    impl ToolDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            ctx: ToolContext,
            _kind: ToolKind,
            args: String,
        ) -> Result<String, MantisError> {
            self.seen_args.lock().unwrap().push(args);
            if let Some(log_id) = &self.log_id {
                ctx.meta.set_log_id(log_id.clone());
                ctx.meta.set_model_name("sub-model");
                // Give the 50 ms poller time to observe the slot.
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
            Ok(self.result.clone())
        }
    }

    fn sum_tool() -> ToolSpec {
        ToolSpec {
            name: "sum".into(),
            description: "Calculate the sum of a list of numbers".into(),
            icon: "calculator",
            parameters: json!({"type": "object"}),
            kind: ToolKind::Sum,
        }
    }

    fn input(
        llm_tools: Vec<ToolSpec>,
        dispatcher: Arc<dyn ToolDispatcher>,
        max_iterations: usize,
    ) -> LoopInput {
        LoopInput {
            base_url: "http://llm".into(),
            api_key: "key".into(),
            model: "m".into(),
            messages: vec![LlmMessage::new("user", "x")],
            tools: llm_tools,
            dispatcher,
            thinking_mode: String::new(),
            max_iterations,
            message_id: "msg-1".into(),
            cancel: CancellationToken::new(),
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
    async fn executes_tool_and_stops_without_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            vec![
                StreamEvent::text("run"),
                StreamEvent::tool_calls(vec![ToolCall {
                    id: "1".into(),
                    name: "sum".into(),
                    arguments: "1+1".into(),
                }]),
            ],
            vec![StreamEvent::text("done")],
        ]));
        let dispatcher = Arc::new(RecordingDispatcher {
            result: "2".into(),
            seen_args: Mutex::new(Vec::new()),
            log_id: None,
        });

        let agent_loop = AgentLoop::new(llm.clone());
        let events = collect(agent_loop.execute(input(vec![sum_tool()], dispatcher.clone(), 2))).await;

        assert_eq!(dispatcher.seen_args.lock().unwrap().as_slice(), ["1+1"]);

        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Text,
                EventKind::ToolStart,
                EventKind::ToolEnd,
                EventKind::Text,
            ]
        );
        assert_eq!(events[0].delta, "run");
        assert_eq!(events[2].delta, "2");
        assert_eq!(events[3].delta, "done");
        assert_eq!(events[3].iteration, 1);

        // The second LLM call must carry the synthetic assistant message and
        // the tool result.
        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        let roles: Vec<&str> = requests[1].messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool"]);
        assert_eq!(requests[1].messages[2].tool_call_id, "1");
    }

    #[tokio::test]
    async fn max_iterations_emits_final_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![vec![StreamEvent::tool_calls(vec![
            ToolCall {
                id: "1".into(),
                name: "sum".into(),
                arguments: "1+1".into(),
            },
        ])]]));
        let dispatcher = Arc::new(RecordingDispatcher {
            result: "2".into(),
            seen_args: Mutex::new(Vec::new()),
            log_id: None,
        });

        let agent_loop = AgentLoop::new(llm);
        let events = collect(agent_loop.execute(input(vec![sum_tool()], dispatcher, 1))).await;

        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert_eq!(last.delta, "max iterations reached");
        assert!(last.is_final);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_tool_error_message() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            vec![StreamEvent::tool_calls(vec![ToolCall {
                id: "1".into(),
                name: "nope".into(),
                arguments: "{}".into(),
            }])],
            vec![StreamEvent::text("recovered")],
        ]));
        let dispatcher = Arc::new(RecordingDispatcher {
            result: String::new(),
            seen_args: Mutex::new(Vec::new()),
            log_id: None,
        });

        let agent_loop = AgentLoop::new(llm.clone());
        let events = collect(agent_loop.execute(input(vec![sum_tool()], dispatcher, 2))).await;

        assert!(events.iter().all(|e| e.kind != EventKind::ToolStart));
        assert_eq!(events.last().unwrap().delta, "recovered");
        let requests = llm.requests();
        assert_eq!(
            requests[1].messages.last().unwrap().content,
            "error: unknown tool nope"
        );
    }

    #[tokio::test]
    async fn tool_meta_arrives_between_start_and_end() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            vec![StreamEvent::tool_calls(vec![ToolCall {
                id: "1".into(),
                name: "sum".into(),
                arguments: "{}".into(),
            }])],
            vec![],
        ]));
        let dispatcher = Arc::new(RecordingDispatcher {
            result: "ok".into(),
            seen_args: Mutex::new(Vec::new()),
            log_id: Some("log-7".into()),
        });

        let agent_loop = AgentLoop::new(llm);
        let events = collect(agent_loop.execute(input(vec![sum_tool()], dispatcher, 2))).await;

        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        let start = kinds.iter().position(|k| *k == EventKind::ToolStart).unwrap();
        let meta = kinds.iter().position(|k| *k == EventKind::ToolMeta).unwrap();
        let end = kinds.iter().position(|k| *k == EventKind::ToolEnd).unwrap();
        assert!(start < meta && meta < end);

        let meta_event = &events[meta];
        assert_eq!(meta_event.log_id, "log-7");
        assert_eq!(meta_event.model_name, "sub-model");
        assert_eq!(meta_event.tool_id, events[start].tool_id);
        // The end event carries the meta too.
        assert_eq!(events[end].log_id, "log-7");
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_final_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![vec![StreamEvent::tool_calls(vec![
            ToolCall {
                id: "1".into(),
                name: "sum".into(),
                arguments: "{}".into(),
            },
        ])]]));

        struct SlowDispatcher;
        #[async_trait::async_trait]
        impl ToolDispatcher for SlowDispatcher {
            async fn dispatch(
                &self,
                _ctx: ToolContext,
                _kind: ToolKind,
                _args: String,
            ) -> Result<String, MantisError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            }
        }

        let loop_input = input(vec![sum_tool()], Arc::new(SlowDispatcher), 2);
        let cancel = loop_input.cancel.clone();

        let agent_loop = AgentLoop::new(llm);
        let mut stream = agent_loop.execute(loop_input);

        // Drain until the tool is running, then cancel.
        let mut seen_start = false;
        let mut last = None;
        while let Some(event) = stream.recv().await {
            if event.kind == EventKind::ToolStart {
                seen_start = true;
                cancel.cancel();
            }
            last = Some(event);
        }
        assert!(seen_start);
        let last = last.unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert!(last.is_final);
        assert_eq!(last.delta, "cancelled");
    }
}
