// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted LLM for deterministic agent-loop tests.
//!
//! Each call to `chat_stream` pops the next scripted event sequence. Calls
//! past the end of the script yield an empty stream.

use std::sync::Mutex;

use async_trait::async_trait;
use mantis_core::traits::llm::{ChatRequest, ChatStreamer};
use mantis_core::{EventStream, MantisError, StreamEvent};
use tokio::sync::mpsc;

/// A [`ChatStreamer`] that replays pre-scripted event streams.
pub struct ScriptedLlm {
    streams: Mutex<Vec<Vec<StreamEvent>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(streams: Vec<Vec<StreamEvent>>) -> Self {
        let mut streams = streams;
        streams.reverse();
        ScriptedLlm {
            streams: Mutex::new(streams),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of chat calls made.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatStreamer for ScriptedLlm {
    async fn chat_stream(&self, req: ChatRequest) -> Result<EventStream, MantisError> {
        self.requests.lock().unwrap().push(req);
        let events = self.streams.lock().unwrap().pop().unwrap_or_default();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers the whole script, so this cannot fail.
            let _ = tx.try_send(event);
        }
        Ok(rx)
    }
}
