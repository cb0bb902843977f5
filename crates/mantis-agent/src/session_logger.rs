// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wraps a sub-agent stream, writing a durable trace of thoughts, commands
//! and outputs as the events pass through.
//!
//! Text deltas aggregate into one `thought` entry, flushed by the next
//! non-text event. The log row is created up front with `status = running`
//! and its id is published through the tool-meta slot so the orchestrator can
//! link the step to the trace while it is still streaming.

use std::sync::Arc;

use chrono::Utc;
use mantis_core::types::{LogEntry, SessionLog};
use mantis_core::{EventKind, EventStream, Store, StreamEvent, ToolContext, STREAM_BUFFER};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Store-backed stream tracer.
pub struct SessionLogger {
    store: Arc<dyn Store<SessionLog>>,
}

impl SessionLogger {
    pub fn new(store: Arc<dyn Store<SessionLog>>) -> Self {
        SessionLogger { store }
    }

    /// Wraps `src`, mirroring every event into a [`SessionLog`]. On failure
    /// to create the log row the stream passes through untraced.
    pub async fn wrap(
        &self,
        ctx: &ToolContext,
        connection_id: &str,
        agent_name: &str,
        prompt: &str,
        src: EventStream,
    ) -> EventStream {
        let session = SessionLog {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            agent_name: agent_name.to_string(),
            prompt: prompt.to_string(),
            status: "running".into(),
            message_id: ctx.message_id.clone(),
            step_id: ctx.step_id.clone(),
            model_name: ctx.meta.get().model_name,
            entries: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        };

        if let Err(err) = self.store.create(vec![session.clone()]).await {
            warn!(error = %err, "session_logger: failed to create log");
            return src;
        }
        ctx.meta.set_log_id(session.id.clone());

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let store = self.store.clone();
        tokio::spawn(pump(store, session, src, tx));
        rx
    }
}

async fn pump(
    store: Arc<dyn Store<SessionLog>>,
    mut session: SessionLog,
    mut src: EventStream,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut text_buf = String::new();

    async fn save(store: &Arc<dyn Store<SessionLog>>, session: &SessionLog) {
        if let Err(err) = store.update(vec![session.clone()]).await {
            warn!(error = %err, "session_logger: failed to update log");
        }
    }

    fn flush_text(session: &mut SessionLog, text_buf: &mut String) {
        if !text_buf.is_empty() {
            session.entries.push(LogEntry {
                kind: "thought".into(),
                content: text_buf.trim().to_string(),
                timestamp: Utc::now(),
            });
            text_buf.clear();
        }
    }

    while let Some(event) = src.recv().await {
        // The trace is written even if the consumer went away.
        let _ = tx.send(event.clone()).await;

        match event.kind {
            EventKind::Text => text_buf.push_str(&event.delta),
            EventKind::Thinking => {
                flush_text(&mut session, &mut text_buf);
                session.entries.push(LogEntry {
                    kind: "thought".into(),
                    content: event.delta.trim().to_string(),
                    timestamp: Utc::now(),
                });
                save(&store, &session).await;
            }
            EventKind::ToolStart => {
                flush_text(&mut session, &mut text_buf);
                session.entries.push(LogEntry {
                    kind: "command".into(),
                    content: event.delta,
                    timestamp: Utc::now(),
                });
                save(&store, &session).await;
            }
            EventKind::ToolEnd => {
                session.entries.push(LogEntry {
                    kind: "output".into(),
                    content: event.delta,
                    timestamp: Utc::now(),
                });
                save(&store, &session).await;
            }
            EventKind::Error => {
                flush_text(&mut session, &mut text_buf);
                session.entries.push(LogEntry {
                    kind: "error".into(),
                    content: event.delta,
                    timestamp: Utc::now(),
                });
                save(&store, &session).await;
            }
            _ => {}
        }
    }
    flush_text(&mut session, &mut text_buf);

    session.status = "finished".into();
    session.finished_at = Some(Utc::now());
    save(&store, &session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_core::types::ListQuery;
    use mantis_test_utils::MemoryStore;

    async fn run_through(events: Vec<StreamEvent>) -> (Vec<StreamEvent>, SessionLog) {
        let store = Arc::new(MemoryStore::<SessionLog>::new());
        let logger = SessionLogger::new(store.clone());
        let ctx = ToolContext {
            step_id: "step-1".into(),
            message_id: "msg-1".into(),
            meta: Default::default(),
            cancel: tokio_util::sync::CancellationToken::new(),
        };

        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        drop(tx);

        let mut wrapped = logger.wrap(&ctx, "conn-1", "ssh", "check disk", rx).await;
        assert!(!ctx.meta.get().log_id.is_empty());

        let mut forwarded = Vec::new();
        while let Some(event) = wrapped.recv().await {
            forwarded.push(event);
        }
        let logs = store.list(ListQuery::default()).await.unwrap();
        assert_eq!(logs.len(), 1);
        (forwarded, logs.into_iter().next().unwrap())
    }

    #[tokio::test]
    async fn aggregates_text_into_thought_entries() {
        let (forwarded, log) = run_through(vec![
            StreamEvent::text("I will "),
            StreamEvent::text("check disk"),
            StreamEvent {
                kind: EventKind::ToolStart,
                delta: "{\"id\":\"s\"}".into(),
                tool_id: "s".into(),
                ..Default::default()
            },
            StreamEvent {
                kind: EventKind::ToolEnd,
                delta: "42G free".into(),
                tool_id: "s".into(),
                ..Default::default()
            },
            StreamEvent::text("done"),
        ])
        .await;

        assert_eq!(forwarded.len(), 5);
        let kinds: Vec<&str> = log.entries.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["thought", "command", "output", "thought"]);
        assert_eq!(log.entries[0].content, "I will check disk");
        assert_eq!(log.status, "finished");
        assert!(log.finished_at.is_some());
        assert_eq!(log.step_id, "step-1");
        assert_eq!(log.message_id, "msg-1");
    }

    #[tokio::test]
    async fn errors_are_recorded() {
        let (_, log) = run_through(vec![
            StreamEvent::text("partial"),
            StreamEvent::error("boom"),
        ])
        .await;
        let kinds: Vec<&str> = log.entries.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["thought", "error"]);
        assert_eq!(log.entries[1].content, "boom");
    }
}
