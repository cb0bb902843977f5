// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message listing with stale-pending promotion and live-buffer overlay.

use std::sync::Arc;

use chrono::{Duration, Utc};
use mantis_core::types::{ChatMessage, ListQuery, Page, Sort, SortDir};
use mantis_core::{MantisError, Store};

use crate::buffer::Buffer;

/// A pending reply older than this is treated as interrupted.
const PENDING_TIMEOUT_MINUTES: i64 = 10;

/// Read-side use case: list messages for display.
pub struct ListMessages {
    store: Arc<dyn Store<ChatMessage>>,
    buffer: Arc<Buffer>,
}

impl ListMessages {
    pub fn new(store: Arc<dyn Store<ChatMessage>>, buffer: Arc<Buffer>) -> Self {
        ListMessages { store, buffer }
    }

    /// Lists messages ascending by creation time.
    ///
    /// Pending rows older than ten minutes are promoted to error in the store
    /// and in the result. Still-pending rows are overlaid with the live
    /// buffer's content and steps so pollers see streaming progress.
    pub async fn execute(
        &self,
        limit: i64,
        offset: i64,
        session_id: &str,
        source: &str,
    ) -> Result<Vec<ChatMessage>, MantisError> {
        let limit = if limit <= 0 { 10 } else { limit as usize };
        let offset = if offset < 0 { 0 } else { offset as usize };

        let mut query = ListQuery {
            page: Page { limit, offset },
            sort: vec![Sort {
                field: "createdAt".into(),
                dir: SortDir::Desc,
            }],
            ..Default::default()
        };
        if source.is_empty() {
            query.filter_not.insert("source".into(), "cron".into());
        } else {
            query.filter.insert("source".into(), source.to_string());
        }
        if !session_id.is_empty() {
            query
                .filter
                .insert("sessionId".into(), session_id.to_string());
        }

        let items = self.store.list(query).await?;

        let cutoff = Utc::now() - Duration::minutes(PENDING_TIMEOUT_MINUTES);
        let mut stale = Vec::new();
        let mut result = Vec::with_capacity(items.len());
        for mut message in items {
            if message.status == "pending" && message.created_at < cutoff {
                message.status = "error".into();
                message.content = "[Error] generation interrupted".into();
                stale.push(message.clone());
            }
            result.push(message);
        }
        if !stale.is_empty() {
            let _ = self.store.update(stale).await;
        }

        for message in &mut result {
            if message.status == "pending" {
                if let Some(entry) = self.buffer.get(&message.id) {
                    if !entry.content.is_empty() {
                        message.content = entry.content;
                    }
                    if !entry.steps.is_empty() {
                        message.steps = serde_json::to_value(&entry.steps).ok();
                    }
                }
            }
        }

        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_core::types::Step;
    use mantis_test_utils::MemoryStore;

    fn msg(id: &str, status: &str, content: &str, minutes_ago: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            session_id: "s1".into(),
            role: "assistant".into(),
            content: content.into(),
            status: status.into(),
            source: "web".into(),
            created_at: Utc::now() - Duration::minutes(minutes_ago),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_pending_is_promoted_and_buffer_overlaid() {
        let store = Arc::new(MemoryStore::with_items(vec![
            msg("m3", "pending", "old", 11),
            msg("m2", "pending", "p", 1),
            msg("m1", "", "done", 2),
        ]));
        let buffer = Arc::new(Buffer::new());
        buffer.set_content("m2", "stream".into());
        buffer.set_step(
            "m2",
            Step {
                id: "s1".into(),
                tool: "t".into(),
                ..Default::default()
            },
        );

        let list = ListMessages::new(store.clone(), buffer);
        let result = list.execute(0, -1, "", "").await.unwrap();

        let ids: Vec<&str> = result.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m1", "m2"]);

        let m3 = &result[0];
        assert_eq!(m3.status, "error");
        assert_eq!(m3.content, "[Error] generation interrupted");
        // The promotion is persisted.
        let stored = store.get(&["m3".into()]).await.unwrap();
        assert_eq!(stored["m3"].status, "error");

        let m2 = &result[2];
        assert_eq!(m2.content, "stream");
        assert!(m2.steps.as_ref().unwrap().as_array().unwrap().len() == 1);
    }

    #[tokio::test]
    async fn cron_messages_are_hidden_unless_requested() {
        let mut cron = msg("c1", "", "cron result", 1);
        cron.source = "cron".into();
        let store = Arc::new(MemoryStore::with_items(vec![cron, msg("m1", "", "web", 2)]));
        let list = ListMessages::new(store, Arc::new(Buffer::new()));

        let visible = list.execute(10, 0, "", "").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "m1");

        let cron_only = list.execute(10, 0, "", "cron").await.unwrap();
        assert_eq!(cron_only.len(), 1);
        assert_eq!(cron_only[0].id, "c1");
    }
}
