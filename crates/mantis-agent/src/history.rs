// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builds the prior-message context for a turn.
//!
//! Finished messages of the session are included, plus cron-session messages
//! from the last 24 hours when the session is not itself a cron session,
//! prefixed so the model can tell scheduled traffic from the live thread.

use chrono::{Duration, Utc};
use mantis_core::traits::llm::LlmMessage;
use mantis_core::types::{ChatMessage, ListQuery};
use mantis_core::{MantisError, Store};

const CRON_PREFIX: &str = "cron:";

/// Prior messages for `session_id`, ascending by creation time.
pub async fn build_history(
    store: &dyn Store<ChatMessage>,
    session_id: &str,
) -> Result<Vec<LlmMessage>, MantisError> {
    let all = store.list(ListQuery::default()).await?;

    let include_cron = !session_id.starts_with(CRON_PREFIX);
    let cron_cutoff = Utc::now() - Duration::hours(24);

    let mut selected: Vec<ChatMessage> = all
        .into_iter()
        .filter(|m| {
            if !m.status.is_empty() {
                return false;
            }
            if m.session_id == session_id {
                return true;
            }
            include_cron && m.session_id.starts_with(CRON_PREFIX) && m.created_at > cron_cutoff
        })
        .collect();
    selected.sort_by_key(|m| m.created_at);

    Ok(selected
        .into_iter()
        .map(|m| {
            let content = if m.session_id != session_id {
                if m.role == "user" {
                    format!("[Scheduled task] {}", m.content)
                } else {
                    format!("[Scheduled task result] {}", m.content)
                }
            } else {
                m.content
            };
            LlmMessage::new(m.role, content)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_test_utils::MemoryStore;

    fn msg(id: &str, session: &str, role: &str, status: &str, hours_ago: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            session_id: session.into(),
            role: role.into(),
            content: format!("content {id}"),
            status: status.into(),
            created_at: Utc::now() - Duration::hours(hours_ago),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn includes_recent_cron_messages_with_prefixes() {
        let store = MemoryStore::with_items(vec![
            msg("m1", "s1", "user", "", 2),
            msg("m2", "s1", "assistant", "", 2),
            msg("m3", "cron:j1", "user", "", 1),
            msg("m4", "cron:j1", "assistant", "", 1),
            msg("old", "cron:j1", "user", "", 48),
            msg("pending", "s1", "assistant", "pending", 0),
            msg("other", "s2", "user", "", 0),
        ]);

        let history = build_history(&store, "s1").await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "content m1",
                "content m2",
                "[Scheduled task] content m3",
                "[Scheduled task result] content m4",
            ]
        );
    }

    #[tokio::test]
    async fn cron_sessions_see_only_themselves() {
        let store = MemoryStore::with_items(vec![
            msg("m1", "cron:j1", "user", "", 1),
            msg("m2", "cron:j2", "user", "", 1),
            msg("m3", "s1", "user", "", 1),
        ]);
        let history = build_history(&store, "cron:j1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "content m1");
    }
}
