// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session policy: resolve or create conversation sessions under three modes.
//!
//! The clock and id generator are injectable for deterministic tests.
//! Reads within one policy instance are serialized so a burst of messages on
//! a channel cannot create duplicate sessions.

use chrono::{DateTime, Utc};
use mantis_core::traits::store::get_one;
use mantis_core::types::{ChatSession, ListQuery};
use mantis_core::{MantisError, Store};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Which resolution strategy to use.
#[derive(Debug, Clone)]
pub enum SessionMode {
    /// Newest session not matching any excluded prefix; create one if none.
    LatestOrCreate { exclude_prefixes: Vec<String> },
    /// Always create a fresh session.
    CreateNew,
    /// Return the session with this id, creating it if absent.
    Ensure { session_id: String },
}

/// Outcome of a policy run.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: ChatSession,
    pub created: bool,
}

type NowFn = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;
type NewIdFn = Box<dyn Fn() -> String + Send + Sync>;

/// Store-backed session policy.
pub struct SessionPolicy {
    store: Arc<dyn Store<ChatSession>>,
    now_fn: NowFn,
    new_id_fn: NewIdFn,
    serialize: Mutex<()>,
}

impl SessionPolicy {
    pub fn new(store: Arc<dyn Store<ChatSession>>) -> Self {
        SessionPolicy {
            store,
            now_fn: Box::new(Utc::now),
            new_id_fn: Box::new(|| Uuid::new_v4().to_string()),
            serialize: Mutex::new(()),
        }
    }

    /// Overrides the clock and id source (tests).
    pub fn with_sources(mut self, now_fn: NowFn, new_id_fn: NewIdFn) -> Self {
        self.now_fn = now_fn;
        self.new_id_fn = new_id_fn;
        self
    }

    pub async fn execute(&self, mode: SessionMode) -> Result<SessionOutcome, MantisError> {
        let _guard = self.serialize.lock().await;
        match mode {
            SessionMode::LatestOrCreate { exclude_prefixes } => {
                self.latest_or_create(&exclude_prefixes).await
            }
            SessionMode::CreateNew => {
                let session = self.create(None).await?;
                Ok(SessionOutcome {
                    session,
                    created: true,
                })
            }
            SessionMode::Ensure { session_id } => {
                if session_id.trim().is_empty() {
                    return Err(MantisError::Validation(
                        "session_id is required for ensure mode".into(),
                    ));
                }
                self.ensure(&session_id).await
            }
        }
    }

    async fn latest_or_create(
        &self,
        exclude_prefixes: &[String],
    ) -> Result<SessionOutcome, MantisError> {
        let sessions = self.store.list(ListQuery::default()).await?;
        let latest = sessions
            .into_iter()
            .filter(|s| {
                !exclude_prefixes
                    .iter()
                    .any(|p| !p.is_empty() && s.id.starts_with(p))
            })
            .max_by_key(|s| s.created_at);
        if let Some(session) = latest {
            return Ok(SessionOutcome {
                session,
                created: false,
            });
        }
        let session = self.create(None).await?;
        Ok(SessionOutcome {
            session,
            created: true,
        })
    }

    async fn ensure(&self, session_id: &str) -> Result<SessionOutcome, MantisError> {
        if let Some(session) = get_one(self.store.as_ref(), session_id).await? {
            return Ok(SessionOutcome {
                session,
                created: false,
            });
        }
        let session = self.create(Some(session_id)).await?;
        Ok(SessionOutcome {
            session,
            created: true,
        })
    }

    async fn create(&self, id: Option<&str>) -> Result<ChatSession, MantisError> {
        let id = match id {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => (self.new_id_fn)(),
        };
        let session = ChatSession {
            id,
            created_at: (self.now_fn)(),
        };
        let mut created = self.store.create(vec![session]).await?;
        created
            .pop()
            .ok_or_else(|| MantisError::Internal("session was not created".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mantis_test_utils::MemoryStore;

    fn session(id: &str, secs: i64) -> ChatSession {
        ChatSession {
            id: id.into(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn policy(store: Arc<MemoryStore<ChatSession>>) -> SessionPolicy {
        SessionPolicy::new(store).with_sources(
            Box::new(|| Utc.timestamp_opt(1_700_100_000, 0).unwrap()),
            Box::new(|| "fixed-id".to_string()),
        )
    }

    #[tokio::test]
    async fn latest_or_create_skips_excluded_prefixes() {
        let store = Arc::new(MemoryStore::with_items(vec![
            session("old", 0),
            session("new", 100),
            session("cron:j1", 500),
        ]));
        let outcome = policy(store)
            .execute(SessionMode::LatestOrCreate {
                exclude_prefixes: vec!["cron:".into()],
            })
            .await
            .unwrap();
        assert_eq!(outcome.session.id, "new");
        assert!(!outcome.created);
    }

    #[tokio::test]
    async fn latest_or_create_creates_when_all_excluded() {
        let store = Arc::new(MemoryStore::with_items(vec![session("cron:j1", 0)]));
        let outcome = policy(store.clone())
            .execute(SessionMode::LatestOrCreate {
                exclude_prefixes: vec!["cron:".into()],
            })
            .await
            .unwrap();
        assert_eq!(outcome.session.id, "fixed-id");
        assert!(outcome.created);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn ensure_creates_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let policy = policy(store.clone());

        let first = policy
            .execute(SessionMode::Ensure {
                session_id: "cron:j1".into(),
            })
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.session.id, "cron:j1");

        let second = policy
            .execute(SessionMode::Ensure {
                session_id: "cron:j1".into(),
            })
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.session.created_at, first.session.created_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn ensure_requires_an_id() {
        let store = Arc::new(MemoryStore::new());
        let err = policy(store)
            .execute(SessionMode::Ensure {
                session_id: "  ".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MantisError::Validation(_)));
    }
}
