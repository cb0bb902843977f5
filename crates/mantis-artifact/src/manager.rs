// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide mapping of session id to artifact store.
//!
//! Every lookup touches the session's last-access stamp and sweeps idle
//! sessions whose TTL elapsed and whose store is empty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::store::{ArtifactStore, DEFAULT_TTL};

struct SessionRecord {
    store: Arc<ArtifactStore>,
    last_access: Instant,
}

/// Hands out per-session artifact stores.
pub struct ArtifactManager {
    ttl: Duration,
    sessions: DashMap<String, SessionRecord>,
}

impl Default for ArtifactManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactManager {
    pub fn new() -> Self {
        ArtifactManager {
            ttl: DEFAULT_TTL,
            sessions: DashMap::new(),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        ArtifactManager {
            ttl,
            sessions: DashMap::new(),
        }
    }

    /// The artifact store for a session, created on first use. An empty
    /// session id yields a detached store that is not tracked.
    pub fn for_session(&self, session_id: &str) -> Arc<ArtifactStore> {
        if session_id.is_empty() {
            return Arc::new(ArtifactStore::new());
        }

        let store = {
            let mut entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionRecord {
                    store: Arc::new(ArtifactStore::new()),
                    last_access: Instant::now(),
                });
            entry.last_access = Instant::now();
            entry.store.clone()
        };

        self.cleanup();
        store
    }

    /// Number of tracked sessions.
    pub fn sessions(&self) -> usize {
        self.sessions.len()
    }

    fn cleanup(&self) {
        let ttl = self.ttl;
        self.sessions.retain(|_, record| {
            if record.last_access.elapsed() <= ttl {
                return true;
            }
            record.store.prune_expired();
            let stats = record.store.stats();
            stats.count > 0 || stats.outgoing > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_session_gets_same_store() {
        let manager = ArtifactManager::new();
        let a = manager.for_session("s1");
        a.put("f.txt", b"x".to_vec(), "").unwrap();
        let b = manager.for_session("s1");
        assert_eq!(b.list().len(), 1);
        assert_eq!(manager.sessions(), 1);
    }

    #[test]
    fn empty_session_id_is_detached() {
        let manager = ArtifactManager::new();
        let a = manager.for_session("");
        a.put("f.txt", b"x".to_vec(), "").unwrap();
        assert_eq!(manager.sessions(), 0);
        assert!(manager.for_session("").list().is_empty());
    }

    #[test]
    fn idle_empty_sessions_are_swept() {
        let manager = ArtifactManager::with_ttl(Duration::from_millis(1));
        manager.for_session("idle");
        std::thread::sleep(Duration::from_millis(5));
        manager.for_session("other");
        assert_eq!(manager.sessions(), 1);
    }
}
