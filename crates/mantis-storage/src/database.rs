// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and schema
//! creation.
//!
//! All access is serialized through tokio-rusqlite's single background
//! thread. Do NOT create additional Connection instances for writes.

use mantis_core::MantisError;
use tracing::debug;

/// Tables backing the entity stores. Every table is a JSON-document table:
/// `(id TEXT PRIMARY KEY, data TEXT NOT NULL)`.
const TABLES: &[&str] = &[
    "chat_sessions",
    "chat_messages",
    "models",
    "llm_connections",
    "connections",
    "cron_jobs",
    "channels",
    "guard_profiles",
    "session_logs",
    "configs",
];

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema exists.
    pub async fn open(path: &str) -> Result<Self, MantisError> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(map_tr_err)?;

        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            for table in TABLES {
                conn.execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, data TEXT NOT NULL)"
                    ),
                    [],
                )?;
            }
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        debug!(path, "database opened");
        Ok(Database { conn })
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, MantisError> {
        Self::open(":memory:").await
    }

    /// The underlying serialized connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Closes the database, flushing pending writes.
    pub async fn close(self) -> Result<(), MantisError> {
        self.conn
            .close()
            .await
            .map_err(|e| MantisError::Storage {
                source: Box::new(e),
            })
    }
}

/// Maps a tokio-rusqlite error into the workspace error type.
pub fn map_tr_err(err: tokio_rusqlite::Error) -> MantisError {
    MantisError::Storage {
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_all_tables() {
        let db = Database::open_in_memory().await.unwrap();
        let count: i64 = db
            .connection()
            .call(|conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(count as usize, super::TABLES.len());
        db.close().await.unwrap();
    }
}
