// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic SQLite entity store.
//!
//! Each entity type maps to one JSON-document table. List queries compile
//! filters and sorts into `json_extract` expressions, so the camelCase JSON
//! field names used across the workspace are also the query field names.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use mantis_core::types::{Entity, ListQuery, SortDir};
use mantis_core::{MantisError, Store};
use rusqlite::params_from_iter;

use crate::database::{map_tr_err, Database};

/// SQLite-backed [`Store`] for one entity type.
pub struct SqliteStore<E: Entity> {
    db: Database,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity> SqliteStore<E> {
    pub fn new(db: Database) -> Self {
        SqliteStore {
            db,
            _marker: PhantomData,
        }
    }
}

/// Field names come from callers, never user input, but keep them inert in
/// SQL anyway.
fn valid_field(field: &str) -> Result<(), MantisError> {
    if !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(MantisError::Validation(format!(
            "invalid query field name: {field:?}"
        )))
    }
}

fn build_list_sql(table: &str, query: &ListQuery) -> Result<(String, Vec<String>), MantisError> {
    let mut sql = format!("SELECT data FROM {table}");
    let mut params: Vec<String> = Vec::new();
    let mut clauses: Vec<String> = Vec::new();

    for (field, value) in &query.filter {
        valid_field(field)?;
        clauses.push(format!("json_extract(data, '$.{field}') = ?"));
        params.push(value.clone());
    }
    for (field, value) in &query.filter_not {
        valid_field(field)?;
        clauses.push(format!(
            "(json_extract(data, '$.{field}') IS NULL OR json_extract(data, '$.{field}') != ?)"
        ));
        params.push(value.clone());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !query.sort.is_empty() {
        let mut terms = Vec::with_capacity(query.sort.len());
        for sort in &query.sort {
            valid_field(&sort.field)?;
            let dir = match sort.dir {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            };
            terms.push(format!("json_extract(data, '$.{}') {dir}", sort.field));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    if query.page.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", query.page.limit));
        if query.page.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", query.page.offset));
        }
    } else if query.page.offset > 0 {
        sql.push_str(&format!(" LIMIT -1 OFFSET {}", query.page.offset));
    }

    Ok((sql, params))
}

fn decode<E: Entity>(data: &str) -> Result<E, tokio_rusqlite::Error> {
    serde_json::from_str(data).map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))
}

fn encode<E: Entity>(item: &E) -> Result<String, tokio_rusqlite::Error> {
    serde_json::to_string(item).map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))
}

#[async_trait]
impl<E: Entity> Store<E> for SqliteStore<E> {
    async fn create(&self, items: Vec<E>) -> Result<Vec<E>, MantisError> {
        if items.is_empty() {
            return Ok(items);
        }
        let rows: Vec<(String, E)> = items
            .iter()
            .map(|item| (item.id().to_string(), item.clone()))
            .collect();
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&format!(
                        "INSERT INTO {} (id, data) VALUES (?1, ?2)",
                        E::TABLE
                    ))?;
                    for (id, item) in &rows {
                        stmt.execute(rusqlite::params![id, encode(item)?])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        Ok(items)
    }

    async fn get(&self, ids: &[String]) -> Result<HashMap<String, E>, MantisError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = ids.to_vec();
        self.db
            .connection()
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let mut stmt = conn.prepare(&format!(
                    "SELECT data FROM {} WHERE id IN ({placeholders})",
                    E::TABLE
                ))?;
                let mut rows = stmt.query(params_from_iter(ids.iter()))?;
                let mut out = HashMap::new();
                while let Some(row) = rows.next()? {
                    let data: String = row.get(0)?;
                    let item: E = decode(&data)?;
                    out.insert(item.id().to_string(), item);
                }
                Ok(out)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn list(&self, query: ListQuery) -> Result<Vec<E>, MantisError> {
        let (sql, params) = build_list_sql(E::TABLE, &query)?;
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let data: String = row.get(0)?;
                    out.push(decode(&data)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn update(&self, items: Vec<E>) -> Result<Vec<E>, MantisError> {
        if items.is_empty() {
            return Ok(items);
        }
        let rows: Vec<(String, E)> = items
            .iter()
            .map(|item| (item.id().to_string(), item.clone()))
            .collect();
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&format!(
                        "UPDATE {} SET data = ?2 WHERE id = ?1",
                        E::TABLE
                    ))?;
                    for (id, item) in &rows {
                        stmt.execute(rusqlite::params![id, encode(item)?])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        Ok(items)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), MantisError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.db
            .connection()
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                conn.execute(
                    &format!("DELETE FROM {} WHERE id IN ({placeholders})", E::TABLE),
                    params_from_iter(ids.iter()),
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mantis_core::types::{ChatMessage, Page, Sort};
    use tempfile::tempdir;

    async fn setup() -> (Database, SqliteStore<ChatMessage>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        let store = SqliteStore::new(db.clone());
        (db, store, dir)
    }

    fn msg(id: &str, session: &str, source: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            session_id: session.into(),
            role: "user".into(),
            content: format!("content {id}"),
            source: source.into(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_get_update_delete_round_trip() {
        let (db, store, _dir) = setup().await;

        store
            .create(vec![msg("m1", "s1", "web", 0)])
            .await
            .unwrap();
        let found = store.get(&["m1".into(), "missing".into()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["m1"].content, "content m1");

        let mut updated = found["m1"].clone();
        updated.status = "error".into();
        store.update(vec![updated]).await.unwrap();
        let found = store.get(&["m1".into()]).await.unwrap();
        assert_eq!(found["m1"].status, "error");

        store.delete(&["m1".into()]).await.unwrap();
        assert!(store.get(&["m1".into()]).await.unwrap().is_empty());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let (db, store, _dir) = setup().await;
        store
            .create(vec![
                msg("m1", "s1", "web", 10),
                msg("m2", "s1", "cron", 20),
                msg("m3", "s2", "web", 30),
                msg("m4", "s1", "web", 40),
            ])
            .await
            .unwrap();

        let mut query = ListQuery::filter_eq("sessionId", "s1");
        query.filter_not.insert("source".into(), "cron".into());
        query.sort = vec![Sort {
            field: "createdAt".into(),
            dir: SortDir::Desc,
        }];
        let items = store.list(query.clone()).await.unwrap();
        assert_eq!(
            items.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m1"]
        );

        query.page = Page {
            limit: 1,
            offset: 1,
        };
        let items = store.list(query).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "m1");

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_empty_vec_not_error() {
        let (db, store, _dir) = setup().await;
        let items = store
            .list(ListQuery::filter_eq("sessionId", "nope"))
            .await
            .unwrap();
        assert!(items.is_empty());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_field_name_is_rejected() {
        let (db, store, _dir) = setup().await;
        let err = store
            .list(ListQuery::filter_eq("id') OR 1=1 --", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MantisError::Validation(_)));
        db.close().await.unwrap();
    }
}
