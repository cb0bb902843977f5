// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory [`Store`] implementation for tests.
//!
//! Supports the full list-query surface (filter, filter-not, sort, paginate)
//! by evaluating against the entity's JSON representation, mirroring what the
//! SQLite store compiles to SQL.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use mantis_core::types::{Entity, ListQuery, SortDir};
use mantis_core::{MantisError, Store};

/// A `HashMap`-backed store guarded by a mutex.
pub struct MemoryStore<E: Entity> {
    items: Mutex<HashMap<String, E>>,
}

impl<E: Entity> MemoryStore<E> {
    pub fn new() -> Self {
        MemoryStore {
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_items(items: Vec<E>) -> Self {
        let store = Self::new();
        {
            let mut map = store.items.lock().unwrap();
            for item in items {
                map.insert(item.id().to_string(), item);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Entity> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn field_value(json: &serde_json::Value, field: &str) -> String {
    match json.get(field) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl<E: Entity> Store<E> for MemoryStore<E> {
    async fn create(&self, items: Vec<E>) -> Result<Vec<E>, MantisError> {
        let mut map = self.items.lock().unwrap();
        for item in &items {
            map.insert(item.id().to_string(), item.clone());
        }
        Ok(items)
    }

    async fn get(&self, ids: &[String]) -> Result<HashMap<String, E>, MantisError> {
        let map = self.items.lock().unwrap();
        let mut out = HashMap::new();
        for id in ids {
            if let Some(item) = map.get(id) {
                out.insert(id.clone(), item.clone());
            }
        }
        Ok(out)
    }

    async fn list(&self, query: ListQuery) -> Result<Vec<E>, MantisError> {
        let map = self.items.lock().unwrap();
        let mut rows: Vec<(serde_json::Value, E)> = map
            .values()
            .map(|item| (serde_json::to_value(item).unwrap_or_default(), item.clone()))
            .collect();

        rows.retain(|(json, _)| {
            query
                .filter
                .iter()
                .all(|(field, value)| field_value(json, field) == *value)
                && query
                    .filter_not
                    .iter()
                    .all(|(field, value)| field_value(json, field) != *value)
        });

        for sort in query.sort.iter().rev() {
            rows.sort_by(|(a, _), (b, _)| {
                let ord = field_value(a, &sort.field).cmp(&field_value(b, &sort.field));
                match sort.dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                }
            });
        }

        let mut items: Vec<E> = rows.into_iter().map(|(_, item)| item).collect();
        if query.page.offset > 0 {
            items = items.split_off(query.page.offset.min(items.len()));
        }
        if query.page.limit > 0 {
            items.truncate(query.page.limit);
        }
        Ok(items)
    }

    async fn update(&self, items: Vec<E>) -> Result<Vec<E>, MantisError> {
        let mut map = self.items.lock().unwrap();
        for item in &items {
            map.insert(item.id().to_string(), item.clone());
        }
        Ok(items)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), MantisError> {
        let mut map = self.items.lock().unwrap();
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_core::types::{CronJob, Sort};

    fn job(id: &str, enabled: bool) -> CronJob {
        CronJob {
            id: id.into(),
            name: format!("job {id}"),
            schedule: "@hourly".into(),
            prompt: "do it".into(),
            enabled,
        }
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let store = MemoryStore::with_items(vec![job("b", true), job("a", true), job("c", false)]);
        let mut query = ListQuery::filter_eq("enabled", "true");
        query.sort = vec![Sort {
            field: "id".into(),
            dir: SortDir::Asc,
        }];
        let items = store.list(query).await.unwrap();
        assert_eq!(
            items.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }
}
