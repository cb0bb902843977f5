// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The entity-store abstraction: uniform CRUD over typed records keyed by
//! string, with filter/sort/paginate list queries.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::MantisError;
use crate::types::{Entity, ListQuery};

/// Uniform CRUD over one entity type.
///
/// Implementations must tolerate empty inputs and always return concrete
/// (possibly empty) collections.
#[async_trait]
pub trait Store<E: Entity>: Send + Sync {
    /// Inserts the given records and returns them.
    async fn create(&self, items: Vec<E>) -> Result<Vec<E>, MantisError>;

    /// Fetches records by id. Missing ids are simply absent from the map.
    async fn get(&self, ids: &[String]) -> Result<HashMap<String, E>, MantisError>;

    /// Lists records matching the query.
    async fn list(&self, query: ListQuery) -> Result<Vec<E>, MantisError>;

    /// Replaces the given records by primary key and returns them.
    async fn update(&self, items: Vec<E>) -> Result<Vec<E>, MantisError>;

    /// Deletes records by id. Unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> Result<(), MantisError>;
}

/// Fetches a single record by id.
pub async fn get_one<E: Entity>(
    store: &dyn Store<E>,
    id: &str,
) -> Result<Option<E>, MantisError> {
    let mut found = store.get(&[id.to_string()]).await?;
    Ok(found.remove(id))
}
