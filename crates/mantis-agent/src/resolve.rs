// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lookup helpers for models and LLM connections.

use mantis_core::traits::store::get_one;
use mantis_core::types::{LlmConnection, Model};
use mantis_core::{MantisError, Store};

/// Resolves a model by id. An empty id means no LLM is connected.
pub async fn resolve_model(
    store: &dyn Store<Model>,
    model_id: &str,
) -> Result<Model, MantisError> {
    if model_id.is_empty() {
        return Err(MantisError::Validation("LLM is not connected".into()));
    }
    get_one(store, model_id)
        .await?
        .ok_or_else(|| MantisError::NotFound(format!("model {model_id} not found")))
}

/// Resolves an LLM connection by id.
pub async fn resolve_connection(
    store: &dyn Store<LlmConnection>,
    connection_id: &str,
) -> Result<LlmConnection, MantisError> {
    if connection_id.is_empty() {
        return Err(MantisError::Validation("llm connection is not set".into()));
    }
    get_one(store, connection_id)
        .await?
        .ok_or_else(|| MantisError::NotFound(format!("llm connection {connection_id:?} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_test_utils::MemoryStore;

    #[tokio::test]
    async fn missing_model_is_not_found() {
        let store = MemoryStore::<Model>::new();
        let err = resolve_model(&store, "m1").await.unwrap_err();
        assert!(matches!(err, MantisError::NotFound(_)));
        let err = resolve_model(&store, "").await.unwrap_err();
        assert!(matches!(err, MantisError::Validation(_)));
    }

    #[tokio::test]
    async fn resolves_existing_model() {
        let store = MemoryStore::with_items(vec![Model {
            id: "m1".into(),
            connection_id: "c1".into(),
            name: "gpt".into(),
            thinking_mode: String::new(),
        }]);
        let model = resolve_model(&store, "m1").await.unwrap();
        assert_eq!(model.name, "gpt");
    }
}
