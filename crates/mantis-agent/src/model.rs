// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model resolver: explicit id -> channel model -> config path.

use mantis_core::traits::store::get_one;
use mantis_core::types::{Channel, Config};
use mantis_core::{MantisError, Store};
use std::sync::Arc;

/// Where the resolved model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Explicit,
    Channel,
    Config,
    None,
}

/// Resolution request. Missing intermediate config objects yield
/// [`ModelSource::None`] without error.
#[derive(Debug, Clone, Default)]
pub struct ModelQuery {
    pub explicit_model_id: String,
    pub channel_id: String,
    /// Defaults to "default" when empty.
    pub config_id: String,
    pub config_path: Vec<String>,
}

/// Resolution result. `model_id` is empty iff `source` is `None`.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model_id: String,
    pub source: ModelSource,
}

/// Decides which LLM model a turn uses.
pub struct ModelResolver {
    channel_store: Option<Arc<dyn Store<Channel>>>,
    config_store: Option<Arc<dyn Store<Config>>>,
}

impl ModelResolver {
    pub fn new(
        channel_store: Option<Arc<dyn Store<Channel>>>,
        config_store: Option<Arc<dyn Store<Config>>>,
    ) -> Self {
        ModelResolver {
            channel_store,
            config_store,
        }
    }

    pub async fn execute(&self, query: ModelQuery) -> Result<ResolvedModel, MantisError> {
        let explicit = query.explicit_model_id.trim();
        if !explicit.is_empty() {
            return Ok(ResolvedModel {
                model_id: explicit.to_string(),
                source: ModelSource::Explicit,
            });
        }

        if !query.channel_id.trim().is_empty() {
            let model_id = self.from_channel(query.channel_id.trim()).await?;
            if !model_id.is_empty() {
                return Ok(ResolvedModel {
                    model_id,
                    source: ModelSource::Channel,
                });
            }
        }

        if !query.config_path.is_empty() {
            let model_id = self
                .from_config(query.config_id.trim(), &query.config_path)
                .await?;
            if !model_id.is_empty() {
                return Ok(ResolvedModel {
                    model_id,
                    source: ModelSource::Config,
                });
            }
        }

        Ok(ResolvedModel {
            model_id: String::new(),
            source: ModelSource::None,
        })
    }

    async fn from_channel(&self, channel_id: &str) -> Result<String, MantisError> {
        let store = self
            .channel_store
            .as_ref()
            .ok_or_else(|| MantisError::Internal("channel store is not configured".into()))?;
        let channel = get_one(store.as_ref(), channel_id)
            .await?
            .ok_or_else(|| MantisError::NotFound(format!("channel {channel_id:?} not found")))?;
        Ok(channel.model_id.trim().to_string())
    }

    async fn from_config(&self, config_id: &str, path: &[String]) -> Result<String, MantisError> {
        let store = self
            .config_store
            .as_ref()
            .ok_or_else(|| MantisError::Internal("config store is not configured".into()))?;
        let config_id = if config_id.is_empty() {
            "default"
        } else {
            config_id
        };
        let config = get_one(store.as_ref(), config_id)
            .await?
            .ok_or_else(|| MantisError::NotFound(format!("config {config_id:?} not found")))?;

        let mut current = &config.data;
        for key in path {
            match current.get(key) {
                Some(next) => current = next,
                None => return Ok(String::new()),
            }
        }
        Ok(current.as_str().unwrap_or("").trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_test_utils::MemoryStore;
    use serde_json::json;

    fn resolver(channel_model: &str, config_data: serde_json::Value) -> ModelResolver {
        let channels = MemoryStore::with_items(vec![Channel {
            id: "tg-1".into(),
            kind: "telegram".into(),
            name: "bot".into(),
            model_id: channel_model.into(),
            ..Default::default()
        }]);
        let configs = MemoryStore::with_items(vec![Config {
            id: "default".into(),
            data: config_data,
        }]);
        ModelResolver::new(Some(Arc::new(channels)), Some(Arc::new(configs)))
    }

    #[tokio::test]
    async fn explicit_wins() {
        let resolver = resolver("ch-model", json!({}));
        let out = resolver
            .execute(ModelQuery {
                explicit_model_id: "m-9".into(),
                channel_id: "tg-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.model_id, "m-9");
        assert_eq!(out.source, ModelSource::Explicit);
    }

    #[tokio::test]
    async fn channel_second() {
        let resolver = resolver("ch-model", json!({}));
        let out = resolver
            .execute(ModelQuery {
                channel_id: "tg-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.model_id, "ch-model");
        assert_eq!(out.source, ModelSource::Channel);
    }

    #[tokio::test]
    async fn config_path_third() {
        let resolver = resolver("", json!({"cron": {"model_id": "cfg-model"}}));
        let out = resolver
            .execute(ModelQuery {
                channel_id: "tg-1".into(),
                config_path: vec!["cron".into(), "model_id".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.model_id, "cfg-model");
        assert_eq!(out.source, ModelSource::Config);
    }

    #[tokio::test]
    async fn missing_path_yields_none_without_error() {
        let resolver = resolver("", json!({"chat": {}}));
        let out = resolver
            .execute(ModelQuery {
                config_path: vec!["cron".into(), "model_id".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(out.model_id.is_empty());
        assert_eq!(out.source, ModelSource::None);
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let resolver = resolver("x", json!({}));
        let err = resolver
            .execute(ModelQuery {
                channel_id: "missing".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MantisError::NotFound(_)));
    }
}
