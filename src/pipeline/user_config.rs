// src/pipeline/user_config.rs

//! The per-user configuration sub-workflow.
//!
//! Lookup always comes first; creation goes through a conditional put so
//! that concurrent callers for the same new user end up with one row.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{ConfigResolution, TEMPLATE_ID, TemplateConfig, USER_CONFIG_SK, UserConfig};
use crate::stage::StageUnit;
use crate::stages::{ConfigReady, EnsureConfigRequest, from_payload, to_payload};
use crate::store::{DataStore, Item, PutOutcome};

pub struct UserConfigWorkflow {
    store: Arc<dyn DataStore>,
    template_kind: String,
}

impl UserConfigWorkflow {
    pub fn new(store: Arc<dyn DataStore>, template_kind: impl Into<String>) -> Self {
        Self {
            store,
            template_kind: template_kind.into(),
        }
    }

    /// Existing config for `user_id`, if any.
    pub async fn lookup(&self, user_id: &str) -> Result<Option<UserConfig>> {
        self.store
            .get(user_id, USER_CONFIG_SK)
            .await?
            .map(|item| item.decode())
            .transpose()
    }

    pub async fn template(&self) -> Result<TemplateConfig> {
        self.store
            .get(TEMPLATE_ID, &TemplateConfig::sort_key(&self.template_kind))
            .await?
            .ok_or_else(|| {
                AppError::config_missing(format!("template {:?} not found", self.template_kind))
            })?
            .decode()
    }

    /// Look up or create the user's config and return it once a row is
    /// confirmed present.
    pub async fn ensure(&self, user_id: &str) -> Result<ConfigReady> {
        if let Some(config) = self.lookup(user_id).await? {
            debug!(user_id, "Config already exists");
            return Ok(ConfigReady {
                resolution: ConfigResolution::Existing,
                config,
            });
        }

        let derived = self.template().await?.derive_for(user_id);
        let outcome = self
            .store
            .put_if_absent(Item::encode(user_id, USER_CONFIG_SK, &derived)?)
            .await?;

        let config = self.lookup(user_id).await?.ok_or_else(|| {
            AppError::transient(format!("config for {user_id} not visible after create"))
        })?;

        let resolution = match outcome {
            PutOutcome::Created => {
                info!(user_id, template = %self.template_kind, "Created user config");
                ConfigResolution::Created
            }
            PutOutcome::AlreadyExists => {
                debug!(user_id, "Lost config creation race; using existing row");
                ConfigResolution::Adopted
            }
        };
        Ok(ConfigReady { resolution, config })
    }

    /// Write a template row. Existing rows are kept unless `overwrite` is set.
    pub async fn seed_template(&self, template: &TemplateConfig, overwrite: bool) -> Result<PutOutcome> {
        let item = Item::encode(TEMPLATE_ID, TemplateConfig::sort_key(&template.kind), template)?;
        if overwrite {
            self.store.put(item).await?;
            Ok(PutOutcome::Created)
        } else {
            self.store.put_if_absent(item).await
        }
    }
}

#[async_trait]
impl StageUnit for UserConfigWorkflow {
    fn name(&self) -> &str {
        "UserConfigWorkflow"
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let request: EnsureConfigRequest = from_payload(self.name(), input)?;
        to_payload(&self.ensure(&request.user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    async fn workflow() -> (UserConfigWorkflow, MemoryStore) {
        let store = MemoryStore::new();
        let workflow = UserConfigWorkflow::new(Arc::new(store.clone()), "default");
        workflow
            .seed_template(&TemplateConfig::builtin("default"), false)
            .await
            .unwrap();
        (workflow, store)
    }

    #[tokio::test]
    async fn test_creates_then_finds() {
        let (workflow, _) = workflow().await;

        let first = workflow.ensure("u1").await.unwrap();
        assert_eq!(first.resolution, ConfigResolution::Created);
        assert_eq!(first.config.user_id, "u1");

        let second = workflow.ensure("u1").await.unwrap();
        assert_eq!(second.resolution, ConfigResolution::Existing);
        assert_eq!(second.config, first.config);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_row() {
        let (workflow, store) = workflow().await;
        let workflow = Arc::new(workflow);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let workflow = Arc::clone(&workflow);
                tokio::spawn(async move { workflow.ensure("new-user").await })
            })
            .collect();

        let mut configs = Vec::new();
        for task in tasks {
            configs.push(task.await.unwrap().unwrap());
        }

        let created = configs
            .iter()
            .filter(|c| c.resolution == ConfigResolution::Created)
            .count();
        assert_eq!(created, 1);
        assert!(configs.iter().all(|c| c.config == configs[0].config));
        assert_eq!(store.query_by_id("new-user", "").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_template_is_config_missing() {
        let workflow = UserConfigWorkflow::new(Arc::new(MemoryStore::new()), "default");
        let err = workflow.ensure("u1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    }

    #[tokio::test]
    async fn test_seed_template_keeps_existing() {
        let (workflow, _) = workflow().await;
        let mut custom = TemplateConfig::builtin("default");
        custom.title = "Custom".into();

        assert_eq!(
            workflow.seed_template(&custom, false).await.unwrap(),
            PutOutcome::AlreadyExists
        );
        assert_eq!(workflow.template().await.unwrap().title, "Work Schedule");

        workflow.seed_template(&custom, true).await.unwrap();
        assert_eq!(workflow.template().await.unwrap().title, "Custom");
    }
}
