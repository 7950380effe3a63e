// src/config.rs

//! Configuration loading utilities.
//!
//! Local runs read `config.toml` from disk; the Lambda reads it from the
//! object store. Environment overrides are applied last in both cases.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::Config;
use crate::storage::ObjectStore;

/// Config loader reading TOML files from an object-store prefix.
pub struct RemoteConfigLoader {
    storage: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl RemoteConfigLoader {
    pub fn new(storage: Arc<dyn ObjectStore>, bucket: &str, config_prefix: &str) -> Self {
        Self {
            storage,
            bucket: bucket.to_string(),
            prefix: config_prefix.trim_end_matches('/').to_string(),
        }
    }

    async fn load_toml(&self, file_name: &str) -> Result<Config> {
        let key = if self.prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.prefix, file_name)
        };
        info!("Loading config file from s3://{}/{}", self.bucket, key);

        let bytes = self
            .storage
            .get_object(&self.bucket, &key)
            .await?
            .ok_or_else(|| AppError::Config(format!("Config file not found: {key}")))?;

        let s = String::from_utf8(bytes).map_err(|e| {
            AppError::Config(format!("Config file {key} is not valid UTF-8: {e}"))
        })?;
        Config::from_toml(&s)
    }

    /// Load `config.toml`, falling back to defaults when it is missing or
    /// unreadable, then apply environment overrides and validate.
    pub async fn load_config(&self) -> Result<Config> {
        let mut config = self.load_toml("config.toml").await.unwrap_or_else(|e| {
            warn!("{e}. Using default configuration.");
            Config::default()
        });
        config.apply_env();
        config.validate()?;
        Ok(config)
    }
}

/// Load configuration from a TOML file, apply environment overrides and
/// validate.
///
/// Falls back to defaults if the file cannot be read.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::load_or_default(path);
    config.apply_env();
    config.validate()?;
    Ok(config)
}
