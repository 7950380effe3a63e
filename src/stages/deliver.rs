//! Deliver: push a rendered artifact to the user's channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::delivery::{DeliveryRequest, Messenger};
use crate::error::{AppError, Result};
use crate::stage::StageUnit;
use crate::stages::{DeliverRequest, from_payload, to_payload};
use crate::storage::ObjectStore;

pub struct DeliverUnit {
    objects: Arc<dyn ObjectStore>,
    messenger: Arc<dyn Messenger>,
    default_channel: Option<String>,
}

impl DeliverUnit {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        messenger: Arc<dyn Messenger>,
        default_channel: Option<String>,
    ) -> Self {
        Self {
            objects,
            messenger,
            default_channel,
        }
    }

    /// User channel, else the default channel.
    fn resolve_channel(&self, request: &DeliverRequest) -> Result<String> {
        request
            .channel
            .clone()
            .or_else(|| self.default_channel.clone())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                AppError::config_missing(format!("no delivery channel for {}", request.user_id))
            })
    }
}

#[async_trait]
impl StageUnit for DeliverUnit {
    fn name(&self) -> &str {
        "Deliver"
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let request: DeliverRequest = from_payload(self.name(), input)?;
        let channel = self.resolve_channel(&request)?;

        let artifact = &request.artifact;
        let bytes = self
            .objects
            .get_object(&artifact.bucket, &artifact.key)
            .await?
            .ok_or_else(|| {
                AppError::rejected(format!(
                    "artifact {}/{} is missing",
                    artifact.bucket, artifact.key
                ))
            })?;

        let receipt = self
            .messenger
            .deliver(DeliveryRequest {
                user_id: request.user_id.clone(),
                channel,
                filename: artifact.filename.clone(),
                bytes,
            })
            .await?;
        to_payload(&receipt)
    }
}
