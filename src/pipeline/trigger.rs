// src/pipeline/trigger.rs

//! Storage-event trigger.
//!
//! Filters object-created notifications to the configured prefix, claims the
//! idempotency token in the ledger and hands new executions to the pipeline.

use std::sync::Arc;

use log::{debug, info};

use crate::error::Result;
use crate::models::{PipelineExecution, StorageNotification, TriggerConfig, TriggerInput};
use crate::pipeline::{AbortSignal, MainPipeline};
use crate::store::PutOutcome;
use crate::utils::matches_prefix;

/// What happened to a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A new execution ran; carries its final record
    Started(PipelineExecution),
    /// The token was already claimed by an earlier notification
    Duplicate { execution_id: String },
    /// The notification does not concern this pipeline
    Ignored { reason: String },
}

impl TriggerOutcome {
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            TriggerOutcome::Started(execution) => Some(&execution.execution_id),
            TriggerOutcome::Duplicate { execution_id } => Some(execution_id),
            TriggerOutcome::Ignored { .. } => None,
        }
    }
}

pub struct EventTrigger {
    config: TriggerConfig,
    pipeline: Arc<MainPipeline>,
}

impl EventTrigger {
    pub fn new(config: TriggerConfig, pipeline: Arc<MainPipeline>) -> Self {
        Self { config, pipeline }
    }

    /// Whether a notification should start an execution, and why not.
    pub fn filter(&self, notification: &StorageNotification) -> std::result::Result<TriggerInput, String> {
        if !notification.is_object_created() {
            return Err(format!("event {} is not an object creation", notification.event_name));
        }
        if let Some(bucket) = &self.config.bucket {
            if &notification.bucket != bucket {
                return Err(format!("bucket {} is not watched", notification.bucket));
            }
        }
        if !matches_prefix(&notification.key, &self.config.prefix) {
            return Err(format!(
                "key {} is outside prefix {}",
                notification.key, self.config.prefix
            ));
        }
        if notification.key.ends_with('/') {
            return Err(format!("key {} is a folder marker", notification.key));
        }
        Ok(notification.trigger_input())
    }

    /// Handle one notification end to end.
    pub async fn handle(&self, notification: &StorageNotification, abort: AbortSignal) -> Result<TriggerOutcome> {
        let input = match self.filter(notification) {
            Ok(input) => input,
            Err(reason) => {
                debug!("Ignoring notification: {}", reason);
                return Ok(TriggerOutcome::Ignored { reason });
            }
        };
        self.start(input, abort).await
    }

    /// Start an execution for `input` unless its token was already claimed.
    pub async fn start(&self, input: TriggerInput, abort: AbortSignal) -> Result<TriggerOutcome> {
        let execution = PipelineExecution::new(input);
        let ledger = self.pipeline.ledger();

        match ledger.create_if_absent(&execution).await? {
            PutOutcome::AlreadyExists => {
                info!(
                    "Duplicate trigger {} (execution {})",
                    execution.trigger.idempotency_token(),
                    execution.execution_id
                );
                Ok(TriggerOutcome::Duplicate {
                    execution_id: execution.execution_id,
                })
            }
            PutOutcome::Created => {
                info!(
                    "Starting execution {} for {}",
                    execution.execution_id,
                    execution.trigger.idempotency_token()
                );
                let finished = self.pipeline.run(execution, abort).await?;
                Ok(TriggerOutcome::Started(finished))
            }
        }
    }
}
