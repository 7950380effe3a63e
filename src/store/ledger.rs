//! Persistence of pipeline execution records.

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::PipelineExecution;
use crate::store::{DataStore, Item, PutOutcome};

const EXECUTION_SK: &str = "Execution";

/// Stores [`PipelineExecution`] records under `("Execution#<id>", "Execution")`.
#[derive(Clone)]
pub struct ExecutionLedger {
    store: Arc<dyn DataStore>,
}

impl ExecutionLedger {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    fn partition_key(execution_id: &str) -> String {
        format!("Execution#{execution_id}")
    }

    /// Record a new execution unless one with the same id exists.
    pub async fn create_if_absent(&self, execution: &PipelineExecution) -> Result<PutOutcome> {
        let item = Item::encode(
            Self::partition_key(&execution.execution_id),
            EXECUTION_SK,
            execution,
        )?;
        self.store.put_if_absent(item).await
    }

    /// Overwrite the stored record. A record that is already terminal is
    /// never modified.
    pub async fn save(&self, execution: &PipelineExecution) -> Result<()> {
        if let Some(stored) = self.get(&execution.execution_id).await? {
            if stored.is_terminal() {
                return Err(AppError::ExecutionTerminal(execution.execution_id.clone()));
            }
        }
        let item = Item::encode(
            Self::partition_key(&execution.execution_id),
            EXECUTION_SK,
            execution,
        )?;
        self.store.put(item).await
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<PipelineExecution>> {
        self.store
            .get(&Self::partition_key(execution_id), EXECUTION_SK)
            .await?
            .map(|item| item.decode())
            .transpose()
    }

    /// Execution view for the operational status surface.
    pub async fn status(&self, execution_id: &str) -> Result<PipelineExecution> {
        self.get(execution_id)
            .await?
            .ok_or_else(|| AppError::input(format!("unknown execution {execution_id}")))
    }
}
