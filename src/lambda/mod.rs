// src/lambda/mod.rs

//! AWS Lambda handler for storage notifications.
//!
//! Each S3 record is turned into a [`StorageNotification`] and handed to the
//! [`EventTrigger`]. Records are dispatched concurrently; an execution that
//! is still running when the invocation nears its deadline is aborted so it
//! stops between stages.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_lambda_events::s3::{S3Event, S3EventRecord};
use futures::future::join_all;
use lambda_runtime::{Error as LambdaError, LambdaEvent};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::models::{ExecutionStatus, StorageNotification};
use crate::pipeline::{AbortHandle, AbortSignal, EventTrigger, TriggerOutcome};
use crate::utils::decode_object_key;

/// Time left for the final ledger write once an abort is requested.
const ABORT_MARGIN: Duration = Duration::from_secs(10);

/// Result for one S3 record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordResult {
    pub bucket: String,
    pub key: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lambda response payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerResponse {
    pub results: Vec<RecordResult>,
}

impl TriggerResponse {
    pub fn failed(&self) -> impl Iterator<Item = &RecordResult> {
        self.results.iter().filter(|r| r.outcome == "error")
    }
}

/// Reduce an S3 record to a notification. Records without a bucket or key
/// are dropped.
pub fn notification(record: &S3EventRecord) -> Option<StorageNotification> {
    let bucket = record.s3.bucket.name.clone()?;
    let key = decode_object_key(record.s3.object.key.as_deref()?);
    Some(StorageNotification {
        event_name: record.event_name.clone().unwrap_or_default(),
        bucket,
        key,
        version_id: record.s3.object.version_id.clone(),
        sequencer: record.s3.object.sequencer.clone(),
    })
}

/// Dispatch every record of an event and collect per-record results.
pub async fn dispatch(trigger: &EventTrigger, event: &S3Event, abort: AbortSignal) -> TriggerResponse {
    let notifications: Vec<StorageNotification> = event
        .records
        .iter()
        .filter_map(|record| {
            let parsed = notification(record);
            if parsed.is_none() {
                warn!("Skipping S3 record without bucket or key");
            }
            parsed
        })
        .collect();

    let results = join_all(notifications.iter().map(|n| {
        let abort = abort.clone();
        async move {
            let mut result = RecordResult {
                bucket: n.bucket.clone(),
                key: n.key.clone(),
                outcome: "error",
                execution_id: None,
                status: None,
                error: None,
            };
            match trigger.handle(n, abort).await {
                Ok(TriggerOutcome::Started(execution)) => {
                    result.outcome = "started";
                    result.status = Some(execution.status);
                    result.execution_id = Some(execution.execution_id);
                }
                Ok(TriggerOutcome::Duplicate { execution_id }) => {
                    result.outcome = "duplicate";
                    result.execution_id = Some(execution_id);
                }
                Ok(TriggerOutcome::Ignored { reason }) => {
                    result.outcome = "ignored";
                    result.error = Some(reason);
                }
                Err(e) => {
                    error!("Failed to start execution for {}/{}: {}", n.bucket, n.key, e);
                    result.error = Some(e.to_string());
                }
            }
            result
        }
    }))
    .await;

    TriggerResponse { results }
}

/// Main Lambda handler function.
#[instrument(skip(trigger, event))]
pub async fn handler(
    trigger: &EventTrigger,
    event: LambdaEvent<S3Event>,
) -> std::result::Result<TriggerResponse, LambdaError> {
    let (payload, context) = event.into_parts();
    info!("Received {} S3 records", payload.records.len());

    let (handle, signal) = AbortHandle::new();
    let watchdog = remaining(context.deadline).map(|left| {
        tokio::spawn(async move {
            tokio::time::sleep(left.saturating_sub(ABORT_MARGIN)).await;
            warn!("Invocation deadline approaching; aborting executions");
            handle.abort();
        })
    });

    let response = dispatch(trigger, &payload, signal).await;
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    let failed: Vec<&str> = response.failed().map(|r| r.key.as_str()).collect();
    if !failed.is_empty() {
        return Err(format!("failed to start executions for: {}", failed.join(", ")).into());
    }
    Ok(response)
}

/// Time until a deadline given in epoch milliseconds.
fn remaining(deadline_ms: u64) -> Option<Duration> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    Duration::from_millis(deadline_ms).checked_sub(now)
}
