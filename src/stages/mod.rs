//! Reference units of work for each pipeline stage.
//!
//! Every unit speaks JSON so it can be swapped for a remote function without
//! touching the orchestrator. The payloads below are the hand-off contract
//! between stages.

pub mod deliver;
pub mod ingest;
pub mod persist;
pub mod render;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::delivery::DeliveryReceipt;
use crate::error::{AppError, Result};
use crate::models::{ConfigResolution, ScheduleArtifact, UserConfig, UserRecords};

pub use deliver::DeliverUnit;
pub use ingest::{IngestUnit, parse_work_file};
pub use persist::PersistUnit;
pub use render::{RenderUnit, render_schedule};

/// Ingest output: records grouped by user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutput {
    pub users: Vec<UserRecords>,
}

/// A user seen in the upload and the months it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMonths {
    pub user_id: String,
    pub months: Vec<String>,
}

/// PersistRecords output: the distinct users written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistOutput {
    pub users: Vec<UserMonths>,
    pub written: usize,
}

/// EnsureUserConfig input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureConfigRequest {
    pub user_id: String,
}

/// EnsureUserConfig output: the config the branch continues with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigReady {
    pub resolution: ConfigResolution,
    pub config: UserConfig,
}

/// RenderSchedule input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub execution_id: String,
    /// Bucket of the upload; artifacts default to it
    pub source_bucket: String,
    pub user_id: String,
    pub months: Vec<String>,
    pub config: UserConfig,
}

/// Deliver input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverRequest {
    pub user_id: String,
    #[serde(default)]
    pub channel: Option<String>,
    pub artifact: ScheduleArtifact,
}

/// Deliver output.
pub type DeliverOutput = DeliveryReceipt;

/// Decode a stage payload; a malformed payload is an input error.
pub fn from_payload<T: DeserializeOwned>(stage: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| AppError::input(format!("{stage}: malformed payload: {e}")))
}

pub fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
