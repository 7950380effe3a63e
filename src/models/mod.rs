// src/models/mod.rs

//! Domain models for the schedule orchestrator.
//!
//! Work records and user configs are what the stages exchange; execution
//! records are what the orchestrator persists about itself.

mod config;
mod execution;
mod record;
mod trigger;
mod user_config;

pub(crate) use config::defaults;

pub use config::{
    ArtifactConfig, Config, DeliveryConfig, LoggingConfig, PipelineConfig, RetryConfig,
    StoreConfig, TriggerConfig,
};
pub use execution::{
    BranchOutcome, BranchRecord, ExecutionStatus, FailureRecord, PipelineExecution, Stage,
    StageRecord, StageScope, StageState,
};
pub use record::{ScheduleArtifact, UserRecords, WORK_DATA_PREFIX, WorkRecord, work_month_prefix};
pub use trigger::{StorageNotification, TriggerInput, UNVERSIONED};
pub use user_config::{
    ConfigResolution, ScheduleOptions, TEMPLATE_ID, TemplateConfig, USER_CONFIG_SK, UserConfig,
};
