//! Application configuration structures.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Stage;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage-event filter settings
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Data store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Where rendered schedules are handed from render to delivery
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Messaging endpoint settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Timeouts and branch concurrency
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Stage retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Apply environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup (environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(table) = lookup("WORK_TABLE_NAME") {
            self.store.table_name = table;
        }
        if let Some(bucket) = lookup("ARTIFACT_BUCKET") {
            self.artifacts.bucket = Some(bucket);
        }
        if let Some(prefix) = lookup("TRIGGER_PREFIX") {
            self.trigger.prefix = prefix;
        }
        if let Some(channel) = lookup("SLACK_DEFAULT_CHANNEL") {
            self.delivery.default_channel = Some(channel);
        }
        if let Some(secs) = lookup("EXECUTION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.pipeline.execution_timeout_secs = secs;
        }
        if let Some(secs) = lookup("STAGE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.pipeline.stage_timeout_secs = secs;
        }
        if let Some(n) = lookup("MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = n;
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.trigger.prefix.trim().is_empty() {
            return Err(AppError::validation("trigger.prefix is empty"));
        }
        if self.store.table_name.trim().is_empty() {
            return Err(AppError::validation("store.table_name is empty"));
        }
        if self.store.template_kind.trim().is_empty() {
            return Err(AppError::validation("store.template_kind is empty"));
        }
        if self.pipeline.stage_timeout_secs == 0 {
            return Err(AppError::validation("pipeline.stage_timeout_secs must be > 0"));
        }
        if self.pipeline.execution_timeout_secs == 0 {
            return Err(AppError::validation(
                "pipeline.execution_timeout_secs must be > 0",
            ));
        }
        if self.pipeline.max_parallel_branches == 0 {
            return Err(AppError::validation(
                "pipeline.max_parallel_branches must be > 0",
            ));
        }
        for (stage, secs) in &self.pipeline.stage_timeouts {
            if !Stage::ALL.iter().any(|s| s.key() == stage) {
                return Err(AppError::validation(format!(
                    "pipeline.stage_timeouts.{stage} is not a stage"
                )));
            }
            if *secs == 0 {
                return Err(AppError::validation(format!(
                    "pipeline.stage_timeouts.{stage} must be > 0"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AppError::validation("retry.multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

/// Storage-event filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Only objects under this key prefix start an execution
    #[serde(default = "defaults::prefix")]
    pub prefix: String,

    /// Restrict triggering to one bucket (any bucket when unset)
    #[serde(default)]
    pub bucket: Option<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            prefix: defaults::prefix(),
            bucket: None,
        }
    }
}

/// Data store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Table holding work records, user configs, templates and executions
    #[serde(default = "defaults::table_name")]
    pub table_name: String,

    /// Template kind used when provisioning a new user config
    #[serde(default = "defaults::template_kind")]
    pub template_kind: String,

    /// Path of the JSON table used by the local CLI
    #[serde(default = "defaults::local_table_path")]
    pub local_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_name: defaults::table_name(),
            template_kind: defaults::template_kind(),
            local_path: defaults::local_table_path(),
        }
    }
}

/// Artifact hand-off settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Bucket for rendered artifacts (defaults to the triggering bucket)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix for rendered artifacts
    #[serde(default = "defaults::artifact_prefix")]
    pub prefix: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: defaults::artifact_prefix(),
        }
    }
}

/// Messaging endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Slack Web API base URL
    #[serde(default = "defaults::slack_api_base")]
    pub api_base: String,

    /// Environment variable holding the bot token
    #[serde(default = "defaults::token_env")]
    pub token_env: String,

    /// Channel used when a user config names none
    #[serde(default)]
    pub default_channel: Option<String>,

    /// Directory used by the local outbox messenger
    #[serde(default = "defaults::outbox_dir")]
    pub outbox_dir: String,

    /// HTTP timeout for delivery requests in seconds
    #[serde(default = "defaults::http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_base: defaults::slack_api_base(),
            token_env: defaults::token_env(),
            default_channel: None,
            outbox_dir: defaults::outbox_dir(),
            http_timeout_secs: defaults::http_timeout(),
        }
    }
}

/// Timeouts and concurrency of the pipeline runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default time budget for one stage invocation
    #[serde(default = "defaults::stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Per-stage overrides of the time budget, keyed like `render_schedule`
    #[serde(default)]
    pub stage_timeouts: BTreeMap<String, u64>,

    /// Overall budget after which an execution is marked timed out
    #[serde(default = "defaults::execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Maximum number of per-user branches running at once
    #[serde(default = "defaults::max_parallel_branches")]
    pub max_parallel_branches: usize,
}

impl PipelineConfig {
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        let secs = self
            .stage_timeouts
            .get(stage.key())
            .copied()
            .unwrap_or(self.stage_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: defaults::stage_timeout(),
            stage_timeouts: BTreeMap::new(),
            execution_timeout_secs: defaults::execution_timeout(),
            max_parallel_branches: defaults::max_parallel_branches(),
        }
    }
}

/// Retry policy shared by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "defaults::initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for a single delay in milliseconds
    #[serde(default = "defaults::max_backoff")]
    pub max_backoff_ms: u64,

    /// Growth factor between attempts
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,

    /// Randomise delays within `[d/2, d]`
    #[serde(default = "defaults::jitter")]
    pub jitter: bool,

    /// Remote error codes treated as transient, on top of the built-in
    /// throttling codes
    #[serde(default = "defaults::transient_codes")]
    pub transient_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            initial_backoff_ms: defaults::initial_backoff(),
            max_backoff_ms: defaults::max_backoff(),
            multiplier: defaults::multiplier(),
            jitter: defaults::jitter(),
            transient_codes: defaults::transient_codes(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: debug, info, warn, error
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

pub(crate) mod defaults {
    pub fn prefix() -> String {
        "raw/".into()
    }
    pub fn table_name() -> String {
        "WorkScheduleTable".into()
    }
    pub fn template_kind() -> String {
        "default".into()
    }
    pub fn local_table_path() -> String {
        "storage/table.json".into()
    }
    pub fn artifact_prefix() -> String {
        "work_schedule".into()
    }
    pub fn slack_api_base() -> String {
        "https://slack.com/api".into()
    }
    pub fn token_env() -> String {
        "SLACK_BOT_TOKEN".into()
    }
    pub fn outbox_dir() -> String {
        "storage/outbox".into()
    }
    pub fn http_timeout() -> u64 {
        30
    }
    pub fn stage_timeout() -> u64 {
        60
    }
    pub fn execution_timeout() -> u64 {
        900
    }
    pub fn max_parallel_branches() -> usize {
        8
    }
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn initial_backoff() -> u64 {
        200
    }
    pub fn max_backoff() -> u64 {
        5_000
    }
    pub fn multiplier() -> f64 {
        2.0
    }
    pub fn jitter() -> bool {
        true
    }
    pub fn transient_codes() -> Vec<String> {
        [
            "ThrottlingException",
            "Throttling",
            "ProvisionedThroughputExceededException",
            "RequestLimitExceeded",
            "TooManyRequestsException",
            "ServiceUnavailable",
            "InternalServerError",
            "SlowDown",
            "ratelimited",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn log_level() -> String {
        "info".into()
    }
}
