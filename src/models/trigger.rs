// src/models/trigger.rs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version used for objects in unversioned buckets.
pub const UNVERSIONED: &str = "null";

/// Location of the uploaded object that started an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInput {
    pub bucket: String,
    pub key: String,
    /// Object version, or the event sequencer for unversioned buckets
    pub version: String,
}

impl TriggerInput {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        version: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version: version
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| UNVERSIONED.to_string()),
        }
    }

    /// Deduplication token: object location plus version.
    pub fn idempotency_token(&self) -> String {
        format!("{}/{}@{}", self.bucket, self.key, self.version)
    }

    /// Stable execution id derived from the idempotency token.
    pub fn execution_id(&self) -> String {
        let digest = Sha256::digest(self.idempotency_token().as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(32);
        id
    }
}

/// A storage-change notification, reduced to what the trigger needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNotification {
    /// e.g. `ObjectCreated:Put`
    pub event_name: String,
    pub bucket: String,
    /// Object key, already URL-decoded
    pub key: String,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub sequencer: Option<String>,
}

impl StorageNotification {
    pub fn object_created(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            event_name: "ObjectCreated:Put".into(),
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            sequencer: None,
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn is_object_created(&self) -> bool {
        self.event_name.starts_with("ObjectCreated")
            || self.event_name.starts_with("s3:ObjectCreated")
    }

    /// Trigger input; the version falls back to the event sequencer so that
    /// overwrites of an unversioned object still start new executions.
    pub fn trigger_input(&self) -> TriggerInput {
        let version = self
            .version_id
            .clone()
            .filter(|v| !v.is_empty() && v != UNVERSIONED)
            .or_else(|| self.sequencer.clone());
        TriggerInput::new(self.bucket.clone(), self.key.clone(), version)
    }
}
