// src/models/record.rs

use serde::{Deserialize, Serialize};

/// Sort-key prefix shared by every work record.
pub const WORK_DATA_PREFIX: &str = "WorkData#";

/// One normalised row of an uploaded work-data file.
///
/// Keyed by `(id, SK)` where `SK = "WorkData#YYYY-MM-DD#NN"`, so re-ingesting
/// the same file overwrites rows instead of duplicating them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    /// Owning user id (partition key)
    pub id: String,

    /// Sort key
    #[serde(rename = "SK")]
    pub sk: String,

    /// Work date, `YYYY-MM-DD`
    pub datetime: String,

    #[serde(default)]
    pub date_code: String,

    #[serde(default)]
    pub work_code: String,

    /// `YYYY-MM-DD HH:MM:SS`, absent on days off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_datetime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_datetime: Option<String>,

    #[serde(default)]
    pub break_hours: String,

    #[serde(default)]
    pub work_hours: String,

    #[serde(default)]
    pub night_hours: String,

    #[serde(default)]
    pub memo: String,
}

impl WorkRecord {
    /// Build the sort key for a work date and per-day work number.
    pub fn sort_key(date: &str, work_num: u32) -> String {
        format!("{WORK_DATA_PREFIX}{date}#{work_num:02}")
    }

    /// Work month, `YYYY-MM`.
    pub fn month(&self) -> &str {
        self.datetime.get(..7).unwrap_or(&self.datetime)
    }
}

/// Sort-key prefix selecting one user's records for one month.
pub fn work_month_prefix(month: &str) -> String {
    format!("{WORK_DATA_PREFIX}{month}")
}

/// Records of one user extracted from a single upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecords {
    pub user_id: String,
    /// Distinct work months (`YYYY-MM`), ascending
    pub months: Vec<String>,
    pub records: Vec<WorkRecord>,
}

/// A rendered schedule placed in the artifact store for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleArtifact {
    pub user_id: String,
    pub bucket: String,
    pub key: String,
    pub filename: String,
    pub size: usize,
}
