// src/models/user_config.rs

//! Per-user configuration and the templates it is derived from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sort key of a user's config row.
pub const USER_CONFIG_SK: &str = "UserConfig";

/// Partition key shared by all template rows.
pub const TEMPLATE_ID: &str = "Template";

/// Formatting options applied when rendering a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// Render the memo column
    #[serde(default = "defaults::include_memo")]
    pub include_memo: bool,

    /// Weekday labels, Monday first
    #[serde(default = "defaults::weekday_labels")]
    pub weekday_labels: Vec<String>,

    /// Display labels keyed by work code
    #[serde(default = "defaults::work_code_labels")]
    pub work_code_labels: BTreeMap<String, String>,

    /// Artifact filename; `{user_id}` and `{months}` are substituted
    #[serde(default = "defaults::filename_pattern")]
    pub filename_pattern: String,

    /// Start/end times are rounded down to this many minutes
    #[serde(default = "defaults::time_sharing")]
    pub time_sharing: u32,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            include_memo: defaults::include_memo(),
            weekday_labels: defaults::weekday_labels(),
            work_code_labels: defaults::work_code_labels(),
            filename_pattern: defaults::filename_pattern(),
            time_sharing: defaults::time_sharing(),
        }
    }
}

impl ScheduleOptions {
    pub fn weekday_label(&self, weekday: chrono::Weekday) -> &str {
        self.weekday_labels
            .get(weekday.num_days_from_monday() as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn work_code_label<'a>(&'a self, code: &'a str) -> &'a str {
        self.work_code_labels
            .get(code)
            .map(String::as_str)
            .unwrap_or(code)
    }

    pub fn filename(&self, user_id: &str, months: &[String]) -> String {
        self.filename_pattern
            .replace("{user_id}", user_id)
            .replace("{months}", &months.join("_"))
    }
}

/// Default configuration a new user's config is derived from.
///
/// Stored under `("Template", "UserConfig#<kind>")`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub kind: String,

    /// Schedule title prefix
    #[serde(default = "defaults::title")]
    pub title: String,

    /// Channel for users whose config names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default)]
    pub options: ScheduleOptions,
}

impl TemplateConfig {
    /// Template shipped with the crate, used to seed a fresh table.
    pub fn builtin(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            title: defaults::title(),
            channel: None,
            options: ScheduleOptions::default(),
        }
    }

    pub fn sort_key(kind: &str) -> String {
        format!("{USER_CONFIG_SK}#{kind}")
    }

    /// Derive the initial config row for a user seen for the first time.
    pub fn derive_for(&self, user_id: &str) -> UserConfig {
        UserConfig {
            user_id: user_id.to_string(),
            template: self.kind.clone(),
            display_name: None,
            channel: self.channel.clone(),
            title: self.title.clone(),
            options: self.options.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Per-user settings, created once from a template and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(rename = "id")]
    pub user_id: String,

    /// Kind of the template this config was derived from
    pub template: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Messaging channel the schedule is delivered to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default = "defaults::title")]
    pub title: String,

    #[serde(default)]
    pub options: ScheduleOptions,

    pub created_at: DateTime<Utc>,
}

impl UserConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

/// How EnsureUserConfig resolved a user's config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigResolution {
    /// Found by the fast existence check; the sub-workflow was skipped
    Existing,
    /// Written by this invocation of the sub-workflow
    Created,
    /// Another writer created it first; its row was read back
    Adopted,
}

mod defaults {
    use std::collections::BTreeMap;

    pub fn include_memo() -> bool {
        true
    }
    pub fn weekday_labels() -> Vec<String> {
        ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
            .into_iter()
            .map(String::from)
            .collect()
    }
    pub fn work_code_labels() -> BTreeMap<String, String> {
        [
            ("01", "client_onsite"),
            ("02", "client_offsite"),
            ("10", "in-house_onsite"),
            ("11", "in-house_offsite"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
    pub fn filename_pattern() -> String {
        "{user_id}_{months}.csv".into()
    }
    pub fn time_sharing() -> u32 {
        1
    }
    pub fn title() -> String {
        "Work Schedule".into()
    }
}
