//! RenderSchedule: persisted records plus user config into a CSV schedule.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use csv::{Terminator, WriterBuilder};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{ScheduleArtifact, UserConfig, WorkRecord, work_month_prefix};
use crate::stage::StageUnit;
use crate::stages::{RenderRequest, from_payload, to_payload};
use crate::storage::ObjectStore;
use crate::store::DataStore;

pub struct RenderUnit {
    store: Arc<dyn DataStore>,
    objects: Arc<dyn ObjectStore>,
    artifact_bucket: Option<String>,
    artifact_prefix: String,
}

impl RenderUnit {
    pub fn new(
        store: Arc<dyn DataStore>,
        objects: Arc<dyn ObjectStore>,
        artifact_bucket: Option<String>,
        artifact_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            objects,
            artifact_bucket,
            artifact_prefix: artifact_prefix.into(),
        }
    }

    async fn load_records(&self, user_id: &str, months: &[String]) -> Result<Vec<WorkRecord>> {
        let mut records = Vec::new();
        for month in months {
            for item in self.store.query_by_id(user_id, &work_month_prefix(month)).await? {
                records.push(item.decode::<WorkRecord>()?);
            }
        }
        records.sort_by(|a, b| a.sk.cmp(&b.sk));
        Ok(records)
    }
}

#[async_trait]
impl StageUnit for RenderUnit {
    fn name(&self) -> &str {
        "RenderSchedule"
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let request: RenderRequest = from_payload(self.name(), input)?;
        let records = self.load_records(&request.user_id, &request.months).await?;

        let body = render_schedule(&request.config, &request.months, &records)?;
        let filename = request
            .config
            .options
            .filename(&request.user_id, &request.months);
        let bucket = self
            .artifact_bucket
            .clone()
            .unwrap_or_else(|| request.source_bucket.clone());
        let key = format!(
            "{}/{}/{}/{}",
            self.artifact_prefix.trim_end_matches('/'),
            request.user_id,
            request.execution_id,
            filename
        );

        let size = body.len();
        self.objects
            .put_object(&bucket, &key, body.into_bytes(), "text/csv")
            .await?;
        log::info!(
            "Rendered {} rows for {} to {}/{}",
            records.len(),
            request.user_id,
            bucket,
            key
        );

        to_payload(&ScheduleArtifact {
            user_id: request.user_id,
            bucket,
            key,
            filename,
            size,
        })
    }
}

/// Render one user's schedule as CSV: title, header, one row per record and a
/// totals row.
pub fn render_schedule(
    config: &UserConfig,
    months: &[String],
    records: &[WorkRecord],
) -> Result<String> {
    let options = &config.options;
    let mut writer = WriterBuilder::new()
        .flexible(true)
        .terminator(Terminator::CRLF)
        .from_writer(Vec::new());

    writer.write_record([format!(
        "{} - {} - {}",
        config.title,
        config.display_name(),
        months.join(", ")
    )])?;

    let mut header: Vec<String> = [
        "Date", "Weekday", "WorkType", "Start", "End", "Break", "Work", "Night",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    if options.include_memo {
        header.push("Memo".into());
    }
    writer.write_record(&header)?;

    let mut totals = [0u32; 3];
    for record in records {
        let date = NaiveDate::parse_from_str(&record.datetime, "%Y-%m-%d").ok();
        let weekday = date
            .map(|d| options.weekday_label(chrono::Datelike::weekday(&d)).to_string())
            .unwrap_or_default();

        let hours = [&record.break_hours, &record.work_hours, &record.night_hours];
        for (total, value) in totals.iter_mut().zip(hours) {
            *total += parse_hours(value).unwrap_or(0);
        }

        let mut row = vec![
            record.datetime.clone(),
            weekday,
            options.work_code_label(&record.work_code).to_string(),
            clock(date, record.start_datetime.as_deref(), options.time_sharing),
            clock(date, record.end_datetime.as_deref(), options.time_sharing),
            record.break_hours.clone(),
            record.work_hours.clone(),
            record.night_hours.clone(),
        ];
        if options.include_memo {
            row.push(record.memo.clone());
        }
        writer.write_record(&row)?;
    }

    let mut total_row = vec![
        "Total".to_string(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
    ];
    total_row.extend(totals.iter().map(|m| format_hours(*m)));
    if options.include_memo {
        total_row.push(String::new());
    }
    writer.write_record(&total_row)?;

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::from(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| AppError::validation(format!("schedule CSV: {e}")))
}

/// Time of day relative to the work date, rounded down to `step` minutes.
/// Times past midnight keep counting (`25:30`).
fn clock(date: Option<NaiveDate>, datetime: Option<&str>, step: u32) -> String {
    let (Some(date), Some(datetime)) = (date, datetime) else {
        return String::new();
    };
    let Ok(at) = NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S") else {
        return String::new();
    };
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return String::new();
    };

    let minutes = (at - midnight).num_minutes().max(0) as u32;
    let step = step.max(1);
    let minutes = minutes / step * step;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Minutes in `H:MM` or decimal-hour notation.
fn parse_hours(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.is_empty() {
        return Some(0);
    }
    if let Some((h, m)) = value.split_once(':') {
        return Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?);
    }
    let hours: f64 = value.parse().ok()?;
    (hours >= 0.0).then(|| (hours * 60.0).round() as u32)
}

fn format_hours(minutes: u32) -> String {
    format!("{}:{:02}", minutes / 60, minutes % 60)
}
