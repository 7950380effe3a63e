//! Ingest: turn an uploaded work-data file into work records.
//!
//! The file is UTF-8 (with or without BOM) or Shift-JIS, tab- or
//! comma-delimited with standard CSV quoting, and has one header row:
//!
//! ```text
//! id  name  date  work_num  date_code  date_type  work_code  work_type
//! start_time  end_time  start_time_round  end_time_round  break_hours
//! work_hours  night_hours  memo  [approver ... third_approval_datetime]
//! ```

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use encoding_rs::SHIFT_JIS;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{TriggerInput, UserRecords, WorkRecord};
use crate::stage::StageUnit;
use crate::stages::{IngestOutput, from_payload, to_payload};
use crate::storage::ObjectStore;

mod col {
    pub const ID: usize = 0;
    pub const DATE: usize = 2;
    pub const WORK_NUM: usize = 3;
    pub const DATE_CODE: usize = 4;
    pub const WORK_CODE: usize = 6;
    pub const START_TIME: usize = 8;
    pub const END_TIME: usize = 9;
    pub const BREAK_HOURS: usize = 12;
    pub const WORK_HOURS: usize = 13;
    pub const NIGHT_HOURS: usize = 14;
    pub const MEMO: usize = 15;
}

/// Columns up to and including `night_hours` are required.
const REQUIRED_COLUMNS: usize = col::NIGHT_HOURS + 1;

/// Reads the uploaded object and parses it.
pub struct IngestUnit {
    objects: Arc<dyn ObjectStore>,
}

impl IngestUnit {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl StageUnit for IngestUnit {
    fn name(&self) -> &str {
        "Ingest"
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let trigger: TriggerInput = from_payload(self.name(), input)?;
        let bytes = self
            .objects
            .get_object(&trigger.bucket, &trigger.key)
            .await?
            .ok_or_else(|| {
                AppError::input(format!("object {}/{} not found", trigger.bucket, trigger.key))
            })?;

        let users = parse_work_file(&bytes)?;
        log::info!(
            "Parsed {} records for {} users from {}",
            users.iter().map(|u| u.records.len()).sum::<usize>(),
            users.len(),
            trigger.key
        );
        to_payload(&IngestOutput { users })
    }
}

/// Parse a work-data file into records grouped by user, in order of first
/// appearance.
pub fn parse_work_file(bytes: &[u8]) -> Result<Vec<UserRecords>> {
    let text = decode_text(bytes)?;
    let header = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| AppError::input("work file is empty"))?;
    let delimiter = if header.contains('\t') { b'\t' } else { b',' };

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<WorkRecord>> = HashMap::new();

    for row in reader.records() {
        let row = row.map_err(|e| AppError::input(format!("work file: {e}")))?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        let line = row.position().map_or(0, |p| p.line());
        let record = parse_row(&row)
            .map_err(|reason| AppError::input(format!("line {line}: {reason}")))?;

        if !grouped.contains_key(&record.id) {
            order.push(record.id.clone());
        }
        grouped.entry(record.id.clone()).or_default().push(record);
    }

    if order.is_empty() {
        return Err(AppError::input("work file has no data rows"));
    }

    Ok(order
        .into_iter()
        .map(|user_id| {
            let records = grouped.remove(&user_id).unwrap_or_default();
            let months: BTreeSet<String> = records.iter().map(|r| r.month().to_string()).collect();
            UserRecords {
                user_id,
                months: months.into_iter().collect(),
                records,
            }
        })
        .collect())
}

/// UTF-8 (BOM stripped) when the bytes are valid UTF-8, Shift-JIS otherwise.
fn decode_text(bytes: &[u8]) -> Result<Cow<'_, str>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(Cow::Borrowed(text));
    }
    SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(bytes)
        .ok_or_else(|| AppError::input("work file is neither UTF-8 nor Shift-JIS"))
}

fn parse_row(row: &StringRecord) -> std::result::Result<WorkRecord, String> {
    if row.len() < REQUIRED_COLUMNS {
        return Err(format!(
            "expected at least {REQUIRED_COLUMNS} columns, found {}",
            row.len()
        ));
    }
    let field = |i: usize| row.get(i).unwrap_or("");

    let id = field(col::ID);
    if id.is_empty() {
        return Err("missing id".into());
    }

    let date = NaiveDate::parse_from_str(field(col::DATE), "%Y%m%d")
        .map_err(|_| format!("bad date {:?}", field(col::DATE)))?;
    let work_num: u32 = field(col::WORK_NUM)
        .parse()
        .map_err(|_| format!("bad work_num {:?}", field(col::WORK_NUM)))?;

    let datetime = date.format("%Y-%m-%d").to_string();
    Ok(WorkRecord {
        id: id.to_string(),
        sk: WorkRecord::sort_key(&datetime, work_num),
        datetime,
        date_code: field(col::DATE_CODE).to_string(),
        work_code: field(col::WORK_CODE).to_string(),
        start_datetime: clock_time(date, field(col::START_TIME))?,
        end_datetime: clock_time(date, field(col::END_TIME))?,
        break_hours: field(col::BREAK_HOURS).to_string(),
        work_hours: field(col::WORK_HOURS).to_string(),
        night_hours: field(col::NIGHT_HOURS).to_string(),
        memo: field(col::MEMO).to_string(),
    })
}

/// `HH:MM` on `date`; 24:00 and later roll over to the next day.
fn clock_time(date: NaiveDate, value: &str) -> std::result::Result<Option<String>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let (hours, minutes) = value
        .split_once(':')
        .and_then(|(h, m)| Some((h.parse::<i64>().ok()?, m.parse::<i64>().ok()?)))
        .filter(|(h, m)| (0..48).contains(h) && (0..60).contains(m))
        .ok_or_else(|| format!("bad time {value:?}"))?;

    let midnight: NaiveDateTime = date.and_hms_opt(0, 0, 0).ok_or("bad date")?;
    let at = midnight + Duration::hours(hours) + Duration::minutes(minutes);
    Ok(Some(at.format("%Y-%m-%d %H:%M:%S").to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::MemoryObjectStore;

    const HEADER: &str = "id\tname\tdate\twork_num\tdate_code\tdate_type\twork_code\twork_type\tstart_time\tend_time\tstart_time_round\tend_time_round\tbreak_hours\twork_hours\tnight_hours\tmemo\tapprover\tapproval_datetime\tsecond_approver\tsecond_approval_datetime\tthird_approver\tthird_approval_datetime";

    fn row(id: &str, date: &str, num: &str, start: &str, end: &str) -> String {
        format!(
            "{id}\tName\t{date}\t{num}\t0\tweekday\t01\tonsite\t{start}\t{end}\t{start}\t{end}\t1:00\t8:00\t0:00\tnote\t\t\t\t\t\t"
        )
    }

    fn file(rows: &[String]) -> Vec<u8> {
        let mut text = HEADER.to_string();
        for r in rows {
            text.push('\n');
            text.push_str(r);
        }
        text.into_bytes()
    }

    #[test]
    fn test_parse_groups_by_user() {
        let bytes = file(&[
            row("u1", "20240105", "1", "09:00", "18:00"),
            row("u2", "20240105", "1", "10:00", "19:00"),
            row("u1", "20240201", "2", "09:00", "18:00"),
        ]);
        let users = parse_work_file(&bytes).unwrap();

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "u1");
        assert_eq!(users[0].months, ["2024-01", "2024-02"]);
        assert_eq!(users[0].records[1].sk, "WorkData#2024-02-01#02");
        assert_eq!(
            users[0].records[0].start_datetime.as_deref(),
            Some("2024-01-05 09:00:00")
        );
        assert_eq!(users[1].records.len(), 1);
    }

    #[test]
    fn test_late_end_rolls_over() {
        let bytes = file(&[row("u1", "20240131", "1", "18:00", "24:30")]);
        let users = parse_work_file(&bytes).unwrap();
        assert_eq!(
            users[0].records[0].end_datetime.as_deref(),
            Some("2024-02-01 00:30:00")
        );
    }

    #[test]
    fn test_days_off_have_no_times() {
        let bytes = file(&[row("u1", "20240106", "1", "", "")]);
        let record = &parse_work_file(&bytes).unwrap()[0].records[0];
        assert!(record.start_datetime.is_none());
        assert!(record.end_datetime.is_none());
    }

    #[test]
    fn test_comma_delimited_without_approval_columns() {
        let text = "id,name,date,work_num,date_code,date_type,work_code,work_type,start_time,end_time,start_time_round,end_time_round,break_hours,work_hours,night_hours\n\
                    u1,\"Name\",20240105,1,0,weekday,01,onsite,09:00,18:00,09:00,18:00,1:00,8:00,0:00\n\n";
        let users = parse_work_file(text.as_bytes()).unwrap();
        assert_eq!(users[0].records[0].memo, "");
        assert_eq!(users[0].records[0].work_hours, "8:00");
    }

    #[test]
    fn test_quoted_delimiters_stay_in_their_field() {
        let text = "id,name,date,work_num,date_code,date_type,work_code,work_type,start_time,end_time,start_time_round,end_time_round,break_hours,work_hours,night_hours,memo\n\
                    u1,\"Doe, Jane\",20240105,1,0,weekday,01,onsite,09:00,18:00,09:00,18:00,1:00,8:00,0:00,\"late, again\"\n\
                    u1,Doe,20240108,1,0,weekday,01,onsite,09:00,18:00,09:00,18:00,1:00,8:00,0:00,\"said \"\"hi\"\"\"\n";
        let users = parse_work_file(text.as_bytes()).unwrap();
        let records = &users[0].records;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sk, "WorkData#2024-01-05#01");
        assert_eq!(records[0].work_hours, "8:00");
        assert_eq!(records[0].memo, "late, again");
        assert_eq!(records[1].memo, "said \"hi\"");
    }

    #[test]
    fn test_shift_jis_upload_is_decoded() {
        let text = format!(
            "{HEADER}\nu1\t山田\t20240105\t1\t0\t平日\t01\t常駐\t09:00\t18:00\t09:00\t18:00\t1:00\t8:00\t0:00\t遅刻"
        );
        let (bytes, _, unmappable) = SHIFT_JIS.encode(&text);
        assert!(!unmappable);
        assert!(std::str::from_utf8(&bytes).is_err());

        let users = parse_work_file(&bytes).unwrap();
        assert_eq!(users[0].user_id, "u1");
        assert_eq!(users[0].records[0].memo, "遅刻");
        assert_eq!(
            users[0].records[0].end_datetime.as_deref(),
            Some("2024-01-05 18:00:00")
        );
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend(file(&[row("u1", "20240105", "1", "09:00", "18:00")]));
        let users = parse_work_file(&bytes).unwrap();
        assert_eq!(users[0].user_id, "u1");
    }

    #[test]
    fn test_errors_name_the_line() {
        let bytes = file(&[
            row("u1", "20240105", "1", "09:00", "18:00"),
            row("u1", "2024-01-06", "1", "09:00", "18:00"),
        ]);
        let err = parse_work_file(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().contains("line 3"));

        let bytes = file(&[row("", "20240105", "1", "09:00", "18:00")]);
        assert!(parse_work_file(&bytes).unwrap_err().to_string().contains("missing id"));

        let bytes = file(&[row("u1", "20240105", "1", "9am", "18:00")]);
        assert!(parse_work_file(&bytes).unwrap_err().to_string().contains("bad time"));
    }

    #[test]
    fn test_header_only_is_rejected() {
        let err = parse_work_file(HEADER.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no data rows"));
        assert!(parse_work_file(b"").is_err());
    }

    #[tokio::test]
    async fn test_unit_reads_object() {
        let objects = MemoryObjectStore::new();
        objects
            .put_object(
                "b",
                "raw/2024-01.csv",
                file(&[row("u1", "20240105", "1", "09:00", "18:00")]),
                "text/csv",
            )
            .await
            .unwrap();
        let unit = IngestUnit::new(Arc::new(objects));

        let input = to_payload(&TriggerInput::new("b", "raw/2024-01.csv", None)).unwrap();
        let output: IngestOutput = from_payload("test", unit.call(input).await.unwrap()).unwrap();
        assert_eq!(output.users[0].user_id, "u1");

        let missing = to_payload(&TriggerInput::new("b", "raw/none.csv", None)).unwrap();
        assert_eq!(unit.call(missing).await.unwrap_err().kind(), ErrorKind::Input);
    }
}
