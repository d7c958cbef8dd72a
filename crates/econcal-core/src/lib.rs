//! Core calendar data model, event normalization and post-crawl cleaning rules.

use chrono::{DateTime, Days, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "econcal-core";

/// Fixed column order of the persisted calendar file.
pub const COLUMNS: [&str; 7] = [
    "datetime", "currency", "impact", "event", "actual", "forecast", "previous",
];

pub const NON_ECONOMIC_LABEL: &str = "Non-Economic";
pub const HOLIDAY_LABEL: &str = "Holiday";

/// Page-embedded calendar state for one rendered day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarState {
    #[serde(default)]
    pub days: Vec<CalendarDay>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarDay {
    #[serde(default)]
    pub events: Vec<JsonValue>,
}

impl CalendarState {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn event_values(&self) -> impl Iterator<Item = &JsonValue> {
        self.days.iter().flat_map(|day| day.events.iter())
    }
}

/// One event entity as exposed by the calendar page. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub dateline: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub impact_title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub actual: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub forecast: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub previous: Option<String>,
}

impl RawEvent {
    pub fn from_value(value: &JsonValue) -> Result<Self, NormalizationError> {
        if !value.is_object() {
            return Err(NormalizationError::Malformed(truncate_for_log(&value.to_string())));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| NormalizationError::Malformed(e.to_string()))
    }
}

// Display values arrive as strings most of the time, but numbers and booleans show up too.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    }))
}

fn truncate_for_log(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(MAX).collect();
        out.push_str("...");
        out
    }
}

/// Persisted calendar row, in `COLUMNS` order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub datetime: String,
    pub currency: String,
    pub impact: String,
    pub event: String,
    pub actual: String,
    pub forecast: String,
    pub previous: String,
}

impl CanonicalRecord {
    /// Timezone-qualified instant of the row, if `datetime` still carries an offset.
    pub fn instant(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(self.datetime.trim()).ok()
    }

    pub fn to_row(&self) -> [&str; 7] {
        [
            &self.datetime,
            &self.currency,
            &self.impact,
            &self.event,
            &self.actual,
            &self.forecast,
            &self.previous,
        ]
    }

    pub fn cleaned(&self, encoding: ImpactEncoding) -> Self {
        Self {
            datetime: clean_datetime(&self.datetime),
            impact: encode_impact(&self.impact, encoding),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("event has no dateline")]
    MissingDateline,
    #[error("unparsable dateline: {0}")]
    InvalidDateline(String),
    #[error("dateline {0} is outside the representable range")]
    OutOfRange(i64),
    #[error("malformed event: {0}")]
    Malformed(String),
}

fn epoch_seconds(value: &JsonValue) -> Result<i64, NormalizationError> {
    let parsed = match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        JsonValue::Null => return Err(NormalizationError::MissingDateline),
        _ => None,
    };
    parsed.ok_or_else(|| NormalizationError::InvalidDateline(truncate_for_log(&value.to_string())))
}

/// Converts epoch seconds into an instant in `tz`.
pub fn instant_from_epoch(seconds: i64, tz: Tz) -> Result<DateTime<Tz>, NormalizationError> {
    let utc = DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or(NormalizationError::OutOfRange(seconds))?;
    Ok(utc.with_timezone(&tz))
}

/// Maps one raw event onto the persisted schema.
///
/// The `dateline` is rendered as an RFC 3339 instant in `tz`; the
/// `Non-Economic` impact label becomes `Holiday`. Other text fields default to
/// the empty string.
pub fn normalize_event(raw: &RawEvent, tz: Tz) -> Result<CanonicalRecord, NormalizationError> {
    let dateline = raw
        .dateline
        .as_ref()
        .ok_or(NormalizationError::MissingDateline)?;
    let instant = instant_from_epoch(epoch_seconds(dateline)?, tz)?;

    let impact = match raw.impact_title.as_deref() {
        Some(NON_ECONOMIC_LABEL) => HOLIDAY_LABEL.to_string(),
        other => other.unwrap_or_default().to_string(),
    };

    Ok(CanonicalRecord {
        datetime: instant.to_rfc3339(),
        currency: raw.currency.clone().unwrap_or_default(),
        impact,
        event: raw.name.clone().unwrap_or_default(),
        actual: raw.actual.clone().unwrap_or_default(),
        forecast: raw.forecast.clone().unwrap_or_default(),
        previous: raw.previous.clone().unwrap_or_default(),
    })
}

/// Day-by-day crawl position, reconstructed on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlCursor {
    pub current: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl CrawlCursor {
    pub fn new(current: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        Self { current, end }
    }

    pub fn is_done(&self) -> bool {
        self.current > self.end
    }

    pub fn current_date(&self) -> NaiveDate {
        self.current.date_naive()
    }

    /// Moves to the same wall-clock time on the next calendar day.
    pub fn advance(&mut self) {
        self.current = self
            .current
            .checked_add_days(Days::new(1))
            .unwrap_or_else(|| self.current + Duration::days(1));
    }

    /// Number of `advance` steps left before the cursor passes `end`, including the current day.
    ///
    /// Today is only visited when the current wall-clock time is not later than `end`'s.
    pub fn remaining_days(&self) -> usize {
        let mut next = *self;
        let mut days = 0;
        while !next.is_done() {
            days += 1;
            next.advance();
        }
        days
    }
}

/// Midnight of `date` in `tz`, or the first valid local time after it when midnight is skipped.
pub fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    for hour in 0..4 {
        if let Some(dt) = tz
            .from_local_datetime(&(midnight + Duration::hours(hour)))
            .earliest()
        {
            return dt;
        }
    }
    tz.from_utc_datetime(&midnight)
}

/// Diagnostic side-channel entry: `timestamp|context|message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Utc>,
    pub context: String,
    pub message: String,
}

impl ErrorLogEntry {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}",
            self.timestamp.to_rfc3339(),
            single_line(&self.context),
            single_line(&self.message)
        )
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImpactEncoding {
    /// Legacy rewrite: lowercase, then replace the substrings `low`, `medium`,
    /// `high` and `holiday` anywhere in the label.
    #[default]
    Substring,
    /// Whole-label lookup; unknown labels pass through unchanged.
    ExactLabel,
}

/// `"2007-01-01T01:00:00+01:00"` -> `"2007-01-01 01:00:00"`.
///
/// Only a `+` offset is stripped; negative offsets survive as-is.
pub fn clean_datetime(value: &str) -> String {
    let replaced = value.replace('T', " ");
    replaced.split('+').next().unwrap_or_default().to_string()
}

pub fn encode_impact(value: &str, encoding: ImpactEncoding) -> String {
    match encoding {
        ImpactEncoding::Substring => value
            .to_lowercase()
            .replace("low", "1")
            .replace("medium", "2")
            .replace("high", "3")
            .replace("holiday", "0")
            .trim()
            .to_string(),
        ImpactEncoding::ExactLabel => {
            let ordinal = match value.trim().to_lowercase().as_str() {
                "holiday" => Some("0"),
                "low impact expected" => Some("1"),
                "medium impact expected" => Some("2"),
                "high impact expected" => Some("3"),
                _ => None,
            };
            ordinal.map(ToString::to_string).unwrap_or_else(|| value.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CleanError {
    #[error("input has no `{0}` column")]
    MissingColumn(&'static str),
    #[error("row {row} has {found} fields, `{column}` needs at least {needed}")]
    MalformedRow {
        row: usize,
        column: &'static str,
        found: usize,
        needed: usize,
    },
}

/// Rewrites `datetime` and `impact` in every row, passing other columns through.
///
/// Any row lacking one of the two columns aborts the whole pass.
pub fn clean_rows(
    headers: &[String],
    rows: Vec<Vec<String>>,
    encoding: ImpactEncoding,
) -> Result<Vec<Vec<String>>, CleanError> {
    let column_index = |name: &'static str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or(CleanError::MissingColumn(name))
    };
    let datetime_idx = column_index("datetime")?;
    let impact_idx = column_index("impact")?;

    rows.into_iter()
        .enumerate()
        .map(|(i, mut row)| {
            for (column, idx) in [("datetime", datetime_idx), ("impact", impact_idx)] {
                if row.len() <= idx {
                    return Err(CleanError::MalformedRow {
                        row: i + 1,
                        column,
                        found: row.len(),
                        needed: idx + 1,
                    });
                }
            }
            row[datetime_idx] = clean_datetime(&row[datetime_idx]);
            row[impact_idx] = encode_impact(&row[impact_idx], encoding);
            Ok(row)
        })
        .collect()
}
