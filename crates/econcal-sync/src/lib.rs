//! Resumable day-by-day crawl orchestration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use econcal_adapters::{
    DayFetcher, FetchFailure, FixturePageRenderer, HttpPageRenderer, JitterDelay, PageRenderer,
    DEFAULT_BASE_URL,
};
use econcal_core::{
    local_midnight, normalize_event, CanonicalRecord, CrawlCursor, ErrorLogEntry,
};
use econcal_storage::{ErrorLog, HttpClientConfig, HttpFetcher, RecordStore, StoreError};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "econcal-sync";

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Madrid;
pub const DEFAULT_OUTPUT: &str = "forex_factory_catalog.csv";
pub const DEFAULT_ERRORS: &str = "errors.csv";
pub const DEFAULT_CLEANED_OUTPUT: &str = "forex_factory_cleaned.csv";
pub const DEFAULT_START: (i32, u32, u32) = (2025, 3, 16);
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub timezone: Tz,
    pub output_path: PathBuf,
    pub errors_path: PathBuf,
    pub cleaned_path: PathBuf,
    pub start_date: NaiveDate,
    pub base_url: String,
    pub jitter: JitterDelay,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_failure_rate: f64,
    pub fixture_dir: Option<PathBuf>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        let (y, m, d) = DEFAULT_START;
        Self {
            timezone: DEFAULT_TIMEZONE,
            output_path: PathBuf::from(DEFAULT_OUTPUT),
            errors_path: PathBuf::from(DEFAULT_ERRORS),
            cleaned_path: PathBuf::from(DEFAULT_CLEANED_OUTPUT),
            start_date: NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            jitter: JitterDelay::default(),
            http_timeout_secs: 20,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_failure_rate: 0.25,
            fixture_dir: None,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(None),
    }
}

impl CrawlConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let timezone = parse_var::<Tz>(&lookup, "ECONCAL_TIMEZONE")?.unwrap_or(defaults.timezone);
        let start_date = match lookup("ECONCAL_START_DATE") {
            Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("invalid ECONCAL_START_DATE={raw}"))?,
            None => defaults.start_date,
        };
        let jitter = JitterDelay {
            min: parse_var::<u64>(&lookup, "ECONCAL_JITTER_MIN_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter.min),
            max: parse_var::<u64>(&lookup, "ECONCAL_JITTER_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter.max),
        };

        Ok(Self {
            timezone,
            output_path: lookup("ECONCAL_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            errors_path: lookup("ECONCAL_ERRORS")
                .map(PathBuf::from)
                .unwrap_or(defaults.errors_path),
            cleaned_path: lookup("ECONCAL_CLEANED_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cleaned_path),
            start_date,
            base_url: lookup("ECONCAL_BASE_URL").unwrap_or(defaults.base_url),
            jitter,
            http_timeout_secs: parse_var(&lookup, "ECONCAL_HTTP_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: lookup("ECONCAL_USER_AGENT").unwrap_or(defaults.user_agent),
            max_failure_rate: parse_var(&lookup, "ECONCAL_MAX_FAILURE_RATE")?
                .unwrap_or(defaults.max_failure_rate),
            fixture_dir: lookup("ECONCAL_FIXTURE_DIR").map(PathBuf::from),
        })
    }

    /// Acquires the rendering layer; failure here aborts the run before any day is attempted.
    pub fn build_renderer(&self) -> Result<Box<dyn PageRenderer>> {
        if let Some(dir) = &self.fixture_dir {
            return Ok(Box::new(FixturePageRenderer::new(dir.clone())));
        }
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })?;
        Ok(Box::new(HttpPageRenderer::new(http)))
    }

    pub fn build_fetcher(&self) -> Result<DayFetcher> {
        Ok(DayFetcher::new(
            self.build_renderer()?,
            self.base_url.clone(),
            self.jitter,
        ))
    }
}

/// Where a run starts, and the last instant already on disk (if any).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumption {
    pub cursor: CrawlCursor,
    pub last_instant: Option<DateTime<Tz>>,
}

/// Computes the crawl window from the persisted calendar.
#[derive(Debug, Clone, Copy)]
pub struct TimeCursor {
    pub fallback: NaiveDate,
    pub timezone: Tz,
}

impl TimeCursor {
    pub fn new(fallback: NaiveDate, timezone: Tz) -> Self {
        Self { fallback, timezone }
    }

    pub fn resume(&self, store: &RecordStore) -> Resumption {
        self.resume_at(store.last_record(), Utc::now())
    }

    /// `last + 1s` when the last stored row carries a parsable instant, else
    /// midnight of the fallback date; the window always ends at `now`.
    pub fn resume_at(
        &self,
        last: Result<Option<CanonicalRecord>, StoreError>,
        now: DateTime<Utc>,
    ) -> Resumption {
        let tz = self.timezone;
        let last_instant = match last {
            Ok(Some(record)) => match record.instant() {
                Some(instant) => Some(instant.with_timezone(&tz)),
                None => {
                    warn!(
                        datetime = %record.datetime,
                        fallback = %self.fallback,
                        "last stored record has no parsable instant; restarting from fallback date"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, fallback = %self.fallback, "stored calendar unreadable; restarting from fallback date");
                None
            }
        };

        let current = match last_instant {
            Some(instant) => instant + chrono::Duration::seconds(1),
            None => local_midnight(tz, self.fallback),
        };
        Resumption {
            cursor: CrawlCursor::new(current, now.with_timezone(&tz)),
            last_instant,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start: String,
    pub end: String,
    pub days_attempted: usize,
    pub days_failed: usize,
    pub events_written: usize,
    pub events_dropped: usize,
    pub events_skipped: usize,
    pub output: String,
}

impl CrawlSummary {
    pub fn failure_rate(&self) -> f64 {
        if self.days_attempted == 0 {
            0.0
        } else {
            self.days_failed as f64 / self.days_attempted as f64
        }
    }

    pub fn exceeds(&self, max_failure_rate: f64) -> bool {
        self.failure_rate() > max_failure_rate
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DayReport {
    written: usize,
    dropped: usize,
    skipped: usize,
}

#[derive(Debug, Error)]
enum DayError {
    #[error(transparent)]
    Fetch(#[from] FetchFailure),
    #[error("appending to calendar: {source}")]
    Store {
        url: String,
        #[source]
        source: StoreError,
    },
}

impl DayError {
    fn url(&self) -> &str {
        match self {
            Self::Fetch(failure) => &failure.url,
            Self::Store { url, .. } => url,
        }
    }

    /// Error-log message; the URL already goes in the context column.
    fn message(&self) -> String {
        match self {
            Self::Fetch(failure) => failure.source.to_string(),
            Self::Store { source, .. } => format!("appending to calendar: {source}"),
        }
    }
}

type ProgressFn = Box<dyn FnMut(NaiveDate) + Send>;

/// Drives the day loop: fetch, normalize, append, advance.
///
/// Each day in the window is attempted once. A failed day is written to the
/// error log and skipped; it is not retried later in the run.
pub struct CrawlOrchestrator {
    config: CrawlConfig,
    fetcher: DayFetcher,
    error_log: ErrorLog,
    progress: Option<ProgressFn>,
}

impl CrawlOrchestrator {
    pub fn new(config: CrawlConfig, fetcher: DayFetcher) -> Self {
        let error_log = ErrorLog::new(config.errors_path.clone());
        Self {
            config,
            fetcher,
            error_log,
            progress: None,
        }
    }

    pub fn from_config(config: CrawlConfig) -> Result<Self> {
        let fetcher = config.build_fetcher().context("acquiring rendering layer")?;
        Ok(Self::new(config, fetcher))
    }

    pub fn with_progress(mut self, progress: impl FnMut(NaiveDate) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub async fn run(self) -> Result<CrawlSummary> {
        self.run_at(Utc::now()).await
    }

    /// Runs the crawl with `now` as the end of the window. The rendering
    /// layer is closed on every exit path.
    pub async fn run_at(mut self, now: DateTime<Utc>) -> Result<CrawlSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("crawl", %run_id, renderer = self.fetcher.renderer_name());
        let result = self.crawl(run_id, now).instrument(span).await;

        if let Err(err) = self.fetcher.close().await {
            warn!(error = %err, "closing rendering layer failed");
        }

        match &result {
            Ok(summary) => info!(
                output = %summary.output,
                days = summary.days_attempted,
                failed = summary.days_failed,
                written = summary.events_written,
                "crawl complete; data saved to {}",
                summary.output
            ),
            Err(err) => warn!(
                error = %err,
                output = %self.config.output_path.display(),
                "crawl aborted; data saved to {}",
                self.config.output_path.display()
            ),
        }
        result
    }

    async fn crawl(&mut self, run_id: Uuid, now: DateTime<Utc>) -> Result<CrawlSummary> {
        let started_at = Utc::now();
        let mut store = RecordStore::open(&self.config.output_path)
            .with_context(|| format!("opening {}", self.config.output_path.display()))?;

        let resumption = TimeCursor::new(self.config.start_date, self.config.timezone)
            .resume_at(store.last_record(), now);
        let mut cursor = resumption.cursor;
        info!(
            start = %cursor.current.to_rfc3339(),
            end = %cursor.end.to_rfc3339(),
            days = cursor.remaining_days(),
            "crawl window"
        );

        let mut summary = CrawlSummary {
            run_id,
            started_at,
            finished_at: started_at,
            start: cursor.current.to_rfc3339(),
            end: cursor.end.to_rfc3339(),
            days_attempted: 0,
            days_failed: 0,
            events_written: 0,
            events_dropped: 0,
            events_skipped: 0,
            output: store.path().display().to_string(),
        };

        // Only the first day can hold rows that are already on disk.
        let mut watermark = resumption.last_instant;
        while !cursor.is_done() {
            let date = cursor.current_date();
            if let Some(progress) = self.progress.as_mut() {
                progress(date);
            }

            summary.days_attempted += 1;
            match self.crawl_day(&mut store, date, watermark).await {
                Ok(report) => {
                    summary.events_written += report.written;
                    summary.events_dropped += report.dropped;
                    summary.events_skipped += report.skipped;
                }
                Err(err) => {
                    summary.days_failed += 1;
                    warn!(%date, url = err.url(), error = %err, "day failed; skipping");
                    self.log_error(err.url(), &err.message());
                }
            }

            watermark = None;
            cursor.advance();
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    async fn crawl_day(
        &mut self,
        store: &mut RecordStore,
        date: NaiveDate,
        watermark: Option<DateTime<Tz>>,
    ) -> Result<DayReport, DayError> {
        let day = self.fetcher.fetch(date).await?;
        let mut report = DayReport::default();

        for rejected in &day.rejected {
            report.dropped += 1;
            self.log_error(&day.url, &format!("skipping event: {rejected}"));
        }

        for event in &day.events {
            let record = match normalize_event(event, self.config.timezone) {
                Ok(record) => record,
                Err(err) => {
                    report.dropped += 1;
                    self.log_error(&day.url, &format!("skipping event: {err}"));
                    continue;
                }
            };

            if let (Some(mark), Some(instant)) = (watermark, record.instant()) {
                if instant <= mark {
                    report.skipped += 1;
                    continue;
                }
            }

            store.append(&record).map_err(|source| DayError::Store {
                url: day.url.clone(),
                source,
            })?;
            report.written += 1;
        }
        Ok(report)
    }

    fn log_error(&self, context: &str, message: &str) {
        let entry = ErrorLogEntry::new(context, message);
        if let Err(err) = self.error_log.append(&entry) {
            warn!(error = %err, context, message, "could not write error log entry");
        }
    }
}

pub async fn run_crawl_from_env() -> Result<CrawlSummary> {
    let config = CrawlConfig::from_env()?;
    CrawlOrchestrator::from_config(config)?.run().await
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use econcal_adapters::RenderError;
    use econcal_storage::{read_last_record, read_records};
    use serde_json::{json, Value as JsonValue};
    use tempfile::tempdir;

    // 08:00 UTC on 2025-03-15 .. 2025-03-18
    const MAR15: i64 = 1_742_025_600;
    const MAR16: i64 = 1_742_112_000;
    const MAR17: i64 = 1_742_198_400;
    const MAR18: i64 = 1_742_284_800;

    #[derive(Clone)]
    enum Page {
        State(JsonValue),
        Broken(&'static str),
    }

    #[derive(Clone, Default)]
    struct ScriptedRenderer {
        pages: HashMap<String, Page>,
        requests: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedRenderer {
        fn page(mut self, slug: &str, page: Page) -> Self {
            self.pages.insert(slug.to_string(), page);
            self
        }
    }

    #[async_trait]
    impl PageRenderer for ScriptedRenderer {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn embedded_state(&mut self, url: &str) -> Result<Option<JsonValue>, RenderError> {
            self.requests.lock().unwrap().push(url.to_string());
            let slug = url.rsplit("day=").next().unwrap_or_default();
            match self.pages.get(slug) {
                Some(Page::State(value)) => Ok(Some(value.clone())),
                Some(Page::Broken(reason)) => Err(RenderError::Message(reason.to_string())),
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<(), RenderError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn day(events: &[(i64, &str)]) -> Page {
        let events: Vec<_> = events
            .iter()
            .map(|(dateline, name)| {
                json!({
                    "dateline": dateline,
                    "currency": "USD",
                    "impactTitle": "High Impact Expected",
                    "name": name,
                    "actual": "",
                    "forecast": "1.2%",
                    "previous": "1.1%"
                })
            })
            .collect();
        Page::State(json!({ "days": [{ "events": events }] }))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    fn config(dir: &Path, start: NaiveDate) -> CrawlConfig {
        CrawlConfig {
            timezone: chrono_tz::UTC,
            output_path: dir.join("calendar.csv"),
            errors_path: dir.join("errors.csv"),
            cleaned_path: dir.join("cleaned.csv"),
            start_date: start,
            base_url: "https://calendar.test/calendar".to_string(),
            jitter: JitterDelay::none(),
            ..CrawlConfig::default()
        }
    }

    fn orchestrator(config: CrawlConfig, renderer: ScriptedRenderer) -> CrawlOrchestrator {
        let fetcher = DayFetcher::new(Box::new(renderer), config.base_url.clone(), config.jitter);
        CrawlOrchestrator::new(config, fetcher)
    }

    fn error_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    fn three_days() -> ScriptedRenderer {
        ScriptedRenderer::default()
            .page("mar15.2025", day(&[(MAR15, "GDP q/q"), (MAR15 + 3600, "CPI m/m")]))
            .page("mar16.2025", day(&[(MAR16, "Retail Sales m/m")]))
            .page("mar17.2025", day(&[(MAR17, "ISM Manufacturing PMI")]))
    }

    #[tokio::test]
    async fn failed_day_is_logged_once_and_neighbours_are_kept() {
        let dir = tempdir().expect("tempdir");
        let cfg = config(dir.path(), date(2025, 3, 15));
        let renderer = three_days().page("mar16.2025", Page::Broken("renderer timed out"));
        let requests = renderer.requests.clone();
        let closed = renderer.closed.clone();

        let summary = orchestrator(cfg.clone(), renderer)
            .run_at(utc("2025-03-17T12:00:00Z"))
            .await
            .expect("run");

        assert_eq!(summary.days_attempted, 3);
        assert_eq!(summary.days_failed, 1);
        assert_eq!(summary.events_written, 3);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(requests.lock().unwrap().len(), 3);

        let rows = read_records(&cfg.output_path).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| !r.datetime.starts_with("2025-03-16")));
        assert_eq!(rows[2].event, "ISM Manufacturing PMI");

        let errors = error_lines(&cfg.errors_path);
        assert_eq!(errors.len(), 1);
        let columns: Vec<_> = errors[0].splitn(3, '|').collect();
        assert_eq!(columns[1], "https://calendar.test/calendar?day=mar16.2025");
        assert!(columns[2].contains("renderer timed out"));
        assert!(!columns[2].contains("calendar.test"));
    }

    #[tokio::test]
    async fn second_run_resumes_one_second_after_last_record_without_duplicates() {
        let dir = tempdir().expect("tempdir");
        let cfg = config(dir.path(), date(2025, 3, 15));
        let now = utc("2025-03-17T12:00:00Z");

        let first = orchestrator(cfg.clone(), three_days()).run_at(now).await.unwrap();
        assert_eq!(first.events_written, 4);

        let resumed = TimeCursor::new(cfg.start_date, cfg.timezone)
            .resume_at(read_last_record(&cfg.output_path), now);
        assert_eq!(resumed.cursor.current.to_rfc3339(), "2025-03-17T08:00:01+00:00");

        let renderer = three_days();
        let requests = renderer.requests.clone();
        let second = orchestrator(cfg.clone(), renderer).run_at(now).await.unwrap();
        assert_eq!(second.days_attempted, 1);
        assert_eq!(second.events_written, 0);
        assert_eq!(second.events_skipped, 1);
        assert_eq!(
            requests.lock().unwrap().as_slice(),
            ["https://calendar.test/calendar?day=mar17.2025".to_string()]
        );
        assert_eq!(read_records(&cfg.output_path).unwrap().len(), 4);

        let later = three_days().page("mar18.2025", day(&[(MAR18, "Building Permits")]));
        let third = orchestrator(cfg.clone(), later)
            .run_at(utc("2025-03-18T12:00:00Z"))
            .await
            .unwrap();
        assert_eq!(third.days_attempted, 2);
        assert_eq!(third.events_written, 1);

        let text = std::fs::read_to_string(&cfg.output_path).unwrap();
        let headers = text
            .lines()
            .filter(|l| l.starts_with("datetime,currency,impact"))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(read_records(&cfg.output_path).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn bad_events_are_dropped_without_losing_siblings() {
        let dir = tempdir().expect("tempdir");
        let cfg = config(dir.path(), date(2025, 3, 15));
        let page = Page::State(json!({ "days": [{ "events": [
            { "dateline": MAR15, "name": "Trade Balance" },
            { "name": "Speech without time" },
            "not an event",
            { "dateline": MAR15 + 60, "name": "Unemployment Rate", "impactTitle": "Non-Economic" }
        ]}]}));
        let renderer = ScriptedRenderer::default().page("mar15.2025", page);

        let summary = orchestrator(cfg.clone(), renderer)
            .run_at(utc("2025-03-15T20:00:00Z"))
            .await
            .unwrap();
        assert_eq!(summary.days_failed, 0);
        assert_eq!(summary.events_written, 2);
        assert_eq!(summary.events_dropped, 2);

        let rows = read_records(&cfg.output_path).unwrap();
        assert_eq!(rows[0].datetime, "2025-03-15T08:00:00+00:00");
        assert_eq!(rows[1].impact, "Holiday");
        assert_eq!(error_lines(&cfg.errors_path).len(), 2);
    }

    #[tokio::test]
    async fn setup_failure_still_closes_renderer() {
        let dir = tempdir().expect("tempdir");
        let mut cfg = config(dir.path(), date(2025, 3, 15));
        cfg.output_path = dir.path().to_path_buf();
        let renderer = three_days();
        let closed = renderer.closed.clone();
        let requests = renderer.requests.clone();

        let result = orchestrator(cfg, renderer)
            .run_at(utc("2025-03-17T12:00:00Z"))
            .await;
        assert!(result.is_err());
        assert!(closed.load(Ordering::SeqCst));
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_reports_each_day_in_order() {
        let dir = tempdir().expect("tempdir");
        let cfg = config(dir.path(), date(2025, 3, 15));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        orchestrator(cfg, three_days())
            .with_progress(move |d| sink.lock().unwrap().push(d))
            .run_at(utc("2025-03-17T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [date(2025, 3, 15), date(2025, 3, 16), date(2025, 3, 17)]
        );
    }

    #[test]
    fn empty_store_starts_at_local_midnight_of_fallback() {
        let now = utc("2025-08-01T10:00:00Z");
        let winter = TimeCursor::new(date(2025, 3, 16), chrono_tz::Europe::Madrid).resume_at(Ok(None), now);
        assert_eq!(winter.cursor.current.to_rfc3339(), "2025-03-16T00:00:00+01:00");
        assert_eq!(winter.cursor.end.to_rfc3339(), "2025-08-01T12:00:00+02:00");
        assert_eq!(winter.last_instant, None);

        let summer = TimeCursor::new(date(2025, 7, 1), chrono_tz::Europe::Madrid).resume_at(Ok(None), now);
        assert_eq!(summer.cursor.current.to_rfc3339(), "2025-07-01T00:00:00+02:00");
    }

    #[test]
    fn unparsable_last_record_falls_back_to_start_date() {
        let last = CanonicalRecord {
            datetime: "2025-03-17 08:00:00".to_string(),
            ..Default::default()
        };
        let resumed = TimeCursor::new(date(2025, 3, 16), chrono_tz::UTC)
            .resume_at(Ok(Some(last)), utc("2025-03-20T00:00:00Z"));
        assert_eq!(resumed.cursor.current.to_rfc3339(), "2025-03-16T00:00:00+00:00");
        assert_eq!(resumed.last_instant, None);
    }

    #[test]
    fn unreadable_store_falls_back_to_start_date() {
        let tz = chrono_tz::Europe::Madrid;
        let unreadable = Err(StoreError::Io {
            path: PathBuf::from("calendar.csv"),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "stream did not contain valid UTF-8"),
        });
        let resumed = TimeCursor::new(date(2025, 3, 16), tz).resume_at(unreadable, utc("2025-03-18T12:00:00Z"));
        assert_eq!(resumed.last_instant, None);
        assert_eq!(resumed.cursor.current, local_midnight(tz, date(2025, 3, 16)));
        assert_eq!(resumed.cursor.current.to_rfc3339(), "2025-03-16T00:00:00+01:00");
    }

    #[test]
    fn corrupt_store_bytes_restart_from_start_date() {
        let dir = tempdir().expect("tempdir");
        let cfg = config(dir.path(), date(2025, 3, 16));
        let mut bytes = b"datetime,currency,impact,event,actual,forecast,previous\n".to_vec();
        bytes.extend_from_slice(b"2025-03-16T09:00:00+01:00,EUR,\xff\xfe,CPI,,,\n");
        std::fs::write(&cfg.output_path, bytes).unwrap();

        let last = read_last_record(&cfg.output_path);
        assert!(last.is_err());
        let resumed = TimeCursor::new(cfg.start_date, cfg.timezone).resume_at(last, utc("2025-03-17T12:00:00Z"));
        assert_eq!(resumed.cursor.current_date(), date(2025, 3, 16));
        assert_eq!(resumed.cursor.current, local_midnight(cfg.timezone, cfg.start_date));
    }

    #[test]
    fn last_record_is_converted_into_target_timezone() {
        let last = CanonicalRecord {
            datetime: "2025-03-17T08:00:00+00:00".to_string(),
            ..Default::default()
        };
        let resumed = TimeCursor::new(date(2025, 3, 16), chrono_tz::Europe::Madrid)
            .resume_at(Ok(Some(last)), utc("2025-03-20T00:00:00Z"));
        assert_eq!(resumed.cursor.current.to_rfc3339(), "2025-03-17T09:00:01+01:00");
    }

    #[test]
    fn failure_rate_threshold() {
        let mut summary = CrawlSummary {
            run_id: Uuid::nil(),
            started_at: utc("2025-03-17T00:00:00Z"),
            finished_at: utc("2025-03-17T00:01:00Z"),
            start: String::new(),
            end: String::new(),
            days_attempted: 4,
            days_failed: 1,
            events_written: 10,
            events_dropped: 0,
            events_skipped: 0,
            output: "calendar.csv".to_string(),
        };
        assert_eq!(summary.failure_rate(), 0.25);
        assert!(!summary.exceeds(0.25));
        assert!(summary.exceeds(0.2));

        summary.days_attempted = 0;
        summary.days_failed = 0;
        assert_eq!(summary.failure_rate(), 0.0);
    }

    #[test]
    fn config_reads_overrides_and_rejects_unknown_timezone() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ECONCAL_TIMEZONE", "America/New_York"),
            ("ECONCAL_START_DATE", "2024-01-02"),
            ("ECONCAL_JITTER_MIN_MS", "0"),
            ("ECONCAL_JITTER_MAX_MS", "0"),
            ("ECONCAL_MAX_FAILURE_RATE", "0.5"),
            ("ECONCAL_OUTPUT", "out/calendar.csv"),
        ]);
        let cfg = CrawlConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.timezone, chrono_tz::America::New_York);
        assert_eq!(cfg.start_date, date(2024, 1, 2));
        assert_eq!(cfg.jitter, JitterDelay::none());
        assert_eq!(cfg.max_failure_rate, 0.5);
        assert_eq!(cfg.output_path, PathBuf::from("out/calendar.csv"));
        assert_eq!(cfg.errors_path, PathBuf::from(DEFAULT_ERRORS));

        let defaults = CrawlConfig::from_lookup(|_| None).unwrap();
        assert_eq!(defaults.timezone, chrono_tz::Europe::Madrid);
        assert_eq!(defaults.start_date, date(2025, 3, 16));

        assert!(CrawlConfig::from_lookup(|k| (k == "ECONCAL_TIMEZONE").then(|| "Mars/Olympus".to_string())).is_err());
        assert!(CrawlConfig::from_lookup(|k| (k == "ECONCAL_START_DATE").then(|| "16/03/2025".to_string())).is_err());
    }
}
