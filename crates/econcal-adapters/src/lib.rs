//! Day fetcher + page renderer contracts toward the external calendar site.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use econcal_core::{CalendarState, NormalizationError, RawEvent};
use econcal_storage::{FetchError, HttpFetcher};
use rand::Rng;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "econcal-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.forexfactory.com/calendar";

/// Script assignment that carries the rendered calendar state.
pub const STATE_MARKER: &str = "calendarComponentStates[1]";

/// `2025-03-16` -> `mar16.2025`.
pub fn day_slug(date: NaiveDate) -> String {
    date.format("%b%d.%Y").to_string().to_lowercase()
}

pub fn day_url(base_url: &str, date: NaiveDate) -> String {
    format!("{}?day={}", base_url.trim_end_matches('/'), day_slug(date))
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid calendar state: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// External rendering layer: turns a calendar URL into the page-embedded state, if any.
#[async_trait]
pub trait PageRenderer: Send {
    fn name(&self) -> &'static str;

    async fn embedded_state(&mut self, url: &str) -> Result<Option<JsonValue>, RenderError>;

    /// Releases the session; called exactly once when the crawl ends.
    async fn close(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

/// Plain HTTP renderer: downloads the page and reads the state assignment out of its scripts.
#[derive(Debug)]
pub struct HttpPageRenderer {
    http: HttpFetcher,
}

impl HttpPageRenderer {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn embedded_state(&mut self, url: &str) -> Result<Option<JsonValue>, RenderError> {
        let page = self.http.fetch_bytes(url).await?;
        extract_embedded_state(&page.body_text())
    }
}

/// Reads pre-captured days from `<dir>/<slug>.json` (raw state) or `<dir>/<slug>.html` (page).
#[derive(Debug, Clone)]
pub struct FixturePageRenderer {
    dir: PathBuf,
}

impl FixturePageRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn slug_from_url(url: &str) -> Option<&str> {
    url.split_once("day=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
        .filter(|slug| !slug.is_empty())
}

fn read_fixture(path: &Path) -> Result<Option<String>, RenderError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RenderError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl PageRenderer for FixturePageRenderer {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn embedded_state(&mut self, url: &str) -> Result<Option<JsonValue>, RenderError> {
        let slug = slug_from_url(url)
            .ok_or_else(|| RenderError::Message(format!("no day slug in {url}")))?;

        if let Some(text) = read_fixture(&self.dir.join(format!("{slug}.json")))? {
            return Ok(Some(serde_json::from_str(&text)?));
        }
        match read_fixture(&self.dir.join(format!("{slug}.html")))? {
            Some(html) => extract_embedded_state(&html),
            None => Ok(None),
        }
    }
}

/// Finds `calendarComponentStates[1] = {...}` in the page scripts and decodes the object.
pub fn extract_embedded_state(html: &str) -> Result<Option<JsonValue>, RenderError> {
    let document = Html::parse_document(html);
    let scripts = Selector::parse("script").map_err(|e| RenderError::Message(e.to_string()))?;

    for script in document.select(&scripts) {
        let text = script.text().collect::<String>();
        let Some(pos) = text.find(STATE_MARKER) else {
            continue;
        };
        let rest = &text[pos + STATE_MARKER.len()..];
        let Some(assign) = rest.find('=') else {
            continue;
        };
        let object = balanced_object(&rest[assign + 1..])
            .ok_or_else(|| RenderError::Message("unterminated calendar state object".to_string()))?;
        return Ok(Some(serde_json::from_str(object)?));
    }
    Ok(None)
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut escaped = false;

    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => quote = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Randomized pause taken before every page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterDelay {
    pub min: Duration,
    pub max: Duration,
}

impl Default for JitterDelay {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2),
            max: Duration::from_secs(4),
        }
    }
}

impl JitterDelay {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// A day that could not be fetched or decoded at all.
#[derive(Debug, Error)]
#[error("fetching {url} failed: {source}")]
pub struct FetchFailure {
    pub url: String,
    #[source]
    pub source: RenderError,
}

/// Events of one calendar day; entries that were not event objects land in `rejected`.
#[derive(Debug, Clone, Default)]
pub struct FetchedDay {
    pub url: String,
    pub events: Vec<RawEvent>,
    pub rejected: Vec<NormalizationError>,
}

/// Fetches one calendar day at a time through a [`PageRenderer`].
pub struct DayFetcher {
    renderer: Box<dyn PageRenderer>,
    base_url: String,
    jitter: JitterDelay,
}

impl DayFetcher {
    pub fn new(renderer: Box<dyn PageRenderer>, base_url: impl Into<String>, jitter: JitterDelay) -> Self {
        Self {
            renderer,
            base_url: base_url.into(),
            jitter,
        }
    }

    pub fn renderer_name(&self) -> &'static str {
        self.renderer.name()
    }

    pub fn url_for(&self, date: NaiveDate) -> String {
        day_url(&self.base_url, date)
    }

    /// A day without embedded state yields zero events rather than a failure.
    pub async fn fetch(&mut self, date: NaiveDate) -> Result<FetchedDay, FetchFailure> {
        let url = self.url_for(date);
        self.jitter.wait().await;

        let state = match self.renderer.embedded_state(&url).await {
            Ok(Some(value)) => CalendarState::from_value(value),
            Ok(None) => Ok(CalendarState::default()),
            Err(source) => return Err(FetchFailure { url, source }),
        };
        let state = match state {
            Ok(state) => state,
            Err(err) => {
                return Err(FetchFailure {
                    url,
                    source: RenderError::Decode(err),
                })
            }
        };

        let mut day = FetchedDay {
            url,
            ..Default::default()
        };
        for value in state.event_values() {
            match RawEvent::from_value(value) {
                Ok(event) => day.events.push(event),
                Err(err) => day.rejected.push(err),
            }
        }
        debug!(url = %day.url, events = day.events.len(), rejected = day.rejected.len(), "fetched day");
        Ok(day)
    }

    pub async fn close(&mut self) -> Result<(), RenderError> {
        self.renderer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"<html><head>
<script>var other = {"x": 1};</script>
<script>
window.calendarComponentStates = window.calendarComponentStates || {};
window.calendarComponentStates[1] = {"days":[{"date":"Sun Mar 16","events":[
  {"dateline":1742112000,"currency":"CNY","impactTitle":"Low Impact Expected","name":"Industrial Production {y/y}","actual":"5.9%","forecast":"5.3%","previous":"6.2%"}
]}],"time":"now"};
</script></head><body></body></html>"#;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn day_slug_uses_lowercase_month_abbreviation() {
        assert_eq!(day_slug(date(2025, 3, 16)), "mar16.2025");
        assert_eq!(day_slug(date(2007, 1, 1)), "jan01.2007");
        assert_eq!(
            day_url("https://www.forexfactory.com/calendar/", date(2024, 12, 5)),
            "https://www.forexfactory.com/calendar?day=dec05.2024"
        );
    }

    #[test]
    fn extracts_state_assignment_with_braces_inside_strings() {
        let state = extract_embedded_state(PAGE).unwrap().expect("state");
        let events = state["days"][0]["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["name"], json!("Industrial Production {y/y}"));
    }

    #[test]
    fn page_without_state_has_no_embedded_data() {
        let html = "<html><script>console.log('hi')</script></html>";
        assert!(extract_embedded_state(html).unwrap().is_none());
    }

    #[test]
    fn unterminated_state_is_an_error() {
        let html = "<script>window.calendarComponentStates[1] = {\"days\": [</script>";
        assert!(matches!(
            extract_embedded_state(html),
            Err(RenderError::Message(_))
        ));
    }

    #[test]
    fn jitter_sample_stays_in_bounds() {
        let jitter = JitterDelay {
            min: Duration::from_millis(5),
            max: Duration::from_millis(10),
        };
        for _ in 0..50 {
            let d = jitter.sample();
            assert!(d >= jitter.min && d <= jitter.max);
        }
        assert_eq!(JitterDelay::none().sample(), Duration::ZERO);
    }

    #[test]
    fn slug_is_read_from_day_query() {
        assert_eq!(slug_from_url("https://x.test/calendar?day=mar16.2025"), Some("mar16.2025"));
        assert_eq!(slug_from_url("https://x.test/calendar?day=mar16.2025&tz=1"), Some("mar16.2025"));
        assert_eq!(slug_from_url("https://x.test/calendar"), None);
    }

    struct StaticRenderer(Option<JsonValue>);

    #[async_trait]
    impl PageRenderer for StaticRenderer {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn embedded_state(&mut self, _url: &str) -> Result<Option<JsonValue>, RenderError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn fetch_splits_events_and_rejected_entries() {
        let state = json!({ "days": [
            { "events": [{ "dateline": 1742112000, "name": "CPI" }, "garbage"] },
            { "events": [{ "dateline": 1742115600, "name": "PPI" }] }
        ]});
        let mut fetcher = DayFetcher::new(
            Box::new(StaticRenderer(Some(state))),
            "https://x.test/calendar",
            JitterDelay::none(),
        );
        let day = fetcher.fetch(date(2025, 3, 16)).await.unwrap();
        assert_eq!(day.url, "https://x.test/calendar?day=mar16.2025");
        assert_eq!(day.events.len(), 2);
        assert_eq!(day.rejected.len(), 1);
    }

    #[tokio::test]
    async fn missing_state_is_zero_events_and_bad_shape_is_failure() {
        let mut empty = DayFetcher::new(Box::new(StaticRenderer(None)), "https://x.test/c", JitterDelay::none());
        let day = empty.fetch(date(2025, 3, 16)).await.unwrap();
        assert!(day.events.is_empty());

        let mut bad = DayFetcher::new(
            Box::new(StaticRenderer(Some(json!({ "days": "not a list" })))),
            "https://x.test/c",
            JitterDelay::none(),
        );
        let err = bad.fetch(date(2025, 3, 16)).await.unwrap_err();
        assert_eq!(err.url, "https://x.test/c?day=mar16.2025");
        assert!(matches!(err.source, RenderError::Decode(_)));
    }
}
