//! Append-only calendar storage, error log sink, cleaned-file rewrite + HTTP fetch utilities.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use csv::{ByteRecord, ReaderBuilder, StringRecord, WriterBuilder};
use econcal_core::{clean_rows, CanonicalRecord, ErrorLogEntry, ImpactEncoding, COLUMNS};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "econcal-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only CSV sink over the primary calendar file.
///
/// The header is written only when the file is empty on open; every appended
/// row is flushed before `append` returns.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl RecordStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let mut len = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();

        // A crash can leave a half-written last row, possibly inside an open
        // quote. Cut the file back to the end of the last complete row.
        if len > 0 && !ends_with_newline(&mut file, len).map_err(|e| StoreError::io(&path, e))? {
            let keep = complete_rows_len(&path)?;
            file.set_len(keep).map_err(|e| StoreError::io(&path, e))?;
            warn!(
                path = %path.display(),
                dropped_bytes = len - keep,
                "dropped partial row left by an interrupted write"
            );
            len = keep;
        }

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if len == 0 {
            writer
                .write_record(COLUMNS)
                .map_err(|e| StoreError::csv(&path, e))?;
            writer.flush().map_err(|e| StoreError::io(&path, e))?;
        }

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &CanonicalRecord) -> Result<(), StoreError> {
        self.writer
            .write_record(record.to_row())
            .map_err(|e| StoreError::csv(&self.path, e))?;
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))
    }

    pub fn last_record(&self) -> Result<Option<CanonicalRecord>, StoreError> {
        read_last_record(&self.path)
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Byte length of the file up to the start of its last record.
///
/// Only meaningful when the file does not end in a newline, in which case the
/// last record is the partial one.
fn complete_rows_len(path: &Path) -> Result<u64, StoreError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StoreError::csv(path, e))?;
    let mut record = ByteRecord::new();
    let mut last_start = 0;
    loop {
        let start = reader.position().byte();
        if !reader
            .read_byte_record(&mut record)
            .map_err(|e| StoreError::csv(path, e))?
        {
            break;
        }
        last_start = start;
    }
    Ok(last_start)
}

struct ColumnMap {
    indices: [Option<usize>; 7],
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut indices = [None; 7];
        for (slot, name) in indices.iter_mut().zip(COLUMNS) {
            *slot = headers.iter().position(|h| h.trim() == name);
        }
        Self { indices }
    }

    fn record(&self, row: &StringRecord) -> CanonicalRecord {
        let field = |i: usize| {
            self.indices[i]
                .and_then(|idx| row.get(idx))
                .unwrap_or_default()
                .to_string()
        };
        CanonicalRecord {
            datetime: field(0),
            currency: field(1),
            impact: field(2),
            event: field(3),
            actual: field(4),
            forecast: field(5),
            previous: field(6),
        }
    }
}

fn open_reader(path: &Path) -> Result<Option<csv::Reader<File>>, StoreError> {
    match File::open(path) {
        Ok(file) => Ok(Some(
            ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .from_reader(file),
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Last non-blank row of a calendar file; `None` for a missing or header-only file.
pub fn read_last_record(path: impl AsRef<Path>) -> Result<Option<CanonicalRecord>, StoreError> {
    let path = path.as_ref();
    let Some(mut reader) = open_reader(path)? else {
        return Ok(None);
    };
    let columns = ColumnMap::from_headers(reader.headers().map_err(|e| StoreError::csv(path, e))?);

    let mut last = None;
    for row in reader.records() {
        let row = row.map_err(|e| StoreError::csv(path, e))?;
        if row.iter().any(|field| !field.trim().is_empty()) {
            last = Some(row);
        }
    }
    Ok(last.map(|row| columns.record(&row)))
}

pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<CanonicalRecord>, StoreError> {
    let path = path.as_ref();
    let Some(mut reader) = open_reader(path)? else {
        return Ok(Vec::new());
    };
    let columns = ColumnMap::from_headers(reader.headers().map_err(|e| StoreError::csv(path, e))?);
    reader
        .records()
        .map(|row| {
            row.map(|row| columns.record(&row))
                .map_err(|e| StoreError::csv(path, e))
        })
        .collect()
}

/// Line-oriented `timestamp|context|message` diagnostics file.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ErrorLogEntry) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        writeln!(file, "{}", entry.to_line()).map_err(|e| StoreError::io(&self.path, e))?;
        file.flush().map_err(|e| StoreError::io(&self.path, e))
    }
}

/// Rewrites `input` into a fresh `output` with cleaned `datetime` and `impact` columns.
///
/// The output only appears once every row has been cleaned and written; a
/// malformed row leaves any previous output untouched. Returns the number of
/// data rows written.
pub fn clean_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    encoding: ImpactEncoding,
) -> anyhow::Result<usize> {
    let input = input.as_ref();
    let output = output.as_ref();

    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", input.display()))?
        .iter()
        .map(ToString::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|row| row.map(|r| r.iter().map(ToString::to_string).collect::<Vec<_>>()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading rows of {}", input.display()))?;

    let cleaned = clean_rows(&headers, rows, encoding)
        .with_context(|| format!("cleaning {}", input.display()))?;
    let written = cleaned.len();

    write_rows_atomically(output, &headers, &cleaned)?;
    debug!(input = %input.display(), output = %output.display(), rows = written, "cleaned calendar file");
    Ok(written)
}

fn write_rows_atomically(output: &Path, headers: &[String], rows: &[Vec<String>]) -> anyhow::Result<()> {
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), rows.len()));
    let result = (|| -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        writer
            .write_record(headers)
            .with_context(|| format!("writing header to {}", temp_path.display()))?;
        for row in rows {
            writer
                .write_record(row)
                .with_context(|| format!("writing row to {}", temp_path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(writer);
        fs::rename(&temp_path, output).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                output.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_inner(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_bytes_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
