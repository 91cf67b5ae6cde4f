//! Destination workbook storage, run configuration and HTTP fetch utilities for cotizar.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use cotizar_core::{
    CellValue, FailureKind, Series, SeriesId, SeriesRecord, SeriesSchema, NUMBER_FORMAT,
};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cotizar-storage";

pub const DEFAULT_COLUMN_WIDTH: f64 = 12.0;
pub const ESTIMATE_FILL_COLOR: &str = "BDD7EE";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination {} is open or locked by another process", .0.display())]
    Locked(PathBuf),
    #[error("destination {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("destination {} is not a readable workbook: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Locked(_) => FailureKind::ResourceLocked,
            StoreError::Corrupt { .. } => FailureKind::Parse,
            StoreError::Missing(_) | StoreError::Io { .. } => FailureKind::ResourceMissing,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A highlighted cell: 1-based sheet row (the header is row 1) and column name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    pub row: usize,
    pub column: String,
}

/// Presentational metadata persisted next to a sheet's cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetLayout {
    pub frozen_rows: u32,
    pub column_width: f64,
    #[serde(default)]
    pub number_formats: BTreeMap<String, String>,
    #[serde(default)]
    pub hidden_columns: Vec<String>,
    #[serde(default)]
    pub highlight_color: Option<String>,
    #[serde(default)]
    pub highlighted_cells: Vec<CellRef>,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            frozen_rows: 1,
            column_width: DEFAULT_COLUMN_WIDTH,
            number_formats: BTreeMap::new(),
            hidden_columns: Vec::new(),
            highlight_color: None,
            highlighted_cells: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sheet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    #[serde(default)]
    pub layout: SheetLayout,
}

/// On-disk document: named sheets, serialized as pretty JSON.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkbookDocument {
    pub sheets: BTreeMap<String, Sheet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Single-file workbook. Every write replaces the whole document through a
/// temp file and rename, so readers never observe a partial sheet.
#[derive(Debug, Clone)]
pub struct WorkbookFile {
    path: PathBuf,
}

impl WorkbookFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool, StoreError> {
        fs::try_exists(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Office applications drop these next to a workbook they hold open.
    pub fn owner_lock_paths(&self) -> Vec<PathBuf> {
        let Some(file_name) = self.path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return Vec::new();
        };
        let parent = self.parent_dir();
        vec![
            parent.join(format!("~${file_name}")),
            parent.join(format!(".~lock.{file_name}#")),
        ]
    }

    /// Advisory lock probe. There is a race window between this check and the
    /// first write; the destination format has no native locking primitive.
    pub async fn check_unlocked(&self) -> Result<(), StoreError> {
        if !self.exists().await? {
            return Ok(());
        }
        for owner in self.owner_lock_paths() {
            if fs::try_exists(&owner).await.unwrap_or(false) {
                debug!(owner = %owner.display(), "found owner lock file");
                return Err(StoreError::Locked(self.path.clone()));
            }
        }
        match fs::OpenOptions::new().append(true).open(&self.path).await {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(error = %err, "destination refused append open");
                Err(StoreError::Locked(self.path.clone()))
            }
        }
    }

    pub async fn load(&self) -> Result<WorkbookDocument, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(self.path.clone()));
            }
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(WorkbookDocument::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Creates an empty workbook if none exists yet.
    pub async fn create_if_missing(&self) -> Result<bool, StoreError> {
        if self.exists().await? {
            return Ok(false);
        }
        let parent = self.parent_dir();
        if !fs::try_exists(&parent).await.unwrap_or(false) {
            return Err(StoreError::Missing(parent));
        }
        self.write_document(&WorkbookDocument::default()).await?;
        Ok(true)
    }

    pub async fn save(&self, doc: &WorkbookDocument) -> Result<WriteOutcome, StoreError> {
        if !self.exists().await? {
            return Err(StoreError::Missing(self.path.clone()));
        }
        self.write_document(doc).await
    }

    async fn write_document(&self, doc: &WorkbookDocument) -> Result<WriteOutcome, StoreError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Ok(existing) = fs::read(&self.path).await {
            if sha256_hex(&existing) == sha256_hex(&bytes) {
                return Ok(WriteOutcome::Unchanged);
            }
        }

        let temp_path = self
            .parent_dir()
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let result: std::io::Result<()> = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        match result {
            Ok(()) => Ok(WriteOutcome::Written),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::io(&self.path, err))
            }
        }
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Paired value/flag columns whose value cell is filled when the flag is set.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightRule {
    pub value_column: String,
    pub flag_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetStyle {
    pub column_width: f64,
    pub number_formats: BTreeMap<String, String>,
    pub hidden_columns: Vec<String>,
    pub highlights: Vec<HighlightRule>,
    pub highlight_color: String,
}

impl SheetStyle {
    /// Header frozen, uniform width, `#,##0.00` on every value column, and
    /// for sheets with provenance flags: hidden flag columns plus highlights.
    pub fn for_schema(schema: &SeriesSchema) -> Self {
        Self {
            column_width: DEFAULT_COLUMN_WIDTH,
            number_formats: schema
                .value_columns
                .iter()
                .map(|c| (c.to_string(), NUMBER_FORMAT.to_string()))
                .collect(),
            hidden_columns: schema.flag_columns.iter().map(ToString::to_string).collect(),
            highlights: schema
                .value_columns
                .iter()
                .zip(schema.flag_columns.iter())
                .map(|(value, flag)| HighlightRule {
                    value_column: value.to_string(),
                    flag_column: flag.to_string(),
                })
                .collect(),
            highlight_color: ESTIMATE_FILL_COLOR.to_string(),
        }
    }
}

/// Read/upsert/write access to series persisted as workbook sheets.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    workbook: WorkbookFile,
}

impl SeriesStore {
    pub fn new(workbook: WorkbookFile) -> Self {
        Self { workbook }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(WorkbookFile::new(path))
    }

    pub fn workbook(&self) -> &WorkbookFile {
        &self.workbook
    }

    pub async fn check_unlocked(&self) -> Result<(), StoreError> {
        self.workbook.check_unlocked().await
    }

    /// Adds an empty sheet for every series the destination is missing.
    pub async fn ensure_sheets(&self, ids: &[SeriesId]) -> Result<Vec<&'static str>, StoreError> {
        let mut doc = self.workbook.load().await?;
        let mut created = Vec::new();
        for id in ids {
            let schema = id.schema();
            if !doc.sheets.contains_key(schema.sheet) {
                doc.sheets.insert(
                    schema.sheet.to_string(),
                    Sheet {
                        columns: schema.columns(),
                        rows: Vec::new(),
                        layout: SheetLayout::default(),
                    },
                );
                created.push(schema.sheet);
            }
        }
        if !created.is_empty() {
            self.workbook.save(&doc).await?;
            info!(sheets = ?created, "created missing sheets");
        }
        Ok(created)
    }

    /// Reads a series. An absent destination or sheet is an empty series;
    /// rows whose key cell does not parse are dropped.
    pub async fn read(&self, schema: &SeriesSchema) -> Result<Series, StoreError> {
        let doc = match self.workbook.load().await {
            Ok(doc) => doc,
            Err(StoreError::Missing(_)) => return Ok(schema.empty_series()),
            Err(err) => return Err(err),
        };
        Ok(sheet_to_series(schema, doc.sheets.get(schema.sheet)))
    }

    /// Existing records followed by `incoming`, keep-last on key collision,
    /// sorted ascending, then persisted with the schema's default style.
    pub async fn upsert(
        &self,
        schema: &SeriesSchema,
        incoming: Vec<SeriesRecord>,
    ) -> Result<Series, StoreError> {
        let existing = self.read(schema).await?;
        let merged = existing.merge(incoming);
        self.write_styled(schema, &merged, &SheetStyle::for_schema(schema))
            .await?;
        Ok(merged)
    }

    pub async fn write_styled(
        &self,
        schema: &SeriesSchema,
        series: &Series,
        style: &SheetStyle,
    ) -> Result<WriteOutcome, StoreError> {
        let mut doc = self.workbook.load().await?;
        doc.sheets
            .insert(schema.sheet.to_string(), series_to_sheet(schema, series, style));
        let outcome = self.workbook.save(&doc).await?;
        info!(sheet = schema.sheet, rows = series.len(), ?outcome, "sheet persisted");
        Ok(outcome)
    }
}

fn cell_as_text(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Text(s) => Some(s.clone()),
        CellValue::Number(v) => Some(v.to_string()),
        CellValue::Flag(_) | CellValue::Empty => None,
    }
}

fn sheet_to_series(schema: &SeriesSchema, sheet: Option<&Sheet>) -> Series {
    let Some(sheet) = sheet else {
        return schema.empty_series();
    };
    let Some(key_index) = sheet.columns.iter().position(|c| c == schema.key_column) else {
        warn!(sheet = schema.sheet, key = schema.key_column, "key column missing from sheet");
        return schema.empty_series();
    };

    let mut records = Vec::with_capacity(sheet.rows.len());
    let mut dropped = 0usize;
    for row in &sheet.rows {
        let key = row
            .get(key_index)
            .and_then(cell_as_text)
            .map(|raw| schema.parse_key(&raw));
        let Some(Ok(key)) = key else {
            dropped += 1;
            continue;
        };
        let mut record = SeriesRecord::new(key);
        for (index, column) in sheet.columns.iter().enumerate() {
            if index == key_index {
                continue;
            }
            let cell = row.get(index).cloned().unwrap_or_default();
            record.values.insert(column.clone(), cell);
        }
        records.push(record);
    }
    if dropped > 0 {
        warn!(sheet = schema.sheet, dropped, "dropped stored rows with unreadable keys");
    }
    Series::from_records(schema.sheet, schema.key_column, records)
}

fn series_to_sheet(schema: &SeriesSchema, series: &Series, style: &SheetStyle) -> Sheet {
    let mut columns = schema.columns();
    let known: BTreeSet<String> = columns.iter().cloned().collect();
    let extra: BTreeSet<String> = series
        .records
        .iter()
        .flat_map(|r| r.values.keys())
        .filter(|c| !known.contains(*c))
        .cloned()
        .collect();
    columns.extend(extra);

    let rows: Vec<Vec<CellValue>> = series
        .records
        .iter()
        .map(|record| {
            std::iter::once(CellValue::Text(record.key.to_string()))
                .chain(columns.iter().skip(1).map(|c| record.get(c).clone()))
                .collect()
        })
        .collect();

    let mut highlighted_cells = Vec::new();
    for (index, record) in series.records.iter().enumerate() {
        for rule in &style.highlights {
            if record.get(&rule.flag_column).as_flag() {
                highlighted_cells.push(CellRef {
                    row: index + 2,
                    column: rule.value_column.clone(),
                });
            }
        }
    }

    Sheet {
        columns,
        rows,
        layout: SheetLayout {
            frozen_rows: 1,
            column_width: style.column_width,
            number_formats: style.number_formats.clone(),
            hidden_columns: style.hidden_columns.clone(),
            highlight_color: (!style.highlights.is_empty()).then(|| style.highlight_color.clone()),
            highlighted_cells,
        },
    }
}

pub const KEY_DESTINATION: &str = "destination_path";
pub const KEY_LAST_UPDATE: &str = "last_update";

/// Flat key-value document persisted as a JSON object.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// A missing file is an empty configuration.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> anyhow::Result<()> {
        self.values.insert(key.to_string(), value.into());
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        if self.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.values).context("serializing config")?;
        let temp_path = self.path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        std::fs::write(&temp_path, bytes)
            .with_context(|| format!("writing {}", temp_path.display()))?;
        std::fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "renaming config {} -> {}",
                temp_path.display(),
                self.path.display()
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Certificate trust for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsTrust {
    Verified,
    /// Skips certificate verification. Only honoured for hosts listed in
    /// [`HttpClientConfig::relaxed_tls_hosts`].
    Relaxed,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub relaxed_tls_hosts: Vec<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            relaxed_tls_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("relaxed certificate trust is not allowed for host '{0}'")]
    RelaxedTlsNotAllowed(String),
    #[error("unexpected payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Decode { .. } => FailureKind::Parse,
            _ => FailureKind::Connectivity,
        }
    }
}

pub fn relaxed_trust_allowed(url: &str, allowed_hosts: &[String]) -> Result<(), FetchError> {
    let host = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_default();
    if allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
        Ok(())
    } else {
        Err(FetchError::RelaxedTlsNotAllowed(host))
    }
}

fn client_builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder
}

async fn send_with_retry<F, Fut>(
    backoff: &BackoffPolicy,
    url: &str,
    send: F,
) -> Result<String, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0usize;
    loop {
        match send().await {
            Ok(resp) => {
                let status = resp.status();
                let final_url = resp.url().to_string();

                if status.is_success() {
                    return Ok(resp.text().await?);
                }

                if classify_status(status) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    warn!(%status, attempt, "retryable status");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }

                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            Err(err) => {
                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    warn!(error = %err, attempt, url, "retryable request error");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Err(FetchError::Request(err));
            }
        }
    }
}

fn decode_json<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    relaxed_client: Option<reqwest::Client>,
    config: HttpClientConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = client_builder(&config)
            .build()
            .context("building reqwest client")?;
        let relaxed_client = if config.relaxed_tls_hosts.is_empty() {
            None
        } else {
            Some(
                client_builder(&config)
                    .danger_accept_invalid_certs(true)
                    .build()
                    .context("building relaxed-trust reqwest client")?,
            )
        };
        Ok(Self {
            client,
            relaxed_client,
            config,
        })
    }

    fn client_for(&self, url: &str, trust: TlsTrust) -> Result<&reqwest::Client, FetchError> {
        match trust {
            TlsTrust::Verified => Ok(&self.client),
            TlsTrust::Relaxed => {
                relaxed_trust_allowed(url, &self.config.relaxed_tls_hosts)?;
                self.relaxed_client
                    .as_ref()
                    .ok_or_else(|| FetchError::RelaxedTlsNotAllowed(url.to_string()))
            }
        }
    }

    pub async fn get_text(&self, url: &str, trust: TlsTrust) -> Result<String, FetchError> {
        let client = self.client_for(url, trust)?;
        send_with_retry(&self.config.backoff, url, || client.get(url).send())
            .instrument(info_span!("http_get", url, ?trust))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        trust: TlsTrust,
    ) -> Result<T, FetchError> {
        let body = self.get_text(url, trust).await?;
        decode_json(url, &body)
    }

    /// Fresh cookie jar for protocols that carry state between requests.
    /// Nothing from a session outlives it.
    pub fn begin_session(&self) -> Result<HttpSession, FetchError> {
        let client = client_builder(&self.config).cookie_store(true).build()?;
        Ok(HttpSession {
            client,
            backoff: self.config.backoff,
        })
    }
}

#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpSession {
    pub async fn get_text(&self, url: &str, headers: HeaderMap) -> Result<String, FetchError> {
        send_with_retry(&self.backoff, url, || {
            self.client.get(url).headers(headers.clone()).send()
        })
        .instrument(info_span!("session_get", url))
        .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        headers: HeaderMap,
        form: &[(String, String)],
    ) -> Result<String, FetchError> {
        send_with_retry(&self.backoff, url, || {
            self.client
                .post(url)
                .headers(headers.clone())
                .form(form)
                .send()
        })
        .instrument(info_span!("session_post", url, fields = form.len()))
        .await
    }
}
