//! Sync run orchestration: window resolution, per-series incremental sync,
//! calendar reconciliation and the last-run bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use cotizar_adapters::{adapter_for, SourceAdapter, BOARD_HOST, BROWSER_USER_AGENT};
use cotizar_core::{
    BoardQuote, BoardRecord, CellValue, Commodity, DateWindow, FailureKind, Series, SeriesId, SeriesKey,
    SeriesRecord,
};
use cotizar_storage::{
    ConfigStore, HttpClientConfig, HttpFetcher, SeriesStore, SheetStyle, StoreError, WriteOutcome,
    KEY_DESTINATION, KEY_LAST_UPDATE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cotizar-sync";

/// Minimum time between automatic runs.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn calendar_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

/// First date requested for an exchange-rate series with no stored history.
pub fn exchange_epoch() -> NaiveDate {
    calendar_date(2023, 1, 1)
}

/// The board is always rebuilt from this date.
pub fn board_anchor() -> NaiveDate {
    calendar_date(2024, 1, 1)
}

/// Nominal start of full-history fetches; those sources ignore the window.
pub fn full_history_start() -> NaiveDate {
    calendar_date(1900, 1, 1)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub destination_override: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub relaxed_tls_hosts: Vec<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("COTIZAR_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config.json")),
            destination_override: std::env::var("COTIZAR_DESTINATION").ok().map(PathBuf::from),
            user_agent: std::env::var("COTIZAR_USER_AGENT")
                .unwrap_or_else(|_| BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("COTIZAR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            relaxed_tls_hosts: vec![BOARD_HOST.to_string()],
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            relaxed_tls_hosts: self.relaxed_tls_hosts.clone(),
            ..Default::default()
        }
    }

    pub fn load_config_store(&self) -> Result<ConfigStore> {
        ConfigStore::load(&self.config_path)
    }

    /// Environment override first, then the persisted destination.
    pub fn destination(&self, store: &ConfigStore) -> Option<PathBuf> {
        self.destination_override
            .clone()
            .or_else(|| store.get(KEY_DESTINATION).map(PathBuf::from))
    }
}

/// Last successful run as persisted; unreadable values count as never run.
pub fn last_run(store: &ConfigStore) -> Option<DateTime<Utc>> {
    let raw = store.get(KEY_LAST_UPDATE)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            warn!(value = raw, error = %err, "ignoring unreadable last-run timestamp");
            None
        }
    }
}

pub fn update_due(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(last_run) = last_run else {
        return true;
    };
    now.signed_duration_since(last_run)
        .to_std()
        .is_ok_and(|elapsed| elapsed > UPDATE_INTERVAL)
}

/// Everything a run needs to know about "now", built once per invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
    pub last_run: Option<DateTime<Utc>>,
    pub destination: PathBuf,
}

impl RunContext {
    pub fn new(
        now: DateTime<Utc>,
        today: NaiveDate,
        last_run: Option<DateTime<Utc>>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            now,
            today,
            last_run,
            destination: destination.into(),
        }
    }

    pub fn yesterday(&self) -> NaiveDate {
        self.today.pred_opt().unwrap_or(self.today)
    }

    /// Dates that may not have a real observation yet and must never be
    /// fabricated by forward-fill.
    pub fn protected_dates(&self) -> BTreeSet<NaiveDate> {
        BTreeSet::from([self.today, self.yesterday()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowEnd {
    Yesterday,
    Today,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPolicy {
    /// `[cursor + 1, end]`, or `[epoch, end]` for an empty series.
    Incremental { epoch: NaiveDate, end: WindowEnd },
    /// The source always returns its full history.
    FullRefresh,
    /// `[anchor, end]` on every run regardless of stored data.
    Anchored { anchor: NaiveDate, end: WindowEnd },
}

impl WindowPolicy {
    pub fn for_series(series: SeriesId) -> Self {
        match series {
            SeriesId::DivisaBillete | SeriesId::Mep => WindowPolicy::Incremental {
                epoch: exchange_epoch(),
                end: WindowEnd::Yesterday,
            },
            SeriesId::Libre => WindowPolicy::Incremental {
                epoch: exchange_epoch(),
                end: WindowEnd::Today,
            },
            SeriesId::Uva | SeriesId::Ipc | SeriesId::Cac | SeriesId::Smvym => {
                WindowPolicy::FullRefresh
            }
            SeriesId::PizarraRosario => WindowPolicy::Anchored {
                anchor: board_anchor(),
                end: WindowEnd::Yesterday,
            },
        }
    }

    pub fn resolve(&self, cursor: Option<NaiveDate>, ctx: &RunContext) -> DateWindow {
        let end_date = |end: WindowEnd| match end {
            WindowEnd::Yesterday => ctx.yesterday(),
            WindowEnd::Today => ctx.today,
        };
        match *self {
            WindowPolicy::Incremental { epoch, end } => {
                let start = cursor
                    .map(|last| last.succ_opt().unwrap_or(last))
                    .unwrap_or(epoch);
                DateWindow::new(start, end_date(end))
            }
            WindowPolicy::FullRefresh => DateWindow::new(full_history_start(), ctx.today),
            WindowPolicy::Anchored { anchor, end } => DateWindow::new(anchor, end_date(end)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    UpToDate,
    NoNewRecords,
    Updated { fetched: usize, stored: usize },
    Reconciled { filled: usize, write: WriteOutcome },
    SourceFailed { kind: FailureKind, message: String },
    WriteFailed { kind: FailureKind, message: String },
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SyncOutcome::SourceFailed { .. } | SyncOutcome::WriteFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesReport {
    pub series: SeriesId,
    pub window: Option<DateWindow>,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub series: Vec<SeriesReport>,
    pub reconciled: Vec<SeriesReport>,
}

impl RunSummary {
    pub fn failures(&self) -> usize {
        self.series
            .iter()
            .chain(&self.reconciled)
            .filter(|r| r.outcome.is_failure())
            .count()
    }

    pub fn report_for(&self, series: SeriesId) -> Option<&SeriesReport> {
        self.series.iter().find(|r| r.series == series)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("destination {} is open in another program; close it and retry", .0.display())]
    ResourceLocked(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl RunError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            RunError::ResourceLocked(_) => Some(FailureKind::ResourceLocked),
            RunError::Store(err) => Some(err.kind()),
            RunError::Config(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub level: ProgressLevel,
    pub series: Option<SeriesId>,
    pub message: String,
}

/// Receives status events; never influences control flow.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        let series = event.series.map(|s| s.sheet_name()).unwrap_or("-");
        match event.level {
            ProgressLevel::Info | ProgressLevel::Success => {
                info!(series, level = ?event.level, "{}", event.message)
            }
            ProgressLevel::Warning => warn!(series, "{}", event.message),
            ProgressLevel::Error => error!(series, "{}", event.message),
        }
    }
}

fn emit(sink: &dyn ProgressSink, level: ProgressLevel, series: Option<SeriesId>, message: String) {
    sink.emit(ProgressEvent {
        level,
        series,
        message,
    });
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GapFillReconciler;

impl GapFillReconciler {
    /// Daily forward fill over `[min, max]` of the observed dates, column by
    /// column: an empty cell takes the last non-empty value of its column,
    /// on observed rows as well as on filled days. Protected dates that were
    /// not observed are left out. Period-keyed and empty
    /// series come back unchanged.
    pub fn fill(series: Series, protected: &BTreeSet<NaiveDate>) -> Series {
        let dates: Option<Vec<NaiveDate>> = series.records.iter().map(|r| r.key.as_date()).collect();
        let Some((first, last)) =
            dates.and_then(|d| Some((*d.iter().min()?, *d.iter().max()?)))
        else {
            return series;
        };
        let observed: BTreeMap<NaiveDate, &SeriesRecord> = series
            .records
            .iter()
            .filter_map(|r| r.key.as_date().map(|d| (d, r)))
            .collect();

        let mut records = Vec::with_capacity(observed.len());
        // last non-empty value per column
        let mut carry: BTreeMap<String, CellValue> = BTreeMap::new();
        for date in first.iter_days().take_while(|d| *d <= last) {
            if let Some(record) = observed.get(&date) {
                let mut record = (*record).clone();
                for (column, value) in record.values.iter_mut() {
                    if value.is_empty() {
                        if let Some(previous) = carry.get(column) {
                            *value = previous.clone();
                        }
                    } else {
                        carry.insert(column.clone(), value.clone());
                    }
                }
                for (column, previous) in &carry {
                    record
                        .values
                        .entry(column.clone())
                        .or_insert_with(|| previous.clone());
                }
                records.push(record);
            } else if !protected.contains(&date) {
                records.push(SeriesRecord {
                    key: SeriesKey::Date(date),
                    values: carry.clone(),
                });
            }
        }

        Series {
            name: series.name.clone(),
            key_column: series.key_column.clone(),
            records,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BoardReconciler;

impl BoardReconciler {
    /// One record per day in `[anchor, target]`. Observed days keep their
    /// quotes, missing days repeat the previous observed day (value and
    /// provenance together), days before the first observation are zero.
    pub fn fill(records: Vec<BoardRecord>, anchor: NaiveDate, target: NaiveDate) -> Vec<BoardRecord> {
        let observed: BTreeMap<NaiveDate, BTreeMap<Commodity, BoardQuote>> = records
            .into_iter()
            .filter(|r| r.date >= anchor && r.date <= target)
            .map(|r| (r.date, r.quotes))
            .collect();

        let mut carry: BTreeMap<Commodity, BoardQuote> = BTreeMap::new();
        anchor
            .iter_days()
            .take_while(|d| *d <= target)
            .map(|date| {
                if let Some(quotes) = observed.get(&date) {
                    carry = quotes.clone();
                }
                BoardRecord {
                    date,
                    quotes: carry.clone(),
                }
            })
            .collect()
    }
}

pub struct IncrementalSyncController<'a> {
    store: &'a SeriesStore,
    http: &'a HttpFetcher,
    progress: &'a dyn ProgressSink,
}

impl<'a> IncrementalSyncController<'a> {
    pub fn new(store: &'a SeriesStore, http: &'a HttpFetcher, progress: &'a dyn ProgressSink) -> Self {
        Self {
            store,
            http,
            progress,
        }
    }

    /// Fetches what the stored series is missing and upserts it. Source and
    /// store failures are reported in the outcome, never raised.
    pub async fn sync(
        &self,
        adapter: &dyn SourceAdapter,
        policy: WindowPolicy,
        ctx: &RunContext,
    ) -> SeriesReport {
        let series = adapter.series();
        if let WindowPolicy::Anchored { .. } = policy {
            return self.sync_board(adapter, policy, ctx).await;
        }
        let schema = series.schema();

        let existing = match self.store.read(schema).await {
            Ok(existing) => existing,
            Err(err) => return self.write_failed(series, None, &err),
        };
        let window = policy.resolve(existing.cursor(), ctx);
        if window.is_empty() {
            emit(
                self.progress,
                ProgressLevel::Info,
                Some(series),
                format!("already up to date (last stored {})", window.start.pred_opt().unwrap_or(window.start)),
            );
            return report(series, Some(window), SyncOutcome::UpToDate);
        }

        let records = match self.fetch(adapter, &window).await {
            Ok(records) => records,
            Err(outcome) => return report(series, Some(window), outcome),
        };
        if records.is_empty() {
            emit(
                self.progress,
                ProgressLevel::Info,
                Some(series),
                format!("no new records for {window}"),
            );
            return report(series, Some(window), SyncOutcome::NoNewRecords);
        }

        let fetched = records.len();
        match self.store.upsert(schema, records).await {
            Ok(stored) => {
                emit(
                    self.progress,
                    ProgressLevel::Success,
                    Some(series),
                    format!("{fetched} records fetched, {} stored", stored.len()),
                );
                report(
                    series,
                    Some(window),
                    SyncOutcome::Updated {
                        fetched,
                        stored: stored.len(),
                    },
                )
            }
            Err(err) => self.write_failed(series, Some(window), &err),
        }
    }

    /// Rebuilds the board from its anchor and upserts the whole sequence.
    pub async fn sync_board(
        &self,
        adapter: &dyn SourceAdapter,
        policy: WindowPolicy,
        ctx: &RunContext,
    ) -> SeriesReport {
        let series = adapter.series();
        let schema = series.schema();
        let window = policy.resolve(None, ctx);
        if window.is_empty() {
            return report(series, Some(window), SyncOutcome::UpToDate);
        }

        let records = match self.fetch(adapter, &window).await {
            Ok(records) => records,
            Err(outcome) => return report(series, Some(window), outcome),
        };
        if records.is_empty() {
            emit(
                self.progress,
                ProgressLevel::Warning,
                Some(series),
                "board returned no quotes".to_string(),
            );
            return report(series, Some(window), SyncOutcome::NoNewRecords);
        }

        let fetched = records.len();
        let board: Vec<BoardRecord> = records
            .iter()
            .filter_map(BoardRecord::from_series_record)
            .collect();
        let filled: Vec<SeriesRecord> = BoardReconciler::fill(board, window.start, window.end)
            .iter()
            .map(BoardRecord::to_series_record)
            .collect();
        match self.store.upsert(schema, filled).await {
            Ok(stored) => {
                let estimated = stored
                    .records
                    .iter()
                    .filter(|r| schema.flag_columns.iter().any(|f| r.get(f).as_flag()))
                    .count();
                emit(
                    self.progress,
                    ProgressLevel::Success,
                    Some(series),
                    format!("{} days stored, {estimated} with estimated quotes", stored.len()),
                );
                report(
                    series,
                    Some(window),
                    SyncOutcome::Updated {
                        fetched,
                        stored: stored.len(),
                    },
                )
            }
            Err(err) => self.write_failed(series, Some(window), &err),
        }
    }

    async fn fetch(
        &self,
        adapter: &dyn SourceAdapter,
        window: &DateWindow,
    ) -> Result<Vec<SeriesRecord>, SyncOutcome> {
        let series = adapter.series();
        adapter
            .fetch(self.http, window)
            .instrument(info_span!("fetch", source = adapter.source_id(), %window))
            .await
            .map_err(|err| {
                emit(
                    self.progress,
                    ProgressLevel::Error,
                    Some(series),
                    format!("{}: {err}", err.kind()),
                );
                SyncOutcome::SourceFailed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            })
    }

    fn write_failed(
        &self,
        series: SeriesId,
        window: Option<DateWindow>,
        err: &StoreError,
    ) -> SeriesReport {
        emit(
            self.progress,
            ProgressLevel::Error,
            Some(series),
            format!("{}: {err}", err.kind()),
        );
        report(
            series,
            window,
            SyncOutcome::WriteFailed {
                kind: err.kind(),
                message: err.to_string(),
            },
        )
    }
}

fn report(series: SeriesId, window: Option<DateWindow>, outcome: SyncOutcome) -> SeriesReport {
    SeriesReport {
        series,
        window,
        outcome,
    }
}

pub struct RunOrchestrator {
    store: SeriesStore,
    http: HttpFetcher,
    adapters: Vec<Box<dyn SourceAdapter>>,
    progress: Arc<dyn ProgressSink>,
}

impl RunOrchestrator {
    /// Production adapters in run order.
    pub fn new(store: SeriesStore, http: HttpFetcher) -> Self {
        Self {
            store,
            http,
            adapters: SeriesId::ALL.into_iter().map(adapter_for).collect(),
            progress: Arc::new(TracingProgress),
        }
    }

    pub fn with_adapters(mut self, adapters: Vec<Box<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Lock check, sheet existence, per-series sync in order, reconciliation
    /// of the daily rates, then the last-run timestamp. Only a locked
    /// destination aborts the run; everything else is reported per series.
    pub async fn run(
        &self,
        ctx: &RunContext,
        config: &mut ConfigStore,
    ) -> Result<RunSummary, RunError> {
        let span = info_span!("sync_run", run_id = %ctx.run_id, today = %ctx.today);
        async {
            let started_at = Utc::now();
            let progress = self.progress.as_ref();

            match self.store.check_unlocked().await {
                Ok(()) => {}
                Err(StoreError::Locked(path)) => {
                    emit(
                        progress,
                        ProgressLevel::Error,
                        None,
                        format!("{} is open elsewhere; nothing was updated", path.display()),
                    );
                    return Err(RunError::ResourceLocked(path));
                }
                Err(err) => return Err(RunError::Store(err)),
            }

            match self.store.ensure_sheets(&SeriesId::ALL).await {
                Ok(created) if !created.is_empty() => emit(
                    progress,
                    ProgressLevel::Info,
                    None,
                    format!("created sheets: {}", created.join(", ")),
                ),
                Ok(_) => {}
                Err(err) => emit(
                    progress,
                    ProgressLevel::Warning,
                    None,
                    format!("{}: {err}", err.kind()),
                ),
            }

            let controller = IncrementalSyncController::new(&self.store, &self.http, progress);
            let mut series = Vec::with_capacity(self.adapters.len());
            for adapter in &self.adapters {
                let policy = WindowPolicy::for_series(adapter.series());
                series.push(controller.sync(adapter.as_ref(), policy, ctx).await);
            }

            let mut reconciled = Vec::with_capacity(SeriesId::DAILY_RATES.len());
            for id in SeriesId::DAILY_RATES {
                reconciled.push(self.reconcile_daily(id, ctx).await);
            }

            config
                .set(KEY_LAST_UPDATE, ctx.now.to_rfc3339())
                .context("recording last successful run")?;

            let summary = RunSummary {
                run_id: ctx.run_id,
                started_at,
                finished_at: Utc::now(),
                series,
                reconciled,
            };
            info!(failures = summary.failures(), "sync run finished");
            Ok::<_, RunError>(summary)
        }
        .instrument(span)
        .await
    }

    async fn reconcile_daily(&self, id: SeriesId, ctx: &RunContext) -> SeriesReport {
        let schema = id.schema();
        let progress = self.progress.as_ref();
        let failed = |err: StoreError| {
            emit(progress, ProgressLevel::Error, Some(id), format!("{}: {err}", err.kind()));
            report(
                id,
                None,
                SyncOutcome::WriteFailed {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            )
        };

        let stored = match self.store.read(schema).await {
            Ok(stored) => stored,
            Err(err) => return failed(err),
        };
        if stored.is_empty() {
            return report(id, None, SyncOutcome::UpToDate);
        }
        let before = stored.len();
        let filled = GapFillReconciler::fill(stored, &ctx.protected_dates());
        let added = filled.len().saturating_sub(before);
        match self
            .store
            .write_styled(schema, &filled, &SheetStyle::for_schema(schema))
            .await
        {
            Ok(write) => {
                if added > 0 {
                    emit(
                        progress,
                        ProgressLevel::Info,
                        Some(id),
                        format!("filled {added} calendar gaps"),
                    );
                }
                report(
                    id,
                    None,
                    SyncOutcome::Reconciled {
                        filled: added,
                        write,
                    },
                )
            }
            Err(err) => failed(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub config_path: PathBuf,
    pub destination: Option<PathBuf>,
    pub last_run: Option<DateTime<Utc>>,
    pub due: bool,
}

pub fn run_status(config: &SyncConfig, now: DateTime<Utc>) -> Result<RunStatus> {
    let store = config.load_config_store()?;
    let last_run = last_run(&store);
    Ok(RunStatus {
        config_path: config.config_path.clone(),
        destination: config.destination(&store),
        last_run,
        due: update_due(last_run, now),
    })
}

/// Creates the destination workbook with every sheet and remembers it.
pub async fn init_destination(
    config: &SyncConfig,
    destination: impl Into<PathBuf>,
) -> Result<Vec<&'static str>> {
    let destination = destination.into();
    let store = SeriesStore::open(&destination);
    store
        .workbook()
        .create_if_missing()
        .await
        .with_context(|| format!("creating {}", destination.display()))?;
    let created = store
        .ensure_sheets(&SeriesId::ALL)
        .await
        .with_context(|| format!("preparing sheets in {}", destination.display()))?;
    let mut settings = config.load_config_store()?;
    settings.set(KEY_DESTINATION, destination.display().to_string())?;
    info!(destination = %destination.display(), sheets = created.len(), "destination initialised");
    Ok(created)
}

/// Forgets the remembered destination so the next `init` can pick a new
/// one. Returns the path that was configured, if any.
pub fn clear_destination(config: &SyncConfig) -> Result<Option<PathBuf>> {
    let mut settings = config.load_config_store()?;
    let previous = settings.get(KEY_DESTINATION).map(PathBuf::from);
    settings.remove(KEY_DESTINATION)?;
    info!(previous = ?previous, "destination cleared");
    Ok(previous)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncAttempt {
    /// The last run is less than [`UPDATE_INTERVAL`] old.
    NotDue { last_run: DateTime<Utc> },
    Completed(RunSummary),
}

fn skip_if_recent(
    force: bool,
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<SyncAttempt> {
    match previous {
        Some(last_run) if !force && !update_due(previous, now) => {
            Some(SyncAttempt::NotDue { last_run })
        }
        _ => None,
    }
}

/// One full run against the configured destination. `force` skips the
/// 24 hour check.
pub async fn run_sync_once_from_env(force: bool) -> Result<SyncAttempt> {
    let config = SyncConfig::from_env();
    let mut settings = config.load_config_store()?;
    let now = Utc::now();
    let previous = last_run(&settings);
    if let Some(skipped) = skip_if_recent(force, previous, now) {
        info!(last_run = ?previous, "last run is recent; skipping");
        return Ok(skipped);
    }
    let destination = config.destination(&settings).with_context(|| {
        format!(
            "no destination configured in {}; run `cotizar init <path>` first",
            config.config_path.display()
        )
    })?;

    let ctx = RunContext::new(now, Local::now().date_naive(), previous, destination);
    let http = HttpFetcher::new(config.http_client_config())?;
    let orchestrator = RunOrchestrator::new(SeriesStore::open(&ctx.destination), http);
    let summary = orchestrator.run(&ctx, &mut settings).await?;
    Ok(SyncAttempt::Completed(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use cotizar_adapters::{
        extract_update_panel, load_fixture_text, parse_exchange_table, AdapterError, SourceKind,
    };
    use tempfile::{tempdir, TempDir};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ctx_for(today: NaiveDate, destination: &Path) -> RunContext {
        let now = Utc.from_utc_datetime(&today.and_hms_opt(12, 0, 0).unwrap());
        RunContext::new(now, today, None, destination)
    }

    fn mep(date: NaiveDate, value: f64) -> SeriesRecord {
        SeriesRecord::dated(date).with("DOLAR MEP", CellValue::Number(value))
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).unwrap()
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingProgress {
        fn emit(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RecordingProgress {
        fn errors(&self) -> Vec<ProgressEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.level == ProgressLevel::Error)
                .cloned()
                .collect()
        }
    }

    enum Reply {
        Records(Vec<SeriesRecord>),
        Fail(&'static str),
    }

    struct StubAdapter {
        series: SeriesId,
        reply: Reply,
        windows: Arc<Mutex<Vec<DateWindow>>>,
    }

    impl StubAdapter {
        fn new(series: SeriesId, reply: Reply) -> Self {
            Self {
                series,
                reply,
                windows: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn series(&self) -> SeriesId {
            self.series
        }

        fn source_id(&self) -> &'static str {
            "stub"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::RestArray
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            window: &DateWindow,
        ) -> Result<Vec<SeriesRecord>, AdapterError> {
            self.windows.lock().unwrap().push(*window);
            match &self.reply {
                Reply::Records(records) => Ok(records.clone()),
                Reply::Fail(message) => Err(AdapterError::Parse(message.to_string())),
            }
        }
    }

    async fn workbook(dir: &TempDir) -> (PathBuf, SeriesStore) {
        let path = dir.path().join("cotizaciones.json");
        let store = SeriesStore::open(&path);
        store.workbook().create_if_missing().await.unwrap();
        (path, store)
    }

    fn config_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::load(dir.path().join("config.json")).unwrap()
    }

    #[test]
    fn windows_follow_cursor_and_series_policy() {
        let ctx = ctx_for(ymd(2024, 3, 6), Path::new("unused.json"));
        let mep = WindowPolicy::for_series(SeriesId::Mep);
        assert_eq!(
            mep.resolve(None, &ctx),
            DateWindow::new(ymd(2023, 1, 1), ymd(2024, 3, 5))
        );
        assert_eq!(
            mep.resolve(Some(ymd(2024, 3, 1)), &ctx),
            DateWindow::new(ymd(2024, 3, 2), ymd(2024, 3, 5))
        );
        assert!(mep.resolve(Some(ymd(2024, 3, 5)), &ctx).is_empty());

        let libre = WindowPolicy::for_series(SeriesId::Libre);
        assert!(!libre.resolve(Some(ymd(2024, 3, 5)), &ctx).is_empty());
        assert!(libre.resolve(Some(ymd(2024, 3, 6)), &ctx).is_empty());

        let board = WindowPolicy::for_series(SeriesId::PizarraRosario);
        assert_eq!(
            board.resolve(Some(ymd(2024, 3, 1)), &ctx),
            DateWindow::new(ymd(2024, 1, 1), ymd(2024, 3, 5))
        );
        assert_eq!(WindowPolicy::for_series(SeriesId::Cac), WindowPolicy::FullRefresh);
    }

    #[test]
    fn update_is_due_after_a_full_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).single().unwrap();
        assert!(update_due(None, now));
        assert!(!update_due(Some(now - chrono::Duration::hours(23)), now));
        assert!(update_due(Some(now - chrono::Duration::hours(25)), now));
        assert!(!update_due(Some(now + chrono::Duration::hours(1)), now));
    }

    #[test]
    fn gap_fill_carries_values_forward() {
        let series = Series::from_records(
            "MEP",
            "fecha",
            vec![mep(ymd(2024, 3, 1), 10.0), mep(ymd(2024, 3, 3), 12.0)],
        );
        let filled = GapFillReconciler::fill(series, &BTreeSet::new());
        let values: Vec<_> = filled
            .records
            .iter()
            .map(|r| (r.key.as_date().unwrap(), r.number("DOLAR MEP").unwrap()))
            .collect();
        assert_eq!(
            values,
            vec![
                (ymd(2024, 3, 1), 10.0),
                (ymd(2024, 3, 2), 10.0),
                (ymd(2024, 3, 3), 12.0)
            ]
        );
    }

    #[test]
    fn gap_fill_carries_each_column_separately() {
        let libre = |date, compra: CellValue, venta: CellValue| {
            SeriesRecord::dated(date).with("Compra", compra).with("Venta", venta)
        };
        let series = Series::from_records(
            "Libre",
            "fecha",
            vec![
                libre(ymd(2024, 3, 1), CellValue::Empty, CellValue::Number(1020.0)),
                libre(ymd(2024, 3, 2), CellValue::Number(1000.0), CellValue::Number(1040.0)),
                libre(ymd(2024, 3, 3), CellValue::Empty, CellValue::Number(1045.0)),
                libre(ymd(2024, 3, 5), CellValue::Number(1010.0), CellValue::Empty),
            ],
        );
        let filled = GapFillReconciler::fill(series, &BTreeSet::new());
        let rows: Vec<_> = filled
            .records
            .iter()
            .map(|r| (r.key.as_date().unwrap(), r.number("Compra"), r.number("Venta")))
            .collect();
        assert_eq!(
            rows,
            vec![
                // nothing earlier to carry
                (ymd(2024, 3, 1), None, Some(1020.0)),
                (ymd(2024, 3, 2), Some(1000.0), Some(1040.0)),
                (ymd(2024, 3, 3), Some(1000.0), Some(1045.0)),
                (ymd(2024, 3, 4), Some(1000.0), Some(1045.0)),
                (ymd(2024, 3, 5), Some(1010.0), Some(1045.0)),
            ]
        );
    }

    #[test]
    fn protected_dates_are_never_fabricated() {
        let series = Series::from_records(
            "MEP",
            "fecha",
            vec![mep(ymd(2024, 3, 1), 10.0), mep(ymd(2024, 3, 4), 13.0)],
        );
        let protected = BTreeSet::from([ymd(2024, 3, 3), ymd(2024, 3, 4)]);
        let filled = GapFillReconciler::fill(series, &protected);
        let dates: Vec<_> = filled.records.iter().filter_map(|r| r.key.as_date()).collect();
        assert_eq!(dates, vec![ymd(2024, 3, 1), ymd(2024, 3, 2), ymd(2024, 3, 4)]);
    }

    #[test]
    fn period_keyed_series_are_not_filled() {
        let series = Series::from_records(
            "CAC",
            "Periodo",
            vec![
                SeriesRecord::new(SeriesKey::Period("2024-01-01".into())),
                SeriesRecord::new(SeriesKey::Period("2024-03-01".into())),
            ],
        );
        let filled = GapFillReconciler::fill(series.clone(), &BTreeSet::new());
        assert_eq!(filled, series);
    }

    #[test]
    fn board_fill_copies_value_and_provenance_together() {
        let mut jan2 = BoardRecord::new(ymd(2024, 1, 2));
        jan2.quotes.insert(Commodity::Trigo, BoardQuote::resolve(Some(0.0), Some(7.5)));
        jan2.quotes.insert(Commodity::Soja, BoardQuote::resolve(Some(10.0), Some(7.5)));
        let mut jan4 = BoardRecord::new(ymd(2024, 1, 4));
        jan4.quotes.insert(Commodity::Trigo, BoardQuote::resolve(Some(0.0), Some(0.0)));
        let outside = BoardRecord::new(ymd(2023, 12, 30));

        let filled = BoardReconciler::fill(vec![jan4, jan2, outside], ymd(2024, 1, 1), ymd(2024, 1, 5));
        let dates: Vec<_> = filled.iter().map(|r| r.date).collect();
        assert_eq!(dates, (1..=5).map(|d| ymd(2024, 1, d)).collect::<Vec<_>>());

        assert_eq!(filled[0].quote(Commodity::Trigo), BoardQuote::default());
        assert_eq!(
            filled[2].quote(Commodity::Trigo),
            BoardQuote {
                value: 7.5,
                estimated: true
            }
        );
        assert_eq!(filled[2].quote(Commodity::Soja).value, 10.0);
        // an observed zero is kept, not replaced by the previous day
        assert_eq!(filled[3].quote(Commodity::Trigo), BoardQuote::default());
        assert_eq!(filled[4].quote(Commodity::Soja), BoardQuote::default());
    }

    #[tokio::test]
    async fn repeated_sync_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        let http = http();
        let progress = RecordingProgress::default();
        let controller = IncrementalSyncController::new(&store, &http, &progress);
        let ctx = ctx_for(ymd(2024, 3, 6), &path);
        let adapter = StubAdapter::new(
            SeriesId::Mep,
            Reply::Records(vec![mep(ymd(2024, 3, 4), 1.0), mep(ymd(2024, 3, 5), 2.0)]),
        );
        let policy = WindowPolicy::Incremental {
            epoch: ymd(2024, 3, 4),
            end: WindowEnd::Yesterday,
        };

        let first = controller.sync(&adapter, policy, &ctx).await;
        assert_eq!(first.outcome, SyncOutcome::Updated { fetched: 2, stored: 2 });
        let bytes = std::fs::read(&path).unwrap();

        let second = controller.sync(&adapter, policy, &ctx).await;
        assert_eq!(second.outcome, SyncOutcome::UpToDate);
        assert_eq!(adapter.windows.lock().unwrap().len(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[tokio::test]
    async fn full_refresh_upsert_keeps_the_later_record() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        let http = http();
        let progress = RecordingProgress::default();
        let controller = IncrementalSyncController::new(&store, &http, &progress);
        let ctx = ctx_for(ymd(2024, 3, 6), &path);
        let value = |v: f64| {
            SeriesRecord::dated(ymd(2024, 1, 1)).with("Valor", CellValue::Number(v))
        };
        let adapter = StubAdapter::new(SeriesId::Ipc, Reply::Records(vec![value(20.6), value(20.7)]));

        let outcome = controller.sync(&adapter, WindowPolicy::FullRefresh, &ctx).await;
        assert_eq!(outcome.outcome, SyncOutcome::Updated { fetched: 2, stored: 1 });
        let stored = store.read(SeriesId::Ipc.schema()).await.unwrap();
        assert_eq!(stored.records[0].number("Valor"), Some(20.7));

        let again = controller.sync(&adapter, WindowPolicy::FullRefresh, &ctx).await;
        assert_eq!(again.outcome, SyncOutcome::Updated { fetched: 2, stored: 1 });
    }

    #[tokio::test]
    async fn source_failure_leaves_store_untouched_and_run_continues() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        let progress = Arc::new(RecordingProgress::default());
        let orchestrator = RunOrchestrator::new(store.clone(), http())
            .with_adapters(vec![
                Box::new(StubAdapter::new(SeriesId::DivisaBillete, Reply::Fail("no anchor tokens"))),
                Box::new(StubAdapter::new(
                    SeriesId::Mep,
                    Reply::Records(vec![mep(ymd(2024, 3, 4), 1.0)]),
                )),
            ])
            .with_progress(progress.clone());
        let mut config = config_in(&dir);

        let summary = orchestrator
            .run(&ctx_for(ymd(2024, 3, 6), &path), &mut config)
            .await
            .unwrap();
        assert!(matches!(
            summary.series[0].outcome,
            SyncOutcome::SourceFailed {
                kind: FailureKind::Parse,
                ..
            }
        ));
        assert!(matches!(summary.series[1].outcome, SyncOutcome::Updated { .. }));
        assert!(store.read(SeriesId::DivisaBillete.schema()).await.unwrap().is_empty());
        assert_eq!(progress.errors().len(), 1);
        assert_eq!(progress.errors()[0].series, Some(SeriesId::DivisaBillete));
        assert!(config.get(KEY_LAST_UPDATE).is_some());
    }

    #[tokio::test]
    async fn end_to_end_window_then_gap_fill() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        store
            .upsert(
                SeriesId::Mep.schema(),
                vec![mep(ymd(2024, 2, 29), 1085.0), mep(ymd(2024, 3, 1), 1087.0)],
            )
            .await
            .unwrap();

        let adapter = StubAdapter::new(
            SeriesId::Mep,
            Reply::Records(vec![
                mep(ymd(2024, 3, 2), 1090.0),
                mep(ymd(2024, 3, 3), 1091.0),
                mep(ymd(2024, 3, 5), 1095.0),
            ]),
        );
        let windows = adapter.windows.clone();
        let orchestrator =
            RunOrchestrator::new(store.clone(), http()).with_adapters(vec![Box::new(adapter)]);
        let mut config = config_in(&dir);
        let summary = orchestrator
            .run(&ctx_for(ymd(2024, 3, 6), &path), &mut config)
            .await
            .unwrap();

        assert_eq!(
            windows.lock().unwrap().as_slice(),
            &[DateWindow::new(ymd(2024, 3, 2), ymd(2024, 3, 5))]
        );
        let mep_reconcile = summary
            .reconciled
            .iter()
            .find(|r| r.series == SeriesId::Mep)
            .unwrap();
        assert!(matches!(
            mep_reconcile.outcome,
            SyncOutcome::Reconciled { filled: 1, .. }
        ));

        let stored = store.read(SeriesId::Mep.schema()).await.unwrap();
        let dates: Vec<_> = stored.records.iter().filter_map(|r| r.key.as_date()).collect();
        assert_eq!(dates, (0..6).map(|i| ymd(2024, 2, 29) + chrono::Days::new(i)).collect::<Vec<_>>());
        let mar4 = stored
            .records
            .iter()
            .find(|r| r.key == SeriesKey::Date(ymd(2024, 3, 4)))
            .unwrap();
        assert_eq!(mar4.number("DOLAR MEP"), Some(1091.0));
    }

    #[tokio::test]
    async fn malformed_scraped_row_is_dropped() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/errepar/postback.txt");
        let body = load_fixture_text(fixture).unwrap();
        let records = parse_exchange_table(extract_update_panel(&body).unwrap()).unwrap();

        let http = http();
        let progress = RecordingProgress::default();
        let controller = IncrementalSyncController::new(&store, &http, &progress);
        let adapter = StubAdapter::new(SeriesId::DivisaBillete, Reply::Records(records));
        let report = controller
            .sync(
                &adapter,
                WindowPolicy::for_series(SeriesId::DivisaBillete),
                &ctx_for(ymd(2024, 3, 2), &path),
            )
            .await;
        assert_eq!(report.outcome, SyncOutcome::Updated { fetched: 9, stored: 9 });
        assert_eq!(store.read(SeriesId::DivisaBillete.schema()).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn locked_destination_aborts_before_any_fetch() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        store
            .upsert(SeriesId::Mep.schema(), vec![mep(ymd(2024, 3, 1), 1.0)])
            .await
            .unwrap();
        let before = std::fs::read(&path).unwrap();
        std::fs::write(dir.path().join("~$cotizaciones.json"), b"owner").unwrap();

        let adapter = StubAdapter::new(SeriesId::Mep, Reply::Records(vec![mep(ymd(2024, 3, 2), 2.0)]));
        let windows = adapter.windows.clone();
        let progress = Arc::new(RecordingProgress::default());
        let orchestrator = RunOrchestrator::new(store, http())
            .with_adapters(vec![Box::new(adapter)])
            .with_progress(progress.clone());
        let mut config = config_in(&dir);

        let err = orchestrator
            .run(&ctx_for(ymd(2024, 3, 6), &path), &mut config)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ResourceLocked(_)));
        assert_eq!(err.kind(), Some(FailureKind::ResourceLocked));
        assert!(windows.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(config.get(KEY_LAST_UPDATE).is_none());
        assert_eq!(progress.errors().len(), 1);
    }

    #[tokio::test]
    async fn missing_destination_fails_writes_but_not_the_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let orchestrator = RunOrchestrator::new(SeriesStore::open(&path), http()).with_adapters(vec![
            Box::new(StubAdapter::new(SeriesId::Mep, Reply::Records(vec![mep(ymd(2024, 3, 4), 1.0)]))),
            Box::new(StubAdapter::new(SeriesId::Uva, Reply::Records(Vec::new()))),
        ]);
        let mut config = config_in(&dir);

        let summary = orchestrator
            .run(&ctx_for(ymd(2024, 3, 6), &path), &mut config)
            .await
            .unwrap();
        assert!(matches!(
            summary.series[0].outcome,
            SyncOutcome::WriteFailed {
                kind: FailureKind::ResourceMissing,
                ..
            }
        ));
        assert_eq!(summary.series[1].outcome, SyncOutcome::NoNewRecords);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn board_is_rebuilt_from_anchor_with_highlighted_estimates() {
        let dir = tempdir().unwrap();
        let (path, store) = workbook(&dir).await;
        let mut jan2 = BoardRecord::new(ymd(2024, 1, 2));
        jan2.quotes.insert(Commodity::Maiz, BoardQuote::resolve(Some(0.0), Some(140000.0)));
        jan2.quotes.insert(Commodity::Soja, BoardQuote::resolve(Some(305000.0), None));
        let adapter = StubAdapter::new(
            SeriesId::PizarraRosario,
            Reply::Records(vec![jan2.to_series_record()]),
        );
        let windows = adapter.windows.clone();
        let orchestrator =
            RunOrchestrator::new(store.clone(), http()).with_adapters(vec![Box::new(adapter)]);
        let mut config = config_in(&dir);

        let summary = orchestrator
            .run(&ctx_for(ymd(2024, 1, 5), &path), &mut config)
            .await
            .unwrap();
        assert_eq!(
            windows.lock().unwrap().as_slice(),
            &[DateWindow::new(ymd(2024, 1, 1), ymd(2024, 1, 4))]
        );
        assert_eq!(
            summary.report_for(SeriesId::PizarraRosario).unwrap().outcome,
            SyncOutcome::Updated { fetched: 1, stored: 4 }
        );

        let stored = store.read(SeriesId::PizarraRosario.schema()).await.unwrap();
        let board: Vec<_> = stored
            .records
            .iter()
            .filter_map(BoardRecord::from_series_record)
            .collect();
        assert_eq!(board[0].quote(Commodity::Maiz), BoardQuote::default());
        assert_eq!(board[3].quote(Commodity::Maiz), board[1].quote(Commodity::Maiz));
        assert!(board[3].quote(Commodity::Maiz).estimated);
        assert!(!board[3].quote(Commodity::Soja).estimated);

        let doc = store.workbook().load().await.unwrap();
        let layout = &doc.sheets["Pizarra Rosario"].layout;
        assert_eq!(layout.highlighted_cells.len(), 3);
        assert!(layout.hidden_columns.contains(&"Maíz_is_est".to_string()));
    }

    #[test]
    fn recent_run_is_skipped_with_its_timestamp() {
        let last = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let soon = last + chrono::Duration::hours(3);
        match skip_if_recent(false, Some(last), soon) {
            Some(SyncAttempt::NotDue { last_run }) => assert_eq!(last_run, last),
            other => panic!("expected NotDue, got {other:?}"),
        }
        assert!(skip_if_recent(true, Some(last), soon).is_none());
        assert!(skip_if_recent(false, None, soon).is_none());
        assert!(skip_if_recent(false, Some(last), last + chrono::Duration::hours(25)).is_none());

        let json = serde_json::to_value(SyncAttempt::NotDue { last_run: last }).unwrap();
        assert_eq!(json["status"], "not_due");
        assert_eq!(json["last_run"], "2024-03-05T10:00:00Z");
    }

    #[tokio::test]
    async fn init_creates_every_sheet_and_records_destination() {
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            config_path: dir.path().join("config.json"),
            destination_override: None,
            user_agent: "test".into(),
            http_timeout_secs: 5,
            relaxed_tls_hosts: Vec::new(),
        };
        let destination = dir.path().join("cotizaciones.json");
        let created = init_destination(&config, &destination).await.unwrap();
        assert_eq!(created.len(), SeriesId::ALL.len());
        assert!(init_destination(&config, &destination).await.unwrap().is_empty());

        let status = run_status(&config, Utc::now()).unwrap();
        assert_eq!(status.destination, Some(destination.clone()));
        assert!(status.due);

        assert_eq!(clear_destination(&config).unwrap(), Some(destination));
        assert_eq!(run_status(&config, Utc::now()).unwrap().destination, None);
        assert_eq!(clear_destination(&config).unwrap(), None);
    }
}
