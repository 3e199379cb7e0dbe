use crate::config::MilkteaConfig;
use crate::index::builder::{build_index, BuildError, ParseProgress};
use crate::index::{cache, IndexError, IndexSummary};
use crate::query::executor::{LogcatStats, QueryExecutor, QueryResponse};
use crate::query::{Direction, LogFilters, QueryCursor, QueryError};
use crate::report::identity::ReportId;
use crate::report::{DeviceInfo, ReaderError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Typed errors crossing the host boundary. The host renders these; the
/// core never formats UI text.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("bugreport not found: {0}")]
    BugreportNotFound(String),

    #[error("unsupported bugreport format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("parse cancelled")]
    Cancelled,

    #[error("cache is stale, re-parse the bugreport: {0}")]
    CacheStale(String),

    #[error("invalid cursor: {0}")]
    CursorInvalid(String),

    #[error("invalid filter: {0}")]
    FilterInvalid(String),

    #[error("no bugreport loaded")]
    NoReportLoaded,
}

impl From<ReaderError> for CommandError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::NotFound(path) => Self::BugreportNotFound(path.display().to_string()),
            ReaderError::UnsupportedArchive(path) => {
                Self::UnsupportedFormat(path.display().to_string())
            }
            ReaderError::Archive(err) => Self::CorruptArchive(err.to_string()),
            ReaderError::Io(err) => Self::IoError(err.to_string()),
        }
    }
}

impl From<IndexError> for CommandError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Stale(reason) | IndexError::Corrupt(reason) => Self::CacheStale(reason),
            IndexError::Io(err) => Self::IoError(err.to_string()),
            IndexError::Json(err) => Self::IoError(err.to_string()),
        }
    }
}

impl From<BuildError> for CommandError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Reader(err) => err.into(),
            BuildError::Index(err) => err.into(),
            BuildError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<QueryError> for CommandError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::CursorInvalid(reason) => Self::CursorInvalid(reason),
            QueryError::FilterInvalid(reason) => Self::FilterInvalid(reason),
            QueryError::Index(err) => err.into(),
        }
    }
}

/// Result of the parse command: device identity plus the headline
/// counts the dashboard renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSummary {
    pub report_id: String,
    pub device: DeviceInfo,
    pub events: u64,
    pub anrs: u64,
    pub crashes: u64,
    pub ef_total: u64,
    pub ef_recent: u64,
    pub min_ts: Option<String>,
    pub max_ts: Option<String>,
}

impl ParseSummary {
    fn from_summary(summary: &IndexSummary) -> Self {
        Self {
            report_id: summary.report_id.clone(),
            device: summary.device.clone(),
            events: summary.counts.events,
            anrs: summary.counts.anrs,
            crashes: summary.counts.crashes,
            ef_total: summary.counts.ef_total,
            ef_recent: summary.counts.ef_recent,
            min_ts: summary.min_ts_display.clone(),
            max_ts: summary.max_ts_display.clone(),
        }
    }
}

struct LoadedReport {
    dir: PathBuf,
    executor: QueryExecutor,
}

/// In-flight parse. Dropping the handle abandons the parse; the ingest
/// pass observes the cancellation between line batches and unwinds,
/// deleting its partial cache.
pub struct ParseHandle {
    progress: watch::Receiver<ParseProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<ParseSummary, CommandError>>,
}

impl ParseHandle {
    /// Latest-value progress channel; progress events strictly precede
    /// the completion result.
    pub fn progress(&self) -> watch::Receiver<ParseProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(mut self) -> Result<ParseSummary, CommandError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(err) => Err(CommandError::IoError(format!("parse task failed: {err}"))),
        }
    }
}

impl Drop for ParseHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The state a desktop host holds: configuration plus the currently
/// loaded report. Queries only ever touch the committed cache.
pub struct BugreportService {
    config: MilkteaConfig,
    current: Arc<Mutex<Option<LoadedReport>>>,
}

impl BugreportService {
    pub fn new(config: MilkteaConfig) -> Self {
        Self {
            config,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &MilkteaConfig {
        &self.config
    }

    /// Parses (or reuses the cache of) a bugreport on a blocking worker
    /// and makes it the current report on success.
    pub fn parse_bugreport_streaming(&self, path: impl Into<PathBuf>) -> ParseHandle {
        let path = path.into();
        let config = self.config.clone();
        let current = self.current.clone();
        let (progress_tx, progress_rx) = watch::channel(ParseProgress::starting());
        let cancel = CancellationToken::new();
        let cancel_worker = cancel.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<ParseSummary, CommandError> {
            let summary = build_index(&path, &config, &progress_tx, &cancel_worker)?;
            let id = ReportId::from_string(summary.report_id.clone());
            let dir = cache::report_dir(&cache::cache_root(&config), &id);
            let executor = QueryExecutor::open(&dir, &id)?;

            let mut guard = current.lock().expect("service state lock");
            *guard = Some(LoadedReport { dir, executor });
            Ok(ParseSummary::from_summary(&summary))
        });

        ParseHandle {
            progress: progress_rx,
            cancel,
            task,
        }
    }

    pub async fn get_logcat_stats(&self, filters: LogFilters) -> Result<LogcatStats, CommandError> {
        self.with_executor(move |executor| executor.stats(&filters))
            .await
    }

    pub async fn query_logcat_v2(
        &self,
        filters: LogFilters,
        cursor: Option<QueryCursor>,
        limit: u32,
        direction: Direction,
    ) -> Result<QueryResponse, CommandError> {
        self.with_executor(move |executor| executor.query(&filters, cursor, limit, direction))
            .await
    }

    pub async fn jump_to_time(
        &self,
        filters: LogFilters,
        target_time: String,
        limit: u32,
    ) -> Result<QueryResponse, CommandError> {
        self.with_executor(move |executor| executor.jump_to_time(&filters, &target_time, limit))
            .await
    }

    /// Runs a query op on the blocking pool. Read-corruption drops the
    /// cache directory and the loaded report so the host can re-parse.
    async fn with_executor<T, F>(&self, op: F) -> Result<T, CommandError>
    where
        T: Send + 'static,
        F: FnOnce(&mut QueryExecutor) -> Result<T, QueryError> + Send + 'static,
    {
        let current = self.current.clone();
        let joined = tokio::task::spawn_blocking(move || -> Result<T, CommandError> {
            let mut guard = current.lock().expect("service state lock");
            let loaded = guard.as_mut().ok_or(CommandError::NoReportLoaded)?;

            match op(&mut loaded.executor) {
                Ok(value) => Ok(value),
                Err(QueryError::Index(IndexError::Corrupt(reason))) => {
                    let dir = loaded.dir.clone();
                    *guard = None;
                    tracing::warn!(
                        dir = %dir.display(),
                        reason = %reason,
                        "query hit corrupt cache, deleting"
                    );
                    if let Err(err) = std::fs::remove_dir_all(&dir) {
                        tracing::warn!(error = %err, "failed to delete corrupt cache");
                    }
                    Err(CommandError::CacheStale(reason))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(CommandError::IoError(format!("query task failed: {err}"))),
        }
    }
}
