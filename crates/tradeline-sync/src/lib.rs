//! Batch orchestration: record selection, bounded concurrent fetch+normalize,
//! aggregation and export.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use tradeline_core::{
    Clock, OutputTable, ProgressEvent, ProgressSink, SourceRecord, SystemClock, Task, TradelineRow,
};
use tradeline_export::{ExportManifest, ExportSet};
use tradeline_normalize::try_normalize;
use tradeline_storage::{
    HttpClientConfig, HttpReportFetcher, MySqlRecordSource, RecordSource, ReportFetcher,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tradeline-sync";

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 50;
pub const DEFAULT_CONCURRENCY: usize = 20;

pub const NULL_REFERENCE: &str = "null";

const PROGRESS_LOG_EVERY: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("concurrency must be within 1..=50, got {0}")]
    ConcurrencyOutOfRange(usize),
    #[error("http timeout must be at least one second")]
    ZeroTimeout,
    #[error("config value `{0}` must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: String,
    pub source_table: String,
    pub blob_base_url: String,
    pub concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub output_dir: PathBuf,
    pub output_stem: String,
    pub write_parquet: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "mysql://localhost:3306/qfinance".to_string(),
            source_table: "qfinance.q_report".to_string(),
            blob_base_url: "https://mum-objectstore.e2enetworks.net/production-finqy/".to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            http_timeout_secs: 30,
            user_agent: "tradeline-bot/0.1".to_string(),
            output_dir: PathBuf::from("."),
            output_stem: "processed_trade_lines".to_string(),
            write_parquet: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let database_url = lookup("DATABASE_URL")
            .or_else(|| {
                lookup("DB_HOST").map(|host| {
                    compose_mysql_url(
                        &host,
                        lookup("DB_USER").as_deref(),
                        lookup("DB_PASSWORD").as_deref(),
                        lookup("DB_NAME").as_deref().unwrap_or("qfinance"),
                    )
                })
            })
            .unwrap_or(defaults.database_url);

        Self {
            database_url,
            source_table: lookup("TRADELINE_SOURCE_TABLE").unwrap_or(defaults.source_table),
            blob_base_url: lookup("TRADELINE_BLOB_BASE_URL").unwrap_or(defaults.blob_base_url),
            concurrency: lookup("TRADELINE_CONCURRENCY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.concurrency),
            http_timeout_secs: lookup("TRADELINE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: lookup("TRADELINE_USER_AGENT").unwrap_or(defaults.user_agent),
            output_dir: lookup("TRADELINE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            output_stem: lookup("TRADELINE_OUTPUT_STEM").unwrap_or(defaults.output_stem),
            write_parquet: lookup("TRADELINE_WRITE_PARQUET")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.write_parquet),
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::ConcurrencyOutOfRange(self.concurrency));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        for (name, value) in [
            ("database_url", &self.database_url),
            ("source_table", &self.source_table),
            ("blob_base_url", &self.blob_base_url),
            ("output_stem", &self.output_stem),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.blob_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn export_set(&self) -> ExportSet {
        ExportSet::new(self.output_dir.clone(), self.output_stem.clone())
            .with_parquet(self.write_parquet)
    }
}

fn compose_mysql_url(host: &str, user: Option<&str>, password: Option<&str>, database: &str) -> String {
    let credentials = match (user, password) {
        (Some(user), Some(password)) => format!(
            "{}:{}@",
            urlencoding::encode(user),
            urlencoding::encode(password)
        ),
        (Some(user), None) => format!("{}@", urlencoding::encode(user)),
        _ => String::new(),
    };
    format!("mysql://{credentials}{host}/{database}")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter text contains no valid identifiers")]
    NoValidIdentifiers,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Za-z]{5}[0-9]{4}[A-Za-z]").expect("identifier pattern is valid")
    })
}

pub fn extract_identifiers(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = identifier_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_uppercase())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierFilter {
    All,
    Only(Vec<String>),
}

impl IdentifierFilter {
    pub fn parse(text: Option<&str>) -> Result<Self, FilterError> {
        match text.map(str::trim) {
            None | Some("") => Ok(Self::All),
            Some(text) => {
                let ids = extract_identifiers(text);
                if ids.is_empty() {
                    Err(FilterError::NoValidIdentifiers)
                } else {
                    Ok(Self::Only(ids))
                }
            }
        }
    }

    pub fn allow_list(&self) -> Option<&[String]> {
        match self {
            Self::All => None,
            Self::Only(ids) => Some(ids),
        }
    }
}

pub fn select_tasks(records: &[SourceRecord]) -> Vec<Task> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::new();
    for record in records {
        let Some(reference) = record.report_reference.as_deref() else {
            continue;
        };
        if reference.trim().is_empty() || reference.trim().eq_ignore_ascii_case(NULL_REFERENCE) {
            continue;
        }
        if seen.insert(record.identifier.as_str()) {
            tasks.push(Task {
                identifier: record.identifier.clone(),
                report_reference: reference.to_string(),
            });
        }
    }
    tasks
}

#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, event: ProgressEvent) {
        info!(completed = event.completed, total = event.total, "{}", event.message);
    }
}

#[derive(Debug, Default, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Normalize,
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub identifier: String,
    pub report_reference: String,
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    fn new(task: &Task, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            identifier: task.identifier.clone(),
            report_reference: task.report_reference.clone(),
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub completed: usize,
    pub rows: Vec<TradelineRow>,
    pub failures: Vec<TaskFailure>,
}

struct TaskOutcome {
    task: Task,
    result: Result<Vec<TradelineRow>, TaskFailure>,
}

pub struct Executor {
    fetcher: Arc<dyn ReportFetcher>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
    run_id: Uuid,
}

impl Executor {
    pub fn new(fetcher: Arc<dyn ReportFetcher>, clock: Arc<dyn Clock>, concurrency: usize) -> Self {
        Self {
            fetcher,
            clock,
            concurrency: concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
            run_id: Uuid::nil(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run(&self, tasks: Vec<Task>, progress: &dyn ProgressSink) -> ExecutionReport {
        let total = tasks.len();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, Task> = HashMap::with_capacity(total);

        for task in tasks {
            let permits = Arc::clone(&permits);
            let owned = task.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let clock = Arc::clone(&self.clock);
            let span = info_span!(
                "report_task",
                run_id = %self.run_id,
                identifier = %task.identifier,
                reference = %task.report_reference,
            );
            let handle = set.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        let failure = TaskFailure::new(&owned, FailureKind::Join, "executor shut down");
                        return TaskOutcome { task: owned, result: Err(failure) };
                    };
                    process_task(fetcher.as_ref(), clock.as_ref(), owned).await
                }
                .instrument(span),
            );
            pending.insert(handle.id(), task);
        }

        let mut report = ExecutionReport::default();
        while let Some(joined) = set.join_next_with_id().await {
            report.completed += 1;
            let label = match joined {
                Ok((id, TaskOutcome { task, result: Ok(rows) })) => {
                    pending.remove(&id);
                    report.rows.extend(rows);
                    task.identifier
                }
                Ok((id, TaskOutcome { task, result: Err(failure) })) => {
                    pending.remove(&id);
                    warn!(
                        identifier = %failure.identifier,
                        reference = %failure.report_reference,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "task failed"
                    );
                    report.failures.push(failure);
                    task.identifier
                }
                Err(err) => {
                    let task = pending.remove(&err.id()).unwrap_or_else(|| Task {
                        identifier: String::new(),
                        report_reference: String::new(),
                    });
                    warn!(
                        identifier = %task.identifier,
                        reference = %task.report_reference,
                        error = %err,
                        "task aborted"
                    );
                    report
                        .failures
                        .push(TaskFailure::new(&task, FailureKind::Join, err.to_string()));
                    task.identifier
                }
            };

            progress.report(ProgressEvent::new(
                report.completed,
                total,
                format!("Processed {}/{}: {}", report.completed, total, label),
            ));
            if report.completed % PROGRESS_LOG_EVERY == 0 {
                info!(completed = report.completed, total, "processing records");
            }
        }

        report
    }
}

async fn process_task(fetcher: &dyn ReportFetcher, clock: &dyn Clock, task: Task) -> TaskOutcome {
    let raw = match fetcher.fetch(&task.report_reference).await {
        Ok(raw) => raw,
        Err(err) => {
            let failure = TaskFailure::new(&task, FailureKind::Fetch, err.to_string());
            return TaskOutcome { task, result: Err(failure) };
        }
    };

    let result = try_normalize(&raw, &task.identifier, clock.now())
        .map_err(|err| TaskFailure::new(&task, FailureKind::Normalize, err.to_string()));
    TaskOutcome { task, result }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("no tasks were processed")]
    NoTasks,
    #[error("{tasks} tasks produced no rows")]
    NoRows { tasks: usize },
}

pub fn build_table(rows: Vec<TradelineRow>, task_count: usize) -> Result<OutputTable, AggregateError> {
    if task_count == 0 {
        return Err(AggregateError::NoTasks);
    }
    if rows.is_empty() {
        return Err(AggregateError::NoRows { tasks: task_count });
    }
    Ok(OutputTable::new(rows))
}

#[derive(Debug, Clone)]
pub enum ExportStatus {
    Written(ExportManifest),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub tasks: usize,
    pub table: OutputTable,
    pub failures: Vec<TaskFailure>,
    pub export: ExportStatus,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    AbortedBeforeStart,
    NoMatchingRecords,
    CompletedWithData(RunReport),
    CompletedEmpty {
        run_id: Uuid,
        tasks: usize,
        failures: Vec<TaskFailure>,
    },
    AbortedOnFatalError(String),
}

impl RunOutcome {
    pub fn table(&self) -> Option<&OutputTable> {
        match self {
            Self::CompletedWithData(report) => Some(&report.table),
            _ => None,
        }
    }

    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            Self::CompletedWithData(report) => &report.failures,
            Self::CompletedEmpty { failures, .. } => failures,
            _ => &[],
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AbortedOnFatalError(_))
    }

    pub fn summary(&self) -> String {
        match self {
            Self::AbortedBeforeStart => "run cancelled before start".to_string(),
            Self::NoMatchingRecords => "No records found matching criteria.".to_string(),
            Self::CompletedWithData(report) => {
                let export = match &report.export {
                    ExportStatus::Written(manifest) => format!("{} files written", manifest.files.len()),
                    ExportStatus::Failed(err) => format!("export failed: {err}"),
                };
                format!(
                    "run {}: {} rows from {} tasks ({} failed); {}",
                    report.run_id,
                    report.table.len(),
                    report.tasks,
                    report.failures.len(),
                    export
                )
            }
            Self::CompletedEmpty { run_id, tasks, failures } => format!(
                "run {run_id}: {tasks} tasks produced no rows ({} failed)",
                failures.len()
            ),
            Self::AbortedOnFatalError(message) => format!("Error: {message}"),
        }
    }
}

pub struct TradelinePipeline {
    config: PipelineConfig,
    source: Arc<dyn RecordSource>,
    fetcher: Arc<dyn ReportFetcher>,
    clock: Arc<dyn Clock>,
}

impl TradelinePipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn RecordSource>,
        fetcher: Arc<dyn ReportFetcher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            fetcher,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let source = MySqlRecordSource::new(config.database_url.clone(), config.source_table.clone())
            .context("configuring record source")?;
        let fetcher = HttpReportFetcher::new(config.http_client_config())?;
        Ok(Self::new(config, Arc::new(source), Arc::new(fetcher))?)
    }

    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        filter: &IdentifierFilter,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            info!("run cancelled before start");
            return RunOutcome::AbortedBeforeStart;
        }

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let clock_start = Instant::now();

        progress.report(ProgressEvent::indeterminate("Initializing record source connection..."));
        progress.report(ProgressEvent::indeterminate(match filter {
            IdentifierFilter::Only(ids) => format!("Fetching records for {} specific identifiers...", ids.len()),
            IdentifierFilter::All => "Fetching ALL records from the record source...".to_string(),
        }));

        let records = match self.source.fetch_records(filter.allow_list()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%run_id, source = %self.source.describe(), error = %err, "record source failed");
                progress.report(ProgressEvent::indeterminate(format!("Error: {err}")));
                return RunOutcome::AbortedOnFatalError(err.to_string());
            }
        };
        info!(%run_id, records = records.len(), source = %self.source.describe(), "records loaded");

        progress.report(ProgressEvent::indeterminate("Filtering duplicates (latest wins)..."));
        let tasks = select_tasks(&records);
        if tasks.is_empty() {
            progress.report(ProgressEvent::indeterminate("No records found matching criteria."));
            return RunOutcome::NoMatchingRecords;
        }

        if cancel.is_cancelled() {
            info!(%run_id, "run cancelled before dispatch");
            return RunOutcome::AbortedBeforeStart;
        }

        let task_count = tasks.len();
        info!(%run_id, tasks = task_count, concurrency = self.config.concurrency, "dispatching tasks");
        progress.report(ProgressEvent::new(
            0,
            task_count,
            format!("Starting parallel processing for {task_count} tasks..."),
        ));

        let executor = Executor::new(Arc::clone(&self.fetcher), Arc::clone(&self.clock), self.config.concurrency)
            .with_run_id(run_id);
        let execution = executor.run(tasks, progress).await;
        info!(
            %run_id,
            completed = execution.completed,
            rows = execution.rows.len(),
            failures = execution.failures.len(),
            elapsed_secs = clock_start.elapsed().as_secs_f64(),
            "processing finished"
        );

        let table = match build_table(execution.rows, task_count) {
            Ok(table) => table,
            Err(err) => {
                warn!(%run_id, error = %err, "no rows to export");
                return RunOutcome::CompletedEmpty {
                    run_id,
                    tasks: task_count,
                    failures: execution.failures,
                };
            }
        };

        progress.report(ProgressEvent::new(task_count, task_count, "Generating export files..."));
        let (table, export) = write_exports(self.config.export_set(), table).await;
        if let ExportStatus::Written(manifest) = &export {
            info!(%run_id, rows = manifest.row_count, files = manifest.files.len(), "exports written");
        }

        RunOutcome::CompletedWithData(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records: records.len(),
            tasks: task_count,
            table,
            failures: execution.failures,
            export,
        })
    }
}

async fn write_exports(exports: ExportSet, table: OutputTable) -> (OutputTable, ExportStatus) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = exports.write_all(&table);
        (table, result)
    })
    .await;

    match joined {
        Ok((table, Ok(manifest))) => (table, ExportStatus::Written(manifest)),
        Ok((table, Err(err))) => {
            warn!(error = %format!("{err:#}"), "export failed; rows kept in memory");
            (table, ExportStatus::Failed(format!("{err:#}")))
        }
        // the table moved into the panicked closure; nothing left to return
        Err(err) => (OutputTable::new(Vec::new()), ExportStatus::Failed(err.to_string())),
    }
}
