//! Sync run orchestration: lock, extract, map, reconcile, photos, summary, report.

pub mod archive;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod photos;
pub mod reconcile;
pub mod summary;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use csync_core::{
    DetectedFile, MappedRecord, PhotoCounters, RunSummary, SourceFileCandidate, SystemInfo,
};
use csync_feed::{
    is_archive, is_data_file, table_name_for, DelimitedParser, FieldMapper, FileLocator,
    MappingTables, ParsedFile, ZipExtractor,
};
use csync_storage::{
    ArtifactMediaLibrary, CatalogStore, HttpClientConfig, HttpFetcher, JsonCatalogStore,
    MediaLibrary, RemoteMedia,
};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};

use crate::archive::Archiver;
use crate::lock::{RunLock, LOCK_FILE_NAME};
use crate::logging::LogSinks;
use crate::notify::{compose_report, Notifier, OutboxNotifier, SendMode};
use crate::photos::PhotoSync;
use crate::reconcile::Reconciler;
use crate::summary::{prune_empty_summaries, SummaryArtifact};

pub const CRATE_NAME: &str = "csync-sync";
pub const PHOTOS_TABLE: &str = "PHOTOS.TXT";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_path: PathBuf,
    pub file_pattern: String,
    pub detect_limit: usize,
    pub base_dir: PathBuf,
    pub dev_mode: bool,
    pub clear_logs_on_sync: bool,
    pub timezone: Tz,
    pub send_mode: SendMode,
    pub recipients: Vec<String>,
    pub subject_prefix: String,
    pub user_agent: String,
    pub head_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_redirects: usize,
    pub lock_ttl_secs: u64,
    pub mappings_path: Option<PathBuf>,
    pub header_row_is_data: bool,
    pub site_url: String,
    pub environment: String,
    /// Invalid settings that fell back to defaults, reported once logging is up.
    pub warnings: Vec<String>,
}

impl SyncConfig {
    pub fn new(source_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            file_pattern: "PIVOTELECOM*.TXT;PIVOTELECOM*.ZIP".to_string(),
            detect_limit: 5,
            base_dir: base_dir.into(),
            dev_mode: false,
            clear_logs_on_sync: true,
            timezone: chrono_tz::America::Toronto,
            send_mode: SendMode::Always,
            recipients: Vec::new(),
            subject_prefix: "[Centris Sync]".to_string(),
            user_agent: format!("centris-sync/{}", env!("CARGO_PKG_VERSION")),
            head_timeout_secs: 10,
            download_timeout_secs: 30,
            max_redirects: 3,
            lock_ttl_secs: 3600,
            mappings_path: None,
            header_row_is_data: false,
            site_url: String::new(),
            environment: "production".to_string(),
            warnings: Vec::new(),
        }
    }

    pub fn from_env() -> Self {
        let base_dir = env_string("CSYNC_BASE_DIR").unwrap_or_else(|| "./centris-sync".to_string());
        let source = env_string("CSYNC_SOURCE_PATH").unwrap_or_else(|| "./centris-feed".to_string());
        let mut config = Self::new(source, base_dir);

        if let Some(pattern) = env_string("CSYNC_FILE_PATTERN") {
            config.file_pattern = pattern;
        }
        config.detect_limit = config.parse_env("CSYNC_DETECT_LIMIT", config.detect_limit);
        config.dev_mode = env_bool("CSYNC_DEV_MODE", false);
        config.clear_logs_on_sync = env_bool("CSYNC_CLEAR_LOGS_ON_SYNC", true);
        if let Some(tz) = env_string("CSYNC_TIMEZONE") {
            match tz.parse::<Tz>() {
                Ok(tz) => config.timezone = tz,
                Err(_) => config
                    .warnings
                    .push(format!("CSYNC_TIMEZONE `{tz}` is not a known zone, using America/Toronto")),
            }
        }
        if let Some(mode) = env_string("CSYNC_SEND_MODE") {
            match mode.parse::<SendMode>() {
                Ok(mode) => config.send_mode = mode,
                Err(err) => config.warnings.push(format!("CSYNC_SEND_MODE: {err}, using always")),
            }
        }
        config.recipients = env_string("CSYNC_RECIPIENTS")
            .map(|v| {
                v.split([',', ';'])
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(prefix) = env_string("CSYNC_SUBJECT_PREFIX") {
            config.subject_prefix = prefix;
        }
        if let Some(agent) = env_string("CSYNC_USER_AGENT") {
            config.user_agent = agent;
        }
        config.head_timeout_secs = config.parse_env("CSYNC_HEAD_TIMEOUT_SECS", config.head_timeout_secs);
        config.download_timeout_secs =
            config.parse_env("CSYNC_DOWNLOAD_TIMEOUT_SECS", config.download_timeout_secs);
        config.max_redirects = config.parse_env("CSYNC_MAX_REDIRECTS", config.max_redirects);
        config.lock_ttl_secs = config.parse_env("CSYNC_LOCK_TTL_SECS", config.lock_ttl_secs);
        config.mappings_path = env_string("CSYNC_MAPPINGS_PATH").map(PathBuf::from);
        config.header_row_is_data = env_bool("CSYNC_HEADER_ROW_IS_DATA", false);
        config.site_url = env_string("CSYNC_SITE_URL").unwrap_or_default();
        if let Some(environment) = env_string("CSYNC_ENVIRONMENT") {
            config.environment = environment;
        }
        config
    }

    fn parse_env<T: std::str::FromStr + Copy + std::fmt::Display>(&mut self, key: &str, default: T) -> T {
        match env_string(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                self.warnings
                    .push(format!("{key} `{raw}` is invalid, using {default}"));
                default
            }),
            None => default,
        }
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.base_dir.join("extracted")
    }

    pub fn archived_dir(&self) -> PathBuf {
        self.base_dir.join("archived")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.base_dir.join("failed")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.base_dir.join("reports")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.reports_dir().join("outbox")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.base_dir.join("media")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.base_dir.join("catalog.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(LOCK_FILE_NAME)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            head_timeout: Duration::from_secs(self.head_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            max_redirects: self.max_redirects,
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            site_url: self.site_url.clone(),
            environment: self.environment.clone(),
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn load_mappings(&self) -> Result<MappingTables> {
        match &self.mappings_path {
            Some(path) => MappingTables::from_path(path)
                .with_context(|| format!("loading mappings from {}", path.display())),
            None => MappingTables::builtin().context("loading built-in mappings"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run holds the lock.
    Skipped,
    Completed(RunSummary),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Processed {
        path: PathBuf,
        tables: usize,
        records: usize,
    },
    Failed {
        path: PathBuf,
        reason: String,
    },
}

/// Source inputs in processing order: archives first, then standalone data files.
pub async fn list_inputs(source_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(source_dir)
        .await
        .with_context(|| format!("reading {}", source_dir.display()))?;
    let mut archives = Vec::new();
    let mut data = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if is_archive(&path) {
            archives.push(path);
        } else if is_data_file(&path) {
            data.push(path);
        }
    }
    archives.sort();
    data.sort();
    archives.extend(data);
    Ok(archives)
}

pub fn detect_candidates(config: &SyncConfig) -> Vec<SourceFileCandidate> {
    FileLocator::new(config.timezone).detect(&config.source_path, &config.file_pattern, config.detect_limit)
}

struct RunState {
    reconciler: Reconciler,
    photos: PhotoSync,
    photo_counters: BTreeMap<String, PhotoCounters>,
    files: Vec<FileOutcome>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    catalog: Arc<dyn CatalogStore>,
    media: Arc<dyn MediaLibrary>,
    remote: Arc<dyn RemoteMedia>,
    notifier: Arc<dyn Notifier>,
    mapper: FieldMapper,
    logs: Option<LogSinks>,
}

impl SyncPipeline {
    /// Pipeline backed by the JSON catalog, the on-disk media library and live HTTP.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let mappings = config.load_mappings()?;
        let catalog = JsonCatalogStore::open(config.catalog_path())
            .await
            .context("opening catalog")?;
        let media = ArtifactMediaLibrary::open(config.media_dir())
            .await
            .context("opening media library")?;
        let remote = HttpFetcher::new(config.http_client_config())?;
        let notifier = OutboxNotifier::new(config.outbox_dir());
        Ok(Self {
            mapper: FieldMapper::new(Arc::new(mappings)),
            catalog: Arc::new(catalog),
            media: Arc::new(media),
            remote: Arc::new(remote),
            notifier: Arc::new(notifier),
            logs: None,
            config,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteMedia>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogStore>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_log_sinks(mut self, logs: LogSinks) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        for warning in &self.config.warnings {
            warn!("{warning}");
        }

        let lock = RunLock::new(
            self.config.lock_path(),
            Duration::from_secs(self.config.lock_ttl_secs),
            self.config.timezone,
        );
        let Some(guard) = lock.try_guard().await? else {
            return Ok(RunOutcome::Skipped);
        };

        let started_at = Utc::now();
        let span = info_span!("sync_run", started_at = %started_at.to_rfc3339());
        let mut artifact = None;
        let result = self.run_locked(started_at, &mut artifact).instrument(span).await;

        if let Err(err) = guard.release().await {
            error!(error = %err, "failed to release run lock");
        }
        match result {
            Ok(()) => {
                let summary = self.finish(artifact.as_ref(), started_at, None).await?;
                Ok(RunOutcome::Completed(summary))
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync run failed");
                if let Err(finish_err) = self.finish(artifact.as_ref(), started_at, Some(&err)).await {
                    error!(error = %format!("{finish_err:#}"), "failed run could not be reported");
                }
                Err(err)
            }
        }
    }

    /// Body of a locked run. The summary artifact lands in `artifact` as soon as it exists
    /// so a failed run can still be finalized.
    async fn run_locked(
        &self,
        started_at: chrono::DateTime<Utc>,
        artifact: &mut Option<SummaryArtifact>,
    ) -> Result<()> {
        if self.config.clear_logs_on_sync {
            if let Some(logs) = &self.logs {
                logs.truncate_operational()?;
            }
        }
        info!(source = %self.config.source_path.display(), "sync run started");
        self.reset_extracted().await?;

        let config = self.config.clone();
        let detected = tokio::task::spawn_blocking(move || detect_candidates(&config))
            .await
            .context("joining file detection")?;

        let mut summary = RunSummary::new(started_at, self.config.system_info());
        summary.detected_files = detected.iter().map(DetectedFile::from).collect();
        let artifact: &SummaryArtifact = artifact.insert(
            SummaryArtifact::create(&self.config.reports_dir(), &summary, self.config.timezone).await?,
        );

        let mut state = RunState {
            reconciler: Reconciler::new(self.catalog.clone()),
            photos: PhotoSync::new(self.catalog.clone(), self.remote.clone(), self.media.clone()),
            photo_counters: BTreeMap::new(),
            files: Vec::new(),
        };

        let inputs = match list_inputs(&self.config.source_path).await {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "source directory unavailable");
                Vec::new()
            }
        };
        let archiver = Archiver::new(
            self.config.archived_dir(),
            self.config.failed_dir(),
            self.config.dev_mode,
            self.config.timezone,
        );

        for input in inputs {
            let outcome = self.process_input(&input, artifact, &mut state).await;
            let moved = match &outcome {
                FileOutcome::Processed { .. } => archiver.archive(&input).await.map(|_| ()),
                FileOutcome::Failed { reason, .. } => {
                    error!(file = %input.display(), reason = %reason, "source file failed");
                    archiver.fail(&input).await.map(|_| ())
                }
            };
            if let Err(err) = moved {
                error!(file = %input.display(), error = %format!("{err:#}"), "could not move source file");
            }
            state.files.push(outcome);
        }

        let processed = state
            .files
            .iter()
            .filter(|f| matches!(f, FileOutcome::Processed { .. }))
            .count();
        info!(
            processed,
            failed = state.files.len() - processed,
            "sync run finished processing"
        );
        Ok(())
    }

    async fn reset_extracted(&self) -> Result<()> {
        let dir = self.config.extracted_dir();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("clearing {}", dir.display())),
        }
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))
    }

    async fn process_input(&self, input: &Path, artifact: &SummaryArtifact, state: &mut RunState) -> FileOutcome {
        let parsed_files = if is_archive(input) {
            let extractor = ZipExtractor::new(
                self.config.extracted_dir(),
                DelimitedParser::new(self.config.header_row_is_data),
                self.config.timezone,
            );
            let zip_path = input.to_path_buf();
            let extracted = tokio::task::spawn_blocking(move || extractor.extract_and_parse(&zip_path)).await;
            match extracted {
                Ok(Ok(outcome)) => {
                    info!(run_id = %outcome.run_id, files = outcome.files.len(), "archive ready");
                    outcome
                        .files
                        .into_iter()
                        .filter_map(|file| match file.parsed {
                            Ok(parsed) => Some(parsed),
                            Err(err) => {
                                warn!(file = %file.path.display(), error = %err, "data file skipped");
                                None
                            }
                        })
                        .collect::<Vec<_>>()
                }
                Ok(Err(err)) => {
                    return FileOutcome::Failed {
                        path: input.to_path_buf(),
                        reason: err.to_string(),
                    }
                }
                Err(err) => {
                    return FileOutcome::Failed {
                        path: input.to_path_buf(),
                        reason: format!("extraction task failed: {err}"),
                    }
                }
            }
        } else {
            let parser = DelimitedParser::new(self.config.header_row_is_data);
            let path = input.to_path_buf();
            match tokio::task::spawn_blocking(move || parser.parse(&path)).await {
                Ok(Ok(parsed)) => vec![parsed],
                Ok(Err(err)) => {
                    return FileOutcome::Failed {
                        path: input.to_path_buf(),
                        reason: err.to_string(),
                    }
                }
                Err(err) => {
                    return FileOutcome::Failed {
                        path: input.to_path_buf(),
                        reason: format!("parse task failed: {err}"),
                    }
                }
            }
        };

        let mut tables = 0;
        let mut records = 0;
        for parsed in &parsed_files {
            match self.process_table(parsed, input, artifact, state).await {
                Ok(count) => {
                    if count > 0 {
                        tables += 1;
                    }
                    records += count;
                }
                Err(err) => {
                    error!(
                        file = %parsed.path.display(),
                        error = %format!("{err:#}"),
                        "table processing failed"
                    );
                    return FileOutcome::Failed {
                        path: input.to_path_buf(),
                        reason: format!("{}: {err:#}", parsed.file_name()),
                    };
                }
            }
        }
        FileOutcome::Processed {
            path: input.to_path_buf(),
            tables,
            records,
        }
    }

    /// Map, reconcile and (for photo tables) refresh media. Returns the number of mapped rows.
    async fn process_table(
        &self,
        parsed: &ParsedFile,
        origin: &Path,
        artifact: &SummaryArtifact,
        state: &mut RunState,
    ) -> Result<usize> {
        let table = table_name_for(&parsed.file_name());
        if !self.mapper.has_table(&table) {
            warn!(table = %table, "no mapping for table, skipped");
            return Ok(0);
        }
        let mapped: Vec<MappedRecord> = parsed
            .indexed_rows()
            .map(|row| self.mapper.map(&row, &table))
            .collect();
        info!(table = %table, rows = mapped.len(), "table mapped");

        let ids = state.reconciler.upsert(&mapped, origin).await;
        info!(table = %table, reconciled = ids.len(), "table reconciled");
        artifact
            .update_key("changes_tracked", &state.reconciler.counters())
            .await?;

        if table == PHOTOS_TABLE {
            let file_base = origin
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut counters = state.photo_counters.get(&file_base).copied().unwrap_or_default();
            for row in &mapped {
                state.photos.sync_row(row, &mut counters).await;
            }
            let galleries = state.photos.rebuild_galleries().await?;
            info!(table = %table, galleries, ?counters, "photos synchronized");
            state.photo_counters.insert(file_base, counters);
            artifact
                .update_key("photos_counter_file_bases", &state.photo_counters)
                .await?;
            self.media.flush().await.context("flushing media library")?;
        }

        self.catalog.flush().await.context("flushing catalog")?;
        Ok(mapped.len())
    }

    /// Finalize the summary and dispatch the report; `failure` carries the error of an aborted run.
    async fn finish(
        &self,
        artifact: Option<&SummaryArtifact>,
        started_at: chrono::DateTime<Utc>,
        failure: Option<&anyhow::Error>,
    ) -> Result<RunSummary> {
        let ended_at = Utc::now();
        let finalized = match artifact {
            Some(artifact) => {
                let finalized = artifact.finalize(ended_at).await;
                if let Err(err) = prune_empty_summaries(&self.config.reports_dir(), artifact.path()).await {
                    warn!(error = %format!("{err:#}"), "could not prune summaries");
                }
                finalized
            }
            None => Err(anyhow::anyhow!("run ended before its summary was written")),
        };
        let summary = match finalized {
            Ok(summary) => summary,
            Err(err) if failure.is_some() => {
                warn!(error = %format!("{err:#}"), "reporting failed run from an in-memory summary");
                let mut summary = RunSummary::new(started_at, self.config.system_info());
                summary.ended_at = Some(ended_at);
                summary.duration = Some((ended_at - started_at).num_milliseconds() as f64 / 1000.0);
                summary
            }
            Err(err) => return Err(err),
        };

        let mut error_lines = self
            .logs
            .as_ref()
            .map(|logs| logs.error_window(started_at, ended_at))
            .unwrap_or_default();
        if let Some(err) = failure {
            let line = format!("sync run failed: {err:#}");
            if !error_lines.iter().any(|l| l.contains(&line)) {
                error_lines.push(line);
            }
        }
        if self.config.send_mode.should_send(&summary, &error_lines) {
            let report = compose_report(
                &self.config.subject_prefix,
                &self.config.recipients,
                &summary,
                &error_lines,
            );
            if let Err(err) = self.notifier.notify(&report).await {
                error!(error = %format!("{err:#}"), "summary report not delivered");
            }
        } else {
            info!(mode = ?self.config.send_mode, "summary report not sent");
        }
        info!(
            created = summary.changes_tracked.created,
            updated = summary.changes_tracked.updated,
            unchanged = summary.changes_tracked.unchanged,
            duration = summary.duration.unwrap_or_default(),
            failed = failure.is_some(),
            "sync run ended"
        );
        Ok(summary)
    }
}

pub async fn run_sync_once_from_env() -> Result<RunOutcome> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

/// Markdown view of the most recent run summary under `reports_dir`.
pub async fn report_markdown(reports_dir: &Path) -> Result<String> {
    match summary::latest_summary(reports_dir).await? {
        Some((path, summary)) => {
            let mut body = notify::render_summary_markdown(&summary, &[]);
            body.push_str(&format!("\n_source: `{}`_\n", path.display()));
            Ok(body)
        }
        None => Ok(format!(
            "# Centris Sync Summary\n\nNo summaries found in `{}`.\n",
            reports_dir.display()
        )),
    }
}
