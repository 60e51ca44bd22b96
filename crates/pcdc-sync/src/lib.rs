//! Watermark-tracked incremental extraction loop and its environment wiring.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDateTime};
use pcdc_adapters::{FixtureProfileSource, PgProfileSource, ProfileSource};
use pcdc_core::{transform, ExtractError, OutputDocument, Watermark};
use pcdc_storage::{
    batch_digest, provision_schema, BackoffPolicy, HttpSink, InMemoryWatermarkStore,
    JsonFileSink, PgWatermarkStore, ProvisionReport, SinkWriter, WatermarkStore,
};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pcdc-sync";

/// When the watermark moves relative to the sink flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// Advance per record before the flush; a failed flush loses the batch.
    AtMostOnce,
    /// Advance once after the sink accepts the batch; a crash re-delivers it.
    AtLeastOnce,
}

impl DeliveryMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "at-most-once" => Some(Self::AtMostOnce),
            "at-least-once" => Some(Self::AtLeastOnce),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    File,
    Http,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub database_url: Option<String>,
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: Option<String>,
    pub sink: SinkKind,
    pub output_path: PathBuf,
    pub sink_url: Option<String>,
    pub idle_interval: Duration,
    pub store_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub delivery: DeliveryMode,
    pub log_level: String,
}

impl ExtractorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; missing or unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            non_empty(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let defaults = BackoffPolicy::default();

        Self {
            database_url: non_empty("DATABASE_URL"),
            db_host: non_empty("HOST").unwrap_or_else(|| "localhost".to_string()),
            db_name: non_empty("DATABASE").unwrap_or_else(|| "profiles".to_string()),
            db_user: non_empty("USER").unwrap_or_else(|| "postgres".to_string()),
            db_password: non_empty("PASSWORD"),
            sink: match non_empty("PCDC_SINK").as_deref().map(str::trim) {
                Some(v) if v.eq_ignore_ascii_case("http") => SinkKind::Http,
                _ => SinkKind::File,
            },
            output_path: non_empty("PCDC_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("profiles.json")),
            sink_url: non_empty("PCDC_SINK_URL"),
            idle_interval: Duration::from_millis(number("PCDC_IDLE_INTERVAL_MS", 1000).max(1)),
            store_timeout: Duration::from_secs(number("PCDC_STORE_TIMEOUT_SECS", 10).max(1)),
            backoff: BackoffPolicy {
                max_retries: number("PCDC_MAX_RETRIES", defaults.max_retries as u64) as usize,
                base_delay: Duration::from_millis(number(
                    "PCDC_BACKOFF_BASE_MS",
                    defaults.base_delay.as_millis() as u64,
                )),
                max_delay: Duration::from_millis(number(
                    "PCDC_BACKOFF_MAX_MS",
                    defaults.max_delay.as_millis() as u64,
                )),
            },
            delivery: non_empty("PCDC_DELIVERY")
                .and_then(|v| DeliveryMode::parse(&v))
                .unwrap_or(DeliveryMode::AtMostOnce),
            log_level: non_empty("PCDC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    /// `DATABASE_URL` wins; otherwise the discrete host/database/user/password settings.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return url
                .parse::<PgConnectOptions>()
                .context("parsing DATABASE_URL");
        }
        let mut options = PgConnectOptions::new()
            .host(&self.db_host)
            .database(&self.db_name)
            .username(&self.db_user);
        if let Some(password) = &self.db_password {
            options = options.password(password);
        }
        Ok(options)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            idle_interval: self.idle_interval,
            store_timeout: self.store_timeout,
            backoff: self.backoff,
            delivery: self.delivery,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub idle_interval: Duration,
    pub store_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub delivery: DeliveryMode,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            store_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            delivery: DeliveryMode::AtMostOnce,
        }
    }
}

/// Wall-clock source; drives the reference year for derived ages.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Processing,
    Flushing,
    Error,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Processing => "processing",
            Self::Flushing => "flushing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub records: usize,
    pub batch_digest: String,
    pub watermark: Watermark,
}

/// Result of one poll-process-flush tick. Every variant carries the
/// watermark the next tick must start from.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Empty {
        watermark: Watermark,
    },
    Flushed(CycleReport),
    /// Stop was requested while waiting on a retry.
    Cancelled {
        watermark: Watermark,
        flushed: usize,
        dropped: usize,
    },
}

impl CycleOutcome {
    pub fn watermark(&self) -> Watermark {
        match self {
            Self::Empty { watermark } | Self::Cancelled { watermark, .. } => *watermark,
            Self::Flushed(report) => report.watermark,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub cycles: usize,
    pub empty_polls: usize,
    pub batches: usize,
    pub records: usize,
    pub watermark: Option<Watermark>,
}

impl RunSummary {
    fn started(at: NaiveDateTime) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            cycles: 0,
            empty_polls: 0,
            batches: 0,
            records: 0,
            watermark: None,
        }
    }

    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        self.watermark = Some(outcome.watermark());
        match outcome {
            CycleOutcome::Empty { .. } => self.empty_polls += 1,
            CycleOutcome::Flushed(report) => {
                self.batches += 1;
                self.records += report.records;
            }
            CycleOutcome::Cancelled { flushed, .. } => {
                if *flushed > 0 {
                    self.batches += 1;
                    self.records += flushed;
                }
            }
        }
    }
}

/// Single-writer extraction state machine.
///
/// The watermark is threaded through [`ExtractionLoop::run_cycle`] as an
/// explicit cursor; persistence goes through the injected [`WatermarkStore`].
pub struct ExtractionLoop {
    source: Arc<dyn ProfileSource>,
    watermarks: Arc<dyn WatermarkStore>,
    sink: Arc<dyn SinkWriter>,
    clock: Arc<dyn Clock>,
    config: LoopConfig,
    state: LoopState,
}

impl ExtractionLoop {
    pub fn new(
        source: Arc<dyn ProfileSource>,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn SinkWriter>,
        config: LoopConfig,
    ) -> Self {
        Self {
            source,
            watermarks,
            sink,
            clock: Arc::new(SystemClock),
            config,
            state: LoopState::Idle,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "state transition");
            self.state = next;
        }
    }

    fn halt(&mut self, err: &ExtractError) {
        self.transition(LoopState::Error);
        error!(error = %err, disposition = ?err.disposition(), "extraction halted");
    }

    /// Read the persisted watermark. `None` means stop was requested while retrying.
    pub async fn load_watermark(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Watermark>, ExtractError> {
        let watermarks = Arc::clone(&self.watermarks);
        let loaded = retry_step(self.config, "load_watermark", cancel, || watermarks.load()).await;
        if let Err(err) = &loaded {
            self.halt(err);
        }
        loaded
    }

    /// Run until `cancel` fires or a step fails past its retries.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, ExtractError> {
        let mut summary = RunSummary::started(self.clock.now());
        let Some(mut watermark) = self.load_watermark(&cancel).await? else {
            summary.finished_at = self.clock.now();
            return Ok(summary);
        };
        summary.watermark = Some(watermark);
        info!(
            %watermark,
            source = self.source.source_id(),
            sink = self.sink.name(),
            delivery = ?self.config.delivery,
            "extraction started"
        );

        while !cancel.is_cancelled() {
            let outcome = self.run_cycle(watermark, &cancel).await?;
            watermark = outcome.watermark();
            summary.record(&outcome);
            match outcome {
                CycleOutcome::Flushed(_) => {}
                CycleOutcome::Empty { .. } => {
                    if !self.idle_wait(&cancel).await {
                        break;
                    }
                }
                CycleOutcome::Cancelled { .. } => break,
            }
        }

        summary.finished_at = self.clock.now();
        info!(
            cycles = summary.cycles,
            batches = summary.batches,
            records = summary.records,
            %watermark,
            "extraction stopped"
        );
        Ok(summary)
    }

    /// Load the watermark and run a single tick.
    pub async fn run_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<CycleOutcome>, ExtractError> {
        let Some(watermark) = self.load_watermark(cancel).await? else {
            return Ok(None);
        };
        self.run_cycle(watermark, cancel).await.map(Some)
    }

    /// One tick: poll past `watermark`, transform and checkpoint each record,
    /// flush the batch. Returns the watermark the next tick starts from.
    pub async fn run_cycle(
        &mut self,
        watermark: Watermark,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, ExtractError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "extract_cycle",
            %run_id,
            source = self.source.source_id(),
            sink = self.sink.name()
        );
        let result = self.cycle(run_id, watermark, cancel).instrument(span).await;
        if let Err(err) = &result {
            self.halt(err);
        }
        result
    }

    async fn cycle(
        &mut self,
        run_id: Uuid,
        watermark: Watermark,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, ExtractError> {
        let started_at = self.clock.now();
        let config = self.config;
        let source = Arc::clone(&self.source);
        let watermarks = Arc::clone(&self.watermarks);

        self.transition(LoopState::Polling);
        let polled = retry_step(config, "fetch_since", cancel, || source.fetch_since(watermark)).await?;
        let Some(records) = polled else {
            self.transition(LoopState::Idle);
            return Ok(CycleOutcome::Cancelled {
                watermark,
                flushed: 0,
                dropped: 0,
            });
        };
        if records.is_empty() {
            self.transition(LoopState::Idle);
            debug!(%watermark, "no new profiles");
            return Ok(CycleOutcome::Empty { watermark });
        }

        self.transition(LoopState::Processing);
        let reference_year = started_at.year();
        let mut batch = Vec::with_capacity(records.len());
        let mut committed = watermark;
        let mut pending = watermark;
        let mut interrupted = false;

        for record in &records {
            batch.push(transform(record, reference_year));
            pending = record.watermark().max(pending);
            if config.delivery == DeliveryMode::AtMostOnce {
                let next = pending;
                let advanced =
                    retry_step(config, "advance_watermark", cancel, || watermarks.advance(next))
                        .await?;
                if advanced.is_none() {
                    // not checkpointed, so it will be fetched again
                    batch.pop();
                    interrupted = true;
                    break;
                }
                committed = next;
            }
        }

        self.transition(LoopState::Flushing);
        let digest = batch_digest(&batch);
        if !batch.is_empty() && self.flush(&batch, &digest, committed, cancel).await?.is_none() {
            self.transition(LoopState::Idle);
            warn!(
                dropped = batch.len(),
                watermark = %committed,
                "stopped before the batch reached the sink"
            );
            return Ok(CycleOutcome::Cancelled {
                watermark: committed,
                flushed: 0,
                dropped: batch.len(),
            });
        }

        if config.delivery == DeliveryMode::AtLeastOnce {
            let advanced =
                retry_step(config, "advance_watermark", cancel, || watermarks.advance(pending))
                    .await?;
            if advanced.is_none() {
                self.transition(LoopState::Idle);
                warn!(
                    watermark = %committed,
                    "stopped before checkpointing a delivered batch; it will be delivered again"
                );
                return Ok(CycleOutcome::Cancelled {
                    watermark: committed,
                    flushed: batch.len(),
                    dropped: 0,
                });
            }
            committed = pending;
        }

        if !batch.is_empty() {
            info!(
                records = batch.len(),
                batch_digest = %digest,
                watermark = %committed,
                "batch flushed"
            );
        }
        self.transition(LoopState::Idle);

        if interrupted {
            return Ok(CycleOutcome::Cancelled {
                watermark: committed,
                flushed: batch.len(),
                dropped: 0,
            });
        }
        Ok(CycleOutcome::Flushed(CycleReport {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            records: batch.len(),
            batch_digest: digest,
            watermark: committed,
        }))
    }

    /// Append the batch, retrying the same documents on failure.
    async fn flush(
        &self,
        batch: &[OutputDocument],
        digest: &str,
        committed: Watermark,
        cancel: &CancellationToken,
    ) -> Result<Option<()>, ExtractError> {
        let sink: &dyn SinkWriter = self.sink.as_ref();
        let delivery = self.config.delivery;
        retry_step(self.config, "sink_append", cancel, move || async move {
            let result = sink.append(batch).await;
            if let Err(err) = &result {
                match delivery {
                    DeliveryMode::AtMostOnce => warn!(
                        sink = sink.name(),
                        batch_digest = digest,
                        documents = batch.len(),
                        watermark = %committed,
                        error = %err,
                        "sink append failed after the watermark moved past this batch"
                    ),
                    DeliveryMode::AtLeastOnce => warn!(
                        sink = sink.name(),
                        batch_digest = digest,
                        documents = batch.len(),
                        watermark = %committed,
                        error = %err,
                        "sink append failed; watermark held until the batch is accepted"
                    ),
                }
            }
            result
        })
        .await
    }

    /// Returns `false` when stop was requested during the wait.
    async fn idle_wait(&mut self, cancel: &CancellationToken) -> bool {
        self.transition(LoopState::Idle);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.idle_interval) => true,
        }
    }
}

/// Run `step` under the store timeout, retrying retryable failures with
/// backoff. `Ok(None)` means `cancel` fired during a backoff sleep.
async fn retry_step<T, F, Fut>(
    config: LoopConfig,
    operation: &'static str,
    cancel: &CancellationToken,
    mut step: F,
) -> Result<Option<T>, ExtractError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExtractError>>,
{
    let mut attempt = 0usize;
    loop {
        let result = match tokio::time::timeout(config.store_timeout, step()).await {
            Ok(result) => result,
            Err(_) => Err(ExtractError::Timeout {
                operation,
                after: config.store_timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_retryable() && attempt < config.backoff.max_retries => {
                let delay = config.backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    max_retries = config.backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Load `KEY=value` pairs into the process environment before configuration
/// is read. Variables already set are left alone. With no explicit path a
/// `.env` in the working directory or its parents is used when present.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("loading {}", path.display()))?;
            Ok(Some(path.to_path_buf()))
        }
        None => match dotenvy::dotenv() {
            Ok(found) => Ok(Some(found)),
            Err(err) if err.not_found() => Ok(None),
            Err(err) => Err(err).context("loading .env"),
        },
    }
}

/// Cancellation token that fires on Ctrl-C / SIGINT.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested; finishing current batch");
        }
        child.cancel();
    });
    token
}

pub async fn connect_pool(config: &ExtractorConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(config.store_timeout)
        .connect_with(config.connect_options()?)
        .await
        .context("connecting to profile store")
}

pub fn build_sink(config: &ExtractorConfig) -> Result<Arc<dyn SinkWriter>> {
    match config.sink {
        SinkKind::File => Ok(Arc::new(JsonFileSink::new(config.output_path.clone()))),
        SinkKind::Http => {
            let url = config
                .sink_url
                .clone()
                .context("PCDC_SINK=http requires PCDC_SINK_URL")?;
            Ok(Arc::new(HttpSink::new(url, config.store_timeout)?))
        }
    }
}

pub async fn extraction_loop(config: &ExtractorConfig) -> Result<ExtractionLoop> {
    let pool = connect_pool(config).await?;
    let sink = build_sink(config)?;
    Ok(ExtractionLoop::new(
        Arc::new(PgProfileSource::new(pool.clone())),
        Arc::new(PgWatermarkStore::new(pool)),
        sink,
        config.loop_config(),
    ))
}

pub async fn run_extract_from_env(cancel: CancellationToken) -> Result<RunSummary> {
    let config = ExtractorConfig::from_env();
    let mut extractor = extraction_loop(&config).await?;
    Ok(extractor.run(cancel).await?)
}

pub async fn run_once_from_env() -> Result<Option<CycleOutcome>> {
    let config = ExtractorConfig::from_env();
    let mut extractor = extraction_loop(&config).await?;
    Ok(extractor.run_once(&CancellationToken::new()).await?)
}

pub async fn migrate_from_env() -> Result<ProvisionReport> {
    let config = ExtractorConfig::from_env();
    let pool = connect_pool(&config).await?;
    provision_schema(&pool).await
}

/// One tick over a JSON fixture, starting from the minimum watermark, into a file sink.
pub async fn replay_fixture(fixture: &Path, output: &Path) -> Result<Option<CycleOutcome>> {
    let source = FixtureProfileSource::from_fixture(fixture)?;
    let mut extractor = ExtractionLoop::new(
        Arc::new(source),
        Arc::new(InMemoryWatermarkStore::new(Watermark::minimum())),
        Arc::new(JsonFileSink::new(output)),
        LoopConfig::default(),
    );
    Ok(extractor.run_once(&CancellationToken::new()).await?)
}
