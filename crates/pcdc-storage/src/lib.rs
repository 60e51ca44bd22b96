//! Watermark persistence, batch sinks and retry policy for PCDC.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use pcdc_core::{ExtractError, OutputDocument, RetryDisposition, Watermark};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pcdc-storage";

/// Single-scalar checkpoint of the last extracted creation timestamp.
///
/// `advance` overwrites unconditionally; the extraction loop is the only
/// writer and only ever moves the value forward. Implementations must have
/// made the value durable by the time `advance` returns.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Watermark, ExtractError>;

    async fn advance(&self, value: Watermark) -> Result<(), ExtractError>;
}

/// Watermark kept in the one-row `watermark` table.
///
/// Each call is its own autocommit statement on the pool, so a persisted
/// advance never waits on a later fetch.
#[derive(Debug, Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn load(&self) -> Result<Watermark, ExtractError> {
        let row = sqlx::query("SELECT last_extracted FROM watermark LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        let Some(row) = row else {
            return Err(ExtractError::NotInitialized);
        };
        let value: Option<NaiveDateTime> = row
            .try_get("last_extracted")
            .map_err(classify_sqlx_error)?;
        value.map(Watermark::new).ok_or(ExtractError::NotInitialized)
    }

    async fn advance(&self, value: Watermark) -> Result<(), ExtractError> {
        let result = sqlx::query("UPDATE watermark SET last_extracted = $1")
            .bind(value.as_naive())
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(ExtractError::NotInitialized);
        }
        Ok(())
    }
}

/// Process-local watermark; keeps every advanced value for inspection.
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    state: Mutex<WatermarkState>,
}

#[derive(Debug, Default)]
struct WatermarkState {
    current: Option<Watermark>,
    history: Vec<Watermark>,
}

impl InMemoryWatermarkStore {
    pub fn new(initial: Watermark) -> Self {
        Self {
            state: Mutex::new(WatermarkState {
                current: Some(initial),
                history: Vec::new(),
            }),
        }
    }

    /// A store that was never provisioned; `load` reports `NotInitialized`.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<Watermark> {
        self.state.lock().await.current
    }

    pub async fn history(&self) -> Vec<Watermark> {
        self.state.lock().await.history.clone()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self) -> Result<Watermark, ExtractError> {
        self.state
            .lock()
            .await
            .current
            .ok_or(ExtractError::NotInitialized)
    }

    async fn advance(&self, value: Watermark) -> Result<(), ExtractError> {
        let mut state = self.state.lock().await;
        if state.current.is_none() {
            return Err(ExtractError::NotInitialized);
        }
        state.current = Some(value);
        state.history.push(value);
        Ok(())
    }
}

/// Append-only target for transformed batches.
///
/// Order within a batch must be preserved. Appends are not idempotent: the
/// same batch appended twice shows up twice.
#[async_trait]
pub trait SinkWriter: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, documents: &[OutputDocument]) -> Result<(), ExtractError>;
}

/// Appends each batch as a pretty-printed JSON array, separated by `,\n`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failure(&self, action: &str, err: impl std::fmt::Display) -> ExtractError {
        ExtractError::Sink {
            sink: self.name().to_string(),
            message: format!("{action} {}: {err}", self.path.display()),
        }
    }
}

#[async_trait]
impl SinkWriter for JsonFileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn append(&self, documents: &[OutputDocument]) -> Result<(), ExtractError> {
        let body = encode_batch(documents).map_err(|err| self.failure("encoding batch for", err))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| self.failure("creating directory for", err))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.failure("opening", err))?;
        let existing = file
            .metadata()
            .await
            .map_err(|err| self.failure("inspecting", err))?
            .len();

        write_batch(&mut file, existing, &body)
            .await
            .map_err(|err| self.failure("appending to", err))?;

        info!(path = %self.path.display(), documents = documents.len(), "profiles appended");
        Ok(())
    }
}

/// File handle a batch is appended to.
#[async_trait]
trait BatchFile: AsyncWrite + Unpin + Send {
    async fn sync(&mut self) -> std::io::Result<()>;

    async fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[async_trait]
impl BatchFile for fs::File {
    async fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all().await
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len).await
    }
}

/// Append `body` after the `existing` bytes. On any failure the file is cut
/// back to `existing`, so it always ends on a batch boundary.
async fn write_batch<F: BatchFile>(file: &mut F, existing: u64, body: &[u8]) -> std::io::Result<()> {
    let written = async {
        if existing > 0 {
            file.write_all(b",\n").await?;
        }
        file.write_all(body).await?;
        file.flush().await?;
        file.sync().await
    }
    .await;

    if let Err(err) = written {
        if let Err(rollback) = file.truncate(existing).await {
            warn!(error = %rollback, len = existing, "could not cut back a partial batch");
        }
        return Err(err);
    }
    Ok(())
}

fn encode_batch(documents: &[OutputDocument]) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    documents.serialize(&mut serializer)?;
    Ok(buf)
}

/// Read back a file written by [`JsonFileSink`] as one JSON value per batch.
pub async fn load_file_batches(path: impl AsRef<Path>) -> anyhow::Result<Vec<serde_json::Value>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&format!("[{text}]")).with_context(|| format!("parsing {}", path.display()))
}

/// POSTs each batch as a JSON array to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn error(&self, disposition: RetryDisposition, message: String) -> ExtractError {
        let sink = self.name().to_string();
        match disposition {
            RetryDisposition::Retryable => ExtractError::Sink { sink, message },
            RetryDisposition::NonRetryable => ExtractError::SinkRejected { sink, message },
        }
    }
}

#[async_trait]
impl SinkWriter for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn append(&self, documents: &[OutputDocument]) -> Result<(), ExtractError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(documents)
            .send()
            .await
            .map_err(|err| {
                self.error(
                    classify_reqwest_error(&err),
                    format!("posting to {}: {err}", self.endpoint),
                )
            })?;

        let status = resp.status();
        if status.is_success() {
            debug!(endpoint = %self.endpoint, documents = documents.len(), %status, "batch accepted");
            return Ok(());
        }
        Err(self.error(
            classify_status(status),
            format!("http status {status} from {}", self.endpoint),
        ))
    }
}

/// Keeps appended batches in memory, in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<OutputDocument>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn batches(&self) -> Vec<Vec<OutputDocument>> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl SinkWriter for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, documents: &[OutputDocument]) -> Result<(), ExtractError> {
        self.batches.lock().await.push(documents.to_vec());
        Ok(())
    }
}

/// SHA-256 over the compact JSON encoding of a batch; identifies a batch in
/// logs so repeated appends can be spotted downstream.
pub fn batch_digest(documents: &[OutputDocument]) -> String {
    let mut hasher = Sha256::new();
    match serde_json::to_vec(documents) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => hasher.update(documents.len().to_be_bytes()),
    }
    hex::encode(hasher.finalize())
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

/// Map a sqlx failure onto the extractor's error kinds.
pub fn classify_sqlx_error(err: sqlx::Error) -> ExtractError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ExtractError::Connectivity(err.to_string()),
        // undefined_table: the watermark table was never provisioned
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01") => {
            ExtractError::NotInitialized
        }
        _ => ExtractError::Query(err.to_string()),
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
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
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

const PROFILE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS customers (
        customer_id SERIAL PRIMARY KEY,
        name VARCHAR(100),
        last_name VARCHAR(100),
        gender VARCHAR(10),
        date_of_birth DATE,
        home_address VARCHAR(255),
        home_city VARCHAR(100),
        postal_code VARCHAR(20),
        country VARCHAR(100),
        iso_country_code VARCHAR(10),
        mobile_phone VARCHAR(20),
        email VARCHAR(100) UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retail_preferences (
        retail_preference_id SERIAL PRIMARY KEY,
        customer_id INT REFERENCES customers(customer_id),
        favourite_color VARCHAR(50),
        favourite_category VARCHAR(50),
        favourite_subcategory VARCHAR(50),
        shirt_size VARCHAR(10),
        pants_size VARCHAR(10),
        shoe_size INT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS marketing_preferences (
        marketing_preference_id SERIAL PRIMARY KEY,
        customer_id INT REFERENCES customers(customer_id),
        consent BOOLEAN,
        preferred_communication VARCHAR(20)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loyalty_data (
        loyalty_data_id SERIAL PRIMARY KEY,
        loyalty_number_id BIGINT UNIQUE,
        customer_id INT REFERENCES customers(customer_id),
        date_joined DATE,
        points INT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_data (
        system_data_id SERIAL PRIMARY KEY,
        customer_id INT REFERENCES customers(customer_id),
        profile_creation_date TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS watermark (
        last_extracted TIMESTAMP
    )
    "#,
];

/// Outcome of [`provision_schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionReport {
    pub tables: usize,
    pub watermark_seeded: bool,
}

/// Idempotently create the profile tables and the watermark row.
///
/// The watermark is seeded with [`Watermark::minimum`] only when the table is
/// empty, so re-running never rewinds an existing checkpoint.
pub async fn provision_schema(pool: &PgPool) -> anyhow::Result<ProvisionReport> {
    let mut tx = pool.begin().await.context("starting provisioning transaction")?;
    for statement in PROFILE_SCHEMA {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .context("creating profile tables")?;
    }

    let existing: i64 = sqlx::query("SELECT COUNT(*) AS n FROM watermark")
        .fetch_one(&mut *tx)
        .await
        .context("counting watermark rows")?
        .try_get("n")
        .context("reading watermark row count")?;

    let watermark_seeded = existing == 0;
    if watermark_seeded {
        sqlx::query("INSERT INTO watermark (last_extracted) VALUES ($1)")
            .bind(Watermark::minimum().as_naive())
            .execute(&mut *tx)
            .await
            .context("seeding watermark")?;
    }
    tx.commit().await.context("committing provisioning transaction")?;

    Ok(ProvisionReport {
        tables: PROFILE_SCHEMA.len(),
        watermark_seeded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pcdc_core::{transform, ProfileRecord};
    use std::pin::Pin;
    use std::task::{ready, Context as TaskContext, Poll};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn record(customer_id: i32, second: u32) -> ProfileRecord {
        ProfileRecord {
            customer_id,
            first_name: Some(format!("First{customer_id}")),
            last_name: Some("Tester".into()),
            gender: None,
            date_of_birth: NaiveDate::from_ymd_opt(1985, 6, 15),
            home_address: None,
            home_city: None,
            postal_code: None,
            country: None,
            iso_country_code: None,
            mobile_phone: None,
            email: Some(format!("user{customer_id}@example.com")),
            favourite_color: None,
            favourite_category: None,
            favourite_subcategory: None,
            shirt_size: None,
            pants_size: None,
            shoe_size: None,
            consent: Some(false),
            preferred_communication: None,
            loyalty_number_id: None,
            date_joined: None,
            points: None,
            profile_creation_date: NaiveDate::from_ymd_opt(2024, 2, 1)
                .unwrap()
                .and_hms_opt(8, 0, second)
                .unwrap(),
        }
    }

    fn docs(ids: &[i32]) -> Vec<OutputDocument> {
        ids.iter()
            .map(|id| transform(&record(*id, *id as u32), 2024))
            .collect()
    }

    #[tokio::test]
    async fn file_sink_appends_batches_with_separator() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("profiles.json");
        let sink = JsonFileSink::new(&path);

        sink.append(&docs(&[1, 2])).await.expect("first append");
        sink.append(&docs(&[3])).await.expect("second append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("[\n    {\n        \"createDate\""));
        assert_eq!(text.matches("],\n[").count(), 1);

        let batches = load_file_batches(&path).await.expect("load");
        assert_eq!(batches.len(), 2);
        let first = batches[0].as_array().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["identification"]["customerId"], 1);
        assert_eq!(first[1]["identification"]["customerId"], 2);
        assert_eq!(batches[1][0]["identification"]["customerId"], 3);
    }

    #[tokio::test]
    async fn file_sink_duplicates_repeated_batch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("profiles.json");
        let sink = JsonFileSink::new(&path);
        let batch = docs(&[5]);

        sink.append(&batch).await.unwrap();
        sink.append(&batch).await.unwrap();

        let batches = load_file_batches(&path).await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], batches[1]);
    }

    /// Appending file that refuses writes once `budget` bytes have gone through.
    struct ShortFile {
        file: fs::File,
        budget: usize,
    }

    impl AsyncWrite for ShortFile {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.budget == 0 {
                ready!(Pin::new(&mut self.file).poll_flush(cx))?;
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "file too large",
                )));
            }
            let take = buf.len().min(self.budget);
            let n = ready!(Pin::new(&mut self.file).poll_write(cx, &buf[..take]))?;
            self.budget -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.file).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.file).poll_shutdown(cx)
        }
    }

    #[async_trait]
    impl BatchFile for ShortFile {
        async fn sync(&mut self) -> std::io::Result<()> {
            self.file.sync_all().await
        }

        async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.file.set_len(len).await
        }
    }

    #[tokio::test]
    async fn failed_append_is_cut_back_to_last_batch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("profiles.json");
        let sink = JsonFileSink::new(&path);
        sink.append(&docs(&[1])).await.expect("first append");
        let boundary = std::fs::metadata(&path).unwrap().len();

        let file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        let mut short = ShortFile { file, budget: 64 };
        let body = encode_batch(&docs(&[2, 3, 4])).unwrap();
        assert!(body.len() > 64);
        let err = write_batch(&mut short, boundary, &body).await.unwrap_err();
        assert_eq!(err.to_string(), "file too large");
        drop(short);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), boundary);
        assert_eq!(load_file_batches(&path).await.unwrap().len(), 1);

        sink.append(&docs(&[2, 3, 4])).await.expect("retried append");
        let batches = load_file_batches(&path).await.expect("load");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].as_array().unwrap().len(), 3);
        assert_eq!(batches[1][0]["identification"]["customerId"], 2);
    }

    #[tokio::test]
    async fn memory_sink_preserves_batch_order() {
        let sink = MemorySink::new();
        sink.append(&docs(&[3, 1, 2])).await.unwrap();
        let batches = sink.batches().await;
        let ids: Vec<i32> = batches[0]
            .iter()
            .map(|d| d.identification.customer_id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn in_memory_watermark_tracks_history() {
        let store = InMemoryWatermarkStore::new(Watermark::minimum());
        assert_eq!(store.load().await.unwrap(), Watermark::minimum());

        let a = record(1, 1).watermark();
        let b = record(2, 2).watermark();
        store.advance(a).await.unwrap();
        store.advance(b).await.unwrap();

        assert_eq!(store.load().await.unwrap(), b);
        assert_eq!(store.history().await, vec![a, b]);
    }

    #[tokio::test]
    async fn uninitialized_watermark_is_reported() {
        let store = InMemoryWatermarkStore::uninitialized();
        assert_eq!(store.load().await, Err(ExtractError::NotInitialized));
        assert_eq!(
            store.advance(Watermark::minimum()).await,
            Err(ExtractError::NotInitialized)
        );
    }

    #[test]
    fn batch_digest_is_order_sensitive() {
        let forward = batch_digest(&docs(&[1, 2]));
        assert_eq!(forward, batch_digest(&docs(&[1, 2])));
        assert_ne!(forward, batch_digest(&docs(&[2, 1])));
        assert_eq!(forward.len(), 64);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        buf.len() >= head_end + 4 + length
    }

    /// Serve a single request with `status_line` and return the endpoint.
    async fn collector_replying(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            let response =
                format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/profiles")
    }

    #[tokio::test]
    async fn http_sink_maps_collector_responses() {
        let timeout = Duration::from_secs(5);

        let ok = HttpSink::new(collector_replying("HTTP/1.1 200 OK").await, timeout).unwrap();
        ok.append(&docs(&[1, 2])).await.expect("accepted");

        let busy = HttpSink::new(
            collector_replying("HTTP/1.1 503 Service Unavailable").await,
            timeout,
        )
        .unwrap();
        let err = busy.append(&docs(&[1])).await.unwrap_err();
        assert!(matches!(&err, ExtractError::Sink { sink, .. } if sink == "http"));
        assert!(err.is_retryable());

        let picky = HttpSink::new(
            collector_replying("HTTP/1.1 400 Bad Request").await,
            timeout,
        )
        .unwrap();
        let err = picky.append(&docs(&[1])).await.unwrap_err();
        assert!(matches!(err, ExtractError::SinkRejected { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn http_sink_treats_refused_connection_as_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = HttpSink::new(format!("http://{addr}/profiles"), Duration::from_secs(5)).unwrap();
        let err = sink.append(&docs(&[1])).await.unwrap_err();
        assert!(matches!(err, ExtractError::Sink { .. }), "got {err:?}");
    }

    #[test]
    fn sqlx_errors_split_connectivity_from_query() {
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::PoolTimedOut),
            ExtractError::Connectivity(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused"
            ))),
            ExtractError::Connectivity(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::RowNotFound),
            ExtractError::Query(_)
        ));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
