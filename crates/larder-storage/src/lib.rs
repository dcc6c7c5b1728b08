//! Tracker persistence + HTTP plumbing shared by the catalog and destination clients.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use larder_core::{ImageType, RecordError, RecordUpdate, SyncStatus, TrackerRecord};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "larder-storage";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("reading tracker {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing tracker {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing tracker {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing tracker: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// When tracker mutations reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Rewrite the file after every upsert/remove.
    #[default]
    PerMutation,
    /// Keep changes in memory until `flush`.
    Deferred,
}

/// Durable map of source id -> sync record, backed by one JSON document.
///
/// Assumes a single writer; no file locking is performed.
#[derive(Debug)]
pub struct Tracker {
    path: PathBuf,
    records: BTreeMap<String, TrackerRecord>,
    write_mode: WriteMode,
    dirty: bool,
}

impl Tracker {
    /// Reads the whole map. A missing file is an empty tracker; a corrupt one is an error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        let records = match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|source| TrackerError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(TrackerError::Read { path, source }),
        };
        debug!(path = %path.display(), records = records.len(), "tracker loaded");
        Ok(Self {
            path,
            records,
            write_mode: WriteMode::default(),
            dirty: false,
        })
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &BTreeMap<String, TrackerRecord> {
        &self.records
    }

    pub fn get(&self, source_id: &str) -> Option<&TrackerRecord> {
        self.records.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids_with_status(&self, status: SyncStatus) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.source_id.clone())
            .collect()
    }

    /// Merges `update` onto the existing record (or defaults) and persists it.
    pub async fn upsert(
        &mut self,
        source_id: &str,
        update: RecordUpdate,
    ) -> Result<TrackerRecord, TrackerError> {
        let record =
            TrackerRecord::merged(source_id, self.records.get(source_id), update, Utc::now())?;
        self.records.insert(source_id.to_string(), record.clone());
        self.mark_dirty().await?;
        Ok(record)
    }

    pub async fn remove(&mut self, source_id: &str) -> Result<Option<TrackerRecord>, TrackerError> {
        let removed = self.records.remove(source_id);
        if removed.is_some() {
            self.mark_dirty().await?;
            info!(source_id, "removed from tracker");
        }
        Ok(removed)
    }

    /// Inserts whole records, replacing any with the same id.
    pub async fn import(
        &mut self,
        records: impl IntoIterator<Item = TrackerRecord>,
    ) -> Result<usize, TrackerError> {
        let mut count = 0usize;
        for record in records {
            self.records.insert(record.source_id.clone(), record);
            count += 1;
        }
        if count > 0 {
            self.mark_dirty().await?;
        }
        Ok(count)
    }

    pub async fn flush(&mut self) -> Result<(), TrackerError> {
        if !self.dirty {
            return Ok(());
        }
        self.persist().await?;
        self.dirty = false;
        Ok(())
    }

    async fn mark_dirty(&mut self) -> Result<(), TrackerError> {
        self.dirty = true;
        if self.write_mode == WriteMode::PerMutation {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes the map through a temp file + rename so readers never see a torn document.
    async fn persist(&self) -> Result<(), TrackerError> {
        let bytes = serde_json::to_vec_pretty(&self.records)?;
        let write_err = |source| TrackerError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(write_err)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "tracker.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(write_err)?;
        file.write_all(&bytes).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(err));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ExportRow {
    #[serde(rename = "Whisk Id", default)]
    source_id: Option<String>,
    #[serde(rename = "Notion Id", default)]
    destination_id: Option<String>,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(rename = "Image Type", default)]
    image_type: Option<String>,
    #[serde(rename = "Video?", default)]
    video: Option<String>,
    #[serde(rename = "Made?", default)]
    made: Option<String>,
    #[serde(rename = "Instruction Photos", default)]
    instruction_photos: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSeed {
    pub records: Vec<TrackerRecord>,
    pub skipped: usize,
}

fn csv_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn csv_image_type(value: Option<&str>) -> ImageType {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("file_upload") => ImageType::FileUpload,
        Some("none") => ImageType::NoImage,
        _ => ImageType::External,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Lowercase ASCII slug: spaces become hyphens, everything else non-alphanumeric is dropped.
pub fn slugify_title(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
        } else if (ch == ' ' || ch == '-') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "unknown-recipe".to_string()
    } else {
        slug
    }
}

/// Seeds tracker records from a destination export (one row per mirrored document).
pub fn records_from_export_csv(
    reader: impl Read,
    now: DateTime<Utc>,
) -> Result<CsvSeed, csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut records = Vec::new();
    let mut skipped = 0usize;

    for row in csv_reader.deserialize::<ExportRow>() {
        let row = row?;
        let (Some(source_id), Some(destination_id)) =
            (non_empty(row.source_id), non_empty(row.destination_id))
        else {
            skipped += 1;
            warn!("skipping export row with missing ids");
            continue;
        };
        records.push(TrackerRecord {
            source_id,
            destination_id: Some(destination_id),
            image_type: csv_image_type(row.image_type.as_deref()),
            has_video: csv_flag(row.video.as_deref()),
            has_instruction_media: csv_flag(row.instruction_photos.as_deref()),
            was_reviewed: csv_flag(row.made.as_deref()),
            status: SyncStatus::New,
            title: Some(slugify_title(row.title.as_deref().unwrap_or_default())),
            rejection_reason: None,
            last_synced: now,
        });
    }

    Ok(CsvSeed { records, skipped })
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
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

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Errors that can report a "too many requests" answer from the remote side.
pub trait Throttled {
    fn is_throttled(&self) -> bool;

    /// Server-provided wait hint, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub bucket: Option<TokenBucketConfig>,
    pub max_attempts: usize,
    pub base_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bucket: Some(TokenBucketConfig {
                capacity: 3,
                refill_every: Duration::from_millis(334),
            }),
            max_attempts: 5,
            base_wait: Duration::from_secs(1),
        }
    }
}

/// Wraps any remote operation with a local token bucket and backoff on throttled answers.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<SimpleTokenBucket>,
    max_attempts: usize,
    base_wait: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: config
                .bucket
                .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every)),
            max_attempts: config.max_attempts.max(1),
            base_wait: config.base_wait,
        }
    }

    /// Runs `op` until it succeeds, fails without throttling, or runs out of attempts.
    /// The last throttled error is returned once attempts are exhausted.
    pub async fn call<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Throttled,
    {
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.bucket {
                bucket.take().await;
            }
            match op().await {
                Err(err) if err.is_throttled() && attempt + 1 < self.max_attempts => {
                    let wait = err.retry_after().unwrap_or(self.base_wait)
                        + self.base_wait.saturating_mul(attempt as u32);
                    warn!(
                        label,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
