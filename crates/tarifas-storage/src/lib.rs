//! HTTP fetch utilities, atomic file writes and the change-detecting snapshot store.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
pub use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tarifas_core::{PersistedRecord, Snapshot, Tracked};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tarifas-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: u64,
}

fn temp_path_for(path: &Path, byte_len: usize) -> PathBuf {
    let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), byte_len);
    match path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Replace `path` with `bytes` through a sibling temp file and a rename, so a
/// reader never observes a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_path = temp_path_for(path, bytes.len());
    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(StoredFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        byte_size: bytes.len() as u64,
    })
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Retry without sleeping between attempts.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
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
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// URL the response was served from, after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn ok(final_url: impl Into<String>, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::OK,
            final_url: final_url.into(),
            content_type: content_type.map(str::to_string),
            body: body.into(),
        }
    }

    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(FetchError::HttpStatus {
                status: self.status.as_u16(),
                url: self.final_url,
            })
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// One GET, following server redirects. Non-2xx statuses are returned, not raised.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.ok();

        async {
            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?
                .to_vec();

            debug!(status = status.as_u16(), %final_url, bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                content_type,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}

#[derive(Debug)]
pub struct RetriedFetch {
    pub result: Result<FetchedResponse, FetchError>,
    pub attempts: usize,
}

/// GET `url` until it succeeds with a 2xx, fails with a non-retryable error, or
/// `backoff.max_retries` retries are spent.
pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    timeout: Duration,
    backoff: &BackoffPolicy,
) -> RetriedFetch {
    let mut attempt = 0usize;
    loop {
        let result = fetcher
            .get(url, timeout)
            .await
            .and_then(FetchedResponse::error_for_status);
        match result {
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < backoff.max_retries =>
            {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(url, attempt = attempt + 1, error = %err, ?delay, "transient fetch failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => {
                return RetriedFetch {
                    result,
                    attempts: attempt + 1,
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing state for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("persisted state at {path} is malformed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing state to {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// What to do with a state file that exists but cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorruptStatePolicy {
    /// Log a warning and behave as if nothing was ever recorded.
    #[default]
    #[serde(rename = "first-run")]
    TreatAsFirstRun,
    #[serde(rename = "fail")]
    Fail,
}

impl FromStr for CorruptStatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first-run" | "first_run" | "degrade" => Ok(Self::TreatAsFirstRun),
            "fail" | "strict" => Ok(Self::Fail),
            other => Err(format!("unknown corrupt-state policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub changed: bool,
    pub changed_fields: BTreeSet<String>,
}

impl SnapshotDiff {
    pub fn contains(&self, field: &str) -> bool {
        self.changed_fields.contains(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub persisted: bool,
    pub is_first_run: bool,
    pub diff: SnapshotDiff,
}

/// Loads, diffs and conditionally rewrites JSON state files.
///
/// Single writer per file is assumed; there is no locking.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotStore {
    policy: CorruptStatePolicy,
}

impl SnapshotStore {
    pub fn new(policy: CorruptStatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> CorruptStatePolicy {
        self.policy
    }

    /// `Ok(None)` means first run: the file is missing, or (under
    /// [`CorruptStatePolicy::TreatAsFirstRun`]) unreadable.
    pub async fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, PersistenceError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return match self.policy {
                    CorruptStatePolicy::TreatAsFirstRun => {
                        warn!(path = %path.display(), error = %err, "unreadable state file, treating as first run");
                        Ok(None)
                    }
                    CorruptStatePolicy::Fail => Err(PersistenceError::Io {
                        path: path.to_path_buf(),
                        source: err,
                    }),
                };
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(err) => match self.policy {
                CorruptStatePolicy::TreatAsFirstRun => {
                    warn!(path = %path.display(), error = %err, "malformed state file, treating as first run");
                    Ok(None)
                }
                CorruptStatePolicy::Fail => Err(PersistenceError::Corrupt {
                    path: path.to_path_buf(),
                    source: err,
                }),
            },
        }
    }

    /// Field-by-field comparison. Without a previous record every candidate
    /// field counts as changed.
    pub fn diff<P: Tracked, A>(
        previous: Option<&PersistedRecord<P, A>>,
        candidate: &Snapshot<P>,
    ) -> SnapshotDiff {
        let next = candidate.fields();
        let Some(previous) = previous else {
            return SnapshotDiff {
                changed: true,
                changed_fields: next.into_keys().collect(),
            };
        };

        let prior = previous.current.fields();
        let names: HashSet<&String> = prior.keys().chain(next.keys()).collect();
        let changed_fields: BTreeSet<String> = names
            .into_iter()
            .filter(|name| prior.get(*name) != next.get(*name))
            .cloned()
            .collect();

        SnapshotDiff {
            changed: !changed_fields.is_empty(),
            changed_fields,
        }
    }

    /// Write a new record only when the candidate differs from `previous`.
    /// On an update the superseded snapshot is appended to the history.
    pub async fn persist_if_changed<P, A>(
        &self,
        path: &Path,
        previous: Option<PersistedRecord<P, A>>,
        attributes: A,
        candidate: Snapshot<P>,
    ) -> Result<PersistOutcome, PersistenceError>
    where
        P: Tracked + Serialize,
        A: Serialize,
    {
        let diff = Self::diff(previous.as_ref(), &candidate);
        let is_first_run = previous.is_none();
        if !diff.changed {
            debug!(path = %path.display(), "no tracked field changed, leaving state untouched");
            return Ok(PersistOutcome {
                persisted: false,
                is_first_run,
                diff,
            });
        }

        let record = match previous {
            Some(previous) => previous.superseded_by(attributes, candidate),
            None => PersistedRecord::first(attributes, candidate),
        };
        self.write(path, &record).await?;
        info!(
            path = %path.display(),
            first_run = is_first_run,
            history = record.history.len(),
            changed = ?diff.changed_fields,
            "state persisted"
        );

        Ok(PersistOutcome {
            persisted: true,
            is_first_run,
            diff,
        })
    }

    /// Pretty JSON, whole-file atomic replace through [`write_atomic`].
    pub async fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), PersistenceError> {
        let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        bytes.push(b'\n');
        let stored = write_atomic(path, &bytes)
            .await
            .map_err(|source| PersistenceError::Write {
                path: path.to_path_buf(),
                reason: format!("{source:#}"),
            })?;
        debug!(path = %stored.path.display(), bytes = stored.byte_size, "state file written");
        Ok(())
    }
}
