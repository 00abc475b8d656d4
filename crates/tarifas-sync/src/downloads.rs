//! Incremental PDF harvesting: plan against the registry, fetch the delta, merge results back.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tarifas_core::{Catalog, DownloadKey, DownloadRegistry, DownloadRegistryEntry, DownloadStatus};
use tarifas_storage::{
    fetch_with_retry, write_atomic, BackoffPolicy, FetchError, FetchedResponse, PageFetcher, StoredFile,
};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url} is not a pdf: {reason}")]
    Malformed { url: String, reason: String },
    #[error("writing {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },
    #[error("download cancelled")]
    Cancelled,
}

/// Cooperative cancellation shared between a caller and in-flight downloads.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Maps a company or locality name to a single filesystem-safe path segment.
pub fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// `<company>/<locality>.pdf`, relative to the download root.
pub fn target_relative_path(key: &DownloadKey) -> PathBuf {
    PathBuf::from(sanitize_segment(&key.company))
        .join(format!("{}.pdf", sanitize_segment(&key.locality)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCollision {
    pub relative_path: PathBuf,
    pub keys: Vec<DownloadKey>,
}

/// Distinct catalog keys that sanitize to the same target file.
pub fn find_path_collisions(catalog: &Catalog) -> Vec<PathCollision> {
    let mut by_path: BTreeMap<PathBuf, Vec<DownloadKey>> = BTreeMap::new();
    for (company, tariff) in catalog.pairs() {
        let key = DownloadKey::new(company.name.as_str(), tariff.locality.as_str());
        let keys = by_path.entry(target_relative_path(&key)).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    by_path
        .into_iter()
        .filter(|(_, keys)| keys.len() > 1)
        .map(|(relative_path, keys)| PathCollision {
            relative_path,
            keys,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    New,
    UrlChanged,
    RetryFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDownload {
    pub key: DownloadKey,
    pub pdf_url: String,
    pub relative_path: PathBuf,
    pub reason: PlanReason,
}

/// Catalog pairs still to fetch, in catalog order.
///
/// A pair is skipped only when the registry holds a successful download for its
/// key from the same URL. Repeated keys in the catalog keep their first occurrence.
pub fn plan_downloads(catalog: &Catalog, registry: &DownloadRegistry) -> Vec<PendingDownload> {
    let mut seen = HashSet::new();
    let mut plan = Vec::new();
    for (company, tariff) in catalog.pairs() {
        let key = DownloadKey::new(company.name.as_str(), tariff.locality.as_str());
        if !seen.insert(key.clone()) {
            warn!(%key, pdf_url = %tariff.pdf_url, "duplicate catalog entry ignored");
            continue;
        }
        let reason = match registry.get(&key) {
            None => PlanReason::New,
            Some(prior) if prior.is_succeeded() && prior.pdf_url == tariff.pdf_url => continue,
            Some(prior) if prior.is_succeeded() => PlanReason::UrlChanged,
            Some(_) => PlanReason::RetryFailed,
        };
        plan.push(PendingDownload {
            relative_path: target_relative_path(&key),
            key,
            pdf_url: tariff.pdf_url.clone(),
            reason,
        });
    }
    plan
}

#[derive(Debug)]
pub struct CompletedDownload {
    pub pending: PendingDownload,
    pub entry: DownloadRegistryEntry,
    pub attempts: usize,
}

#[derive(Debug)]
pub struct FailedDownload {
    pub pending: PendingDownload,
    pub entry: DownloadRegistryEntry,
    pub error: DownloadError,
    pub attempts: usize,
}

/// Per-item outcomes of one run, each list in plan order.
#[derive(Debug, Default)]
pub struct DownloadRunResult {
    pub succeeded: Vec<CompletedDownload>,
    pub failed: Vec<FailedDownload>,
    pub cancelled: Vec<PendingDownload>,
}

impl DownloadRunResult {
    pub fn completed_count(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Downloads planned PDFs over a bounded number of concurrent fetches.
pub struct DownloadOrchestrator {
    fetcher: Arc<dyn PageFetcher>,
    timeout: Duration,
    backoff: BackoffPolicy,
    concurrency: usize,
}

impl DownloadOrchestrator {
    pub fn new(fetcher: Arc<dyn PageFetcher>, timeout: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            fetcher,
            timeout,
            backoff,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs `plan`, writing each PDF under `destination_root`. Cancelled items
    /// are reported separately and never produce a registry entry.
    pub async fn execute(
        &self,
        plan: Vec<PendingDownload>,
        destination_root: &Path,
        cancel: &Cancellation,
    ) -> DownloadRunResult {
        let mut outcomes: Vec<_> = stream::iter(plan.into_iter().enumerate())
            .map(|(index, pending)| async move {
                let (attempts, result) = self.download_one(&pending, destination_root, cancel).await;
                (index, pending, attempts, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, ..)| *index);

        let mut run = DownloadRunResult::default();
        for (_, pending, attempts, result) in outcomes {
            let local_path = destination_root.join(&pending.relative_path);
            match result {
                Ok(stored) => {
                    info!(key = %pending.key, path = %stored.path.display(), bytes = stored.byte_size, "pdf downloaded");
                    run.succeeded.push(CompletedDownload {
                        entry: registry_entry(&pending, &local_path, Ok(&stored)),
                        pending,
                        attempts,
                    });
                }
                Err(DownloadError::Cancelled) => run.cancelled.push(pending),
                Err(error) => {
                    warn!(key = %pending.key, url = %pending.pdf_url, attempts, %error, "pdf download failed");
                    run.failed.push(FailedDownload {
                        entry: registry_entry(&pending, &local_path, Err(&error)),
                        pending,
                        error,
                        attempts,
                    });
                }
            }
        }
        run
    }

    async fn download_one(
        &self,
        pending: &PendingDownload,
        destination_root: &Path,
        cancel: &Cancellation,
    ) -> (usize, Result<StoredFile, DownloadError>) {
        if cancel.is_cancelled() {
            return (0, Err(DownloadError::Cancelled));
        }
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (1, Err(DownloadError::Cancelled)),
            fetched = fetch_with_retry(self.fetcher.as_ref(), &pending.pdf_url, self.timeout, &self.backoff) => fetched,
        };
        let attempts = fetched.attempts;
        let result = match fetched.result {
            Ok(resp) => self.store(resp, pending, destination_root, cancel).await,
            Err(err) => Err(err.into()),
        };
        (attempts, result)
    }

    async fn store(
        &self,
        resp: FetchedResponse,
        pending: &PendingDownload,
        destination_root: &Path,
        cancel: &Cancellation,
    ) -> Result<StoredFile, DownloadError> {
        ensure_pdf(&resp)?;
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let path = destination_root.join(&pending.relative_path);
        write_atomic(&path, &resp.body)
            .await
            .map_err(|source| DownloadError::Write {
                reason: format!("{source:#}"),
                path,
            })
    }
}

/// Runs `plan` sequentially with up to `max_retries` immediate retries per item.
pub async fn execute_downloads(
    fetcher: Arc<dyn PageFetcher>,
    plan: Vec<PendingDownload>,
    destination_root: &Path,
    max_retries: usize,
    timeout: Duration,
) -> DownloadRunResult {
    DownloadOrchestrator::new(fetcher, timeout, BackoffPolicy::immediate(max_retries))
        .execute(plan, destination_root, &Cancellation::new())
        .await
}

fn ensure_pdf(resp: &FetchedResponse) -> Result<(), DownloadError> {
    let malformed = |reason: &str| DownloadError::Malformed {
        url: resp.final_url.clone(),
        reason: reason.to_string(),
    };
    if resp.body.is_empty() {
        return Err(malformed("empty body"));
    }
    let pdf_content_type = resp
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("pdf"));
    if !resp.body.starts_with(b"%PDF") && !pdf_content_type {
        let served_as = resp.content_type.as_deref().unwrap_or("no content type");
        return Err(malformed(&format!("missing %PDF header, served as {served_as}")));
    }
    Ok(())
}

fn registry_entry(
    pending: &PendingDownload,
    local_path: &Path,
    outcome: Result<&StoredFile, &DownloadError>,
) -> DownloadRegistryEntry {
    let (status, sha256, bytes, error) = match outcome {
        Ok(stored) => (
            DownloadStatus::Succeeded,
            Some(stored.sha256.clone()),
            Some(stored.byte_size),
            None,
        ),
        Err(err) => (DownloadStatus::Failed, None, None, Some(err.to_string())),
    };
    DownloadRegistryEntry {
        company: pending.key.company.clone(),
        locality: pending.key.locality.clone(),
        pdf_url: pending.pdf_url.clone(),
        local_path: local_path.display().to_string(),
        downloaded_at: Utc::now(),
        status,
        sha256,
        bytes,
        error,
    }
}

/// Merges a run into the registry.
///
/// Successes always replace the prior entry. A failure replaces only a prior
/// failure, a missing entry, or a success whose source URL has since changed.
/// A registry that was previously written gets its pre-merge state appended to
/// the history.
pub fn update_registry(
    mut registry: DownloadRegistry,
    run: &DownloadRunResult,
    updated_at: DateTime<Utc>,
) -> DownloadRegistry {
    let previous = registry.updated_at.is_some().then(|| registry.snapshot());

    for done in &run.succeeded {
        registry.entries.insert(done.entry.key(), done.entry.clone());
    }
    for failed in &run.failed {
        let key = failed.entry.key();
        let replace = match registry.entries.get(&key) {
            None => true,
            Some(prior) if !prior.is_succeeded() => true,
            Some(_) => failed.pending.reason == PlanReason::UrlChanged,
        };
        if replace {
            registry.entries.insert(key, failed.entry.clone());
        } else {
            debug!(%key, "keeping earlier successful download over failed re-check");
        }
    }

    if let Some(previous) = previous {
        registry.history.push(previous);
    }
    registry.updated_at = Some(updated_at);
    registry
}
