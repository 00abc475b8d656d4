//! Monitor configuration and the verification facade: redirect check, catalog
//! monitoring and the separate incremental PDF download.

pub mod downloads;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tarifas_adapters::{extract_catalog, find_link_by_text, resolve_redirect, ResolveError};
use tarifas_core::{
    Catalog, CatalogRecord, DownloadKey, DownloadRegistry, NoAttributes, RedirectAttributes, RedirectObservation,
    RedirectRecord, Snapshot,
};
use tarifas_storage::{
    BackoffPolicy, CorruptStatePolicy, HttpClientConfig, HttpFetcher, PageFetcher, PersistOutcome,
    SnapshotStore,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use downloads::{
    execute_downloads, find_path_collisions, plan_downloads, sanitize_segment, update_registry,
    Cancellation, DownloadError, DownloadOrchestrator, DownloadRunResult, PendingDownload, PlanReason,
};

pub const CRATE_NAME: &str = "tarifas-sync";

pub const REDIRECT_FILE: &str = "siss_url.json";
pub const CATALOG_FILE: &str = "tarifas_empresas.json";
pub const REGISTRY_FILE: &str = "registro_descargas.json";
pub const PDF_DIR: &str = "pdfs";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub start_url: String,
    pub link_text: String,
    pub data_dir: PathBuf,
    pub redirect_file: Option<PathBuf>,
    pub catalog_file: Option<PathBuf>,
    pub registry_file: Option<PathBuf>,
    pub pdf_dir: Option<PathBuf>,
    pub page_timeout: Duration,
    pub download_timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
    pub download_concurrency: usize,
    pub corrupt_state: CorruptStatePolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            start_url: "https://www.siss.gob.cl".to_string(),
            link_text: "Tarifas vigentes".to_string(),
            data_dir: PathBuf::from("data"),
            redirect_file: None,
            catalog_file: None,
            registry_file: None,
            pdf_dir: None,
            page_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            user_agent: format!("tarifas-monitor/{}", env!("CARGO_PKG_VERSION")),
            backoff: BackoffPolicy::default(),
            download_concurrency: 4,
            corrupt_state: CorruptStatePolicy::default(),
        }
    }
}

/// Optional overrides read from a YAML file. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub start_url: Option<String>,
    pub link_text: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub redirect_file: Option<PathBuf>,
    pub catalog_file: Option<PathBuf>,
    pub registry_file: Option<PathBuf>,
    pub pdf_dir: Option<PathBuf>,
    pub http_timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub max_retries: Option<usize>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub download_concurrency: Option<usize>,
    pub corrupt_state: Option<CorruptStatePolicy>,
}

impl MonitorConfig {
    /// Defaults overridden by `TARIFAS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Defaults, then the YAML file at `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: ConfigFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_file(file);
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.start_url {
            self.start_url = v;
        }
        if let Some(v) = file.link_text {
            self.link_text = v;
        }
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        self.redirect_file = file.redirect_file.or(self.redirect_file.take());
        self.catalog_file = file.catalog_file.or(self.catalog_file.take());
        self.registry_file = file.registry_file.or(self.registry_file.take());
        self.pdf_dir = file.pdf_dir.or(self.pdf_dir.take());
        if let Some(v) = file.http_timeout_secs {
            self.page_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.download_timeout_secs {
            self.download_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.max_retries {
            self.backoff.max_retries = v;
        }
        if let Some(v) = file.retry_base_delay_ms {
            self.backoff.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.retry_max_delay_ms {
            self.backoff.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.download_concurrency {
            self.download_concurrency = v.max(1);
        }
        if let Some(v) = file.corrupt_state {
            self.corrupt_state = v;
        }
    }

    /// Values that fail to parse leave the current setting in place.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparsable environment value");
                    None
                }
            }
        };

        if let Some(v) = lookup("TARIFAS_START_URL") {
            self.start_url = v;
        }
        if let Some(v) = lookup("TARIFAS_LINK_TEXT") {
            self.link_text = v;
        }
        if let Some(v) = lookup("TARIFAS_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TARIFAS_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = parsed("TARIFAS_HTTP_TIMEOUT_SECS") {
            self.page_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed("TARIFAS_DOWNLOAD_TIMEOUT_SECS") {
            self.download_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed("TARIFAS_MAX_RETRIES") {
            self.backoff.max_retries = v as usize;
        }
        if let Some(v) = parsed("TARIFAS_DOWNLOAD_CONCURRENCY") {
            self.download_concurrency = (v as usize).max(1);
        }
        if let Some(raw) = lookup("TARIFAS_CORRUPT_STATE") {
            match raw.parse() {
                Ok(policy) => self.corrupt_state = policy,
                Err(err) => warn!(value = %raw, error = %err, "ignoring TARIFAS_CORRUPT_STATE"),
            }
        }
    }

    pub fn redirect_path(&self) -> PathBuf {
        self.redirect_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(REDIRECT_FILE))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(CATALOG_FILE))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(REGISTRY_FILE))
    }

    pub fn pdf_root(&self) -> PathBuf {
        self.pdf_dir.clone().unwrap_or_else(|| self.data_dir.join(PDF_DIR))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.page_timeout.max(self.download_timeout),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.download_concurrency.max(1),
        }
    }
}

fn persist_message(outcome: &PersistOutcome) -> &'static str {
    match (outcome.persisted, outcome.is_first_run) {
        (true, true) => "first verification saved",
        (true, false) => "changes detected and saved",
        (false, _) => "no changes, nothing saved",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    pub url_original: String,
    pub url_final: Option<String>,
    pub url_tarifas_vigentes: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub output_path: PathBuf,
    pub persisted: bool,
    pub is_first_run: bool,
    pub changed: bool,
    pub changed_fields: BTreeSet<String>,
}

impl VerificationResult {
    fn failed(url_original: &str, output_path: &Path, message: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            error: Some(error.to_string()),
            url_original: url_original.to_string(),
            url_final: None,
            url_tarifas_vigentes: None,
            timestamp: Utc::now(),
            output_path: output_path.to_path_buf(),
            persisted: false,
            is_first_run: false,
            changed: false,
            changed_fields: BTreeSet::new(),
        }
    }

    pub fn url_final_changed(&self) -> bool {
        self.changed_fields.contains("url_final")
    }

    pub fn url_tarifas_changed(&self) -> bool {
        self.changed_fields.contains("url_tarifas_vigentes")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    pub tariffs_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub output_path: PathBuf,
    pub total_companies: usize,
    pub total_pdfs: usize,
    pub persisted: bool,
    pub is_first_run: bool,
    pub changed: bool,
    /// Companies that appeared, vanished or whose tariffs differ.
    pub changed_companies: Vec<String>,
}

impl MonitorResult {
    fn failed(tariffs_url: Option<&str>, output_path: &Path, message: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            error: Some(error.to_string()),
            tariffs_url: tariffs_url.map(str::to_string),
            timestamp: Utc::now(),
            output_path: output_path.to_path_buf(),
            total_companies: 0,
            total_pdfs: 0,
            persisted: false,
            is_first_run: false,
            changed: false,
            changed_companies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadItemReport {
    pub company: String,
    pub locality: String,
    pub pdf_url: String,
    pub local_path: PathBuf,
    pub reason: PlanReason,
    pub status: ItemStatus,
    pub attempts: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
    pub run_id: Uuid,
    pub total_pdfs: usize,
    pub planned: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub is_first_run: bool,
    pub registry_written: bool,
    /// One line per planned item, in plan (catalog) order.
    pub items: Vec<DownloadItemReport>,
}

impl DownloadReport {
    fn failed(run_id: Uuid, message: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            error: Some(error.to_string()),
            run_id,
            total_pdfs: 0,
            planned: 0,
            downloaded: 0,
            failed: 0,
            cancelled: 0,
            is_first_run: false,
            registry_written: false,
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub verification: VerificationResult,
    pub monitor: MonitorResult,
    pub download: DownloadReport,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.verification.success && self.monitor.success && self.download.success
    }
}

/// The externally invoked operations. Each is idempotent and reports failure in
/// its result instead of returning an error.
pub struct TariffMonitor {
    config: MonitorConfig,
    fetcher: Arc<dyn PageFetcher>,
    store: SnapshotStore,
}

impl TariffMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: MonitorConfig, fetcher: Arc<dyn PageFetcher>) -> Self {
        let store = SnapshotStore::new(config.corrupt_state);
        Self {
            config,
            fetcher,
            store,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Resolve the start URL's redirects and the tariffs link on the landing
    /// page, and record both in `output_path` when either moved.
    pub async fn verify_redirect(&self, output_path: &Path) -> VerificationResult {
        let url_original = self.config.start_url.as_str();
        let timeout = self.config.page_timeout;
        let observed_at = Utc::now();

        let url_final = match resolve_redirect(self.fetcher.as_ref(), url_original, timeout).await {
            Ok(url) => url,
            Err(err) => {
                warn!(url = url_original, error = %err, "redirect resolution failed");
                return VerificationResult::failed(url_original, output_path, "could not reach start url", err);
            }
        };

        let url_tarifas_vigentes = match find_link_by_text(
            self.fetcher.as_ref(),
            &url_final,
            &self.config.link_text,
            timeout,
        )
        .await
        {
            Ok(url) => Some(url),
            Err(err @ ResolveError::NotFound { .. }) => {
                warn!(error = %err, "tariffs link not found, recording its absence");
                None
            }
            Err(err) => {
                warn!(url = %url_final, error = %err, "landing page lookup failed");
                return VerificationResult::failed(url_original, output_path, "could not read landing page", err);
            }
        };

        let previous: Option<RedirectRecord> = match self.store.load(output_path).await {
            Ok(previous) => previous,
            Err(err) => {
                return VerificationResult::failed(url_original, output_path, "could not load previous state", err)
            }
        };
        let candidate = Snapshot::new(
            RedirectObservation {
                url_final: url_final.clone(),
                url_tarifas_vigentes: url_tarifas_vigentes.clone(),
            },
            observed_at,
        );
        let attributes = RedirectAttributes {
            url_original: url_original.to_string(),
        };

        match self
            .store
            .persist_if_changed(output_path, previous, attributes, candidate)
            .await
        {
            Ok(outcome) => VerificationResult {
                success: true,
                message: persist_message(&outcome).to_string(),
                error: None,
                url_original: url_original.to_string(),
                url_final: Some(url_final),
                url_tarifas_vigentes,
                timestamp: observed_at,
                output_path: output_path.to_path_buf(),
                persisted: outcome.persisted,
                is_first_run: outcome.is_first_run,
                changed: outcome.diff.changed,
                changed_fields: outcome.diff.changed_fields,
            },
            Err(err) => VerificationResult::failed(url_original, output_path, "could not save verification", err),
        }
    }

    /// Locate the tariffs page from the start URL, then monitor it.
    pub async fn monitor_tariffs(&self, output_path: &Path) -> MonitorResult {
        let timeout = self.config.page_timeout;
        let landing = match resolve_redirect(self.fetcher.as_ref(), &self.config.start_url, timeout).await {
            Ok(url) => url,
            Err(err) => return MonitorResult::failed(None, output_path, "could not reach start url", err),
        };
        let tariffs_url =
            match find_link_by_text(self.fetcher.as_ref(), &landing, &self.config.link_text, timeout).await {
                Ok(url) => url,
                Err(err) => {
                    warn!(error = %err, "tariffs page not located");
                    return MonitorResult::failed(None, output_path, "tariffs link not found", err);
                }
            };
        self.monitor_tariffs_at(&tariffs_url, output_path).await
    }

    /// Extract the catalog at `tariffs_url` and record it in `output_path` when
    /// any company changed.
    pub async fn monitor_tariffs_at(&self, tariffs_url: &str, output_path: &Path) -> MonitorResult {
        let observed_at = Utc::now();
        let catalog = match extract_catalog(self.fetcher.as_ref(), tariffs_url, self.config.page_timeout).await {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(url = tariffs_url, error = %err, "catalog extraction failed");
                return MonitorResult::failed(Some(tariffs_url), output_path, "could not extract catalog", err);
            }
        };
        if catalog.companies.is_empty() {
            return MonitorResult::failed(
                Some(tariffs_url),
                output_path,
                "no companies found",
                format!("no company groupings recognized on {tariffs_url}"),
            );
        }
        let total_companies = catalog.total_companies;
        let total_pdfs = catalog.pdf_count();

        let previous: Option<CatalogRecord> = match self.store.load(output_path).await {
            Ok(previous) => previous,
            Err(err) => {
                return MonitorResult::failed(Some(tariffs_url), output_path, "could not load previous state", err)
            }
        };

        match self
            .store
            .persist_if_changed(output_path, previous, NoAttributes {}, Snapshot::new(catalog, observed_at))
            .await
        {
            Ok(outcome) => MonitorResult {
                success: true,
                message: persist_message(&outcome).to_string(),
                error: None,
                tariffs_url: Some(tariffs_url.to_string()),
                timestamp: observed_at,
                output_path: output_path.to_path_buf(),
                total_companies,
                total_pdfs,
                persisted: outcome.persisted,
                is_first_run: outcome.is_first_run,
                changed: outcome.diff.changed,
                changed_companies: outcome
                    .diff
                    .changed_fields
                    .iter()
                    .map(|field| field.strip_prefix("empresa:").unwrap_or(field).to_string())
                    .collect(),
            },
            Err(err) => MonitorResult::failed(Some(tariffs_url), output_path, "could not save catalog", err),
        }
    }

    /// Fetch every catalog PDF not yet downloaded from its current URL and
    /// record the outcomes in the registry.
    pub async fn download_pdfs(
        &self,
        catalog_path: &Path,
        destination_root: &Path,
        registry_path: &Path,
        cancel: &Cancellation,
    ) -> DownloadReport {
        let run_id = Uuid::new_v4();
        self.download_run(run_id, catalog_path, destination_root, registry_path, cancel)
            .instrument(info_span!("download_run", %run_id))
            .await
    }

    async fn download_run(
        &self,
        run_id: Uuid,
        catalog_path: &Path,
        destination_root: &Path,
        registry_path: &Path,
        cancel: &Cancellation,
    ) -> DownloadReport {
        let catalog: Catalog = match self.store.load::<CatalogRecord>(catalog_path).await {
            Ok(Some(record)) => record.current.payload,
            Ok(None) => {
                return DownloadReport::failed(
                    run_id,
                    "no catalog to download from",
                    format!("{} is missing; run the tariff monitor first", catalog_path.display()),
                )
            }
            Err(err) => return DownloadReport::failed(run_id, "could not load catalog", err),
        };
        let registry = match self.store.load::<DownloadRegistry>(registry_path).await {
            Ok(registry) => registry,
            Err(err) => return DownloadReport::failed(run_id, "could not load download registry", err),
        };
        let is_first_run = registry.is_none();
        let registry = registry.unwrap_or_default();

        for collision in find_path_collisions(&catalog) {
            let keys: Vec<String> = collision.keys.iter().map(ToString::to_string).collect();
            warn!(path = %collision.relative_path.display(), ?keys, "distinct catalog entries share a download path");
        }

        let plan = plan_downloads(&catalog, &registry);
        let total_pdfs = catalog.pdf_count();
        let planned = plan.len();
        info!(total_pdfs, planned, first_run = is_first_run, "download plan ready");

        if plan.is_empty() {
            return DownloadReport {
                success: true,
                message: "all PDFs up to date, nothing to download".to_string(),
                error: None,
                run_id,
                total_pdfs,
                planned,
                downloaded: 0,
                failed: 0,
                cancelled: 0,
                is_first_run,
                registry_written: false,
                items: Vec::new(),
            };
        }

        let plan_order: HashMap<DownloadKey, usize> = plan
            .iter()
            .enumerate()
            .map(|(idx, pending)| (pending.key.clone(), idx))
            .collect();
        let run = DownloadOrchestrator::new(
            Arc::clone(&self.fetcher),
            self.config.download_timeout,
            self.config.backoff,
        )
        .with_concurrency(self.config.download_concurrency)
        .execute(plan, destination_root, cancel)
        .await;

        let position = |key: &DownloadKey| plan_order.get(key).copied().unwrap_or(usize::MAX);
        let mut ordered: Vec<(usize, DownloadItemReport)> = Vec::with_capacity(planned);
        ordered.extend(run.succeeded.iter().map(|done| {
            (
                position(&done.pending.key),
                DownloadItemReport {
                    company: done.entry.company.clone(),
                    locality: done.entry.locality.clone(),
                    pdf_url: done.entry.pdf_url.clone(),
                    local_path: destination_root.join(&done.pending.relative_path),
                    reason: done.pending.reason,
                    status: ItemStatus::Succeeded,
                    attempts: done.attempts,
                    error: None,
                },
            )
        }));
        ordered.extend(run.failed.iter().map(|failed| {
            (
                position(&failed.pending.key),
                DownloadItemReport {
                    company: failed.entry.company.clone(),
                    locality: failed.entry.locality.clone(),
                    pdf_url: failed.entry.pdf_url.clone(),
                    local_path: destination_root.join(&failed.pending.relative_path),
                    reason: failed.pending.reason,
                    status: ItemStatus::Failed,
                    attempts: failed.attempts,
                    error: Some(failed.error.to_string()),
                },
            )
        }));
        ordered.extend(run.cancelled.iter().map(|pending| {
            (
                position(&pending.key),
                DownloadItemReport {
                    company: pending.key.company.clone(),
                    locality: pending.key.locality.clone(),
                    pdf_url: pending.pdf_url.clone(),
                    local_path: destination_root.join(&pending.relative_path),
                    reason: pending.reason,
                    status: ItemStatus::Cancelled,
                    attempts: 0,
                    error: None,
                },
            )
        }));
        ordered.sort_by_key(|(idx, _)| *idx);
        let items: Vec<DownloadItemReport> = ordered.into_iter().map(|(_, item)| item).collect();

        let (downloaded, failed, cancelled) = (run.succeeded.len(), run.failed.len(), run.cancelled.len());
        let mut report = DownloadReport {
            success: true,
            message: format!("downloaded {downloaded} of {planned} planned PDFs, {failed} failed, {cancelled} cancelled"),
            error: None,
            run_id,
            total_pdfs,
            planned,
            downloaded,
            failed,
            cancelled,
            is_first_run,
            registry_written: false,
            items,
        };

        if run.completed_count() == 0 {
            info!("no download completed, registry left untouched");
            return report;
        }

        let registry = update_registry(registry, &run, Utc::now());
        match self.store.write(registry_path, &registry).await {
            Ok(()) => {
                report.registry_written = true;
                info!(
                    path = %registry_path.display(),
                    entries = registry.entries.len(),
                    succeeded = registry.succeeded_count(),
                    failed = registry.failed_count(),
                    "download registry saved"
                );
            }
            Err(err) => {
                report.success = false;
                report.message = "downloads finished but the registry could not be saved".to_string();
                report.error = Some(err.to_string());
            }
        }
        report
    }

    /// Verify, monitor and download once, using the configured paths.
    pub async fn run_once(&self, cancel: &Cancellation) -> RunSummary {
        let verification = self.verify_redirect(&self.config.redirect_path()).await;
        let monitor = match verification.url_tarifas_vigentes.as_deref() {
            Some(tariffs_url) => self.monitor_tariffs_at(tariffs_url, &self.config.catalog_path()).await,
            None => self.monitor_tariffs(&self.config.catalog_path()).await,
        };
        let download = self
            .download_pdfs(
                &self.config.catalog_path(),
                &self.config.pdf_root(),
                &self.config.registry_path(),
                cancel,
            )
            .await;
        RunSummary {
            verification,
            monitor,
            download,
        }
    }
}
