use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tarifas_core::{CatalogRecord, DownloadKey, DownloadRegistry, DownloadStatus};
use tarifas_storage::{BackoffPolicy, FetchError, FetchedResponse, PageFetcher, SnapshotStore, StatusCode};
use tarifas_sync::{
    plan_downloads, Cancellation, ItemStatus, MonitorConfig, PlanReason, TariffMonitor,
};
use tempfile::{tempdir, TempDir};

const START: &str = "https://www.siss.gob.cl";
const LANDING: &str = "https://www.siss.gob.cl/586/w3-channel.html";
const TARIFFS: &str = "https://www.siss.gob.cl/586/w3-propertyvalue-6385.html";

#[derive(Clone)]
enum Page {
    Html { final_url: String, body: String },
    Pdf(Vec<u8>),
    Status(u16),
}

/// In-memory regulator site whose pages can be swapped between runs.
#[derive(Default)]
struct FakeSite {
    pages: Mutex<HashMap<String, Page>>,
    hits: Mutex<HashMap<String, usize>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl FakeSite {
    fn set(&self, url: &str, page: Page) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    fn landing(&self, final_url: &str, tariffs_href: Option<&str>) {
        let link = tariffs_href
            .map(|href| format!(r#"<a href="{href}">Ver Tarifas vigentes aquí</a>"#))
            .unwrap_or_default();
        self.set(
            START,
            Page::Html {
                final_url: final_url.to_string(),
                body: format!("<html><body><a href=\"/586/w3-channel.html\">Inicio</a>{link}</body></html>"),
            },
        );
        self.set(
            final_url,
            Page::Html {
                final_url: final_url.to_string(),
                body: format!("<html><body>{link}</body></html>"),
            },
        );
    }

    fn tariffs(&self, companies: &[(&str, &[(&str, &str)])]) {
        let mut body = String::from("<html><body>");
        for (name, rows) in companies {
            body.push_str(&format!("<h3>{name} - Tarifas vigentes</h3><table><tr><th>Localidad</th><th>Tarifa vigente</th></tr>"));
            for (locality, href) in rows.iter() {
                body.push_str(&format!(r#"<tr><td>{locality}</td><td><a href="{href}">PDF</a></td></tr>"#));
            }
            body.push_str("</table>");
        }
        body.push_str("</body></html>");
        self.set(
            TARIFFS,
            Page::Html {
                final_url: TARIFFS.to_string(),
                body,
            },
        );
    }

    fn pdf(&self, url: &str) {
        self.set(url, Page::Pdf(format!("%PDF-1.4 {url}").into_bytes()));
    }

    fn slow(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for FakeSite {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<FetchedResponse, FetchError> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let delay = self.delays.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let page = self.pages.lock().unwrap().get(url).cloned().unwrap_or(Page::Status(404));
        Ok(match page {
            Page::Html { final_url, body } => FetchedResponse::ok(final_url, Some("text/html; charset=utf-8"), body),
            Page::Pdf(bytes) => FetchedResponse::ok(url, Some("application/pdf"), bytes),
            Page::Status(code) => {
                let mut resp = FetchedResponse::ok(url, Some("text/html"), "error");
                resp.status = StatusCode::from_u16(code).unwrap();
                resp
            }
        })
    }
}

fn pdf_url(name: &str) -> String {
    format!("https://www.siss.gob.cl/586/articles-{name}.pdf")
}

fn setup() -> (TempDir, Arc<FakeSite>, TariffMonitor) {
    let dir = tempdir().expect("tempdir");
    let site = Arc::new(FakeSite::default());
    let mut config = MonitorConfig::default();
    config.start_url = START.to_string();
    config.data_dir = dir.path().to_path_buf();
    config.backoff = BackoffPolicy::immediate(1);
    config.download_concurrency = 2;
    let monitor = TariffMonitor::with_fetcher(config, site.clone());
    (dir, site, monitor)
}

fn two_companies(site: &FakeSite, maipu: &str) {
    site.tariffs(&[
        (
            "Aguas Andinas S.A.",
            &[("Gran Santiago", "/586/articles-santiago.pdf"), ("Maipú", maipu)],
        ),
        ("Esval S.A.", &[("Valparaíso", "/586/articles-valparaiso.pdf")]),
    ]);
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).expect("read state")).expect("parse state")
}

async fn download(monitor: &TariffMonitor) -> tarifas_sync::DownloadReport {
    let config = monitor.config();
    monitor
        .download_pdfs(
            &config.catalog_path(),
            &config.pdf_root(),
            &config.registry_path(),
            &Cancellation::new(),
        )
        .await
}

#[tokio::test]
async fn verify_redirect_is_idempotent() {
    let (_dir, site, monitor) = setup();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    let path = monitor.config().redirect_path();

    let first = monitor.verify_redirect(&path).await;
    assert!(first.success, "{first:?}");
    assert!(first.persisted && first.is_first_run);
    assert_eq!(first.message, "first verification saved");
    assert_eq!(first.url_final.as_deref(), Some(LANDING));
    assert_eq!(first.url_tarifas_vigentes.as_deref(), Some(TARIFFS));
    assert!(first.url_final_changed() && first.url_tarifas_changed());
    let bytes = std::fs::read(&path).unwrap();

    let second = monitor.verify_redirect(&path).await;
    assert!(second.success);
    assert!(!second.persisted && !second.changed && !second.is_first_run);
    assert_eq!(second.message, "no changes, nothing saved");
    assert_eq!(std::fs::read(&path).unwrap(), bytes);

    let state = read_json(&path);
    assert_eq!(state["url_original"], START);
    assert_eq!(state["verificado"], true);
    assert_eq!(state["historial"], Value::Array(vec![]));
}

#[tokio::test]
async fn redirect_history_grows_once_per_change() {
    let (_dir, site, monitor) = setup();
    let path = monitor.config().redirect_path();
    let landings = [
        "https://www.siss.gob.cl/586/w3-channel.html",
        "https://www.siss.gob.cl/587/w3-channel.html",
        "https://www.siss.gob.cl/587/w3-channel.html",
        "https://www.siss.gob.cl/588/w3-channel.html",
    ];

    for landing in landings {
        site.landing(landing, Some("/586/w3-propertyvalue-6385.html"));
        assert!(monitor.verify_redirect(&path).await.success);
    }

    let state = read_json(&path);
    let history: Vec<_> = state["historial"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["url_final"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(history, vec![landings[0], landings[1]]);
    assert_eq!(state["url_final"], landings[3]);
}

#[tokio::test]
async fn missing_tariffs_link_is_recorded_not_fatal() {
    let (_dir, site, monitor) = setup();
    let path = monitor.config().redirect_path();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    monitor.verify_redirect(&path).await;

    site.landing(LANDING, None);
    let result = monitor.verify_redirect(&path).await;
    assert!(result.success);
    assert!(result.persisted);
    assert_eq!(result.url_tarifas_vigentes, None);
    assert!(result.url_tarifas_changed() && !result.url_final_changed());
    assert_eq!(result.message, "changes detected and saved");
}

#[tokio::test]
async fn unreachable_start_url_fails_without_writing() {
    let (_dir, site, monitor) = setup();
    site.set(START, Page::Status(503));
    let path = monitor.config().redirect_path();

    let result = monitor.verify_redirect(&path).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("503"));
    assert!(!path.exists());
    assert_eq!(site.hits(START), 1);
}

#[tokio::test]
async fn monitor_refuses_pages_without_link_or_companies() {
    let (_dir, site, monitor) = setup();
    let path = monitor.config().catalog_path();

    site.landing(LANDING, None);
    let no_link = monitor.monitor_tariffs(&path).await;
    assert!(!no_link.success);
    assert_eq!(no_link.message, "tariffs link not found");

    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    site.tariffs(&[]);
    let empty = monitor.monitor_tariffs(&path).await;
    assert!(!empty.success);
    assert_eq!(empty.message, "no companies found");
    assert!(!path.exists());
}

#[tokio::test]
async fn catalog_change_drives_an_incremental_download() {
    let (dir, site, monitor) = setup();
    let config = monitor.config().clone();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    two_companies(&site, "/586/articles-maipu.pdf");
    for name in ["santiago", "maipu", "valparaiso", "maipu-2026"] {
        site.pdf(&pdf_url(name));
    }

    let first = monitor.monitor_tariffs(&config.catalog_path()).await;
    assert!(first.success, "{first:?}");
    assert!(first.is_first_run && first.persisted);
    assert_eq!((first.total_companies, first.total_pdfs), (2, 3));
    assert_eq!(read_json(&config.catalog_path())["historial"], Value::Array(vec![]));

    let record: CatalogRecord = SnapshotStore::default().load(&config.catalog_path()).await.unwrap().unwrap();
    assert_eq!(plan_downloads(&record.current.payload, &DownloadRegistry::default()).len(), 3);

    let run1 = download(&monitor).await;
    assert!(run1.success && run1.registry_written && run1.is_first_run);
    assert_eq!((run1.planned, run1.downloaded, run1.failed), (3, 3, 0));
    let santiago = dir.path().join("pdfs").join("Aguas_Andinas_S.A.").join("Gran_Santiago.pdf");
    assert!(std::fs::read(&santiago).unwrap().starts_with(b"%PDF"));

    let unchanged = monitor.monitor_tariffs(&config.catalog_path()).await;
    assert!(unchanged.success && !unchanged.changed);
    let idle = download(&monitor).await;
    assert_eq!(idle.planned, 0);
    assert!(!idle.registry_written);

    two_companies(&site, "/586/articles-maipu-2026.pdf");
    let changed = monitor.monitor_tariffs(&config.catalog_path()).await;
    assert!(changed.changed && changed.persisted && !changed.is_first_run);
    assert_eq!(changed.changed_companies, vec!["Aguas Andinas S.A.".to_string()]);
    let state = read_json(&config.catalog_path());
    assert_eq!(state["historial"].as_array().unwrap().len(), 1);
    assert_eq!(state["total_empresas"], 2);

    let run2 = download(&monitor).await;
    assert_eq!(run2.planned, 1);
    assert_eq!(run2.items[0].locality, "Maipú");
    assert_eq!(run2.items[0].reason, PlanReason::UrlChanged);
    assert_eq!(site.hits(&pdf_url("santiago")), 1);

    let registry: DownloadRegistry = SnapshotStore::default().load(&config.registry_path()).await.unwrap().unwrap();
    assert_eq!(registry.succeeded_count(), 3);
    assert_eq!(registry.history.len(), 1);
    let maipu = registry.get(&DownloadKey::new("Aguas Andinas S.A.", "Maipú")).unwrap();
    assert_eq!(maipu.pdf_url, pdf_url("maipu-2026"));
    assert_eq!(maipu.sha256.as_deref().map(str::len), Some(64));
}

#[tokio::test]
async fn failed_downloads_are_retried_on_the_next_run() {
    let (_dir, site, monitor) = setup();
    let config = monitor.config().clone();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    two_companies(&site, "/586/articles-maipu.pdf");
    site.pdf(&pdf_url("santiago"));
    site.pdf(&pdf_url("valparaiso"));
    site.set(&pdf_url("maipu"), Page::Status(500));

    assert!(monitor.monitor_tariffs(&config.catalog_path()).await.success);
    let run1 = download(&monitor).await;
    assert_eq!((run1.downloaded, run1.failed), (2, 1));
    assert!(run1.success && run1.registry_written);
    let failed = run1.items.iter().find(|i| i.status == ItemStatus::Failed).unwrap();
    assert_eq!(failed.attempts, 2);
    assert_eq!(site.hits(&pdf_url("maipu")), 2);

    let registry: DownloadRegistry = SnapshotStore::default().load(&config.registry_path()).await.unwrap().unwrap();
    let entry = registry.get(&DownloadKey::new("Aguas Andinas S.A.", "Maipú")).unwrap();
    assert_eq!(entry.status, DownloadStatus::Failed);
    assert!(entry.error.is_some());

    site.pdf(&pdf_url("maipu"));
    let run2 = download(&monitor).await;
    assert_eq!((run2.planned, run2.downloaded), (1, 1));
    assert_eq!(run2.items[0].reason, PlanReason::RetryFailed);

    let registry: DownloadRegistry = SnapshotStore::default().load(&config.registry_path()).await.unwrap().unwrap();
    assert_eq!(registry.succeeded_count(), 3);
    assert_eq!(registry.failed_count(), 0);
}

#[tokio::test]
async fn report_items_follow_catalog_order_not_completion_order() {
    let (_dir, site, monitor) = setup();
    let config = monitor.config().clone();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    two_companies(&site, "/586/articles-maipu.pdf");
    site.pdf(&pdf_url("santiago"));
    site.slow(&pdf_url("santiago"), Duration::from_millis(200));
    site.set(&pdf_url("maipu"), Page::Status(404));
    site.pdf(&pdf_url("valparaiso"));

    assert!(monitor.monitor_tariffs(&config.catalog_path()).await.success);
    let run = download(&monitor).await;
    assert_eq!((run.downloaded, run.failed), (2, 1));
    let order: Vec<_> = run
        .items
        .iter()
        .map(|item| (item.locality.as_str(), item.status))
        .collect();
    assert_eq!(
        order,
        vec![
            ("Gran Santiago", ItemStatus::Succeeded),
            ("Maipú", ItemStatus::Failed),
            ("Valparaíso", ItemStatus::Succeeded),
        ]
    );
}

#[tokio::test]
async fn download_without_catalog_reports_failure() {
    let (_dir, _site, monitor) = setup();
    let report = download(&monitor).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("tarifas_empresas.json"));
    assert!(!monitor.config().registry_path().exists());
}

#[tokio::test]
async fn corrupt_catalog_state_degrades_to_first_run() {
    let (_dir, site, monitor) = setup();
    let path = monitor.config().catalog_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"empresas\": [").unwrap();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    two_companies(&site, "/586/articles-maipu.pdf");

    let result = monitor.monitor_tariffs(&path).await;
    assert!(result.success);
    assert!(result.is_first_run && result.persisted);
    assert_eq!(read_json(&path)["total_empresas"], 2);
}

#[tokio::test]
async fn run_once_chains_all_three_operations() {
    let (_dir, site, monitor) = setup();
    site.landing(LANDING, Some("/586/w3-propertyvalue-6385.html"));
    two_companies(&site, "/586/articles-maipu.pdf");
    for name in ["santiago", "maipu", "valparaiso"] {
        site.pdf(&pdf_url(name));
    }

    let summary = monitor.run_once(&Cancellation::new()).await;
    assert!(summary.success(), "{summary:?}");
    assert_eq!(summary.download.downloaded, 3);
    assert!(monitor.config().redirect_path().exists());
}
