//! Core domain model for the tariff monitor: snapshots, the tariff catalog and the download registry.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tarifas-core";

/// Values whose named string fields drive change detection.
///
/// Two values are considered equal for persistence purposes iff their tracked
/// field maps are equal; nothing else about them is compared.
pub trait Tracked {
    fn tracked_fields(&self) -> BTreeMap<String, String>;
}

/// An observation of a tracked payload at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<P> {
    #[serde(flatten)]
    pub payload: P,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
}

impl<P: Tracked> Snapshot<P> {
    pub fn new(payload: P, observed_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            observed_at,
        }
    }

    pub fn fields(&self) -> BTreeMap<String, String> {
        self.payload.tracked_fields()
    }

    /// Field-wise equality; the observation time is ignored.
    pub fn same_fields(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }
}

/// Record-level attributes for concerns that have none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoAttributes {}

/// On-disk unit of state for one concern: the current snapshot, the snapshots it
/// superseded (oldest first) and untracked record-level attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord<P, A = NoAttributes> {
    #[serde(flatten)]
    pub attributes: A,
    #[serde(flatten)]
    pub current: Snapshot<P>,
    #[serde(rename = "verificado")]
    pub verified: bool,
    #[serde(rename = "historial", default = "Vec::new")]
    pub history: Vec<Snapshot<P>>,
}

impl<P, A> PersistedRecord<P, A> {
    pub fn first(attributes: A, current: Snapshot<P>) -> Self {
        Self {
            attributes,
            current,
            verified: true,
            history: Vec::new(),
        }
    }

    /// Replaces `current`, moving the superseded snapshot to the end of the history.
    pub fn superseded_by(self, attributes: A, candidate: Snapshot<P>) -> Self {
        let mut history = self.history;
        history.push(self.current);
        Self {
            attributes,
            current: candidate,
            verified: true,
            history,
        }
    }
}

/// Where the regulator's home page settles and where its tariffs link points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectObservation {
    pub url_final: String,
    pub url_tarifas_vigentes: Option<String>,
}

impl Tracked for RedirectObservation {
    fn tracked_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("url_final".to_string(), self.url_final.clone()),
            (
                "url_tarifas_vigentes".to_string(),
                self.url_tarifas_vigentes.clone().unwrap_or_default(),
            ),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectAttributes {
    pub url_original: String,
}

pub type RedirectRecord = PersistedRecord<RedirectObservation, RedirectAttributes>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffLink {
    #[serde(rename = "localidad")]
    pub locality: String,
    #[serde(rename = "url_pdf")]
    pub pdf_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyEntry {
    #[serde(rename = "empresa")]
    pub name: String,
    #[serde(rename = "tarifas", default)]
    pub tariffs: Vec<TariffLink>,
}

impl CompanyEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tariffs: Vec::new(),
        }
    }
}

/// Structured company → locality → PDF URL listing scraped from the tariffs page.
///
/// Companies keep source-page order. The observation time lives on the
/// enclosing [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(rename = "url_tarifas")]
    pub source_url: String,
    #[serde(rename = "empresas", default)]
    pub companies: Vec<CompanyEntry>,
    #[serde(rename = "total_empresas", default)]
    pub total_companies: usize,
}

impl Catalog {
    pub fn new(source_url: impl Into<String>, companies: Vec<CompanyEntry>) -> Self {
        let total_companies = companies.len();
        Self {
            source_url: source_url.into(),
            companies,
            total_companies,
        }
    }

    /// Every (company, tariff) pair in document order.
    pub fn pairs(&self) -> impl Iterator<Item = (&CompanyEntry, &TariffLink)> {
        self.companies
            .iter()
            .flat_map(|company| company.tariffs.iter().map(move |tariff| (company, tariff)))
    }

    pub fn pdf_count(&self) -> usize {
        self.companies.iter().map(|c| c.tariffs.len()).sum()
    }
}

impl Tracked for Catalog {
    /// One field per company, keyed by name, holding its sorted tariff lines.
    fn tracked_fields(&self) -> BTreeMap<String, String> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for company in &self.companies {
            let lines = grouped.entry(format!("empresa:{}", company.name)).or_default();
            lines.extend(
                company
                    .tariffs
                    .iter()
                    .map(|t| format!("{}\t{}", t.locality, t.pdf_url)),
            );
        }
        grouped
            .into_iter()
            .map(|(key, mut lines)| {
                lines.sort();
                (key, lines.join("\n"))
            })
            .collect()
    }
}

pub type CatalogRecord = PersistedRecord<Catalog>;

/// Identity of a download target. Two companies pointing at the same URL are
/// still two targets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadKey {
    pub company: String,
    pub locality: String,
}

impl DownloadKey {
    pub fn new(company: impl Into<String>, locality: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            locality: locality.into(),
        }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.company, self.locality)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    #[serde(rename = "exitoso")]
    Succeeded,
    #[serde(rename = "fallido")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRegistryEntry {
    #[serde(rename = "empresa")]
    pub company: String,
    #[serde(rename = "localidad")]
    pub locality: String,
    #[serde(rename = "url_pdf")]
    pub pdf_url: String,
    #[serde(rename = "ruta_local")]
    pub local_path: String,
    #[serde(rename = "timestamp")]
    pub downloaded_at: DateTime<Utc>,
    #[serde(rename = "estado")]
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadRegistryEntry {
    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(self.company.clone(), self.locality.clone())
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == DownloadStatus::Succeeded
    }
}

/// The registry as it stood at one write, without its own history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "ultima_actualizacion", default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "entradas", default, with = "entry_map")]
    pub entries: BTreeMap<DownloadKey, DownloadRegistryEntry>,
}

/// Persisted ledger of which PDFs were fetched, keyed by (company, locality).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRegistry {
    #[serde(rename = "ultima_actualizacion", default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "entradas", default, with = "entry_map")]
    pub entries: BTreeMap<DownloadKey, DownloadRegistryEntry>,
    #[serde(rename = "historial", default = "Vec::new")]
    pub history: Vec<RegistrySnapshot>,
}

impl DownloadRegistry {
    pub fn get(&self, key: &DownloadKey) -> Option<&DownloadRegistryEntry> {
        self.entries.get(key)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            updated_at: self.updated_at,
            entries: self.entries.clone(),
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.len() - self.succeeded_count()
    }
}

/// Serializes registry entries as a JSON object keyed by `company::locality`.
/// Keys are rebuilt from the entries on load, so the key string is informational.
mod entry_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{DownloadKey, DownloadRegistryEntry};

    pub fn serialize<S: Serializer>(
        entries: &BTreeMap<DownloadKey, DownloadRegistryEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        entries
            .iter()
            .map(|(key, entry)| (key.to_string(), entry))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<DownloadKey, DownloadRegistryEntry>, D::Error> {
        let raw = BTreeMap::<String, DownloadRegistryEntry>::deserialize(deserializer)?;
        Ok(raw.into_values().map(|entry| (entry.key(), entry)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn link(locality: &str, url: &str) -> TariffLink {
        TariffLink {
            locality: locality.to_string(),
            pdf_url: url.to_string(),
        }
    }

    #[test]
    fn catalog_fields_ignore_company_and_locality_order() {
        let a = Catalog::new(
            "https://www.siss.gob.cl/tarifas",
            vec![
                CompanyEntry {
                    name: "Aguas Andinas".into(),
                    tariffs: vec![link("Santiago", "/a.pdf"), link("Maipu", "/b.pdf")],
                },
                CompanyEntry::new("Esval"),
            ],
        );
        let b = Catalog::new(
            "https://www.siss.gob.cl/otra",
            vec![
                CompanyEntry::new("Esval"),
                CompanyEntry {
                    name: "Aguas Andinas".into(),
                    tariffs: vec![link("Maipu", "/b.pdf"), link("Santiago", "/a.pdf")],
                },
            ],
        );
        assert_eq!(a.tracked_fields(), b.tracked_fields());
        assert_eq!(a.tracked_fields().get("empresa:Esval").map(String::as_str), Some(""));
    }

    #[test]
    fn redirect_record_matches_persisted_layout() {
        let first = RedirectRecord::first(
            RedirectAttributes {
                url_original: "https://www.siss.gob.cl".into(),
            },
            Snapshot::new(
                RedirectObservation {
                    url_final: "https://www.siss.gob.cl/586/w3-channel.html".into(),
                    url_tarifas_vigentes: Some("https://www.siss.gob.cl/586/w3-article-1.html".into()),
                },
                ts(1),
            ),
        );
        let record = first.superseded_by(
            RedirectAttributes {
                url_original: "https://www.siss.gob.cl".into(),
            },
            Snapshot::new(
                RedirectObservation {
                    url_final: "https://www.siss.gob.cl/587/w3-channel.html".into(),
                    url_tarifas_vigentes: None,
                },
                ts(2),
            ),
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["url_original"], "https://www.siss.gob.cl");
        assert_eq!(value["url_final"], "https://www.siss.gob.cl/587/w3-channel.html");
        assert!(value["url_tarifas_vigentes"].is_null());
        assert_eq!(value["verificado"], true);
        let history = value["historial"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        let keys: Vec<_> = history[0].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["timestamp", "url_final", "url_tarifas_vigentes"]);

        let back: RedirectRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn catalog_record_without_history_loads_empty() {
        let json = serde_json::json!({
            "url_tarifas": "https://www.siss.gob.cl/586/w3-propertyvalue-6385.html",
            "empresas": [
                {"empresa": "Esval", "tarifas": [{"localidad": "Valparaíso", "url_pdf": "https://www.siss.gob.cl/v.pdf"}]}
            ],
            "total_empresas": 1,
            "timestamp": "2026-03-01T01:00:00Z",
            "verificado": true
        });
        let record: CatalogRecord = serde_json::from_value(json).unwrap();
        assert!(record.history.is_empty());
        assert_eq!(record.current.observed_at, ts(1));
        assert_eq!(record.current.payload.companies[0].tariffs[0].locality, "Valparaíso");

        let superseded = record.clone().superseded_by(
            NoAttributes::default(),
            Snapshot::new(Catalog::new("https://www.siss.gob.cl/otra", Vec::new()), ts(2)),
        );
        let back: CatalogRecord = serde_json::from_value(serde_json::to_value(&superseded).unwrap()).unwrap();
        assert_eq!(back.history, vec![record.current]);
    }

    #[test]
    fn registry_entries_are_rekeyed_from_their_fields() {
        let json = serde_json::json!({
            "ultima_actualizacion": "2026-03-01T01:00:00Z",
            "entradas": {
                "stale label": {
                    "empresa": "Esval",
                    "localidad": "Valparaíso",
                    "url_pdf": "https://www.siss.gob.cl/x.pdf",
                    "ruta_local": "data/pdfs/Esval/Valparaíso.pdf",
                    "timestamp": "2026-03-01T01:00:00Z",
                    "estado": "exitoso"
                }
            }
        });
        let registry: DownloadRegistry = serde_json::from_value(json).unwrap();
        let key = DownloadKey::new("Esval", "Valparaíso");
        assert!(registry.get(&key).unwrap().is_succeeded());
        assert!(registry.history.is_empty());

        let value = serde_json::to_value(&registry).unwrap();
        assert!(value["entradas"].get("Esval::Valparaíso").is_some());
    }
}
