//! Core data models used throughout the recall index.
//!
//! These types represent the raw agency records, canonical recalls, duplicate
//! links, and ingestion runs that flow through the ingestion and matching
//! pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::normalize::canonical_code;
use crate::similarity::normalize_text;

/// Code of the agency that published a recall (e.g. `CPSC`, `FDA`).
///
/// Always stored upper-case and trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyCode(String);

impl AgencyCode {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for AgencyCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Cursor marking how far a fetch progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Watermark {
    Timestamp(DateTime<Utc>),
    Opaque(String),
}

impl Watermark {
    /// The later of two watermarks. Opaque cursors are positional, so the
    /// most recently observed one wins.
    pub fn advance(current: Option<Watermark>, seen: Watermark) -> Watermark {
        match (current, seen) {
            (Some(Watermark::Timestamp(a)), Watermark::Timestamp(b)) => {
                Watermark::Timestamp(a.max(b))
            }
            (_, seen) => seen,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Watermark::Timestamp(ts) => Some(*ts),
            Watermark::Opaque(_) => None,
        }
    }

    /// Parse a CLI/API value: RFC 3339, a bare `YYYY-MM-DD`, or an opaque token.
    pub fn parse(value: &str) -> Watermark {
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Watermark::Timestamp(ts.with_timezone(&Utc));
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return Watermark::Timestamp(dt.and_utc());
            }
        }
        Watermark::Opaque(value.to_string())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Watermark::Opaque(token) => f.write_str(token),
        }
    }
}

/// One record as returned by an agency feed, before normalization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub agency_code: AgencyCode,
    /// Human-meaningful reference for error reports (native id or feed position).
    pub record_ref: String,
    pub payload: serde_json::Value,
    /// Watermark contributed by this record, if the feed exposes one.
    pub watermark: Option<Watermark>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentifierType {
    Upc,
    Ean,
    Gtin,
    Isbn,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Upc => "UPC",
            IdentifierType::Ean => "EAN",
            IdentifierType::Gtin => "GTIN",
            IdentifierType::Isbn => "ISBN",
        }
    }
}

impl FromStr for IdentifierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "UPC" | "UPC-A" | "UPC-E" => Ok(IdentifierType::Upc),
            "EAN" | "EAN-13" | "EAN-8" => Ok(IdentifierType::Ean),
            "GTIN" | "GTIN-14" => Ok(IdentifierType::Gtin),
            "ISBN" | "ISBN-10" | "ISBN-13" => Ok(IdentifierType::Isbn),
            other => Err(format!("unknown identifier type: {}", other)),
        }
    }
}

/// A product identifier (barcode) carried by a recall.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: IdentifierType,
    /// The code as published, with separators stripped.
    pub value: String,
}

impl Identifier {
    /// Zero-padded GTIN-14 form used as the exact-lookup key.
    pub fn canonical(&self) -> String {
        canonical_code(&self.value).unwrap_or_else(|| self.value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(Severity::High),
            "MEDIUM" => Ok(Severity::Medium),
            "LOW" => Ok(Severity::Low),
            "UNKNOWN" => Ok(Severity::Unknown),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// One normalized recall notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecall {
    pub recall_id: String,
    pub agency_code: AgencyCode,
    pub agency_native_id: String,
    pub product_name: String,
    pub brand: String,
    pub model_number: String,
    pub identifiers: BTreeSet<Identifier>,
    pub hazard_description: String,
    pub remedy: String,
    pub severity: Severity,
    pub risk_category: String,
    pub recall_date: NaiveDate,
    pub region: String,
    pub source_url: Option<String>,
    pub raw_payload: String,
    pub dedupe_key: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// The agency-supplied fields that define "content" for change detection.
#[derive(Serialize)]
struct ContentView<'a> {
    agency_code: &'a AgencyCode,
    agency_native_id: &'a str,
    product_name: &'a str,
    brand: &'a str,
    model_number: &'a str,
    identifiers: &'a BTreeSet<Identifier>,
    hazard_description: &'a str,
    remedy: &'a str,
    severity: Severity,
    risk_category: &'a str,
    recall_date: NaiveDate,
    region: &'a str,
    source_url: &'a Option<String>,
}

impl CanonicalRecall {
    /// SHA-256 over the agency-supplied fields.
    ///
    /// Timestamps, the raw payload, and derived keys are excluded, so an
    /// identical re-fetch hashes identically even when the feed envelope
    /// carries volatile metadata.
    pub fn content_hash(&self) -> String {
        let view = ContentView {
            agency_code: &self.agency_code,
            agency_native_id: &self.agency_native_id,
            product_name: &self.product_name,
            brand: &self.brand,
            model_number: &self.model_number,
            identifiers: &self.identifiers,
            hazard_description: &self.hazard_description,
            remedy: &self.remedy,
            severity: self.severity,
            risk_category: &self.risk_category,
            recall_date: self.recall_date,
            region: &self.region,
            source_url: &self.source_url,
        };
        let encoded = serde_json::to_vec(&view).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }
}

/// `AGENCY:native-id`, the globally unique recall key.
pub fn recall_id(agency: &AgencyCode, native_id: &str) -> String {
    format!("{}:{}", agency, native_id.trim())
}

/// Soft grouping key for "same real-world product, different agencies".
pub fn dedupe_key(brand: &str, model_number: &str, product_name: &str, region: &str) -> String {
    let model = normalize_text(model_number);
    let product_part = if model.is_empty() {
        let head: String = product_name.chars().take(24).collect();
        normalize_text(&head)
    } else {
        model
    };
    format!(
        "{}|{}|{}",
        normalize_text(brand),
        product_part,
        region.trim().to_uppercase()
    )
}

/// Relationship between two distinct recalls that likely describe the same product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateLink {
    /// The newer record that triggered the link.
    pub recall_id: String,
    /// The existing record it was matched against.
    pub linked_recall_id: String,
    pub similarity: f64,
    pub linked_at: DateTime<Utc>,
}

impl DuplicateLink {
    /// The recall on the other side of this link from `recall_id`.
    pub fn other(&self, recall_id: &str) -> &str {
        if self.recall_id == recall_id {
            &self.linked_recall_id
        } else {
            &self.recall_id
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// A record that was skipped during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub record_ref: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Permanent,
    RetriesExhausted,
    RunTimeout,
    Store,
    Orphaned,
    /// The worker task panicked mid-run.
    Panicked,
}

/// Why a run ended FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub class: FailureClass,
    pub message: String,
}

/// One execution of one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub agency_code: AgencyCode,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_fetched: u64,
    pub records_upserted: u64,
    pub records_skipped_errors: u64,
    pub records_linked: u64,
    pub watermark_before: Option<Watermark>,
    pub watermark_after: Option<Watermark>,
    pub error_summary: Vec<RecordError>,
    pub failure: Option<RunFailure>,
}

impl IngestionRun {
    pub fn pending(agency_code: AgencyCode, watermark_before: Option<Watermark>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agency_code,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            records_fetched: 0,
            records_upserted: 0,
            records_skipped_errors: 0,
            records_linked: 0,
            watermark_before,
            watermark_after: None,
            error_summary: Vec::new(),
            failure: None,
        }
    }

    /// Append to the bounded error summary. The skip counter is always bumped.
    pub fn record_skip(&mut self, record_ref: &str, reason: String, max_summary: usize) {
        self.records_skipped_errors += 1;
        if self.error_summary.len() < max_summary {
            self.error_summary.push(RecordError {
                record_ref: record_ref.to_string(),
                reason,
            });
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agency_code_is_normalized() {
        assert_eq!(AgencyCode::new(" cpsc ").as_str(), "CPSC");
        assert_eq!(recall_id(&AgencyCode::new("fda"), " F-123 "), "FDA:F-123");
    }

    #[test]
    fn dedupe_key_prefers_model_number() {
        let key = dedupe_key("Fisher-Price", "FHC12", "Rock 'n Play Sleeper", "us");
        assert_eq!(key, "fisher price|fhc12|US");
    }

    #[test]
    fn dedupe_key_falls_back_to_product_name_head() {
        let key = dedupe_key(
            "Acme",
            "",
            "Portable Electric Space Heater with Remote Control",
            "CA",
        );
        // 24 chars: "Portable Electric Space "
        assert_eq!(key, "acme|portable electric space|CA");
    }

    #[test]
    fn watermark_advance_keeps_latest_timestamp() {
        let early = Watermark::parse("2024-01-01");
        let late = Watermark::parse("2024-06-01T00:00:00Z");
        let advanced = Watermark::advance(Some(late.clone()), early);
        assert_eq!(advanced, late);
        let opaque = Watermark::advance(Some(late), Watermark::Opaque("page-9".into()));
        assert_eq!(opaque, Watermark::Opaque("page-9".into()));
    }

    #[test]
    fn record_skip_is_bounded() {
        let mut run = IngestionRun::pending(AgencyCode::new("CPSC"), None);
        for i in 0..10 {
            run.record_skip(&format!("r{}", i), "bad".into(), 3);
        }
        assert_eq!(run.records_skipped_errors, 10);
        assert_eq!(run.error_summary.len(), 3);
    }

    #[test]
    fn run_status_roundtrips_through_text() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::Cancelled.is_terminal());
    }
}
