//! Normalization helpers shared by every agency connector.
//!
//! Agency feeds disagree on date formats, barcode spelling, severity
//! vocabulary, and how much HTML leaks into text fields. Connectors map their
//! payload onto a [`RecallDraft`] using these helpers and call
//! [`RecallDraft::finish`] to produce the canonical record, so the rules for
//! what makes a valid [`CanonicalRecall`] live in one place.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::agencies;
use crate::similarity::normalize_text;
use crate::error::NormalizationError;
use crate::models::{
    dedupe_key, recall_id, CanonicalRecall, Identifier, IdentifierType, RawRecord, Severity,
};

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static LABELLED_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(UPC|EAN|GTIN|ISBN)(?:-(?:A|E|8|10|13|14))?[^0-9]{0,24}((?:[0-9][0-9 \-]{6,18}[0-9X])(?:\s*(?:,|;|/|and)\s*[0-9][0-9 \-]{6,18}[0-9X])*)",
    )
    .expect("valid regex")
});

static CODE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:,|;|/|and)\s*").expect("valid regex"));

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y%m%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

// ============ Identifiers ============

fn strip_separators(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '.')
        .collect::<String>()
        .to_uppercase()
}

fn gs1_check_digit(body: &[u32]) -> u32 {
    let sum: u32 = body
        .iter()
        .rev()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d * 3 } else { *d })
        .sum();
    (10 - sum % 10) % 10
}

/// Whether the trailing GS1 check digit of a numeric code is correct.
pub fn has_valid_check_digit(code: &str) -> bool {
    let digits: Option<Vec<u32>> = code.chars().map(|c| c.to_digit(10)).collect();
    match digits {
        Some(d) if d.len() >= 8 => {
            let (body, check) = d.split_at(d.len() - 1);
            gs1_check_digit(body) == check[0]
        }
        _ => false,
    }
}

fn is_isbn10(cleaned: &str) -> bool {
    cleaned.is_ascii()
        && cleaned.len() == 10
        && cleaned[..9].chars().all(|c| c.is_ascii_digit())
        && cleaned
            .chars()
            .last()
            .map(|c| c.is_ascii_digit() || c == 'X')
            .unwrap_or(false)
}

/// Zero-padded GTIN-14 form of a barcode, or `None` if the value is not a
/// recognizable UPC/EAN/GTIN/ISBN.
///
/// ISBN-10 values are converted to their 978-prefixed ISBN-13 first. A UPC-A
/// and the EAN-13 spelling of the same code share one canonical form.
pub fn canonical_code(value: &str) -> Option<String> {
    let cleaned = strip_separators(value);
    if is_isbn10(&cleaned) {
        let mut body: Vec<u32> = vec![9, 7, 8];
        body.extend(cleaned[..9].chars().filter_map(|c| c.to_digit(10)));
        let check = gs1_check_digit(&body);
        let isbn13: String = body
            .iter()
            .map(|d| char::from_digit(*d, 10).unwrap_or('0'))
            .chain(std::iter::once(char::from_digit(check, 10).unwrap_or('0')))
            .collect();
        return Some(format!("{:0>14}", isbn13));
    }
    if !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match cleaned.len() {
        8 | 12 | 13 | 14 => Some(format!("{:0>14}", cleaned)),
        _ => None,
    }
}

/// Classify a published code into an [`Identifier`].
///
/// An explicit type from the agency wins over inference from the length.
pub fn classify_identifier(value: &str, hint: Option<IdentifierType>) -> Option<Identifier> {
    let cleaned = strip_separators(value);
    canonical_code(&cleaned)?;

    let inferred = match cleaned.len() {
        10 => IdentifierType::Isbn,
        12 => IdentifierType::Upc,
        13 if cleaned.starts_with("978") || cleaned.starts_with("979") => IdentifierType::Isbn,
        14 => IdentifierType::Gtin,
        _ => IdentifierType::Ean,
    };

    if cleaned.len() != 10 && !has_valid_check_digit(&cleaned) {
        debug!(code = %cleaned, "identifier check digit mismatch, keeping as published");
    }

    Some(Identifier {
        id_type: hint.unwrap_or(inferred),
        value: cleaned,
    })
}

/// Pull labelled barcodes (`UPC: 0123…`, `EAN 400…, 400…`) out of free text.
pub fn extract_identifiers(text: &str) -> Vec<Identifier> {
    let mut found = Vec::new();
    for caps in LABELLED_CODE.captures_iter(text) {
        let hint = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<IdentifierType>().ok());
        if let Some(list) = caps.get(2) {
            for code in CODE_SEPARATOR.split(list.as_str()) {
                if let Some(id) = classify_identifier(code, hint) {
                    found.push(id);
                }
            }
        }
    }
    found
}

// ============ Dates, severity, text ============

/// Parse the date formats agencies actually publish.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.date_naive());
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Some(date);
        }
    }
    // Naive datetimes such as `2019-04-12T00:00:00`.
    value
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
}

/// Map agency severity vocabulary onto [`Severity`].
pub fn map_severity(value: &str) -> Severity {
    let v = normalize_text(value);
    if v.contains("class iii") || v == "3" {
        return Severity::Low;
    }
    if v.contains("class ii") || v == "2" {
        return Severity::Medium;
    }
    if v.contains("class i") || v == "1" {
        return Severity::High;
    }
    const HIGH: &[&str] = &[
        "serious", "high", "severe", "death", "deaths", "died", "fatal", "fatality",
        "fatalities",
    ];
    const MEDIUM: &[&str] = &["medium", "moderate"];
    const LOW: &[&str] = &["low", "minor"];
    let has = |words: &[&str]| v.split_whitespace().any(|w| words.contains(&w));
    if has(HIGH) {
        Severity::High
    } else if has(MEDIUM) {
        Severity::Medium
    } else if has(LOW) {
        Severity::Low
    } else {
        Severity::Unknown
    }
}

/// Strip HTML tags, decode the common entities, and collapse whitespace.
pub fn clean_text(value: &str) -> String {
    let stripped = HTML_TAG.replace_all(value, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ JSON payload access ============

/// Resolve a dot path (`Products.0.Name`) inside a JSON payload.
pub fn value_at<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text at a dot path; numbers are rendered, empty strings are `None`.
pub fn text_at(payload: &Value, path: &str) -> Option<String> {
    let text = match value_at(payload, path)? {
        Value::String(s) => clean_text(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// All texts at a dot path whose target may be a scalar or an array of scalars.
pub fn texts_at(payload: &Value, path: &str) -> Vec<String> {
    match value_at(payload, path) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(clean_text(s)),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(_) => text_at(payload, path).into_iter().collect(),
        None => Vec::new(),
    }
}

// ============ Draft → canonical ============

/// Agency fields mapped by a connector, prior to validation.
#[derive(Debug, Default, Clone)]
pub struct RecallDraft {
    pub native_id: String,
    pub product_name: String,
    pub brand: String,
    pub model_number: String,
    pub identifiers: Vec<Identifier>,
    pub hazard_description: String,
    pub remedy: String,
    pub severity: Severity,
    pub risk_category: String,
    pub recall_date: Option<NaiveDate>,
    pub region: Option<String>,
    pub source_url: Option<String>,
}

impl RecallDraft {
    /// Classify and attach a published code; unrecognizable codes are dropped.
    pub fn add_identifier(&mut self, value: &str, hint: Option<IdentifierType>) {
        if let Some(id) = classify_identifier(value, hint) {
            self.identifiers.push(id);
        }
    }

    /// Validate the draft and derive the canonical record.
    ///
    /// Timestamps are provisional (`fetched_at`); the orchestrator assigns
    /// the authoritative `first_seen_at` and `last_updated_at` on upsert.
    pub fn finish(self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        let native_id = self.native_id.trim().to_string();
        if native_id.is_empty() {
            return Err(NormalizationError::MissingField("native_id"));
        }
        let recall_date = self
            .recall_date
            .ok_or(NormalizationError::MissingField("recall_date"))?;

        let product_name = clean_text(&self.product_name);
        let brand = clean_text(&self.brand);
        let model_number = clean_text(&self.model_number);
        if product_name.is_empty() && brand.is_empty() && model_number.is_empty() {
            return Err(NormalizationError::MissingField("product_name"));
        }

        let region = self
            .region
            .map(|r| r.trim().to_uppercase())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| agencies::default_region(&raw.agency_code).to_string());

        let identifiers: BTreeSet<Identifier> = self.identifiers.into_iter().collect();
        let key = dedupe_key(&brand, &model_number, &product_name, &region);

        Ok(CanonicalRecall {
            recall_id: recall_id(&raw.agency_code, &native_id),
            agency_code: raw.agency_code.clone(),
            agency_native_id: native_id,
            product_name,
            brand,
            model_number,
            identifiers,
            hazard_description: clean_text(&self.hazard_description),
            remedy: clean_text(&self.remedy),
            severity: self.severity,
            risk_category: clean_text(&self.risk_category),
            recall_date,
            region,
            source_url: self.source_url,
            raw_payload: raw.payload.to_string(),
            dedupe_key: key,
            first_seen_at: raw.fetched_at,
            last_updated_at: raw.fetched_at,
        })
    }
}
