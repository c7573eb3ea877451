//! openFDA enforcement report connector (food, drug, and device recalls).
//!
//! Pages through `/{category}/enforcement.json` with `skip`/`limit`, sorted
//! by `report_date` ascending so the watermark advances monotonically. The
//! API caps `skip` at 25 000; larger backfills are split by date.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::OpenFdaSourceConfig;
use crate::connector::{page_stream, Connector, RecordStream};
use crate::error::{ConnectorError, NormalizationError};
use crate::http::HttpClient;
use crate::models::{AgencyCode, CanonicalRecall, RawRecord, Watermark};
use crate::normalize::{extract_identifiers, map_severity, parse_date, text_at, RecallDraft};

const MAX_SKIP: usize = 25_000;
const MAX_PRODUCT_NAME_CHARS: usize = 160;

pub struct OpenFdaConnector {
    agency: AgencyCode,
    config: OpenFdaSourceConfig,
    http: HttpClient,
}

impl OpenFdaConnector {
    pub fn new(agency: AgencyCode, config: OpenFdaSourceConfig, http: HttpClient) -> Self {
        Self {
            agency,
            config,
            http,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}/enforcement.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.category
        )
    }

    async fn fetch_page(
        &self,
        skip: usize,
        since: Option<Watermark>,
    ) -> Result<(Vec<RawRecord>, Option<usize>), ConnectorError> {
        let limit = self.config.page_size.max(1);
        let mut query = vec![
            ("limit", limit.to_string()),
            ("skip", skip.to_string()),
            ("sort", "report_date:asc".to_string()),
        ];
        if let Some(ts) = since.as_ref().and_then(Watermark::as_timestamp) {
            query.push((
                "search",
                format!("report_date:[{} TO 29991231]", ts.format("%Y%m%d")),
            ));
        }
        if let Some(key) = &self.config.api_key {
            query.push(("api_key", key.clone()));
        }

        let body = match self.http.get_json_or_empty(&self.endpoint(), &query).await? {
            Some(body) => body,
            None => return Ok((Vec::new(), None)),
        };
        let (records, total) = parse_page(&self.agency, body)?;
        debug!(agency = %self.agency, skip, count = records.len(), total, "openFDA page");

        let next = skip + records.len();
        let more = !records.is_empty() && next < total;
        if more && next >= MAX_SKIP {
            warn!(
                agency = %self.agency,
                total,
                "openFDA skip limit reached; remaining records arrive on the next incremental run"
            );
        }
        Ok((records, (more && next < MAX_SKIP).then_some(next)))
    }
}

/// Records and the reported total from one enforcement page.
pub(crate) fn parse_page(
    agency: &AgencyCode,
    body: Value,
) -> Result<(Vec<RawRecord>, usize), ConnectorError> {
    let total = body
        .pointer("/meta/results/total")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let results = match body.get("results").and_then(Value::as_array) {
        Some(results) => results.clone(),
        None => {
            return Err(ConnectorError::Permanent(
                "openFDA response has no results array".to_string(),
            ))
        }
    };
    let fetched_at = Utc::now();
    let records = results
        .into_iter()
        .enumerate()
        .map(|(i, payload)| RawRecord {
            agency_code: agency.clone(),
            record_ref: text_at(&payload, "recall_number").unwrap_or_else(|| format!("item-{}", i)),
            watermark: text_at(&payload, "report_date")
                .and_then(|s| parse_date(&s))
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Watermark::Timestamp(dt.and_utc())),
            payload,
            fetched_at,
        })
        .collect();
    Ok((records, total))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

impl Connector for OpenFdaConnector {
    fn agency_code(&self) -> &AgencyCode {
        &self.agency
    }

    fn description(&self) -> &str {
        "openFDA enforcement reports"
    }

    fn transport(&self) -> &str {
        "openfda"
    }

    fn fetch(&self, since: Option<Watermark>) -> RecordStream<'_> {
        page_stream(0usize, move |skip| self.fetch_page(skip, since.clone()))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        let p = &raw.payload;
        let description = text_at(p, "product_description").unwrap_or_default();
        let date_text = text_at(p, "recall_initiation_date").or_else(|| text_at(p, "report_date"));
        let recall_date = match date_text {
            Some(s) => Some(parse_date(&s).ok_or(NormalizationError::InvalidField {
                field: "recall_date",
                value: s,
            })?),
            None => None,
        };

        let mut draft = RecallDraft {
            native_id: text_at(p, "recall_number").unwrap_or_default(),
            product_name: truncate_chars(&description, MAX_PRODUCT_NAME_CHARS),
            brand: text_at(p, "recalling_firm").unwrap_or_default(),
            hazard_description: text_at(p, "reason_for_recall").unwrap_or_default(),
            severity: map_severity(&text_at(p, "classification").unwrap_or_default()),
            risk_category: text_at(p, "product_type").unwrap_or_default(),
            recall_date,
            ..Default::default()
        };
        let code_info = text_at(p, "code_info").unwrap_or_default();
        draft
            .identifiers
            .extend(extract_identifiers(&format!("{} {}", code_info, description)));

        draft.finish(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::models::Severity;
    use serde_json::json;

    fn connector() -> OpenFdaConnector {
        OpenFdaConnector::new(
            AgencyCode::new("FDA"),
            OpenFdaSourceConfig {
                base_url: "https://api.fda.gov/".into(),
                category: "food".into(),
                page_size: 100,
                api_key: None,
            },
            HttpClient::new(&IngestConfig::default()).unwrap(),
        )
    }

    #[test]
    fn endpoint_includes_category() {
        assert_eq!(
            connector().endpoint(),
            "https://api.fda.gov/food/enforcement.json"
        );
    }

    #[test]
    fn parses_page_and_maps_classification() {
        let body = json!({
            "meta": { "results": { "skip": 0, "limit": 100, "total": 1 } },
            "results": [{
                "recall_number": "F-0276-2017",
                "classification": "Class I",
                "product_type": "Food",
                "recalling_firm": "Acme Foods Inc.",
                "product_description": "Acme Peanut Butter Crunchy, 16 oz jar",
                "reason_for_recall": "Potential Salmonella contamination",
                "code_info": "UPC 0 12914 63210 9; Lot 1234",
                "recall_initiation_date": "20161025",
                "report_date": "20170111"
            }]
        });
        let (records, total) = parse_page(&AgencyCode::new("FDA"), body).unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].record_ref, "F-0276-2017");
        assert_eq!(records[0].watermark, Some(Watermark::parse("2017-01-11")));

        let recall = connector().normalize(&records[0]).unwrap();
        assert_eq!(recall.recall_id, "FDA:F-0276-2017");
        assert_eq!(recall.severity, Severity::High);
        assert_eq!(recall.brand, "Acme Foods Inc.");
        assert_eq!(recall.recall_date.to_string(), "2016-10-25");
        let canon: Vec<String> = recall.identifiers.iter().map(|i| i.canonical()).collect();
        assert_eq!(canon, vec!["00012914632109"]);
    }

    #[test]
    fn missing_results_is_permanent() {
        let err = parse_page(&AgencyCode::new("FDA"), json!({"error": {}})).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("ééé", 2), "éé");
    }
}
