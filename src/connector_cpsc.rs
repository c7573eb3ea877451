//! U.S. CPSC SaferProducts recall API connector.
//!
//! The API returns every matching recall as one JSON array, so a fetch is a
//! single request. Incremental fetches push the watermark down as
//! `LastPublishDateStart`; the date filter is inclusive, and the overlap is
//! absorbed by the idempotent upsert.

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::config::CpscSourceConfig;
use crate::connector::{page_stream, Connector, RecordStream};
use crate::error::{ConnectorError, NormalizationError};
use crate::http::HttpClient;
use crate::models::{AgencyCode, CanonicalRecall, IdentifierType, RawRecord, Watermark};
use crate::normalize::{
    extract_identifiers, map_severity, parse_date, text_at, RecallDraft,
};

pub struct CpscConnector {
    agency: AgencyCode,
    config: CpscSourceConfig,
    http: HttpClient,
}

impl CpscConnector {
    pub fn new(agency: AgencyCode, config: CpscSourceConfig, http: HttpClient) -> Self {
        Self {
            agency,
            config,
            http,
        }
    }

    async fn fetch_all(
        &self,
        since: Option<Watermark>,
    ) -> Result<(Vec<RawRecord>, Option<()>), ConnectorError> {
        let mut query = vec![("format", "json".to_string())];
        if let Some(ts) = since.as_ref().and_then(Watermark::as_timestamp) {
            query.push(("LastPublishDateStart", ts.format("%Y-%m-%d").to_string()));
        }
        let body = self.http.get_json(&self.config.base_url, &query).await?;
        let records = parse_feed(&self.agency, body)?;
        info!(agency = %self.agency, records = records.len(), "fetched CPSC recalls");
        Ok((records, None))
    }
}

/// Split a SaferProducts response into raw records.
pub(crate) fn parse_feed(agency: &AgencyCode, body: Value) -> Result<Vec<RawRecord>, ConnectorError> {
    let items = match body {
        Value::Array(items) => items,
        other => {
            return Err(ConnectorError::Permanent(format!(
                "expected a JSON array of recalls, got {}",
                json_kind(&other)
            )))
        }
    };
    let fetched_at = Utc::now();
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(i, payload)| {
            let record_ref = text_at(&payload, "RecallNumber")
                .or_else(|| text_at(&payload, "RecallID"))
                .unwrap_or_else(|| format!("item-{}", i));
            let watermark = text_at(&payload, "LastPublishDate")
                .and_then(|s| parse_date(&s))
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Watermark::Timestamp(dt.and_utc()));
            RawRecord {
                agency_code: agency.clone(),
                record_ref,
                payload,
                watermark,
                fetched_at,
            }
        })
        .collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `field` of every object in the array at `path`, joined with "; ".
fn join_field(payload: &Value, path: &str, field: &str) -> String {
    payload
        .get(path)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| text_at(item, field))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default()
}

impl Connector for CpscConnector {
    fn agency_code(&self) -> &AgencyCode {
        &self.agency
    }

    fn description(&self) -> &str {
        "CPSC SaferProducts recall API"
    }

    fn transport(&self) -> &str {
        "cpsc"
    }

    fn fetch(&self, since: Option<Watermark>) -> RecordStream<'_> {
        page_stream((), move |()| self.fetch_all(since.clone()))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        let p = &raw.payload;
        if !p.is_object() {
            return Err(NormalizationError::Malformed("recall is not an object".into()));
        }

        let hazard = join_field(p, "Hazards", "Name");
        let mut draft = RecallDraft {
            native_id: text_at(p, "RecallNumber")
                .or_else(|| text_at(p, "RecallID"))
                .unwrap_or_default(),
            product_name: text_at(p, "Products.0.Name")
                .or_else(|| text_at(p, "Title"))
                .unwrap_or_default(),
            brand: text_at(p, "Manufacturers.0.Name").unwrap_or_default(),
            model_number: text_at(p, "Products.0.Model").unwrap_or_default(),
            severity: map_severity(&format!("{} {}", hazard, join_field(p, "Injuries", "Name"))),
            hazard_description: hazard,
            remedy: join_field(p, "Remedies", "Name"),
            risk_category: text_at(p, "Products.0.Type").unwrap_or_default(),
            recall_date: match text_at(p, "RecallDate") {
                Some(s) => Some(parse_date(&s).ok_or(NormalizationError::InvalidField {
                    field: "recall_date",
                    value: s,
                })?),
                None => None,
            },
            source_url: text_at(p, "URL"),
            ..Default::default()
        };

        if let Some(upcs) = p.get("ProductUPCs").and_then(Value::as_array) {
            for upc in upcs {
                if let Some(code) = text_at(upc, "UPC") {
                    draft.add_identifier(&code, Some(IdentifierType::Upc));
                }
            }
        }
        if let Some(description) = text_at(p, "Description") {
            draft.identifiers.extend(extract_identifiers(&description));
        }

        draft.finish(raw)
    }
}
