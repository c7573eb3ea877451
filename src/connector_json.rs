//! Generic JSON feed connector driven entirely by configuration.
//!
//! Many agencies publish a plain JSON listing (or a JSON export of their
//! CSV). Rather than one module per agency, the URL template, the location
//! of the record array, and a dot path for each canonical field are declared
//! in `[agencies.<CODE>]`:
//!
//! ```toml
//! [agencies.UK_OPSS]
//! kind = "json"
//! url = "https://example.gov.uk/recalls.json?from={since}&page={page}"
//! records_path = "data.items"
//! [agencies.UK_OPSS.fields]
//! native_id = "id"
//! recall_date = "published"
//! product_name = "product.name"
//! identifiers = ["product.barcodes"]
//! ```
//!
//! `{since}` becomes `YYYY-MM-DD` (empty for a full fetch). Without `{since}`
//! in the template, records are filtered client-side. Without `{page}`, the
//! feed is a single document.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::config::JsonSourceConfig;
use crate::connector::{is_not_before, page_stream, Connector, RecordStream};
use crate::error::{ConnectorError, NormalizationError};
use crate::http::HttpClient;
use crate::models::{AgencyCode, CanonicalRecall, IdentifierType, RawRecord, Watermark};
use crate::normalize::{map_severity, parse_date, text_at, texts_at, value_at, RecallDraft};

pub struct JsonConnector {
    agency: AgencyCode,
    config: JsonSourceConfig,
    http: HttpClient,
}

impl JsonConnector {
    pub fn new(agency: AgencyCode, config: JsonSourceConfig, http: HttpClient) -> Self {
        Self {
            agency,
            config,
            http,
        }
    }

    fn paged(&self) -> bool {
        self.config.url.contains("{page}")
    }

    fn url_for(&self, page: u32, since: Option<&Watermark>) -> String {
        let since = since
            .and_then(Watermark::as_timestamp)
            .map(|ts| ts.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        self.config
            .url
            .replace("{since}", &since)
            .replace("{page}", &page.to_string())
    }

    fn record_watermark(&self, payload: &Value) -> Option<Watermark> {
        let fields = &self.config.fields;
        let path = fields.updated_at.as_deref().unwrap_or(&fields.recall_date);
        let text = text_at(payload, path)?;
        if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&text) {
            return Some(Watermark::Timestamp(ts.with_timezone(&Utc)));
        }
        parse_date(&text)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Watermark::Timestamp(dt.and_utc()))
    }

    async fn fetch_page(
        &self,
        page: u32,
        since: Option<Watermark>,
    ) -> Result<(Vec<RawRecord>, Option<u32>), ConnectorError> {
        let url = self.url_for(page, since.as_ref());
        let body = self.http.get_json(&url, &[]).await?;
        let records = self.parse_records(&body)?;
        debug!(agency = %self.agency, page, count = records.len(), "json page");

        let last_page = page + 1 >= self.config.first_page + self.config.max_pages;
        let next = (self.paged() && !records.is_empty() && !last_page).then_some(page + 1);

        let filter_client_side = !self.config.url.contains("{since}");
        let records = records
            .into_iter()
            .filter(|r| !filter_client_side || is_not_before(r.watermark.as_ref(), since.as_ref()))
            .collect();
        Ok((records, next))
    }

    fn parse_records(&self, body: &Value) -> Result<Vec<RawRecord>, ConnectorError> {
        let items = value_at(body, &self.config.records_path)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConnectorError::Permanent(format!(
                    "no record array at '{}'",
                    self.config.records_path
                ))
            })?;
        let fetched_at = Utc::now();
        Ok(items
            .iter()
            .enumerate()
            .map(|(i, payload)| RawRecord {
                agency_code: self.agency.clone(),
                record_ref: text_at(payload, &self.config.fields.native_id)
                    .unwrap_or_else(|| format!("item-{}", i)),
                watermark: self.record_watermark(payload),
                payload: payload.clone(),
                fetched_at,
            })
            .collect())
    }
}

fn optional_text(payload: &Value, path: &Option<String>) -> String {
    path.as_deref()
        .and_then(|p| text_at(payload, p))
        .unwrap_or_default()
}

impl Connector for JsonConnector {
    fn agency_code(&self) -> &AgencyCode {
        &self.agency
    }

    fn description(&self) -> &str {
        "configurable JSON feed"
    }

    fn transport(&self) -> &str {
        "json"
    }

    fn fetch(&self, since: Option<Watermark>) -> RecordStream<'_> {
        page_stream(self.config.first_page, move |page| {
            self.fetch_page(page, since.clone())
        })
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        let p = &raw.payload;
        let f = &self.config.fields;

        let recall_date = match text_at(p, &f.recall_date) {
            Some(s) => Some(parse_date(&s).ok_or(NormalizationError::InvalidField {
                field: "recall_date",
                value: s,
            })?),
            None => None,
        };
        let hint = f
            .identifier_type
            .as_deref()
            .and_then(|t| t.parse::<IdentifierType>().ok());

        let mut draft = RecallDraft {
            native_id: text_at(p, &f.native_id).unwrap_or_default(),
            product_name: optional_text(p, &f.product_name),
            brand: optional_text(p, &f.brand),
            model_number: optional_text(p, &f.model_number),
            hazard_description: optional_text(p, &f.hazard),
            remedy: optional_text(p, &f.remedy),
            severity: map_severity(&optional_text(p, &f.severity)),
            risk_category: optional_text(p, &f.risk_category),
            recall_date,
            region: f.region.as_deref().and_then(|path| text_at(p, path)),
            source_url: f.source_url.as_deref().and_then(|path| text_at(p, path)),
            ..Default::default()
        };
        for path in &f.identifiers {
            for code in texts_at(p, path) {
                draft.add_identifier(&code, hint);
            }
        }

        draft.finish(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, JsonFieldMap};
    use futures::TryStreamExt;
    use serde_json::json;

    fn config(url: String) -> JsonSourceConfig {
        JsonSourceConfig {
            url,
            records_path: "data.items".into(),
            first_page: 1,
            max_pages: 10,
            fields: JsonFieldMap {
                native_id: "id".into(),
                recall_date: "published".into(),
                product_name: Some("product.name".into()),
                brand: Some("product.brand".into()),
                identifiers: vec!["product.barcodes".into()],
                hazard: Some("hazard".into()),
                severity: Some("risk".into()),
                ..Default::default()
            },
        }
    }

    fn connector(url: String) -> JsonConnector {
        JsonConnector::new(
            AgencyCode::new("UK_OPSS"),
            config(url),
            HttpClient::new(&IngestConfig::default()).unwrap(),
        )
    }

    #[test]
    fn url_template_substitution() {
        let c = connector("https://x.test/r?from={since}&page={page}".into());
        assert_eq!(c.url_for(3, None), "https://x.test/r?from=&page=3");
        let since = Watermark::parse("2024-05-01");
        assert_eq!(
            c.url_for(1, Some(&since)),
            "https://x.test/r?from=2024-05-01&page=1"
        );
    }

    #[tokio::test]
    async fn fetches_file_feed_and_filters_client_side() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        let feed = json!({ "data": { "items": [
            { "id": "2024-001", "published": "2024-03-01", "hazard": "Serious burns",
              "product": { "name": "Kettle", "brand": "Brewco", "barcodes": ["5012345678900"] },
              "risk": "Serious" },
            { "id": "2024-002", "published": "2024-06-01", "hazard": "Choking",
              "product": { "name": "Toy Car", "brand": "Playco", "barcodes": [] } }
        ]}});
        std::fs::write(&path, feed.to_string()).unwrap();
        let c = connector(format!("file://{}", path.display()));

        let all: Vec<RawRecord> = c.fetch(None).try_collect().await.unwrap();
        assert_eq!(all.len(), 2);

        let since = Watermark::parse("2024-04-01");
        let newer: Vec<RawRecord> = c.fetch(Some(since)).try_collect().await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].record_ref, "2024-002");

        let recall = c.normalize(&all[0]).unwrap();
        assert_eq!(recall.recall_id, "UK_OPSS:2024-001");
        assert_eq!(recall.region, "GB");
        assert_eq!(recall.brand, "Brewco");
        assert_eq!(recall.identifiers.len(), 1);
        assert_eq!(recall.severity, crate::models::Severity::High);
    }

    #[tokio::test]
    async fn missing_record_array_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, "{\"data\": {}}").unwrap();
        let c = connector(format!("file://{}", path.display()));
        let err = c
            .fetch(None)
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
