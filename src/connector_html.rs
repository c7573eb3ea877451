//! HTML listing scraper.
//!
//! For agencies whose only machine-reachable output is a web page listing
//! recalls in a table or list. One element matched by `row_selector` is one
//! recall; each canonical field is a CSS selector evaluated inside the row.

use anyhow::{anyhow, Result};
use chrono::Utc;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::config::HtmlSourceConfig;
use crate::connector::{is_not_before, page_stream, Connector, RecordStream};
use crate::error::{ConnectorError, NormalizationError};
use crate::http::HttpClient;
use crate::models::{AgencyCode, CanonicalRecall, RawRecord, Watermark};
use crate::normalize::{
    classify_identifier, clean_text, extract_identifiers, map_severity, parse_date, text_at,
    texts_at, RecallDraft,
};

/// Field name and compiled selector, evaluated per row.
struct FieldSelector {
    name: &'static str,
    selector: Selector,
}

pub struct HtmlConnector {
    agency: AgencyCode,
    config: HtmlSourceConfig,
    http: HttpClient,
    rows: Selector,
    fields: Vec<FieldSelector>,
    identifiers: Option<Selector>,
    link: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("invalid CSS selector '{}': {:?}", selector, e))
}

impl HtmlConnector {
    pub fn new(agency: AgencyCode, config: HtmlSourceConfig, http: HttpClient) -> Result<Self> {
        let f = &config.fields;
        let mut fields = vec![FieldSelector {
            name: "recall_date",
            selector: compile(&f.recall_date)?,
        }];
        for (name, selector) in [
            ("native_id", &f.native_id),
            ("product_name", &f.product_name),
            ("brand", &f.brand),
            ("model_number", &f.model_number),
            ("hazard", &f.hazard),
            ("remedy", &f.remedy),
            ("severity", &f.severity),
        ] {
            if let Some(selector) = selector {
                fields.push(FieldSelector {
                    name,
                    selector: compile(selector)?,
                });
            }
        }

        Ok(Self {
            rows: compile(&config.row_selector)?,
            identifiers: f.identifiers.as_deref().map(compile).transpose()?,
            link: f.link.as_deref().map(compile).transpose()?,
            fields,
            agency,
            config,
            http,
        })
    }

    /// One JSON object per row: field name → text, plus `link` and `identifiers`.
    pub(crate) fn parse_rows(&self, page: &str) -> Vec<Value> {
        let document = Html::parse_document(page);
        let base = Url::parse(&self.config.url).ok();

        document
            .select(&self.rows)
            .map(|row| {
                let mut obj = Map::new();
                for field in &self.fields {
                    if let Some(el) = row.select(&field.selector).next() {
                        let text = element_text(&el);
                        if !text.is_empty() {
                            obj.insert(field.name.to_string(), Value::String(text));
                        }
                    }
                }
                if let Some(link) = &self.link {
                    let href = row
                        .select(link)
                        .next()
                        .and_then(|el| el.value().attr("href"))
                        .map(|href| match base.as_ref().and_then(|b| b.join(href).ok()) {
                            Some(url) => url.to_string(),
                            None => href.to_string(),
                        });
                    if let Some(href) = href {
                        obj.insert("link".to_string(), Value::String(href));
                    }
                }
                if let Some(ids) = &self.identifiers {
                    let codes: Vec<Value> = row
                        .select(ids)
                        .map(|el| Value::String(element_text(&el)))
                        .collect();
                    obj.insert("identifiers".to_string(), Value::Array(codes));
                }
                Value::Object(obj)
            })
            .collect()
    }

    async fn fetch_page(
        &self,
        since: Option<Watermark>,
    ) -> Result<(Vec<RawRecord>, Option<()>), ConnectorError> {
        let page = self.http.get_text(&self.config.url, &[]).await?;
        let fetched_at = Utc::now();
        let records = self
            .parse_rows(&page)
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let watermark = text_at(&payload, "recall_date")
                    .and_then(|s| parse_date(&s))
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| Watermark::Timestamp(dt.and_utc()));
                RawRecord {
                    agency_code: self.agency.clone(),
                    record_ref: native_id(&payload).unwrap_or_else(|| format!("row-{}", i)),
                    payload,
                    watermark,
                    fetched_at,
                }
            })
            .filter(|r| is_not_before(r.watermark.as_ref(), since.as_ref()))
            .collect();
        Ok((records, None))
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn native_id(row: &Value) -> Option<String> {
    text_at(row, "native_id").or_else(|| text_at(row, "link"))
}

impl Connector for HtmlConnector {
    fn agency_code(&self) -> &AgencyCode {
        &self.agency
    }

    fn description(&self) -> &str {
        "HTML recall listing"
    }

    fn transport(&self) -> &str {
        "html"
    }

    fn fetch(&self, since: Option<Watermark>) -> RecordStream<'_> {
        page_stream((), move |()| self.fetch_page(since.clone()))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        let p = &raw.payload;
        let field = |name: &str| text_at(p, name).unwrap_or_default();

        let recall_date = match text_at(p, "recall_date") {
            Some(s) => Some(parse_date(&s).ok_or(NormalizationError::InvalidField {
                field: "recall_date",
                value: s,
            })?),
            None => None,
        };

        let mut draft = RecallDraft {
            native_id: native_id(p).unwrap_or_default(),
            product_name: field("product_name"),
            brand: field("brand"),
            model_number: field("model_number"),
            hazard_description: field("hazard"),
            remedy: field("remedy"),
            severity: map_severity(&field("severity")),
            recall_date,
            source_url: text_at(p, "link"),
            ..Default::default()
        };
        for code in texts_at(p, "identifiers") {
            match classify_identifier(&code, None) {
                Some(id) => draft.identifiers.push(id),
                None => draft.identifiers.extend(extract_identifiers(&code)),
            }
        }

        draft.finish(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HtmlFieldMap, IngestConfig};

    const PAGE: &str = r#"
        <html><body>
          <table id="recalls">
            <tr class="recall">
              <td class="date">12.03.2024</td>
              <td class="product"><a href="/rueckrufe/4711">Wasserkocher WK-200</a></td>
              <td class="brand">Brewco</td>
              <td class="hazard">Überhitzung, Brandgefahr</td>
              <td class="codes"><span>4006381333931</span><span>EAN 4006381333948</span></td>
            </tr>
            <tr class="recall">
              <td class="date">nie</td>
              <td class="product"><a href="/rueckrufe/4712">Spielzeugauto</a></td>
            </tr>
          </table>
        </body></html>"#;

    fn connector() -> HtmlConnector {
        HtmlConnector::new(
            AgencyCode::new("DE_BAUA"),
            HtmlSourceConfig {
                url: "https://rueckrufe.example.de/liste".into(),
                row_selector: "tr.recall".into(),
                fields: HtmlFieldMap {
                    recall_date: "td.date".into(),
                    product_name: Some("td.product".into()),
                    brand: Some("td.brand".into()),
                    hazard: Some("td.hazard".into()),
                    identifiers: Some("td.codes span".into()),
                    link: Some("td.product a".into()),
                    ..Default::default()
                },
            },
            HttpClient::new(&IngestConfig::default()).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn scrapes_rows_and_resolves_links() {
        let c = connector();
        let rows = c.parse_rows(PAGE);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["link"], "https://rueckrufe.example.de/rueckrufe/4711");
        assert_eq!(rows[0]["product_name"], "Wasserkocher WK-200");
        assert_eq!(rows[0]["identifiers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn normalizes_rows_and_rejects_bad_dates() {
        let c = connector();
        let records: Vec<RawRecord> = c
            .parse_rows(PAGE)
            .into_iter()
            .map(|payload| RawRecord {
                agency_code: AgencyCode::new("DE_BAUA"),
                record_ref: native_id(&payload).unwrap(),
                payload,
                watermark: None,
                fetched_at: Utc::now(),
            })
            .collect();

        let recall = c.normalize(&records[0]).unwrap();
        assert_eq!(
            recall.recall_id,
            "DE_BAUA:https://rueckrufe.example.de/rueckrufe/4711"
        );
        assert_eq!(recall.region, "DE");
        assert_eq!(recall.recall_date.to_string(), "2024-03-12");
        assert_eq!(recall.identifiers.len(), 2);

        assert!(matches!(
            c.normalize(&records[1]),
            Err(NormalizationError::InvalidField { field: "recall_date", .. })
        ));
    }

    #[test]
    fn invalid_selector_is_a_config_error() {
        let mut cfg = HtmlSourceConfig {
            url: "https://x.test".into(),
            row_selector: "tr[".into(),
            fields: HtmlFieldMap {
                recall_date: "td".into(),
                ..Default::default()
            },
        };
        let http = HttpClient::new(&IngestConfig::default()).unwrap();
        assert!(HtmlConnector::new(AgencyCode::new("X"), cfg.clone(), http.clone()).is_err());
        cfg.row_selector = "tr".into();
        assert!(HtmlConnector::new(AgencyCode::new("X"), cfg, http).is_ok());
    }
}
