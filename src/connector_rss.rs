//! RSS 2.0 feed connector.
//!
//! Agencies that only publish a news-style feed get one `<item>` per recall:
//! the title names the product, the description carries hazard text and,
//! often, labelled barcodes. Feeds have no server-side filtering, so items
//! are filtered by `pubDate` against the watermark.

use chrono::Utc;
use quick_xml::events::Event;
use serde_json::{Map, Value};

use crate::config::RssSourceConfig;
use crate::connector::{is_not_before, page_stream, Connector, RecordStream};
use crate::error::{ConnectorError, NormalizationError};
use crate::http::HttpClient;
use crate::models::{AgencyCode, CanonicalRecall, RawRecord, Watermark};
use crate::normalize::{extract_identifiers, map_severity, parse_date, text_at, RecallDraft};

const ITEM_FIELDS: &[&str] = &["title", "link", "description", "pubDate", "guid", "category"];

pub struct RssConnector {
    agency: AgencyCode,
    config: RssSourceConfig,
    http: HttpClient,
}

impl RssConnector {
    pub fn new(agency: AgencyCode, config: RssSourceConfig, http: HttpClient) -> Self {
        Self {
            agency,
            config,
            http,
        }
    }

    async fn fetch_feed(
        &self,
        since: Option<Watermark>,
    ) -> Result<(Vec<RawRecord>, Option<()>), ConnectorError> {
        let xml = self.http.get_text(&self.config.url, &[]).await?;
        let fetched_at = Utc::now();
        let records = parse_items(&xml)?
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let watermark = text_at(&payload, "pubDate")
                    .and_then(|s| chrono::DateTime::parse_from_rfc2822(&s).ok())
                    .map(|ts| Watermark::Timestamp(ts.with_timezone(&Utc)));
                RawRecord {
                    agency_code: self.agency.clone(),
                    record_ref: native_id(&payload).unwrap_or_else(|| format!("item-{}", i)),
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

fn native_id(item: &Value) -> Option<String> {
    text_at(item, "guid").or_else(|| text_at(item, "link"))
}

/// Each `<item>` as a JSON object of its text children.
pub(crate) fn parse_items(xml: &str) -> Result<Vec<Value>, ConnectorError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<Map<String, Value>> = None;
    let mut field: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "item" {
                    current = Some(Map::new());
                } else if current.is_some() && ITEM_FIELDS.contains(&name.as_str()) {
                    field = Some(name);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"item" {
                    if let Some(item) = current.take() {
                        items.push(Value::Object(item));
                    }
                }
                field = None;
            }
            Ok(Event::Text(t)) => {
                if let (Some(item), Some(name)) = (current.as_mut(), field.as_ref()) {
                    let text = t
                        .unescape()
                        .map_err(|e| ConnectorError::Permanent(format!("bad RSS text: {}", e)))?;
                    append(item, name, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(item), Some(name)) = (current.as_mut(), field.as_ref()) {
                    append(item, name, &String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ConnectorError::Permanent(format!("invalid RSS: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(items)
}

fn append(item: &mut Map<String, Value>, name: &str, text: &str) {
    let entry = item
        .entry(name.to_string())
        .or_insert_with(|| Value::String(String::new()));
    if let Value::String(existing) = entry {
        if !existing.is_empty() {
            existing.push(' ');
        }
        existing.push_str(text);
    }
}

impl Connector for RssConnector {
    fn agency_code(&self) -> &AgencyCode {
        &self.agency
    }

    fn description(&self) -> &str {
        "RSS 2.0 recall feed"
    }

    fn transport(&self) -> &str {
        "rss"
    }

    fn fetch(&self, since: Option<Watermark>) -> RecordStream<'_> {
        page_stream((), move |()| self.fetch_feed(since.clone()))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        let p = &raw.payload;
        let title = text_at(p, "title").unwrap_or_default();
        let description = text_at(p, "description").unwrap_or_default();
        let category = text_at(p, "category").unwrap_or_default();

        let recall_date = match text_at(p, "pubDate") {
            Some(s) => Some(parse_date(&s).ok_or(NormalizationError::InvalidField {
                field: "recall_date",
                value: s,
            })?),
            None => None,
        };

        let mut draft = RecallDraft {
            native_id: native_id(p).unwrap_or_default(),
            identifiers: extract_identifiers(&format!("{} {}", title, description)),
            product_name: title,
            severity: map_severity(&category),
            hazard_description: description,
            risk_category: category,
            recall_date,
            source_url: text_at(p, "link"),
            ..Default::default()
        };
        draft.identifiers.sort();
        draft.identifiers.dedup();

        draft.finish(raw)
    }
}
