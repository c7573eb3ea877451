//! Connector contract and registry.
//!
//! Every agency feed is wrapped in a [`Connector`]: a lazy [`fetch`] of raw
//! records since a watermark, and a pure [`normalize`] of each record into a
//! [`CanonicalRecall`]. The orchestrator only ever sees this contract; it
//! never branches on agency identity.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConnectorRegistry              │
//! │  ┌──────┐ ┌────────┐ ┌──────┐ ┌─────┐ ┌────┐ │
//! │  │ cpsc │ │openfda │ │ json │ │ rss │ │html│ │  + custom (Rust)
//! │  └──────┘ └────────┘ └──────┘ └─────┘ └────┘ │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!            Orchestrator::start_run() → upsert pipeline
//! ```
//!
//! [`fetch`]: Connector::fetch
//! [`normalize`]: Connector::normalize

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::config::{Config, SourceConfig};
use crate::connector_cpsc::CpscConnector;
use crate::connector_html::HtmlConnector;
use crate::connector_json::JsonConnector;
use crate::connector_openfda::OpenFdaConnector;
use crate::connector_rss::RssConnector;
use crate::error::{ConnectorError, NormalizationError};
use crate::http::HttpClient;
use crate::models::{AgencyCode, CanonicalRecall, RawRecord, Watermark};

/// Lazy, finite sequence of raw records. Not restartable: after an error the
/// caller starts a fresh [`Connector::fetch`].
pub type RecordStream<'a> = BoxStream<'a, Result<RawRecord, ConnectorError>>;

/// One agency feed.
///
/// # Example
///
/// ```rust
/// use futures::stream::{self, StreamExt};
/// use recall_index::connector::{Connector, RecordStream};
/// use recall_index::error::NormalizationError;
/// use recall_index::models::{AgencyCode, CanonicalRecall, RawRecord, Watermark};
/// use recall_index::normalize::RecallDraft;
///
/// struct StaticFeed {
///     agency: AgencyCode,
///     records: Vec<RawRecord>,
/// }
///
/// impl Connector for StaticFeed {
///     fn agency_code(&self) -> &AgencyCode { &self.agency }
///     fn description(&self) -> &str { "records held in memory" }
///
///     fn fetch(&self, _since: Option<Watermark>) -> RecordStream<'_> {
///         stream::iter(self.records.clone().into_iter().map(Ok)).boxed()
///     }
///
///     fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
///         RecallDraft::default().finish(raw)
///     }
/// }
/// ```
pub trait Connector: Send + Sync {
    /// Agency whose recalls this connector produces.
    fn agency_code(&self) -> &AgencyCode;

    /// One-line description, shown by `recall agencies`.
    fn description(&self) -> &str;

    /// Transport family (`cpsc`, `openfda`, `json`, `rss`, `html`, or `custom`).
    fn transport(&self) -> &str {
        "custom"
    }

    /// Stream records published since `since` (everything when `None`).
    ///
    /// Errors are [`ConnectorError::Transient`] (retry the whole fetch) or
    /// [`ConnectorError::Permanent`] (fail the run).
    fn fetch(&self, since: Option<Watermark>) -> RecordStream<'_>;

    /// Map one raw record onto the canonical schema. Pure; no I/O.
    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError>;
}

/// Flatten a page-at-a-time fetch into a [`RecordStream`].
///
/// `fetch_page` returns the page's records and the next page token; `None`
/// ends the stream.
pub fn page_stream<'a, P, F, Fut>(first: P, fetch_page: F) -> RecordStream<'a>
where
    P: Send + 'a,
    F: Fn(P) -> Fut + Send + 'a,
    Fut: Future<Output = Result<(Vec<RawRecord>, Option<P>), ConnectorError>> + Send + 'a,
{
    stream::try_unfold(Some(first), move |page: Option<P>| {
        let pending = page.map(&fetch_page);
        async move {
            match pending {
                Some(fut) => fut.await.map(Some),
                None => Ok(None),
            }
        }
    })
    .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, ConnectorError>)))
    .try_flatten()
    .boxed()
}

/// Whether a record stamped `stamp` falls at or after `since`.
///
/// Inclusive, since date-only feeds stamp every record of a day with the
/// same midnight and the watermark is that midnight; re-fetched records are
/// absorbed as unchanged upserts. Records without a timestamp are always
/// kept; feeds that cannot filter server-side use this to filter client-side.
pub fn is_not_before(stamp: Option<&Watermark>, since: Option<&Watermark>) -> bool {
    match (
        stamp.and_then(Watermark::as_timestamp),
        since.and_then(Watermark::as_timestamp),
    ) {
        (Some(stamp), Some(since)) => stamp >= since,
        _ => true,
    }
}

/// Registry of connectors keyed by agency code.
pub struct ConnectorRegistry {
    connectors: BTreeMap<AgencyCode, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: BTreeMap::new(),
        }
    }

    /// Build one connector per `[agencies.<CODE>]` table.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = HttpClient::new(&config.ingest)?;
        let mut registry = Self::new();

        for (code, agency) in &config.agencies {
            let code = AgencyCode::new(code);
            let connector: Arc<dyn Connector> = match &agency.source {
                SourceConfig::Cpsc(cfg) => {
                    Arc::new(CpscConnector::new(code, cfg.clone(), http.clone()))
                }
                SourceConfig::Openfda(cfg) => {
                    Arc::new(OpenFdaConnector::new(code, cfg.clone(), http.clone()))
                }
                SourceConfig::Json(cfg) => {
                    Arc::new(JsonConnector::new(code, cfg.clone(), http.clone()))
                }
                SourceConfig::Rss(cfg) => {
                    Arc::new(RssConnector::new(code, cfg.clone(), http.clone()))
                }
                SourceConfig::Html(cfg) => {
                    Arc::new(HtmlConnector::new(code, cfg.clone(), http.clone())?)
                }
            };
            registry.register(connector);
        }

        Ok(registry)
    }

    /// Add a connector, replacing any previous one for the same agency.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.agency_code().clone(), connector);
    }

    pub fn get(&self, agency: &AgencyCode) -> Option<Arc<dyn Connector>> {
        self.connectors.get(agency).cloned()
    }

    pub fn agencies(&self) -> impl Iterator<Item = &AgencyCode> {
        self.connectors.keys()
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Arc<dyn Connector>> {
        self.connectors.values()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn raw(n: u32) -> RawRecord {
        RawRecord {
            agency_code: AgencyCode::new("TEST"),
            record_ref: n.to_string(),
            payload: json!({ "n": n }),
            watermark: None,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn page_stream_walks_pages_in_order() {
        let stream = page_stream(0u32, |page| async move {
            let records = (page * 2..page * 2 + 2).map(raw).collect();
            let next = if page < 2 { Some(page + 1) } else { None };
            Ok((records, next))
        });
        let refs: Vec<String> = stream
            .map_ok(|r| r.record_ref)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(refs, vec!["0", "1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn page_stream_surfaces_errors() {
        let mut stream = page_stream(0u32, |page| async move {
            if page == 0 {
                Ok((vec![raw(0)], Some(1)))
            } else {
                Err(ConnectorError::Transient("boom".into()))
            }
        });
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().unwrap_err().is_transient());
    }

    #[test]
    fn watermark_filter_compares_timestamps_only() {
        let early = Watermark::parse("2024-01-01");
        let late = Watermark::parse("2024-02-01");
        assert!(is_not_before(Some(&late), Some(&early)));
        assert!(!is_not_before(Some(&early), Some(&late)));
        assert!(is_not_before(None, Some(&late)));
        assert!(is_not_before(Some(&early), None));
    }

    #[test]
    fn same_day_records_survive_a_date_watermark() {
        let watermark = Watermark::parse("2024-05-01");
        let same_day = Watermark::parse("2024-05-01");
        assert!(is_not_before(Some(&same_day), Some(&watermark)));
    }
}
