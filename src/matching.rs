//! Exact and fuzzy recall matching.
//!
//! Three read-only queries over the [`Store`]:
//!
//! - **Identifier lookup**: barcode → every recall carrying it. Exact only;
//!   a miss is [`LookupOutcome::NoExactMatch`], never a fuzzy fallback.
//! - **Similar search**: brand / product name / identifier prefix, scored as
//!   a weighted mean of per-field signals.
//! - **Text search**: free text over product name, brand, and hazard text
//!   with agency, region, and date filters.
//!
//! # Scoring
//!
//! ```text
//! confidence = Σ wᵢ·sᵢ / Σ wᵢ        (over the query fields supplied)
//!
//! prefix  s = 1.0 if any identifier starts with the prefix, else 0.0
//! brand   s = 1.0 equal, 0.8 substring, else trigram similarity × 0.6
//! name    s = mean(trigram similarity, trigram containment)
//! ```
//!
//! Results below `min_confidence` are dropped. Equal confidence breaks ties
//! by `recall_date` descending, then `recall_id`.
//!
//! # Pagination
//!
//! Every page carries the store's commit sequence (`as_of`) from the first
//! page inside an opaque cursor. Later pages read every recall as it stood at
//! that commit, so inserts and updates made while a client pages through
//! results never shift or duplicate later pages.
//!
//! Each signal pulls at most `candidate_k` candidates from the store before
//! scoring. `total` counts the scored matches among those candidates, so it
//! is a lower bound once a signal fills its quota.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MatchingConfig;
use crate::error::SearchError;
use crate::models::{CanonicalRecall, DuplicateLink};
use crate::normalize::{canonical_code, has_valid_check_digit};
use crate::similarity::{normalize_text, similarity, text_score};
use crate::store::{trim_code, SearchFilters, Store};

const MIN_PREFIX_DIGITS: usize = 6;
const MAX_PREFIX_DIGITS: usize = 14;
const MAX_QUERY_CHARS: usize = 256;
const HAZARD_WEIGHT: f64 = 0.8;

/// One scored recall, with the ids of its linked duplicates.
#[derive(Debug, Clone, Serialize)]
pub struct RecallMatch {
    pub recall: CanonicalRecall,
    pub confidence: f64,
    pub linked_recall_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// Carriers of the code, most recent recall first.
    ExactMatch(Vec<RecallMatch>),
    NoExactMatch,
}

/// Wire shape of an identifier lookup.
#[derive(Debug, Clone, Serialize)]
pub struct LookupResponse {
    pub matched: bool,
    pub recalls: Vec<RecallMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl From<LookupOutcome> for LookupResponse {
    fn from(outcome: LookupOutcome) -> Self {
        match outcome {
            LookupOutcome::ExactMatch(recalls) => Self {
                matched: true,
                recalls,
                confidence: Some(1.0),
            },
            LookupOutcome::NoExactMatch => Self {
                matched: false,
                recalls: Vec::new(),
                confidence: None,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimilarQuery {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub identifier_prefix: Option<String>,
}

/// Page selection. A `cursor` from a previous page overrides `offset`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    /// Matches at or above the confidence threshold among the candidates
    /// retrieved for this snapshot. Capped by `candidate_k` per signal.
    pub total: usize,
    pub items: Vec<RecallMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub as_of: i64,
}

/// A recall with the duplicate links touching it.
#[derive(Debug, Clone, Serialize)]
pub struct RecallDetail {
    pub recall: CanonicalRecall,
    pub links: Vec<DuplicateLink>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Cursor {
    as_of: i64,
    offset: usize,
}

impl Cursor {
    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    fn decode(token: &str) -> Result<Self, SearchError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| SearchError::Validation("malformed cursor".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| SearchError::Validation("malformed cursor".to_string()))
    }
}

/// Resolved page window.
struct Window {
    as_of: Option<i64>,
    offset: usize,
    limit: usize,
}

pub struct MatchingEngine {
    store: Arc<dyn Store>,
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(store: Arc<dyn Store>, config: MatchingConfig) -> Self {
        Self { store, config }
    }

    /// Exact lookup by barcode. Separators are ignored; UPC-A, EAN-13, and
    /// GTIN-14 spellings of one code are equivalent.
    pub async fn lookup_by_identifier(&self, code: &str) -> Result<LookupOutcome, SearchError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SearchError::Validation("identifier is empty".to_string()));
        }
        let canonical = canonical_code(code).ok_or_else(|| {
            SearchError::Validation(format!("not a UPC/EAN/GTIN/ISBN code: {}", code))
        })?;
        if !has_valid_check_digit(&canonical) {
            debug!(code = %canonical, "lookup code fails its check digit");
        }

        let mut recalls = self.store.lookup_identifier(&canonical).await?;
        if recalls.is_empty() {
            return Ok(LookupOutcome::NoExactMatch);
        }
        recalls.sort_by(|a, b| {
            b.recall_date
                .cmp(&a.recall_date)
                .then_with(|| a.recall_id.cmp(&b.recall_id))
        });
        let scored = recalls.into_iter().map(|r| (r, 1.0)).collect();
        Ok(LookupOutcome::ExactMatch(self.with_links(scored).await?))
    }

    /// Ranked fuzzy matches for a partial product description.
    pub async fn search_similar(
        &self,
        query: &SimilarQuery,
        page: &PageRequest,
    ) -> Result<SearchPage, SearchError> {
        let brand = non_empty(&query.brand);
        let name = non_empty(&query.product_name);
        let prefix = match non_empty(&query.identifier_prefix) {
            Some(p) => Some(parse_prefix(p)?),
            None => None,
        };
        if brand.is_none() && name.is_none() && prefix.is_none() {
            return Err(SearchError::Validation(
                "one of brand, product_name, or identifier_prefix is required".to_string(),
            ));
        }
        for text in brand.iter().chain(name.iter()) {
            check_length(text)?;
        }

        let window = self.window(page)?;
        let as_of = self.snapshot(&window).await?;
        let k = self.config.candidate_k;

        let mut candidates = Vec::new();
        if let Some(prefix) = &prefix {
            candidates.extend(self.store.prefix_candidates(prefix, as_of, k).await?);
        }
        let text: Vec<&str> = brand.iter().chain(name.iter()).copied().collect();
        if !text.is_empty() {
            candidates.extend(
                self.store
                    .text_candidates(&text.join(" "), &SearchFilters::default(), as_of, k)
                    .await?,
            );
        }

        let weights = &self.config;
        let scored = dedupe(candidates)
            .into_iter()
            .map(|recall| {
                let mut total = 0.0;
                let mut weight = 0.0;
                if let Some(prefix) = &prefix {
                    total += weights.identifier_prefix_weight * prefix_score(prefix, &recall);
                    weight += weights.identifier_prefix_weight;
                }
                if let Some(brand) = brand {
                    total += weights.brand_weight * brand_score(brand, &recall.brand);
                    weight += weights.brand_weight;
                }
                if let Some(name) = name {
                    total += weights.name_weight * text_score(name, &recall.product_name);
                    weight += weights.name_weight;
                }
                let confidence = if weight > 0.0 { total / weight } else { 0.0 };
                (recall, confidence)
            })
            .collect();

        self.paginate(scored, as_of, &window).await
    }

    /// Free-text search with filters. No identifier signals.
    pub async fn search_text(
        &self,
        query: &str,
        filters: &SearchFilters,
        page: &PageRequest,
    ) -> Result<SearchPage, SearchError> {
        let query = query.trim();
        if normalize_text(query).is_empty() {
            return Err(SearchError::Validation("query is empty".to_string()));
        }
        check_length(query)?;
        if let (Some(from), Some(to)) = (filters.date_from, filters.date_to) {
            if from > to {
                return Err(SearchError::Validation(format!(
                    "date range is inverted: {} > {}",
                    from, to
                )));
            }
        }

        let window = self.window(page)?;
        let as_of = self.snapshot(&window).await?;
        let candidates = self
            .store
            .text_candidates(query, filters, as_of, self.config.candidate_k)
            .await?;

        let scored = dedupe(candidates)
            .into_iter()
            .filter(|recall| filters.accepts(recall))
            .map(|recall| {
                let confidence = text_score(query, &recall.product_name)
                    .max(text_score(query, &recall.brand))
                    .max(HAZARD_WEIGHT * text_score(query, &recall.hazard_description));
                (recall, confidence)
            })
            .collect();

        self.paginate(scored, as_of, &window).await
    }

    pub async fn get_recall(&self, recall_id: &str) -> Result<RecallDetail, SearchError> {
        let recall = self.store.get_recall(recall_id).await?;
        let links = self.store.links_for(&[recall.recall_id.clone()]).await?;
        Ok(RecallDetail { recall, links })
    }

    fn window(&self, page: &PageRequest) -> Result<Window, SearchError> {
        let limit = page.limit.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Err(SearchError::Validation("limit must be positive".to_string()));
        }
        let limit = limit.min(self.config.max_limit);
        match &page.cursor {
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                Ok(Window {
                    as_of: Some(cursor.as_of),
                    offset: cursor.offset,
                    limit,
                })
            }
            None => Ok(Window {
                as_of: None,
                offset: page.offset,
                limit,
            }),
        }
    }

    async fn snapshot(&self, window: &Window) -> Result<i64, SearchError> {
        match window.as_of {
            Some(as_of) => Ok(as_of),
            None => Ok(self.store.snapshot_seq().await?),
        }
    }

    async fn paginate(
        &self,
        scored: Vec<(CanonicalRecall, f64)>,
        as_of: i64,
        window: &Window,
    ) -> Result<SearchPage, SearchError> {
        let mut kept: Vec<(CanonicalRecall, f64)> = scored
            .into_iter()
            .filter(|(_, confidence)| *confidence >= self.config.min_confidence)
            .map(|(recall, confidence)| (recall, confidence.clamp(0.0, 1.0)))
            .collect();
        kept.sort_by(|(a, ca), (b, cb)| {
            cb.partial_cmp(ca)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.recall_date.cmp(&a.recall_date))
                .then_with(|| a.recall_id.cmp(&b.recall_id))
        });

        let total = kept.len();
        let end = window.offset.saturating_add(window.limit);
        let next_cursor = (end < total).then(|| {
            Cursor {
                as_of,
                offset: end,
            }
            .encode()
        });
        let page: Vec<(CanonicalRecall, f64)> = kept
            .into_iter()
            .skip(window.offset)
            .take(window.limit)
            .collect();

        Ok(SearchPage {
            total,
            items: self.with_links(page).await?,
            next_cursor,
            as_of,
        })
    }

    async fn with_links(
        &self,
        scored: Vec<(CanonicalRecall, f64)>,
    ) -> Result<Vec<RecallMatch>, SearchError> {
        let ids: Vec<String> = scored.iter().map(|(r, _)| r.recall_id.clone()).collect();
        let mut linked: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if !ids.is_empty() {
            for link in self.store.links_for(&ids).await? {
                for id in [&link.recall_id, &link.linked_recall_id] {
                    linked
                        .entry(id.clone())
                        .or_default()
                        .push(link.other(id).to_string());
                }
            }
        }
        Ok(scored
            .into_iter()
            .map(|(recall, confidence)| {
                let mut linked_recall_ids = linked.remove(&recall.recall_id).unwrap_or_default();
                linked_recall_ids.sort();
                linked_recall_ids.dedup();
                RecallMatch {
                    recall,
                    confidence,
                    linked_recall_ids,
                }
            })
            .collect())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_length(text: &str) -> Result<(), SearchError> {
    if text.chars().count() > MAX_QUERY_CHARS {
        return Err(SearchError::Validation(format!(
            "query longer than {} characters",
            MAX_QUERY_CHARS
        )));
    }
    Ok(())
}

/// Digits of an identifier prefix with GTIN padding removed.
fn parse_prefix(prefix: &str) -> Result<String, SearchError> {
    let digits: String = prefix
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if !digits.chars().all(|c| c.is_ascii_digit())
        || !(MIN_PREFIX_DIGITS..=MAX_PREFIX_DIGITS).contains(&digits.len())
    {
        return Err(SearchError::Validation(format!(
            "identifier prefix must be {}-{} digits",
            MIN_PREFIX_DIGITS, MAX_PREFIX_DIGITS
        )));
    }
    Ok(trim_code(&digits).to_string())
}

fn prefix_score(trimmed_prefix: &str, recall: &CanonicalRecall) -> f64 {
    let hit = recall
        .identifiers
        .iter()
        .any(|id| trim_code(&id.canonical()).starts_with(trimmed_prefix));
    if hit {
        1.0
    } else {
        0.0
    }
}

/// Brand agreement: exact, containment either way, or discounted trigram similarity.
pub fn brand_score(query: &str, brand: &str) -> f64 {
    let q = normalize_text(query);
    let b = normalize_text(brand);
    if q.is_empty() || b.is_empty() {
        return 0.0;
    }
    if q == b {
        1.0
    } else if b.contains(&q) || q.contains(&b) {
        0.8
    } else {
        similarity(&q, &b) * 0.6
    }
}

fn dedupe(candidates: Vec<CanonicalRecall>) -> Vec<CanonicalRecall> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|r| seen.insert(r.recall_id.clone()))
        .collect()
}
