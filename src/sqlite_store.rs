//! SQLite-backed [`Store`] implementation.
//!
//! Recalls live in `recalls` with their identifiers in `recall_identifiers`
//! and a trigram FTS5 mirror in `recalls_fts`. Every batch runs in one
//! transaction; the optimistic `last_updated_at` check and the
//! one-active-run-per-agency rule are enforced by the SQL itself, so they
//! hold across processes sharing the database file.
//!
//! Every insert or update takes the next `seq`. An update first archives the
//! version it replaces in `recall_versions`, so candidate reads at an older
//! `as_of` return each recall as it stood then.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AgencyCode, CanonicalRecall, DuplicateLink, FailureClass, Identifier, IngestionRun,
    RunFailure, RunStatus, Watermark,
};
use crate::similarity::normalize_text;
use crate::store::{
    check_recall_id, trim_code, AgencyCount, BatchOutcome, SearchFilters, Store, StoreStats,
    UpsertOp,
};

const RECALL_COLUMNS: &str = "r.recall_id, r.agency_code, r.agency_native_id, r.product_name, \
     r.brand, r.model_number, r.hazard_description, r.remedy, r.severity, r.risk_category, \
     r.recall_date, r.region, r.source_url, r.raw_payload, r.dedupe_key, r.first_seen_at, \
     r.last_updated_at";

const RUN_COLUMNS: &str = "run_id, agency_code, status, created_at, started_at, completed_at, \
     records_fetched, records_upserted, records_skipped_errors, records_linked, \
     watermark_before, watermark_after, error_summary, failure";

/// Chunk size for `IN (...)` lists.
const IN_CHUNK: usize = 500;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Attach identifiers to recalls loaded from `recalls` rows.
    async fn hydrate(&self, rows: Vec<SqliteRow>) -> Result<Vec<CanonicalRecall>, StoreError> {
        let mut recalls = rows
            .iter()
            .map(recall_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if recalls.is_empty() {
            return Ok(recalls);
        }

        let mut by_recall: HashMap<String, Vec<Identifier>> = HashMap::new();
        for chunk in recalls.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT recall_id, id_type, value FROM recall_identifiers WHERE recall_id IN (",
            );
            let mut sep = qb.separated(", ");
            for r in chunk {
                sep.push_bind(r.recall_id.clone());
            }
            qb.push(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                let recall_id: String = row.try_get("recall_id")?;
                by_recall
                    .entry(recall_id)
                    .or_default()
                    .push(identifier_from_row(&row)?);
            }
        }

        for recall in &mut recalls {
            if let Some(ids) = by_recall.remove(&recall.recall_id) {
                recall.identifiers = ids.into_iter().collect();
            }
        }
        Ok(recalls)
    }

    /// Archived versions that were current at `as_of` and have been replaced since.
    async fn versions_at(&self, as_of: i64) -> Result<Vec<CanonicalRecall>, StoreError> {
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM recall_versions WHERE seq <= ? AND superseded_seq > ?",
        )
        .bind(as_of)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(StoreError::from))
            .collect()
    }

    /// Add the archived versions visible at `as_of` that `keep` accepts.
    ///
    /// Runs after the live query, so a recall updated in between shows up
    /// in both and the first copy wins.
    async fn merge_versions(
        &self,
        found: &mut Vec<CanonicalRecall>,
        as_of: i64,
        keep: impl Fn(&CanonicalRecall) -> bool,
    ) -> Result<(), StoreError> {
        let seen: HashSet<String> = found.iter().map(|r| r.recall_id.clone()).collect();
        for prior in self.versions_at(as_of).await? {
            if !seen.contains(&prior.recall_id) && keep(&prior) {
                found.push(prior);
            }
        }
        Ok(())
    }
}

fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_to_ts(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Unavailable(format!("corrupt timestamp: {}", ms)))
}

fn opt_millis_to_ts(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(millis_to_ts).transpose()
}

fn recall_from_row(row: &SqliteRow) -> Result<CanonicalRecall, StoreError> {
    let severity: String = row.try_get("severity")?;
    let recall_date: String = row.try_get("recall_date")?;
    let agency_code: String = row.try_get("agency_code")?;
    Ok(CanonicalRecall {
        recall_id: row.try_get("recall_id")?,
        agency_code: AgencyCode::new(agency_code),
        agency_native_id: row.try_get("agency_native_id")?,
        product_name: row.try_get("product_name")?,
        brand: row.try_get("brand")?,
        model_number: row.try_get("model_number")?,
        identifiers: Default::default(),
        hazard_description: row.try_get("hazard_description")?,
        remedy: row.try_get("remedy")?,
        severity: severity
            .parse()
            .map_err(|e: String| StoreError::Unavailable(format!("corrupt row: {}", e)))?,
        risk_category: row.try_get("risk_category")?,
        recall_date: NaiveDate::parse_from_str(&recall_date, "%Y-%m-%d").map_err(|_| {
            StoreError::Unavailable(format!("corrupt recall_date: {}", recall_date))
        })?,
        region: row.try_get("region")?,
        source_url: row.try_get("source_url")?,
        raw_payload: row.try_get("raw_payload")?,
        dedupe_key: row.try_get("dedupe_key")?,
        first_seen_at: millis_to_ts(row.try_get("first_seen_at")?)?,
        last_updated_at: millis_to_ts(row.try_get("last_updated_at")?)?,
    })
}

fn identifier_from_row(row: &SqliteRow) -> Result<Identifier, StoreError> {
    let id_type: String = row.try_get("id_type")?;
    Ok(Identifier {
        id_type: id_type
            .parse()
            .map_err(|e: String| StoreError::Unavailable(format!("corrupt row: {}", e)))?,
        value: row.try_get("value")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<IngestionRun, StoreError> {
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    let agency_code: String = row.try_get("agency_code")?;
    let watermark_before: Option<String> = row.try_get("watermark_before")?;
    let watermark_after: Option<String> = row.try_get("watermark_after")?;
    let error_summary: String = row.try_get("error_summary")?;
    let failure: Option<String> = row.try_get("failure")?;

    Ok(IngestionRun {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|_| StoreError::Unavailable(format!("corrupt run_id: {}", run_id)))?,
        agency_code: AgencyCode::new(agency_code),
        status: status
            .parse()
            .map_err(|e: String| StoreError::Unavailable(format!("corrupt row: {}", e)))?,
        created_at: millis_to_ts(row.try_get("created_at")?)?,
        started_at: opt_millis_to_ts(row.try_get("started_at")?)?,
        completed_at: opt_millis_to_ts(row.try_get("completed_at")?)?,
        records_fetched: row.try_get::<i64, _>("records_fetched")? as u64,
        records_upserted: row.try_get::<i64, _>("records_upserted")? as u64,
        records_skipped_errors: row.try_get::<i64, _>("records_skipped_errors")? as u64,
        records_linked: row.try_get::<i64, _>("records_linked")? as u64,
        watermark_before: watermark_before
            .map(|s| serde_json::from_str::<Watermark>(&s))
            .transpose()?,
        watermark_after: watermark_after
            .map(|s| serde_json::from_str::<Watermark>(&s))
            .transpose()?,
        error_summary: serde_json::from_str(&error_summary)?,
        failure: failure
            .map(|s| serde_json::from_str::<RunFailure>(&s))
            .transpose()?,
    })
}

/// Every distinct 3-character window of every normalized query word.
fn query_grams(query: &str) -> Vec<String> {
    let mut grams: Vec<String> = Vec::new();
    for word in normalize_text(query).split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            if !grams.contains(&gram) {
                grams.push(gram);
            }
        }
    }
    grams
}

/// FTS5 trigram query: every 3-character window of every query word, OR-ed.
///
/// Returns `None` when no word is long enough to produce a trigram.
fn fts_query(query: &str) -> Option<String> {
    let grams = query_grams(query);
    if grams.is_empty() {
        return None;
    }
    Some(
        grams
            .iter()
            .map(|g| format!("\"{}\"", g))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// The text-candidate match applied in process to archived versions.
fn text_matches(query: &str, recall: &CanonicalRecall) -> bool {
    let text = normalize_text(&format!(
        "{} {} {}",
        recall.product_name, recall.brand, recall.hazard_description
    ));
    let grams = query_grams(query);
    if grams.is_empty() {
        return text.contains(&normalize_text(query));
    }
    grams.iter().any(|g| text.contains(g.as_str()))
}

/// Copy the stored version of `recall_id` into `recall_versions`.
///
/// Returns `false` when the stored `last_updated_at` no longer matches.
async fn archive_version(
    tx: &mut Transaction<'_, Sqlite>,
    recall_id: &str,
    expected_last_updated_at: DateTime<Utc>,
    superseded_seq: i64,
) -> Result<bool, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT r.seq, {} FROM recalls r WHERE r.recall_id = ? AND r.last_updated_at = ?",
        RECALL_COLUMNS
    ))
    .bind(recall_id)
    .bind(ts_to_millis(expected_last_updated_at))
    .fetch_optional(&mut **tx)
    .await?;
    let row = match row {
        Some(row) => row,
        None => return Ok(false),
    };
    let seq: i64 = row.try_get("seq")?;
    let mut prior = recall_from_row(&row)?;
    let id_rows = sqlx::query("SELECT id_type, value FROM recall_identifiers WHERE recall_id = ?")
        .bind(recall_id)
        .fetch_all(&mut **tx)
        .await?;
    for id_row in &id_rows {
        prior.identifiers.insert(identifier_from_row(id_row)?);
    }

    sqlx::query(
        "INSERT INTO recall_versions (recall_id, seq, superseded_seq, payload) VALUES (?, ?, ?, ?)",
    )
    .bind(recall_id)
    .bind(seq)
    .bind(superseded_seq)
    .bind(serde_json::to_string(&prior)?)
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

async fn write_recall_indexes(
    tx: &mut Transaction<'_, Sqlite>,
    recall: &CanonicalRecall,
) -> Result<(), StoreError> {
    for id in &recall.identifiers {
        let canonical = id.canonical();
        sqlx::query(
            "INSERT OR IGNORE INTO recall_identifiers (recall_id, id_type, value, canonical, trimmed) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&recall.recall_id)
        .bind(id.id_type.as_str())
        .bind(&id.value)
        .bind(&canonical)
        .bind(trim_code(&canonical))
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO recalls_fts (recall_id, product_name, brand, hazard_description) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(&recall.recall_id)
    .bind(&recall.product_name)
    .bind(&recall.brand)
    .bind(&recall.hazard_description)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn clear_recall_indexes(
    tx: &mut Transaction<'_, Sqlite>,
    recall_id: &str,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM recall_identifiers WHERE recall_id = ?")
        .bind(recall_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM recalls_fts WHERE recall_id = ?")
        .bind(recall_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_link(
    tx: &mut Transaction<'_, Sqlite>,
    link: &DuplicateLink,
) -> Result<bool, StoreError> {
    let already: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM duplicate_links \
         WHERE (recall_id = ? AND linked_recall_id = ?) OR (recall_id = ? AND linked_recall_id = ?)",
    )
    .bind(&link.recall_id)
    .bind(&link.linked_recall_id)
    .bind(&link.linked_recall_id)
    .bind(&link.recall_id)
    .fetch_one(&mut **tx)
    .await?;
    if already {
        return Ok(false);
    }

    let result = sqlx::query(
        "INSERT INTO duplicate_links (recall_id, linked_recall_id, similarity, linked_at) \
         SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM recalls WHERE recall_id = ?)",
    )
    .bind(&link.recall_id)
    .bind(&link.linked_recall_id)
    .bind(link.similarity)
    .bind(ts_to_millis(link.linked_at))
    .bind(&link.linked_recall_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_recall(&self, recall_id: &str) -> Result<CanonicalRecall, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recalls r WHERE r.recall_id = ?",
            RECALL_COLUMNS
        ))
        .bind(recall_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => self
                .hydrate(vec![row])
                .await?
                .pop()
                .ok_or_else(|| StoreError::NotFound(recall_id.to_string())),
            None => Err(StoreError::NotFound(recall_id.to_string())),
        }
    }

    async fn get_recalls(&self, recall_ids: &[String]) -> Result<Vec<CanonicalRecall>, StoreError> {
        let mut rows = Vec::new();
        for chunk in recall_ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {} FROM recalls r WHERE r.recall_id IN (",
                RECALL_COLUMNS
            ));
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.clone());
            }
            qb.push(")");
            rows.extend(qb.build().fetch_all(&self.pool).await?);
        }
        self.hydrate(rows).await
    }

    async fn find_by_dedupe_key(
        &self,
        dedupe_key: &str,
        region: &str,
    ) -> Result<Vec<CanonicalRecall>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM recalls r WHERE r.dedupe_key = ? AND r.region = ?",
            RECALL_COLUMNS
        ))
        .bind(dedupe_key)
        .bind(region)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn apply_batch(&self, ops: &[UpsertOp]) -> Result<BatchOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        for op in ops {
            match op {
                UpsertOp::Insert { recall, links } => {
                    check_recall_id(recall)?;
                    let result = sqlx::query(
                        r#"
                        INSERT INTO recalls (recall_id, agency_code, agency_native_id, product_name,
                                             brand, model_number, hazard_description, remedy,
                                             severity, risk_category, recall_date, region,
                                             source_url, raw_payload, dedupe_key, content_hash,
                                             first_seen_at, last_updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(recall_id) DO NOTHING
                        "#,
                    )
                    .bind(&recall.recall_id)
                    .bind(recall.agency_code.as_str())
                    .bind(&recall.agency_native_id)
                    .bind(&recall.product_name)
                    .bind(&recall.brand)
                    .bind(&recall.model_number)
                    .bind(&recall.hazard_description)
                    .bind(&recall.remedy)
                    .bind(recall.severity.as_str())
                    .bind(&recall.risk_category)
                    .bind(recall.recall_date.format("%Y-%m-%d").to_string())
                    .bind(&recall.region)
                    .bind(&recall.source_url)
                    .bind(&recall.raw_payload)
                    .bind(&recall.dedupe_key)
                    .bind(recall.content_hash())
                    .bind(ts_to_millis(recall.first_seen_at))
                    .bind(ts_to_millis(recall.last_updated_at))
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::StaleWrite(recall.recall_id.clone()));
                    }
                    write_recall_indexes(&mut tx, recall).await?;
                    for link in links {
                        if insert_link(&mut tx, link).await? {
                            outcome.linked += 1;
                        }
                    }
                    outcome.inserted += 1;
                }
                UpsertOp::Update {
                    recall,
                    expected_last_updated_at,
                } => {
                    check_recall_id(recall)?;
                    let next_seq: i64 =
                        sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM recalls")
                            .fetch_one(&mut *tx)
                            .await?;
                    let archived = archive_version(
                        &mut tx,
                        &recall.recall_id,
                        *expected_last_updated_at,
                        next_seq,
                    )
                    .await?;
                    if !archived {
                        return Err(StoreError::StaleWrite(recall.recall_id.clone()));
                    }
                    let result = sqlx::query(
                        r#"
                        UPDATE recalls SET
                            seq = ?, agency_native_id = ?, product_name = ?, brand = ?,
                            model_number = ?, hazard_description = ?, remedy = ?, severity = ?,
                            risk_category = ?, recall_date = ?, region = ?, source_url = ?,
                            raw_payload = ?, dedupe_key = ?, content_hash = ?, last_updated_at = ?
                        WHERE recall_id = ? AND last_updated_at = ?
                        "#,
                    )
                    .bind(next_seq)
                    .bind(&recall.agency_native_id)
                    .bind(&recall.product_name)
                    .bind(&recall.brand)
                    .bind(&recall.model_number)
                    .bind(&recall.hazard_description)
                    .bind(&recall.remedy)
                    .bind(recall.severity.as_str())
                    .bind(&recall.risk_category)
                    .bind(recall.recall_date.format("%Y-%m-%d").to_string())
                    .bind(&recall.region)
                    .bind(&recall.source_url)
                    .bind(&recall.raw_payload)
                    .bind(&recall.dedupe_key)
                    .bind(recall.content_hash())
                    .bind(ts_to_millis(recall.last_updated_at))
                    .bind(&recall.recall_id)
                    .bind(ts_to_millis(*expected_last_updated_at))
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::StaleWrite(recall.recall_id.clone()));
                    }
                    clear_recall_indexes(&mut tx, &recall.recall_id).await?;
                    write_recall_indexes(&mut tx, recall).await?;
                    outcome.updated += 1;
                }
                UpsertOp::Unchanged { .. } => outcome.unchanged += 1,
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn lookup_identifier(&self, canonical: &str) -> Result<Vec<CanonicalRecall>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {} FROM recall_identifiers i \
             JOIN recalls r ON r.recall_id = i.recall_id WHERE i.canonical = ?",
            RECALL_COLUMNS
        ))
        .bind(canonical)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn text_candidates(
        &self,
        query: &str,
        filters: &SearchFilters,
        as_of: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalRecall>, StoreError> {
        let fts = fts_query(query);
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM ", RECALL_COLUMNS));
        match &fts {
            Some(fts) => {
                qb.push(
                    "recalls_fts JOIN recalls r ON r.recall_id = recalls_fts.recall_id \
                     WHERE recalls_fts MATCH ",
                );
                qb.push_bind(fts.clone());
            }
            // Words shorter than a trigram: substring scan.
            None => {
                let like = format!("%{}%", query.trim());
                qb.push("recalls r WHERE (r.product_name LIKE ");
                qb.push_bind(like.clone());
                qb.push(" OR r.brand LIKE ");
                qb.push_bind(like.clone());
                qb.push(" OR r.hazard_description LIKE ");
                qb.push_bind(like);
                qb.push(")");
            }
        }

        qb.push(" AND r.seq <= ");
        qb.push_bind(as_of);
        if let Some(agency) = &filters.agency {
            qb.push(" AND r.agency_code = ");
            qb.push_bind(agency.as_str().to_string());
        }
        if let Some(region) = &filters.region {
            qb.push(" AND upper(r.region) = upper(");
            qb.push_bind(region.clone());
            qb.push(")");
        }
        if let Some(from) = filters.date_from {
            qb.push(" AND r.recall_date >= ");
            qb.push_bind(from.format("%Y-%m-%d").to_string());
        }
        if let Some(to) = filters.date_to {
            qb.push(" AND r.recall_date <= ");
            qb.push_bind(to.format("%Y-%m-%d").to_string());
        }
        qb.push(if fts.is_some() {
            " ORDER BY bm25(recalls_fts)"
        } else {
            " ORDER BY r.recall_date DESC"
        });
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut found = self.hydrate(rows).await?;
        self.merge_versions(&mut found, as_of, |prior| {
            filters.accepts(prior) && text_matches(query, prior)
        })
        .await?;
        Ok(found)
    }

    async fn prefix_candidates(
        &self,
        trimmed_prefix: &str,
        as_of: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalRecall>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {} FROM recall_identifiers i \
             JOIN recalls r ON r.recall_id = i.recall_id \
             WHERE i.trimmed LIKE ? || '%' AND r.seq <= ? \
             ORDER BY r.recall_date DESC LIMIT ?",
            RECALL_COLUMNS
        ))
        .bind(trimmed_prefix)
        .bind(as_of)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut found = self.hydrate(rows).await?;
        self.merge_versions(&mut found, as_of, |prior| {
            prior
                .identifiers
                .iter()
                .any(|id| trim_code(&id.canonical()).starts_with(trimmed_prefix))
        })
        .await?;
        Ok(found)
    }

    async fn links_for(&self, recall_ids: &[String]) -> Result<Vec<DuplicateLink>, StoreError> {
        let mut links: Vec<DuplicateLink> = Vec::new();
        for chunk in recall_ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT recall_id, linked_recall_id, similarity, linked_at FROM duplicate_links \
                 WHERE recall_id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.clone());
            }
            qb.push(") OR linked_recall_id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.clone());
            }
            qb.push(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                let link = DuplicateLink {
                    recall_id: row.try_get("recall_id")?,
                    linked_recall_id: row.try_get("linked_recall_id")?,
                    similarity: row.try_get("similarity")?,
                    linked_at: millis_to_ts(row.try_get("linked_at")?)?,
                };
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }
        Ok(links)
    }

    async fn snapshot_seq(&self) -> Result<i64, StoreError> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM recalls")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let recalls: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recalls")
            .fetch_one(&self.pool)
            .await?;
        let identifiers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recall_identifiers")
            .fetch_one(&self.pool)
            .await?;
        let duplicate_links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM duplicate_links")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            "SELECT agency_code, COUNT(*) AS n FROM recalls GROUP BY agency_code ORDER BY agency_code",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_agency = rows
            .iter()
            .map(|row| -> Result<AgencyCount, StoreError> {
                let code: String = row.try_get("agency_code")?;
                let n: i64 = row.try_get("n")?;
                Ok(AgencyCount {
                    agency_code: AgencyCode::new(code),
                    recalls: n as u64,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(StoreStats {
            recalls: recalls as u64,
            identifiers: identifiers as u64,
            duplicate_links: duplicate_links as u64,
            by_agency,
        })
    }

    async fn create_run(&self, run: &IngestionRun) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO ingestion_runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RUN_COLUMNS
        ))
        .bind(run.run_id.to_string())
        .bind(run.agency_code.as_str())
        .bind(run.status.as_str())
        .bind(ts_to_millis(run.created_at))
        .bind(run.started_at.map(ts_to_millis))
        .bind(run.completed_at.map(ts_to_millis))
        .bind(run.records_fetched as i64)
        .bind(run.records_upserted as i64)
        .bind(run.records_skipped_errors as i64)
        .bind(run.records_linked as i64)
        .bind(run.watermark_before.as_ref().map(serde_json::to_string).transpose()?)
        .bind(run.watermark_after.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&run.error_summary)?)
        .bind(run.failure.as_ref().map(serde_json::to_string).transpose()?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict(run.agency_code.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_run(
        &self,
        run: &IngestionRun,
        expected: RunStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_runs SET
                status = ?, started_at = ?, completed_at = ?,
                records_fetched = ?, records_upserted = ?, records_skipped_errors = ?,
                records_linked = ?, watermark_before = ?, watermark_after = ?,
                error_summary = ?, failure = ?
            WHERE run_id = ? AND status = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.started_at.map(ts_to_millis))
        .bind(run.completed_at.map(ts_to_millis))
        .bind(run.records_fetched as i64)
        .bind(run.records_upserted as i64)
        .bind(run.records_skipped_errors as i64)
        .bind(run.records_linked as i64)
        .bind(run.watermark_before.as_ref().map(serde_json::to_string).transpose()?)
        .bind(run.watermark_after.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&run.error_summary)?)
        .bind(run.failure.as_ref().map(serde_json::to_string).transpose()?)
        .bind(run.run_id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish "lost the race" from "no such run".
        self.get_run(run.run_id).await.map(|_| false)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_runs WHERE run_id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(StoreError::NotFound(run_id.to_string())),
        }
    }

    async fn list_runs(
        &self,
        agency: Option<&AgencyCode>,
        limit: usize,
    ) -> Result<Vec<IngestionRun>, StoreError> {
        let agency = agency.map(|a| a.as_str().to_string());
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_runs WHERE (? IS NULL OR agency_code = ?) \
             ORDER BY created_at DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(&agency)
        .bind(&agency)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn last_completed_run(
        &self,
        agency: &AgencyCode,
    ) -> Result<Option<IngestionRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_runs WHERE agency_code = ? AND status = 'COMPLETED' \
             ORDER BY completed_at DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(agency.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn fail_orphaned_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT run_id FROM ingestion_runs WHERE status IN ('PENDING', 'RUNNING')",
        )
        .fetch_all(&mut *tx)
        .await?;

        let failure = serde_json::to_string(&RunFailure {
            class: FailureClass::Orphaned,
            message: "process exited while the run was active".to_string(),
        })?;
        sqlx::query(
            "UPDATE ingestion_runs SET status = 'FAILED', completed_at = ?, failure = ? \
             WHERE status IN ('PENDING', 'RUNNING')",
        )
        .bind(ts_to_millis(Utc::now()))
        .bind(&failure)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        ids.iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|_| StoreError::Unavailable(format!("corrupt run_id: {}", id)))
            })
            .collect()
    }
}
