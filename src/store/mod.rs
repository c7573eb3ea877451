//! Storage abstraction for the recall index.
//!
//! The [`Store`] trait is the only path to persisted recalls, duplicate
//! links, and ingestion runs. Two backends implement it:
//!
//! - [`SqliteStore`](crate::sqlite_store::SqliteStore): the durable store used
//!   by the CLI and server.
//! - [`InMemoryStore`](memory::InMemoryStore): for tests and embedded use.
//!
//! Writes to recalls happen only through [`Store::apply_batch`], which the
//! orchestrator calls with a fully planned batch. Each batch is atomic.
//!
//! Every inserted or updated recall takes the next commit sequence. Candidate
//! reads take an `as_of` sequence and return each recall as it stood at that
//! commit, so paging through one snapshot is unaffected by later writes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AgencyCode, CanonicalRecall, DuplicateLink, IngestionRun, RunStatus};

/// One planned write against the recall table.
#[derive(Debug, Clone)]
pub enum UpsertOp {
    /// A recall id the store has never seen, with any duplicate links it triggered.
    Insert {
        recall: CanonicalRecall,
        links: Vec<DuplicateLink>,
    },
    /// Agency content changed. Applied only if the stored `last_updated_at`
    /// still equals `expected_last_updated_at`.
    Update {
        recall: CanonicalRecall,
        expected_last_updated_at: DateTime<Utc>,
    },
    /// Re-fetched with identical content; nothing is written.
    Unchanged { recall_id: String },
}

impl UpsertOp {
    pub fn recall_id(&self) -> &str {
        match self {
            UpsertOp::Insert { recall, .. } | UpsertOp::Update { recall, .. } => &recall.recall_id,
            UpsertOp::Unchanged { recall_id } => recall_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub linked: u64,
}

impl BatchOutcome {
    /// Records accounted for by the batch, changed or not.
    pub fn upserted(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Filters applied to text-search candidates.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub agency: Option<AgencyCode>,
    pub region: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl SearchFilters {
    pub fn accepts(&self, recall: &CanonicalRecall) -> bool {
        if let Some(agency) = &self.agency {
            if &recall.agency_code != agency {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if !recall.region.eq_ignore_ascii_case(region) {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if recall.recall_date < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if recall.recall_date > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgencyCount {
    pub agency_code: AgencyCode,
    pub recalls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub recalls: u64,
    pub identifiers: u64,
    pub duplicate_links: u64,
    pub by_agency: Vec<AgencyCount>,
}

/// Abstract storage backend.
///
/// | Group | Methods |
/// |-------|---------|
/// | Recalls | [`get_recall`](Store::get_recall), [`get_recalls`](Store::get_recalls), [`find_by_dedupe_key`](Store::find_by_dedupe_key), [`apply_batch`](Store::apply_batch) |
/// | Matching | [`lookup_identifier`](Store::lookup_identifier), [`text_candidates`](Store::text_candidates), [`prefix_candidates`](Store::prefix_candidates), [`links_for`](Store::links_for), [`snapshot_seq`](Store::snapshot_seq) |
/// | Runs | [`create_run`](Store::create_run), [`update_run`](Store::update_run), [`get_run`](Store::get_run), [`list_runs`](Store::list_runs), [`last_completed_run`](Store::last_completed_run), [`fail_orphaned_runs`](Store::fail_orphaned_runs) |
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one recall. [`StoreError::NotFound`] if absent.
    async fn get_recall(&self, recall_id: &str) -> Result<CanonicalRecall, StoreError>;

    /// Fetch the recalls that exist among `recall_ids`, in no particular order.
    async fn get_recalls(&self, recall_ids: &[String]) -> Result<Vec<CanonicalRecall>, StoreError>;

    /// Recalls sharing a dedupe key within a region.
    async fn find_by_dedupe_key(
        &self,
        dedupe_key: &str,
        region: &str,
    ) -> Result<Vec<CanonicalRecall>, StoreError>;

    /// Apply a planned batch atomically.
    ///
    /// Fails with [`StoreError::StaleWrite`] if an insert collides with a
    /// recall written since planning, or an update's optimistic check fails.
    /// Nothing from the batch is visible after a failure.
    async fn apply_batch(&self, ops: &[UpsertOp]) -> Result<BatchOutcome, StoreError>;

    /// Recalls carrying the identifier with this canonical (GTIN-14) form.
    async fn lookup_identifier(&self, canonical: &str) -> Result<Vec<CanonicalRecall>, StoreError>;

    /// Candidates for fuzzy text matching over product name, brand, and
    /// hazard text, as they stood at commit `as_of`.
    ///
    /// Recalls inserted after `as_of` are absent; recalls updated after it
    /// are matched and returned in their earlier version.
    async fn text_candidates(
        &self,
        query: &str,
        filters: &SearchFilters,
        as_of: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalRecall>, StoreError>;

    /// Recalls with an identifier whose zero-trimmed canonical form starts
    /// with `trimmed_prefix`, as they stood at commit `as_of`.
    async fn prefix_candidates(
        &self,
        trimmed_prefix: &str,
        as_of: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalRecall>, StoreError>;

    /// Every duplicate link touching any of `recall_ids`.
    async fn links_for(&self, recall_ids: &[String]) -> Result<Vec<DuplicateLink>, StoreError>;

    /// Highest commit sequence; the `as_of` for a new search snapshot.
    async fn snapshot_seq(&self) -> Result<i64, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Insert a new PENDING run. [`StoreError::Conflict`] if the agency
    /// already has a PENDING or RUNNING run.
    async fn create_run(&self, run: &IngestionRun) -> Result<(), StoreError>;

    /// Overwrite a run if its stored status is still `expected`.
    ///
    /// Returns `false` without writing when another writer moved the run first.
    async fn update_run(&self, run: &IngestionRun, expected: RunStatus)
        -> Result<bool, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, StoreError>;

    /// Most recent runs first.
    async fn list_runs(
        &self,
        agency: Option<&AgencyCode>,
        limit: usize,
    ) -> Result<Vec<IngestionRun>, StoreError>;

    async fn last_completed_run(
        &self,
        agency: &AgencyCode,
    ) -> Result<Option<IngestionRun>, StoreError>;

    /// Mark every PENDING or RUNNING run FAILED. Used at startup, when no
    /// worker can still own them.
    async fn fail_orphaned_runs(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Reject recalls whose key would violate the store's uniqueness invariant.
pub(crate) fn check_recall_id(recall: &CanonicalRecall) -> Result<(), StoreError> {
    if recall.recall_id.trim().is_empty() {
        return Err(StoreError::ConstraintViolation(
            "recall_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Strip the GTIN padding so manufacturer prefixes compare across code lengths.
pub fn trim_code(code: &str) -> &str {
    let trimmed = code.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}
