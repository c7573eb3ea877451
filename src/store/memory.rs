//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! All state lives behind one `std::sync::RwLock`, so a batch is validated and
//! applied under a single write guard and readers never see half of it.
//! Candidate retrieval is a linear scan over trigram overlap. Updated
//! recalls keep their prior versions so snapshot reads stay repeatable.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AgencyCode, CanonicalRecall, DuplicateLink, FailureClass, IngestionRun, RunFailure, RunStatus,
};
use crate::similarity::trigrams;

use super::{
    check_recall_id, trim_code, AgencyCount, BatchOutcome, SearchFilters, Store, StoreStats,
    UpsertOp,
};

struct StoredRecall {
    seq: i64,
    recall: CanonicalRecall,
    /// Superseded versions, oldest first.
    history: Vec<(i64, CanonicalRecall)>,
}

impl StoredRecall {
    /// The version that was current at commit `as_of`, if the recall existed then.
    fn at(&self, as_of: i64) -> Option<&CanonicalRecall> {
        if self.seq <= as_of {
            return Some(&self.recall);
        }
        self.history
            .iter()
            .rev()
            .find(|(seq, _)| *seq <= as_of)
            .map(|(_, recall)| recall)
    }
}

#[derive(Default)]
struct Inner {
    seq: i64,
    recalls: HashMap<String, StoredRecall>,
    /// canonical code → recall ids
    identifiers: HashMap<String, BTreeSet<String>>,
    links: Vec<DuplicateLink>,
    runs: HashMap<Uuid, IngestionRun>,
}

impl Inner {
    fn index_identifiers(&mut self, recall: &CanonicalRecall) {
        for id in &recall.identifiers {
            self.identifiers
                .entry(id.canonical())
                .or_default()
                .insert(recall.recall_id.clone());
        }
    }

    fn unindex_identifiers(&mut self, recall_id: &str) {
        for ids in self.identifiers.values_mut() {
            ids.remove(recall_id);
        }
        self.identifiers.retain(|_, ids| !ids.is_empty());
    }

    fn has_link(&self, a: &str, b: &str) -> bool {
        self.links.iter().any(|l| {
            (l.recall_id == a && l.linked_recall_id == b)
                || (l.recall_id == b && l.linked_recall_id == a)
        })
    }

    fn visible(&self, as_of: i64) -> impl Iterator<Item = &CanonicalRecall> {
        self.recalls.values().filter_map(move |s| s.at(as_of))
    }
}

/// In-memory store. Cheap to construct; one per test.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    /// (or succeed again), to exercise outage handling.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.check_available()?;
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.check_available()?;
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_recall(&self, recall_id: &str) -> Result<CanonicalRecall, StoreError> {
        let inner = self.read()?;
        inner
            .recalls
            .get(recall_id)
            .map(|s| s.recall.clone())
            .ok_or_else(|| StoreError::NotFound(recall_id.to_string()))
    }

    async fn get_recalls(&self, recall_ids: &[String]) -> Result<Vec<CanonicalRecall>, StoreError> {
        let inner = self.read()?;
        Ok(recall_ids
            .iter()
            .filter_map(|id| inner.recalls.get(id).map(|s| s.recall.clone()))
            .collect())
    }

    async fn find_by_dedupe_key(
        &self,
        dedupe_key: &str,
        region: &str,
    ) -> Result<Vec<CanonicalRecall>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .recalls
            .values()
            .filter(|s| s.recall.dedupe_key == dedupe_key && s.recall.region == region)
            .map(|s| s.recall.clone())
            .collect())
    }

    async fn apply_batch(&self, ops: &[UpsertOp]) -> Result<BatchOutcome, StoreError> {
        let mut inner = self.write()?;

        // Validate everything before touching state.
        let mut batch_ids = HashSet::new();
        for op in ops {
            if !batch_ids.insert(op.recall_id().to_string()) {
                return Err(StoreError::ConstraintViolation(format!(
                    "recall {} appears twice in one batch",
                    op.recall_id()
                )));
            }
            match op {
                UpsertOp::Insert { recall, .. } => {
                    check_recall_id(recall)?;
                    if inner.recalls.contains_key(&recall.recall_id) {
                        return Err(StoreError::StaleWrite(recall.recall_id.clone()));
                    }
                }
                UpsertOp::Update {
                    recall,
                    expected_last_updated_at,
                } => {
                    check_recall_id(recall)?;
                    match inner.recalls.get(&recall.recall_id) {
                        Some(stored)
                            if stored.recall.last_updated_at == *expected_last_updated_at => {}
                        _ => return Err(StoreError::StaleWrite(recall.recall_id.clone())),
                    }
                }
                UpsertOp::Unchanged { .. } => {}
            }
        }

        let mut outcome = BatchOutcome::default();
        for op in ops {
            match op {
                UpsertOp::Insert { recall, links } => {
                    inner.seq += 1;
                    let seq = inner.seq;
                    inner.index_identifiers(recall);
                    inner.recalls.insert(
                        recall.recall_id.clone(),
                        StoredRecall {
                            seq,
                            recall: recall.clone(),
                            history: Vec::new(),
                        },
                    );
                    for link in links {
                        if inner.recalls.contains_key(&link.linked_recall_id)
                            && !inner.has_link(&link.recall_id, &link.linked_recall_id)
                        {
                            inner.links.push(link.clone());
                            outcome.linked += 1;
                        }
                    }
                    outcome.inserted += 1;
                }
                UpsertOp::Update { recall, .. } => {
                    inner.seq += 1;
                    let seq = inner.seq;
                    inner.unindex_identifiers(&recall.recall_id);
                    inner.index_identifiers(recall);
                    if let Some(stored) = inner.recalls.get_mut(&recall.recall_id) {
                        let prior = std::mem::replace(&mut stored.recall, recall.clone());
                        stored.history.push((stored.seq, prior));
                        stored.seq = seq;
                    }
                    outcome.updated += 1;
                }
                UpsertOp::Unchanged { .. } => outcome.unchanged += 1,
            }
        }
        Ok(outcome)
    }

    async fn lookup_identifier(&self, canonical: &str) -> Result<Vec<CanonicalRecall>, StoreError> {
        let inner = self.read()?;
        let ids = match inner.identifiers.get(canonical) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.recalls.get(id).map(|s| s.recall.clone()))
            .collect())
    }

    async fn text_candidates(
        &self,
        query: &str,
        filters: &SearchFilters,
        as_of: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalRecall>, StoreError> {
        let query_grams = trigrams(query);
        if query_grams.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let mut scored: Vec<(usize, &CanonicalRecall)> = inner
            .visible(as_of)
            .filter(|r| filters.accepts(r))
            .filter_map(|r| {
                let text = format!("{} {} {}", r.product_name, r.brand, r.hazard_description);
                let grams = trigrams(&text);
                let shared = query_grams.iter().filter(|g| grams.contains(*g)).count();
                (shared > 0).then_some((shared, r))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.recall_id.cmp(&b.1.recall_id)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn prefix_candidates(
        &self,
        trimmed_prefix: &str,
        as_of: i64,
        limit: usize,
    ) -> Result<Vec<CanonicalRecall>, StoreError> {
        let inner = self.read()?;
        // Scan versions rather than the identifier index, which only knows
        // the current identifiers.
        let mut found: Vec<CanonicalRecall> = inner
            .visible(as_of)
            .filter(|r| {
                r.identifiers
                    .iter()
                    .any(|id| trim_code(&id.canonical()).starts_with(trimmed_prefix))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.recall_date
                .cmp(&a.recall_date)
                .then_with(|| a.recall_id.cmp(&b.recall_id))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn links_for(&self, recall_ids: &[String]) -> Result<Vec<DuplicateLink>, StoreError> {
        let inner = self.read()?;
        let wanted: HashSet<&str> = recall_ids.iter().map(|s| s.as_str()).collect();
        Ok(inner
            .links
            .iter()
            .filter(|l| {
                wanted.contains(l.recall_id.as_str()) || wanted.contains(l.linked_recall_id.as_str())
            })
            .cloned()
            .collect())
    }

    async fn snapshot_seq(&self) -> Result<i64, StoreError> {
        Ok(self.read()?.seq)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.read()?;
        let mut by_agency: BTreeMap<AgencyCode, u64> = BTreeMap::new();
        let mut identifiers = 0u64;
        for stored in inner.recalls.values() {
            *by_agency.entry(stored.recall.agency_code.clone()).or_default() += 1;
            identifiers += stored.recall.identifiers.len() as u64;
        }
        Ok(StoreStats {
            recalls: inner.recalls.len() as u64,
            identifiers,
            duplicate_links: inner.links.len() as u64,
            by_agency: by_agency
                .into_iter()
                .map(|(agency_code, recalls)| AgencyCount {
                    agency_code,
                    recalls,
                })
                .collect(),
        })
    }

    async fn create_run(&self, run: &IngestionRun) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let busy = inner
            .runs
            .values()
            .any(|r| r.agency_code == run.agency_code && r.status.is_active());
        if busy {
            return Err(StoreError::Conflict(run.agency_code.to_string()));
        }
        inner.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_run(
        &self,
        run: &IngestionRun,
        expected: RunStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        match inner.runs.get_mut(&run.run_id) {
            Some(stored) if stored.status == expected => {
                *stored = run.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(run.run_id.to_string())),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<IngestionRun, StoreError> {
        let inner = self.read()?;
        inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    async fn list_runs(
        &self,
        agency: Option<&AgencyCode>,
        limit: usize,
    ) -> Result<Vec<IngestionRun>, StoreError> {
        let inner = self.read()?;
        let mut runs: Vec<IngestionRun> = inner
            .runs
            .values()
            .filter(|r| agency.map_or(true, |a| &r.agency_code == a))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn last_completed_run(
        &self,
        agency: &AgencyCode,
    ) -> Result<Option<IngestionRun>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .runs
            .values()
            .filter(|r| &r.agency_code == agency && r.status == RunStatus::Completed)
            .max_by_key(|r| r.completed_at)
            .cloned())
    }

    async fn fail_orphaned_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.write()?;
        let now = Utc::now();
        let mut failed = Vec::new();
        for run in inner.runs.values_mut().filter(|r| r.status.is_active()) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(now);
            run.failure = Some(RunFailure {
                class: FailureClass::Orphaned,
                message: "process exited while the run was active".to_string(),
            });
            failed.push(run.run_id);
        }
        Ok(failed)
    }
}
