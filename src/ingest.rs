//! Ingestion run orchestration.
//!
//! Coordinates the full sync flow for one agency: connector fetch →
//! normalization → upsert planning (change detection and duplicate linking)
//! → batched store commits. Runs move through
//! `PENDING → RUNNING → COMPLETED | FAILED | CANCELLED`.
//!
//! ```text
//! start_run ──create_run (exclusive claim)──► mpsc<run_id> ──► dispatcher
//!                                                              │ semaphore(max_workers)
//!                                                              ▼
//!                                     worker: reload run → fetch → plan → apply_batch
//! ```
//!
//! Workers receive only the `run_id` and reload the run from the store, so a
//! run cancelled while queued is never started. Progress counters are
//! persisted after every committed batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, IngestConfig};
use crate::connector::{Connector, ConnectorRegistry};
use crate::error::{ConnectorError, IngestError, StoreError};
use crate::models::{
    AgencyCode, CanonicalRecall, DuplicateLink, FailureClass, IngestionRun, RecordError,
    RunFailure, RunStatus, Watermark,
};
use crate::similarity::record_similarity;
use crate::store::{BatchOutcome, Store, UpsertOp};

/// Attempts at re-planning a batch whose optimistic check failed.
const STALE_WRITE_ATTEMPTS: u32 = 3;
/// Freshness threshold for agencies registered without configuration.
const DEFAULT_MAX_STALENESS_HOURS: u64 = 48;

/// Where a new run starts fetching.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FetchFrom {
    /// The `watermark_after` of the agency's last completed run.
    #[default]
    Resume,
    /// Everything the feed offers.
    Full,
    Since(Watermark),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The run was still queued and is now CANCELLED.
    Cancelled,
    /// The worker was signalled; the run stops at its next batch boundary.
    CancelRequested,
    AlreadyFinished(RunStatus),
}

/// Freshness of one agency's data.
#[derive(Debug, Clone, Serialize)]
pub struct Freshness {
    pub agency_code: AgencyCode,
    pub last_success_at: Option<DateTime<Utc>>,
    pub staleness_secs: Option<i64>,
    pub max_staleness_hours: u64,
    /// Never synced, or last success older than `max_staleness_hours`.
    pub stale: bool,
    pub last_run_status: Option<RunStatus>,
}

/// State shared between the orchestrator handle, the dispatcher, and workers.
struct Shared {
    store: Arc<dyn Store>,
    registry: Arc<ConnectorRegistry>,
    config: IngestConfig,
    max_staleness: BTreeMap<AgencyCode, u64>,
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Bumped whenever a run reaches a terminal state.
    finished: watch::Sender<u64>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Uuid>,
}

impl Orchestrator {
    /// Build the orchestrator and spawn its dispatcher. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectorRegistry>,
        config: IngestConfig,
    ) -> Self {
        Self::build(store, registry, config, BTreeMap::new())
    }

    /// Like [`new`](Self::new), with per-agency staleness limits from `[agencies]`.
    pub fn from_config(
        store: Arc<dyn Store>,
        registry: Arc<ConnectorRegistry>,
        config: &Config,
    ) -> Self {
        let max_staleness = config
            .agencies
            .iter()
            .map(|(code, agency)| (AgencyCode::new(code), agency.max_staleness_hours))
            .collect();
        Self::build(store, registry, config.ingest.clone(), max_staleness)
    }

    fn build(
        store: Arc<dyn Store>,
        registry: Arc<ConnectorRegistry>,
        config: IngestConfig,
        max_staleness: BTreeMap<AgencyCode, u64>,
    ) -> Self {
        let (finished, _) = watch::channel(0);
        let workers = config.max_workers.max(1);
        let shared = Arc::new(Shared {
            store,
            registry,
            config,
            max_staleness,
            cancels: Mutex::new(HashMap::new()),
            finished,
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(shared.clone(), rx, Arc::new(Semaphore::new(workers))));
        Self { shared, jobs }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.shared.registry
    }

    /// Queue a run for `agency`.
    ///
    /// Fails with [`IngestError::Conflict`] when the agency already has a
    /// PENDING or RUNNING run, including one created by another process.
    pub async fn start_run(
        &self,
        agency: &AgencyCode,
        from: FetchFrom,
    ) -> Result<Uuid, IngestError> {
        if self.shared.registry.get(agency).is_none() {
            return Err(IngestError::UnknownAgency(agency.to_string()));
        }
        let since = match from {
            FetchFrom::Full => None,
            FetchFrom::Since(watermark) => Some(watermark),
            FetchFrom::Resume => self
                .shared
                .store
                .last_completed_run(agency)
                .await?
                .and_then(|run| run.watermark_after),
        };

        let run = IngestionRun::pending(agency.clone(), since);
        self.shared.store.create_run(&run).await?;
        self.shared.token(run.run_id);
        let since = run
            .watermark_before
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        info!(agency = %agency, run_id = %run.run_id, since = %since, "run queued");

        if self.jobs.send(run.run_id).is_err() {
            error!(run_id = %run.run_id, "dispatcher has stopped; failing run");
            let mut failed = run.clone();
            failed.failure = Some(RunFailure {
                class: FailureClass::Store,
                message: "orchestrator dispatcher has stopped".to_string(),
            });
            failed.finish(RunStatus::Failed);
            self.shared.store.update_run(&failed, RunStatus::Pending).await?;
            self.shared.forget(run.run_id);
        }
        Ok(run.run_id)
    }

    /// Request cancellation.
    ///
    /// Queued runs are cancelled immediately. Running runs stop at the next
    /// batch boundary; batches already committed remain.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelOutcome, IngestError> {
        loop {
            let mut run = self.get_run_status(run_id).await?;
            match run.status {
                RunStatus::Pending => {
                    run.finish(RunStatus::Cancelled);
                    if self.shared.store.update_run(&run, RunStatus::Pending).await? {
                        info!(agency = %run.agency_code, run_id = %run_id, "queued run cancelled");
                        self.shared.forget(run_id);
                        return Ok(CancelOutcome::Cancelled);
                    }
                    // A worker picked it up in the meantime; re-read.
                }
                RunStatus::Running => {
                    let token = self
                        .shared
                        .cancels
                        .lock()
                        .ok()
                        .and_then(|cancels| cancels.get(&run_id).cloned());
                    return match token {
                        Some(token) => {
                            info!(agency = %run.agency_code, run_id = %run_id, "cancellation requested");
                            token.cancel();
                            Ok(CancelOutcome::CancelRequested)
                        }
                        None => Err(IngestError::NotOwned(run_id)),
                    };
                }
                status => return Ok(CancelOutcome::AlreadyFinished(status)),
            }
        }
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> Result<IngestionRun, IngestError> {
        self.shared.store.get_run(run_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => IngestError::RunNotFound(run_id),
            other => other.into(),
        })
    }

    /// Block until the run reaches a terminal state.
    pub async fn wait_for_run(&self, run_id: Uuid) -> Result<IngestionRun, IngestError> {
        let mut finished = self.shared.finished.subscribe();
        loop {
            let run = self.get_run_status(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            // Runs owned by another process never notify; poll as well.
            tokio::select! {
                _ = finished.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    pub async fn list_runs(
        &self,
        agency: Option<&AgencyCode>,
        limit: usize,
    ) -> Result<Vec<IngestionRun>, IngestError> {
        Ok(self.shared.store.list_runs(agency, limit).await?)
    }

    /// Last successful sync and staleness, for one agency or every registered one.
    pub async fn get_freshness(
        &self,
        agency: Option<&AgencyCode>,
    ) -> Result<Vec<Freshness>, IngestError> {
        let agencies: Vec<AgencyCode> = match agency {
            Some(code) if self.shared.registry.get(code).is_none() => {
                return Err(IngestError::UnknownAgency(code.to_string()))
            }
            Some(code) => vec![code.clone()],
            None => self.shared.registry.agencies().cloned().collect(),
        };

        let now = Utc::now();
        let mut report = Vec::with_capacity(agencies.len());
        for code in agencies {
            let last = self.shared.store.last_completed_run(&code).await?;
            let latest = self.shared.store.list_runs(Some(&code), 1).await?;
            let max_staleness_hours = self
                .shared
                .max_staleness
                .get(&code)
                .copied()
                .unwrap_or(DEFAULT_MAX_STALENESS_HOURS);

            let last_success_at = last.and_then(|run| run.completed_at);
            let staleness_secs = last_success_at.map(|at| (now - at).num_seconds().max(0));
            let stale = match staleness_secs {
                Some(secs) => secs > staleness_limit_secs(max_staleness_hours),
                None => true,
            };
            report.push(Freshness {
                agency_code: code,
                last_success_at,
                staleness_secs,
                max_staleness_hours,
                stale,
                last_run_status: latest.first().map(|run| run.status),
            });
        }
        Ok(report)
    }

    /// Fail runs left PENDING or RUNNING by a process that exited.
    ///
    /// Only safe while no other process is ingesting into the same store.
    pub async fn recover_orphans(&self) -> Result<Vec<Uuid>, IngestError> {
        let orphans = self.shared.store.fail_orphaned_runs().await?;
        for run_id in &orphans {
            warn!(run_id = %run_id, error_class = "orphaned", "failed orphaned run");
        }
        Ok(orphans)
    }

    /// Signal every in-flight run to stop at its next batch boundary.
    pub fn shutdown(&self) {
        if let Ok(cancels) = self.shared.cancels.lock() {
            for token in cancels.values() {
                token.cancel();
            }
        }
    }

    /// Signal every in-flight run and wait up to `grace` for them to reach a
    /// terminal state. Returns `false` if some run was still active when the
    /// grace period ran out.
    pub async fn shutdown_and_wait(&self, grace: Duration) -> bool {
        let run_ids: Vec<Uuid> = self
            .shared
            .cancels
            .lock()
            .map(|cancels| cancels.keys().copied().collect())
            .unwrap_or_default();
        self.shutdown();
        if run_ids.is_empty() {
            return true;
        }

        info!(runs = run_ids.len(), "waiting for in-flight runs to stop");
        let waits = join_all(run_ids.iter().map(|run_id| self.wait_for_run(*run_id)));
        match tokio::time::timeout(grace, waits).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    warn!(error = %err, "could not confirm run stopped");
                }
                true
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "in-flight runs did not stop in time");
                false
            }
        }
    }
}

impl Shared {
    fn token(&self, run_id: Uuid) -> CancellationToken {
        match self.cancels.lock() {
            Ok(mut cancels) => cancels
                .entry(run_id)
                .or_insert_with(CancellationToken::new)
                .clone(),
            Err(_) => CancellationToken::new(),
        }
    }

    fn forget(&self, run_id: Uuid) {
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(&run_id);
        }
        self.finished.send_modify(|n| *n += 1);
    }

    /// Drive one run to a terminal state. The run executes in its own task
    /// so a panicking connector still leaves the run FAILED.
    async fn execute(self: Arc<Self>, run_id: Uuid) {
        let token = self.token(run_id);
        let task = {
            let shared = self.clone();
            let token = token.clone();
            tokio::spawn(async move { shared.execute_run(run_id, &token).await })
        };
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(run_id = %run_id, error = %e, error_class = "store", "run bookkeeping failed");
            }
            Err(join) => {
                let message = if join.is_panic() {
                    "run worker panicked"
                } else {
                    "run worker was aborted"
                };
                if let Err(e) = self.fail_aborted(run_id, message).await {
                    error!(run_id = %run_id, error = %e, error_class = "store", "run bookkeeping failed");
                }
            }
        }
        self.forget(run_id);
    }

    /// Fail a run whose worker task died, keeping the last persisted counters.
    async fn fail_aborted(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        let mut run = self.store.get_run(run_id).await?;
        let expected = run.status;
        if expected.is_terminal() {
            return Ok(());
        }
        error!(
            agency = %run.agency_code,
            run_id = %run_id,
            error_class = "panicked",
            error = message,
            "run failed"
        );
        run.failure = Some(RunFailure {
            class: FailureClass::Panicked,
            message: message.to_string(),
        });
        run.finish(RunStatus::Failed);
        if !self.store.update_run(&run, expected).await? {
            warn!(run_id = %run_id, "run was finalized by another writer");
        }
        Ok(())
    }

    async fn execute_run(&self, run_id: Uuid, token: &CancellationToken) -> Result<(), StoreError> {
        let mut run = self.store.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            debug!(run_id = %run_id, status = %run.status, "run no longer pending; skipping");
            return Ok(());
        }

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        if !self.store.update_run(&run, RunStatus::Pending).await? {
            debug!(run_id = %run_id, "run was cancelled before it started");
            return Ok(());
        }
        info!(agency = %run.agency_code, run_id = %run_id, "run started");

        let connector = match self.registry.get(&run.agency_code) {
            Some(connector) => connector,
            None => {
                return self
                    .finalize(
                        run,
                        Finish::Failed(
                            FailureClass::Permanent,
                            "no connector registered for agency".to_string(),
                        ),
                    )
                    .await
            }
        };

        let limit = Duration::from_secs(self.config.run_timeout_secs);
        let mut worker = RunWorker {
            shared: self,
            connector: connector.as_ref(),
            token,
            watermark: run.watermark_before.clone(),
            run,
            done: HashSet::new(),
        };
        let finish = match tokio::time::timeout(limit, worker.ingest()).await {
            Ok(finish) => finish,
            Err(_) => Finish::Failed(
                FailureClass::RunTimeout,
                format!("run exceeded {}s", self.config.run_timeout_secs),
            ),
        };
        self.finalize(worker.run, finish).await
    }

    async fn finalize(&self, mut run: IngestionRun, finish: Finish) -> Result<(), StoreError> {
        match finish {
            Finish::Completed(watermark) => {
                run.watermark_after = watermark;
                run.finish(RunStatus::Completed);
                info!(
                    agency = %run.agency_code,
                    run_id = %run.run_id,
                    fetched = run.records_fetched,
                    upserted = run.records_upserted,
                    skipped = run.records_skipped_errors,
                    linked = run.records_linked,
                    "run completed"
                );
            }
            Finish::Cancelled => {
                run.finish(RunStatus::Cancelled);
                info!(agency = %run.agency_code, run_id = %run.run_id, upserted = run.records_upserted, "run cancelled");
            }
            Finish::Failed(class, message) => {
                error!(
                    agency = %run.agency_code,
                    run_id = %run.run_id,
                    error_class = ?class,
                    error = %message,
                    "run failed"
                );
                run.failure = Some(RunFailure { class, message });
                run.finish(RunStatus::Failed);
            }
            Finish::Superseded => {
                warn!(run_id = %run.run_id, "run was finalized by another writer");
                return Ok(());
            }
        }
        if !self.store.update_run(&run, RunStatus::Running).await? {
            warn!(run_id = %run.run_id, "run was finalized by another writer");
        }
        Ok(())
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut jobs: mpsc::UnboundedReceiver<Uuid>,
    workers: Arc<Semaphore>,
) {
    while let Some(run_id) = jobs.recv().await {
        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            shared.execute(run_id).await;
            drop(permit);
        });
    }
    debug!("ingest dispatcher stopped");
}

/// How a run ended.
enum Finish {
    Completed(Option<Watermark>),
    Cancelled,
    Failed(FailureClass, String),
    /// Another writer moved the run out of RUNNING.
    Superseded,
}

/// How one fetch pass ended.
enum Pass {
    Exhausted,
    Cancelled,
    Superseded,
}

enum PassError {
    Connector(ConnectorError),
    Store(StoreError),
}

/// Records normalized since the last commit.
#[derive(Default)]
struct PendingBatch {
    recalls: Vec<CanonicalRecall>,
    skipped: Vec<RecordError>,
    refs: Vec<String>,
}

impl PendingBatch {
    fn len(&self) -> usize {
        self.refs.len()
    }

    /// Later copies of a recall within one batch replace earlier ones.
    fn push(&mut self, record_ref: String, recall: CanonicalRecall) {
        match self
            .recalls
            .iter_mut()
            .find(|r| r.recall_id == recall.recall_id)
        {
            Some(existing) => *existing = recall,
            None => self.recalls.push(recall),
        }
        self.refs.push(record_ref);
    }

    fn skip(&mut self, record_ref: String, reason: String) {
        self.skipped.push(RecordError {
            record_ref: record_ref.clone(),
            reason,
        });
        self.refs.push(record_ref);
    }
}

struct RunWorker<'a> {
    shared: &'a Shared,
    connector: &'a dyn Connector,
    token: &'a CancellationToken,
    run: IngestionRun,
    /// Record refs committed by this run; skipped when a fetch is replayed.
    done: HashSet<String>,
    watermark: Option<Watermark>,
}

impl RunWorker<'_> {
    async fn ingest(&mut self) -> Finish {
        let config = &self.shared.config;
        let mut attempt = 0u32;
        loop {
            match self.fetch_pass().await {
                Ok(Pass::Exhausted) => return Finish::Completed(self.watermark.clone()),
                Ok(Pass::Cancelled) => return Finish::Cancelled,
                Ok(Pass::Superseded) => return Finish::Superseded,
                Err(PassError::Connector(e)) if e.is_transient() => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        return Finish::Failed(
                            FailureClass::RetriesExhausted,
                            format!("gave up after {} retries: {}", config.max_retries, e),
                        );
                    }
                    let delay = backoff_delay(attempt, config.retry_base_ms, config.retry_cap_ms);
                    warn!(
                        agency = %self.run.agency_code,
                        run_id = %self.run.run_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        error_class = "transient",
                        "fetch failed; restarting"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => return Finish::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(PassError::Connector(e)) => {
                    return Finish::Failed(FailureClass::Permanent, e.to_string())
                }
                Err(PassError::Store(e)) => return Finish::Failed(FailureClass::Store, e.to_string()),
            }
        }
    }

    /// One fetch from `watermark_before` to the end of the stream.
    async fn fetch_pass(&mut self) -> Result<Pass, PassError> {
        let connector = self.connector;
        let mut stream = connector.fetch(self.run.watermark_before.clone());
        let mut batch = PendingBatch::default();

        loop {
            // Cancellation lands between records, never inside a request.
            if self.token.is_cancelled() {
                return Ok(Pass::Cancelled);
            }
            let raw = match stream.next().await {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Err(PassError::Connector(e)),
                None => break,
            };
            if let Some(stamp) = raw.watermark.clone() {
                self.watermark = Some(Watermark::advance(self.watermark.take(), stamp));
            }
            if self.done.contains(&raw.record_ref) {
                continue;
            }

            match connector.normalize(&raw) {
                Ok(recall) => batch.push(raw.record_ref, recall),
                Err(e) => {
                    debug!(
                        agency = %self.run.agency_code,
                        record_ref = %raw.record_ref,
                        error = %e,
                        "skipping record"
                    );
                    batch.skip(raw.record_ref, e.to_string());
                }
            }

            if batch.len() >= self.shared.config.batch_size.max(1) {
                if !self.commit(std::mem::take(&mut batch)).await? {
                    return Ok(Pass::Superseded);
                }
                if self.token.is_cancelled() {
                    return Ok(Pass::Cancelled);
                }
            }
        }

        if batch.len() > 0 && !self.commit(batch).await? {
            return Ok(Pass::Superseded);
        }
        Ok(Pass::Exhausted)
    }

    /// Plan and apply one batch, then persist progress. `false` if the run
    /// was moved out of RUNNING by another writer.
    async fn commit(&mut self, batch: PendingBatch) -> Result<bool, PassError> {
        let outcome = if batch.recalls.is_empty() {
            BatchOutcome::default()
        } else {
            self.apply_with_replan(&batch.recalls)
                .await
                .map_err(PassError::Store)?
        };

        let max_summary = self.shared.config.max_error_summary;
        self.run.records_fetched += batch.refs.len() as u64;
        self.run.records_upserted += outcome.upserted();
        self.run.records_linked += outcome.linked;
        for skipped in batch.skipped {
            self.run
                .record_skip(&skipped.record_ref, skipped.reason, max_summary);
        }
        self.done.extend(batch.refs);

        debug!(
            agency = %self.run.agency_code,
            run_id = %self.run.run_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            linked = outcome.linked,
            "batch committed"
        );
        self.shared
            .store
            .update_run(&self.run, RunStatus::Running)
            .await
            .map_err(PassError::Store)
    }

    async fn apply_with_replan(
        &self,
        recalls: &[CanonicalRecall],
    ) -> Result<BatchOutcome, StoreError> {
        let store = self.shared.store.as_ref();
        let mut attempt = 1;
        loop {
            let ops = plan_batch(
                store,
                recalls,
                self.shared.config.dedupe_similarity,
                Utc::now(),
            )
            .await?;
            match store.apply_batch(&ops).await {
                Err(StoreError::StaleWrite(recall_id)) if attempt < STALE_WRITE_ATTEMPTS => {
                    debug!(
                        run_id = %self.run.run_id,
                        recall_id = %recall_id,
                        attempt,
                        "stale write; re-planning batch"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Turn normalized recalls into store operations against current state.
///
/// - Known id, same content hash: `Unchanged`; no timestamps move.
/// - Known id, changed content: `Update`, keeping `first_seen_at`.
/// - New id: `Insert`, linked to every recall sharing its dedupe key and
///   region (including earlier inserts in the same batch) whose field
///   similarity exceeds `threshold`. Linked records stay distinct.
pub async fn plan_batch(
    store: &dyn Store,
    recalls: &[CanonicalRecall],
    threshold: f64,
    now: DateTime<Utc>,
) -> Result<Vec<UpsertOp>, StoreError> {
    let ids: Vec<String> = recalls.iter().map(|r| r.recall_id.clone()).collect();
    let existing: HashMap<String, CanonicalRecall> = store
        .get_recalls(&ids)
        .await?
        .into_iter()
        .map(|r| (r.recall_id.clone(), r))
        .collect();

    let mut groups: HashMap<(String, String), Vec<CanonicalRecall>> = HashMap::new();
    let mut ops = Vec::with_capacity(recalls.len());

    for recall in recalls {
        match existing.get(&recall.recall_id) {
            Some(stored) if stored.content_hash() == recall.content_hash() => {
                ops.push(UpsertOp::Unchanged {
                    recall_id: recall.recall_id.clone(),
                });
            }
            Some(stored) => {
                let mut updated = recall.clone();
                updated.first_seen_at = stored.first_seen_at;
                updated.last_updated_at = now;
                ops.push(UpsertOp::Update {
                    recall: updated,
                    expected_last_updated_at: stored.last_updated_at,
                });
            }
            None => {
                let mut fresh = recall.clone();
                fresh.first_seen_at = now;
                fresh.last_updated_at = now;

                let key = (fresh.dedupe_key.clone(), fresh.region.clone());
                if !groups.contains_key(&key) {
                    let found = store.find_by_dedupe_key(&key.0, &key.1).await?;
                    groups.insert(key.clone(), found);
                }
                let group = groups.entry(key).or_default();
                let links: Vec<DuplicateLink> = group
                    .iter()
                    .filter(|other| other.recall_id != fresh.recall_id)
                    .filter_map(|other| {
                        let similarity = record_similarity(&fresh, other);
                        (similarity > threshold).then(|| DuplicateLink {
                            recall_id: fresh.recall_id.clone(),
                            linked_recall_id: other.recall_id.clone(),
                            similarity,
                            linked_at: now,
                        })
                    })
                    .collect();
                group.push(fresh.clone());
                ops.push(UpsertOp::Insert {
                    recall: fresh,
                    links,
                });
            }
        }
    }
    Ok(ops)
}

/// Staleness threshold in seconds, saturating for oversized configuration.
fn staleness_limit_secs(max_staleness_hours: u64) -> i64 {
    i64::try_from(max_staleness_hours.saturating_mul(3600)).unwrap_or(i64::MAX)
}

/// `min(base · 2^(attempt-1), cap)` plus up to 25% jitter.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(32));
    let delay = exp.min(cap_ms);
    let jitter = if delay >= 4 {
        rand::rng().random_range(0..=delay / 4)
    } else {
        0
    };
    Duration::from_millis(delay + jitter)
}

/// Starts runs on a fixed interval for agencies with `schedule_mins`.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    schedules: Vec<(AgencyCode, Duration)>,
}

impl Scheduler {
    pub fn from_config(orchestrator: Arc<Orchestrator>, config: &Config) -> Self {
        let schedules = config
            .agencies
            .iter()
            .filter_map(|(code, agency)| {
                agency
                    .schedule_mins
                    .filter(|mins| *mins > 0)
                    .map(|mins| (AgencyCode::new(code), Duration::from_secs(mins * 60)))
            })
            .collect();
        Self {
            orchestrator,
            schedules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// One task per scheduled agency. The first run starts immediately.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.schedules
            .into_iter()
            .map(|(agency, period)| {
                let orchestrator = self.orchestrator.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(agency = %agency, every_secs = period.as_secs(), "scheduled");
                    let mut ticks = tokio::time::interval(period);
                    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = ticks.tick() => {}
                        }
                        match orchestrator.start_run(&agency, FetchFrom::Resume).await {
                            Ok(run_id) => debug!(agency = %agency, run_id = %run_id, "scheduled run queued"),
                            Err(IngestError::Conflict(_)) => {
                                debug!(agency = %agency, "previous run still active; skipping tick")
                            }
                            Err(e) => warn!(agency = %agency, error = %e, "scheduled run not started"),
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{recall_id, Identifier, IdentifierType, Severity};
    use crate::store::memory::InMemoryStore;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn recall(native_id: &str, brand: &str, model: &str, hazard: &str) -> CanonicalRecall {
        let agency = AgencyCode::new("CPSC");
        let now = Utc::now();
        CanonicalRecall {
            recall_id: recall_id(&agency, native_id),
            agency_native_id: native_id.to_string(),
            agency_code: agency,
            product_name: "Space Heater".to_string(),
            brand: brand.to_string(),
            model_number: model.to_string(),
            identifiers: BTreeSet::from([Identifier {
                id_type: IdentifierType::Upc,
                value: "012914632109".to_string(),
            }]),
            hazard_description: hazard.to_string(),
            remedy: "Refund".to_string(),
            severity: Severity::High,
            risk_category: String::new(),
            recall_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            region: "US".to_string(),
            source_url: None,
            raw_payload: "{}".to_string(),
            dedupe_key: crate::models::dedupe_key(brand, model, "Space Heater", "US"),
            first_seen_at: now,
            last_updated_at: now,
        }
    }

    #[tokio::test]
    async fn plan_detects_unchanged_and_updates() {
        let store = InMemoryStore::new();
        let first = recall("1", "Acme", "H-100", "Fire hazard");
        let t0 = Utc::now();
        let ops = plan_batch(&store, &[first.clone()], 0.9, t0).await.unwrap();
        store.apply_batch(&ops).await.unwrap();

        let ops = plan_batch(&store, &[first.clone()], 0.9, Utc::now()).await.unwrap();
        assert!(matches!(ops[0], UpsertOp::Unchanged { .. }));

        let mut changed = first.clone();
        changed.remedy = "Repair".to_string();
        let ops = plan_batch(&store, &[changed], 0.9, Utc::now()).await.unwrap();
        match &ops[0] {
            UpsertOp::Update {
                recall,
                expected_last_updated_at,
            } => {
                assert_eq!(recall.first_seen_at, t0);
                assert_eq!(*expected_last_updated_at, t0);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn plan_links_near_duplicates_within_a_batch() {
        let store = InMemoryStore::new();
        let a = recall("1", "Acme", "H-100", "Fire hazard from overheating");
        let b = recall("2", "Acme", "H-100", "Fire hazard from overheating");
        let c = recall("3", "Acme", "H-100", "Sharp metal edges on the housing can cut fingers");

        let ops = plan_batch(&store, &[a, b, c], 0.9, Utc::now()).await.unwrap();
        let links: Vec<usize> = ops
            .iter()
            .map(|op| match op {
                UpsertOp::Insert { links, .. } => links.len(),
                _ => panic!("expected inserts"),
            })
            .collect();
        assert_eq!(links, vec![0, 1, 0]);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d1 = backoff_delay(1, 2000, 60_000).as_millis();
        let d3 = backoff_delay(3, 2000, 60_000).as_millis();
        let d9 = backoff_delay(9, 2000, 60_000).as_millis();
        assert!((2000..=2500).contains(&d1));
        assert!((8000..=10_000).contains(&d3));
        assert!((60_000..=75_000).contains(&d9));
        assert_eq!(backoff_delay(40, 1, 1).as_millis(), 1);
    }

    #[test]
    fn staleness_limit_saturates() {
        assert_eq!(staleness_limit_secs(24), 86_400);
        assert_eq!(staleness_limit_secs(u64::MAX), i64::MAX);
        assert_eq!(staleness_limit_secs(u64::MAX / 3600), i64::MAX);
    }

    #[tokio::test]
    async fn unknown_agency_is_rejected() {
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ConnectorRegistry::new()),
            IngestConfig::default(),
        );
        let err = orchestrator
            .start_run(&AgencyCode::new("NOPE"), FetchFrom::Resume)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownAgency(_)));
    }
}
