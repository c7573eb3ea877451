use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;

use recall_index::config::{IngestConfig, MatchingConfig};
use recall_index::connector::{Connector, ConnectorRegistry, RecordStream};
use recall_index::error::{ConnectorError, IngestError, NormalizationError};
use recall_index::ingest::{CancelOutcome, FetchFrom, Orchestrator};
use recall_index::matching::{LookupOutcome, MatchingEngine, PageRequest};
use recall_index::models::{
    recall_id, AgencyCode, CanonicalRecall, FailureClass, IngestionRun, RawRecord, RunStatus,
    Watermark,
};
use recall_index::normalize::{parse_date, RecallDraft};
use recall_index::sqlite_store::SqliteStore;
use recall_index::store::memory::InMemoryStore;
use recall_index::store::{SearchFilters, Store, UpsertOp};
use recall_index::{db, migrate};

const AGENCY: &str = "FIXTURE";

/// How the fixture feed misbehaves.
#[derive(Clone, Copy, Default)]
enum Failure {
    #[default]
    None,
    /// The first N fetches yield two records and then a transient error.
    TransientTimes(u32),
    Permanent,
    /// `normalize` panics on the record with this id.
    PanicsOn(&'static str),
}

struct FixtureConnector {
    agency: AgencyCode,
    records: Vec<Value>,
    failure: Failure,
    delay: Option<Duration>,
    fetches: AtomicU32,
}

impl FixtureConnector {
    fn new(records: Vec<Value>) -> Self {
        Self {
            agency: AgencyCode::new(AGENCY),
            records,
            failure: Failure::None,
            delay: None,
            fetches: AtomicU32::new(0),
        }
    }

    fn failing(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn raw(&self, payload: &Value) -> RawRecord {
        RawRecord {
            agency_code: self.agency.clone(),
            record_ref: payload["id"].as_str().unwrap_or("?").to_string(),
            payload: payload.clone(),
            watermark: payload["date"].as_str().map(Watermark::parse),
            fetched_at: Utc::now(),
        }
    }
}

impl Connector for FixtureConnector {
    fn agency_code(&self) -> &AgencyCode {
        &self.agency
    }

    fn description(&self) -> &str {
        "in-memory fixture feed"
    }

    fn fetch(&self, _since: Option<Watermark>) -> RecordStream<'_> {
        let attempt = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let mut items: Vec<Result<RawRecord, ConnectorError>> =
            self.records.iter().map(|p| Ok(self.raw(p))).collect();
        match self.failure {
            Failure::TransientTimes(n) if attempt <= n => {
                items.truncate(2);
                items.push(Err(ConnectorError::Transient("HTTP 503".to_string())));
            }
            Failure::Permanent => {
                items = vec![Err(ConnectorError::Permanent("HTTP 401".to_string()))];
            }
            _ => {}
        }

        let delay = self.delay;
        stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }

    fn normalize(&self, raw: &RawRecord) -> Result<CanonicalRecall, NormalizationError> {
        if let Failure::PanicsOn(bad) = self.failure {
            if raw.record_ref == bad {
                panic!("fixture cannot normalize record {}", bad);
            }
        }
        let p = &raw.payload;
        let text = |key: &str| p[key].as_str().unwrap_or_default().to_string();
        let mut draft = RecallDraft {
            native_id: text("id"),
            product_name: text("name"),
            brand: text("brand"),
            model_number: text("model"),
            hazard_description: text("hazard"),
            recall_date: p["date"].as_str().and_then(parse_date),
            ..Default::default()
        };
        if let Some(upc) = p["upc"].as_str() {
            draft.add_identifier(upc, None);
        }
        draft.finish(raw)
    }
}

fn record(id: &str, name: &str, brand: &str, model: &str, upc: &str, date: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "brand": brand,
        "model": model,
        "upc": upc,
        "hazard": format!("{} can overheat and catch fire", name),
        "date": date,
    })
}

fn three_records() -> Vec<Value> {
    vec![
        record("1", "Space Heater", "Acme", "H-100", "036000291452", "2024-01-05"),
        record("2", "Baby Sleeper", "Fisher-Price", "RNP-1", "012345678905", "2024-02-10"),
        record("3", "Hair Dryer", "Globex", "HD-9", "725272730706", "2024-03-15"),
    ]
}

fn id(native: &str) -> String {
    recall_id(&AgencyCode::new(AGENCY), native)
}

fn orchestrator(
    store: Arc<dyn Store>,
    connector: Arc<FixtureConnector>,
    config: IngestConfig,
) -> Orchestrator {
    let mut registry = ConnectorRegistry::new();
    registry.register(connector);
    Orchestrator::new(store, Arc::new(registry), config)
}

fn fast_retries() -> IngestConfig {
    IngestConfig {
        retry_base_ms: 1,
        retry_cap_ms: 5,
        ..IngestConfig::default()
    }
}

async fn run_to_end(orchestrator: &Orchestrator, from: FetchFrom) -> IngestionRun {
    let run_id = orchestrator
        .start_run(&AgencyCode::new(AGENCY), from)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for_run(run_id))
        .await
        .expect("run did not finish")
        .unwrap()
}

#[tokio::test]
async fn sync_inserts_and_completes() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(three_records()));
    let orch = orchestrator(store.clone(), connector, IngestConfig::default());

    let run = run_to_end(&orch, FetchFrom::Resume).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.records_fetched, 3);
    assert_eq!(run.records_upserted, 3);
    assert_eq!(run.records_skipped_errors, 0);
    assert!(run.started_at.is_some() && run.completed_at.is_some());
    assert_eq!(
        run.watermark_after,
        Some(Watermark::parse("2024-03-15")),
        "watermark is the newest record seen"
    );

    let heater = store.get_recall(&id("1")).await.unwrap();
    assert_eq!(heater.brand, "Acme");
    assert_eq!(heater.region, "XX");
}

#[tokio::test]
async fn rerun_with_unchanged_content_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(three_records()));
    let orch = orchestrator(store.clone(), connector, IngestConfig::default());

    run_to_end(&orch, FetchFrom::Full).await;
    let before = store.get_recall(&id("2")).await.unwrap();

    let rerun = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(rerun.status, RunStatus::Completed);
    assert_eq!(rerun.records_upserted, 3);
    assert_eq!(rerun.records_linked, 0);

    let after = store.get_recall(&id("2")).await.unwrap();
    assert_eq!(after.last_updated_at, before.last_updated_at);
    assert_eq!(after.first_seen_at, before.first_seen_at);
    assert_eq!(store.stats().await.unwrap().recalls, 3);
}

#[tokio::test]
async fn resume_starts_from_last_completed_watermark() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(three_records()));
    let orch = orchestrator(store, connector, IngestConfig::default());

    let first = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(first.watermark_before, None);

    let second = run_to_end(&orch, FetchFrom::Resume).await;
    assert_eq!(second.watermark_before, first.watermark_after);

    let pinned = run_to_end(&orch, FetchFrom::Since(Watermark::parse("2023-06-01"))).await;
    assert_eq!(pinned.watermark_before, Some(Watermark::parse("2023-06-01")));
}

#[tokio::test]
async fn near_duplicates_are_linked_not_merged() {
    let mut records = three_records();
    records.push(record("4", "Space Heater", "Acme", "H-100", "036000291452", "2024-04-01"));

    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(records));
    let orch = orchestrator(store.clone(), connector, IngestConfig::default());

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.records_upserted, 4);
    assert_eq!(run.records_linked, 1);

    let engine = MatchingEngine::new(store.clone(), MatchingConfig::default());
    let detail = engine.get_recall(&id("4")).await.unwrap();
    assert_eq!(detail.links.len(), 1);
    assert_eq!(detail.links[0].other(&id("4")), id("1"));

    match engine.lookup_by_identifier("0-36000-29145-2").await.unwrap() {
        LookupOutcome::ExactMatch(matches) => {
            let ids: Vec<&str> = matches.iter().map(|m| m.recall.recall_id.as_str()).collect();
            assert_eq!(ids, vec![id("4"), id("1")]);
            assert_eq!(matches[0].linked_recall_ids, vec![id("1")]);
        }
        LookupOutcome::NoExactMatch => panic!("expected both carriers"),
    }
}

#[tokio::test]
async fn second_start_while_active_conflicts() {
    let store = Arc::new(InMemoryStore::new());
    let connector =
        Arc::new(FixtureConnector::new(three_records()).slow(Duration::from_millis(50)));
    let orch = orchestrator(store, connector, IngestConfig::default());
    let agency = AgencyCode::new(AGENCY);

    let first = orch.start_run(&agency, FetchFrom::Resume).await.unwrap();
    let err = orch.start_run(&agency, FetchFrom::Full).await.unwrap_err();
    assert!(matches!(err, IngestError::Conflict(_)), "got {:?}", err);

    let done = orch.wait_for_run(first).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(orch.start_run(&agency, FetchFrom::Resume).await.is_ok());
}

#[tokio::test]
async fn cancelled_run_keeps_committed_batches() {
    let records: Vec<Value> = (0..20)
        .map(|i| {
            record(
                &format!("c{}", i),
                &format!("Lamp model {}", i),
                "Lumen",
                &format!("L-{}", i),
                "",
                "2024-05-01",
            )
        })
        .collect();
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(records).slow(Duration::from_millis(30)));
    let config = IngestConfig {
        batch_size: 1,
        ..IngestConfig::default()
    };
    let orch = orchestrator(store.clone(), connector, config);

    let run_id = orch
        .start_run(&AgencyCode::new(AGENCY), FetchFrom::Full)
        .await
        .unwrap();
    loop {
        let run = orch.get_run_status(run_id).await.unwrap();
        if run.records_upserted >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        orch.cancel_run(run_id).await.unwrap(),
        CancelOutcome::CancelRequested
    );
    let run = orch.wait_for_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.records_upserted >= 2 && run.records_upserted < 20);
    assert_eq!(run.watermark_after, None);
    assert_eq!(
        store.stats().await.unwrap().recalls,
        run.records_upserted,
        "committed batches remain after cancellation"
    );

    assert_eq!(
        orch.cancel_run(run_id).await.unwrap(),
        CancelOutcome::AlreadyFinished(RunStatus::Cancelled)
    );
}

#[tokio::test]
async fn shutdown_waits_for_runs_to_record_cancellation() {
    let records: Vec<Value> = (0..20)
        .map(|i| record(&format!("s{}", i), "Desk Fan", "Breeze", "F-1", "", "2024-05-01"))
        .collect();
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(records).slow(Duration::from_millis(30)));
    let config = IngestConfig {
        batch_size: 1,
        ..IngestConfig::default()
    };
    let orch = orchestrator(store, connector, config);

    let run_id = orch
        .start_run(&AgencyCode::new(AGENCY), FetchFrom::Full)
        .await
        .unwrap();
    while orch.get_run_status(run_id).await.unwrap().status != RunStatus::Running {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(orch.shutdown_and_wait(Duration::from_secs(5)).await);
    let run = orch.get_run_status(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(orch.shutdown_and_wait(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn transient_failures_are_retried_without_double_counting() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(
        FixtureConnector::new(three_records()).failing(Failure::TransientTimes(2)),
    );
    let config = IngestConfig {
        batch_size: 1,
        ..fast_retries()
    };
    let orch = orchestrator(store, connector.clone(), config);

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(connector.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(run.records_fetched, 3);
    assert_eq!(run.records_upserted, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(
        FixtureConnector::new(three_records()).failing(Failure::TransientTimes(u32::MAX)),
    );
    let config = IngestConfig {
        max_retries: 2,
        ..fast_retries()
    };
    let orch = orchestrator(store, connector.clone(), config);

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure.as_ref().map(|f| f.class),
        Some(FailureClass::RetriesExhausted)
    );
    assert_eq!(connector.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(run.watermark_after, None);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let store = Arc::new(InMemoryStore::new());
    let connector =
        Arc::new(FixtureConnector::new(three_records()).failing(Failure::Permanent));
    let orch = orchestrator(store.clone(), connector.clone(), fast_retries());

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.expect("failure recorded");
    assert_eq!(failure.class, FailureClass::Permanent);
    assert!(failure.message.contains("401"));
    assert_eq!(connector.fetches.load(Ordering::SeqCst), 1);

    // A failed run does not move the resume point.
    let agency = AgencyCode::new(AGENCY);
    assert!(store.last_completed_run(&agency).await.unwrap().is_none());
}

#[tokio::test]
async fn panicking_connector_fails_the_run_and_frees_the_agency() {
    let store = Arc::new(InMemoryStore::new());
    let connector =
        Arc::new(FixtureConnector::new(three_records()).failing(Failure::PanicsOn("3")));
    let config = IngestConfig {
        batch_size: 1,
        ..IngestConfig::default()
    };
    let orch = orchestrator(store.clone(), connector, config);

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure.as_ref().map(|f| f.class),
        Some(FailureClass::Panicked)
    );
    assert_eq!(run.records_upserted, 2, "counters from committed batches survive");
    assert_eq!(store.stats().await.unwrap().recalls, 2);

    let agency = AgencyCode::new(AGENCY);
    assert!(store.last_completed_run(&agency).await.unwrap().is_none());
    let next = orch.start_run(&agency, FetchFrom::Resume).await;
    assert!(next.is_ok(), "agency stays claimable: {:?}", next);
}

#[tokio::test]
async fn run_timeout_fails_the_run() {
    let store = Arc::new(InMemoryStore::new());
    let connector =
        Arc::new(FixtureConnector::new(three_records()).slow(Duration::from_secs(3)));
    let config = IngestConfig {
        run_timeout_secs: 1,
        ..IngestConfig::default()
    };
    let orch = orchestrator(store, connector, config);

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure.map(|f| f.class),
        Some(FailureClass::RunTimeout)
    );
}

#[tokio::test]
async fn malformed_records_are_skipped_and_summarized() {
    let mut records: Vec<Value> = (0..500)
        .map(|i| json!({ "id": format!("bad-{}", i), "name": "No date" }))
        .collect();
    records.insert(
        250,
        record("ok-1", "Space Heater", "Acme", "H-100", "036000291452", "2024-01-05"),
    );
    records.push(record("ok-2", "Hair Dryer", "Globex", "HD-9", "725272730706", "2024-03-15"));

    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(records));
    let config = IngestConfig {
        batch_size: 100,
        ..IngestConfig::default()
    };
    let orch = orchestrator(store.clone(), connector, config);

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.records_fetched, 502);
    assert_eq!(run.records_upserted, 2);
    assert_eq!(run.records_skipped_errors, 500);
    assert_eq!(run.error_summary.len(), 50);
    assert_eq!(run.error_summary[0].record_ref, "bad-0");
    assert!(run.error_summary[0].reason.contains("recall_date"));
    assert_eq!(store.stats().await.unwrap().recalls, 2);
}

#[tokio::test]
async fn freshness_reports_stale_until_first_success() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(three_records()));
    let orch = orchestrator(store, connector, IngestConfig::default());

    let before = orch.get_freshness(None).await.unwrap();
    assert_eq!(before.len(), 1);
    assert!(before[0].stale);
    assert_eq!(before[0].last_success_at, None);

    run_to_end(&orch, FetchFrom::Full).await;
    let after = orch
        .get_freshness(Some(&AgencyCode::new(AGENCY)))
        .await
        .unwrap();
    assert!(!after[0].stale);
    assert_eq!(after[0].last_run_status, Some(RunStatus::Completed));
    assert!(after[0].staleness_secs.unwrap() < 60);

    let err = orch
        .get_freshness(Some(&AgencyCode::new("NOPE")))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UnknownAgency(_)));
}

#[tokio::test]
async fn unknown_run_is_reported() {
    let store = Arc::new(InMemoryStore::new());
    let connector = Arc::new(FixtureConnector::new(Vec::new()));
    let orch = orchestrator(store, connector, IngestConfig::default());
    let err = orch.get_run_status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, IngestError::RunNotFound(_)));
}

// ============ SQLite-backed ============

async fn sqlite_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let pool = db::connect_path(&tmp.path().join("data/recall.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

#[tokio::test]
async fn sqlite_sync_then_lookup_and_search() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let connector = Arc::new(FixtureConnector::new(three_records()));
    let orch = orchestrator(store.clone(), connector, IngestConfig::default());

    let run = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(run.status, RunStatus::Completed);
    let rerun = run_to_end(&orch, FetchFrom::Full).await;
    assert_eq!(rerun.records_upserted, 3);

    let engine = MatchingEngine::new(store.clone(), MatchingConfig::default());
    match engine.lookup_by_identifier("012345678905").await.unwrap() {
        LookupOutcome::ExactMatch(matches) => {
            assert_eq!(matches.len(), 1);
            assert_eq!(matches[0].recall.brand, "Fisher-Price");
        }
        LookupOutcome::NoExactMatch => panic!("UPC should match"),
    }
    // EAN-13 form of the same UPC-A.
    assert!(matches!(
        engine.lookup_by_identifier("0012345678905").await.unwrap(),
        LookupOutcome::ExactMatch(_)
    ));
    assert!(matches!(
        engine.lookup_by_identifier("4006381333931").await.unwrap(),
        LookupOutcome::NoExactMatch
    ));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.recalls, 3);
    assert_eq!(stats.identifiers, 3);
}

#[tokio::test]
async fn sqlite_cursor_pages_survive_updates() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let records = vec![
        record("1", "Play Yard", "Acme", "PY-1", "036000291452", "2024-01-05"),
        record("2", "Play Mat", "Globex", "PM-2", "012345678905", "2024-02-10"),
        record("3", "Play Tent", "Initech", "PT-3", "725272730706", "2024-03-15"),
    ];
    let orch = orchestrator(
        store.clone(),
        Arc::new(FixtureConnector::new(records)),
        IngestConfig::default(),
    );
    assert_eq!(run_to_end(&orch, FetchFrom::Full).await.status, RunStatus::Completed);

    let engine = MatchingEngine::new(store.clone(), MatchingConfig::default());
    let page = |cursor: Option<String>| PageRequest {
        limit: Some(1),
        cursor,
        ..Default::default()
    };
    let filters = SearchFilters::default();
    let first = engine.search_text("play", &filters, &page(None)).await.unwrap();
    assert_eq!(first.total, 3);
    let first_id = first.items[0].recall.recall_id.clone();

    // Rename every other hit to the bare query, which would reorder a fresh search.
    let mut originals = Vec::new();
    for native in ["1", "2", "3"] {
        let stored = store.get_recall(&id(native)).await.unwrap();
        if stored.recall_id == first_id {
            continue;
        }
        let mut renamed = stored.clone();
        renamed.product_name = "Play".to_string();
        renamed.last_updated_at = stored.last_updated_at + ChronoDuration::seconds(1);
        store
            .apply_batch(&[UpsertOp::Update {
                recall: renamed,
                expected_last_updated_at: stored.last_updated_at,
            }])
            .await
            .unwrap();
        originals.push(stored);
    }

    let mut seen = vec![first_id];
    let mut cursor = first.next_cursor.clone();
    while let Some(next) = cursor.take() {
        let later = engine.search_text("play", &filters, &page(Some(next))).await.unwrap();
        assert_eq!(later.total, 3);
        assert_eq!(later.as_of, first.as_of);
        for item in &later.items {
            let original = originals
                .iter()
                .find(|r| r.recall_id == item.recall.recall_id)
                .expect("page repeated the first hit");
            assert_eq!(item.recall.product_name, original.product_name);
            seen.push(item.recall.recall_id.clone());
        }
        cursor = later.next_cursor;
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen, vec![id("1"), id("2"), id("3")]);

    let fresh = engine.search_text("play", &filters, &page(None)).await.unwrap();
    assert!(fresh.as_of > first.as_of);
    assert_eq!(fresh.items[0].recall.product_name, "Play");
}

#[tokio::test]
async fn sqlite_exclusivity_spans_orchestrators() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let slow = || Arc::new(FixtureConnector::new(three_records()).slow(Duration::from_millis(50)));
    let first = orchestrator(store.clone(), slow(), IngestConfig::default());
    let second = orchestrator(store.clone(), slow(), IngestConfig::default());
    let agency = AgencyCode::new(AGENCY);

    let run_id = first.start_run(&agency, FetchFrom::Full).await.unwrap();
    let err = second.start_run(&agency, FetchFrom::Full).await.unwrap_err();
    assert!(matches!(err, IngestError::Conflict(_)));

    // The second orchestrator does not own the run's worker.
    let status = second.get_run_status(run_id).await.unwrap().status;
    if status == RunStatus::Running {
        assert!(matches!(
            second.cancel_run(run_id).await,
            Err(IngestError::NotOwned(_))
        ));
    }

    let done = first.wait_for_run(run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one_run() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let slow = || Arc::new(FixtureConnector::new(three_records()).slow(Duration::from_millis(50)));
    let first = orchestrator(store.clone(), slow(), IngestConfig::default());
    let second = orchestrator(store.clone(), slow(), IngestConfig::default());
    let agency = AgencyCode::new(AGENCY);

    let attempts = (0..8).map(|i| {
        let orch = if i % 2 == 0 { &first } else { &second };
        orch.start_run(&agency, FetchFrom::Full)
    });
    let results = futures::future::join_all(attempts).await;

    let started: Vec<uuid::Uuid> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(started.len(), 1, "results: {:?}", results);
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(IngestError::Conflict(_))))
        .count();
    assert_eq!(conflicts, 7, "results: {:?}", results);

    let runs = store.list_runs(Some(&agency), 20).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, started[0]);

    let done = first.wait_for_run(started[0]).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
}

#[tokio::test]
async fn orphaned_runs_are_failed_on_recovery() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;

    let mut stranded = IngestionRun::pending(AgencyCode::new(AGENCY), None);
    store.create_run(&stranded).await.unwrap();
    stranded.status = RunStatus::Running;
    stranded.started_at = Some(Utc::now());
    assert!(store.update_run(&stranded, RunStatus::Pending).await.unwrap());

    let connector = Arc::new(FixtureConnector::new(three_records()));
    let orch = orchestrator(store.clone(), connector, IngestConfig::default());
    let recovered = orch.recover_orphans().await.unwrap();
    assert_eq!(recovered, vec![stranded.run_id]);

    let run = orch.get_run_status(stranded.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure.map(|f| f.class), Some(FailureClass::Orphaned));

    // The agency is free again.
    let next = run_to_end(&orch, FetchFrom::Resume).await;
    assert_eq!(next.status, RunStatus::Completed);
}
