//! JSON HTTP server.
//!
//! A thin adapter over the matching engine and the ingestion orchestrator.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/lookup/{code}` | Exact barcode lookup |
//! | `POST` | `/search/similar` | Brand / name / identifier-prefix matching |
//! | `POST` | `/search/text` | Free-text search with filters |
//! | `GET`  | `/recalls/{id}` | One recall with its duplicate links |
//! | `POST` | `/runs` | Start an ingestion run |
//! | `GET`  | `/runs` | Recent runs (`?agency=&limit=`) |
//! | `GET`  | `/runs/{id}` | Run status |
//! | `POST` | `/runs/{id}/cancel` | Cancel a run |
//! | `GET`  | `/freshness` | Per-agency last success and staleness (`?agency=`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `unavailable` (503), `internal` (500).
//!
//! `recall serve` also recovers orphaned runs at startup and runs the
//! per-agency scheduler until shutdown.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{IngestError, SearchError, StoreError};
use crate::ingest::{CancelOutcome, FetchFrom, Freshness, Scheduler};
use crate::matching::{LookupResponse, PageRequest, RecallDetail, SearchPage, SimilarQuery};
use crate::models::{AgencyCode, IngestionRun, Watermark};
use crate::services::Services;
use crate::store::SearchFilters;

/// How long shutdown waits for in-flight runs to record CANCELLED.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
}

/// Start the server on `[server].bind` and run until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Arc::new(Services::open(config).await?);

    let orphans = services.orchestrator.recover_orphans().await?;
    if !orphans.is_empty() {
        warn!(count = orphans.len(), "failed runs orphaned by a previous process");
    }

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::from_config(services.orchestrator.clone(), config);
    if !scheduler.is_empty() {
        scheduler.spawn(shutdown.clone());
    }

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "recall server listening");
    println!("Recall server listening on http://{}", bind_addr);

    let app = router(services.clone());
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            signal.cancel();
        })
        .await?;

    services.orchestrator.shutdown_and_wait(SHUTDOWN_GRACE).await;
    Ok(())
}

/// The full route table over `services`.
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/lookup/{code}", get(handle_lookup))
        .route("/search/similar", post(handle_similar))
        .route("/search/text", post(handle_text))
        .route("/recalls/{id}", get(handle_get_recall))
        .route("/runs", post(handle_start_run).get(handle_list_runs))
        .route("/runs/{id}", get(handle_run_status))
        .route("/runs/{id}/cancel", post(handle_cancel_run))
        .route("/freshness", get(handle_freshness))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { services })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        let message = err.to_string();
        match err {
            SearchError::Validation(_) => bad_request(message),
            SearchError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, "not_found", message),
            SearchError::Unavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let message = err.to_string();
        match err {
            IngestError::Conflict(_) | IngestError::NotOwned(_) => {
                AppError::new(StatusCode::CONFLICT, "conflict", message)
            }
            IngestError::UnknownAgency(_) | IngestError::RunNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            IngestError::Store(StoreError::Unavailable(_)) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            IngestError::Store(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

fn parse_run_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| bad_request(format!("invalid run id: {}", id)))
}

fn parse_date(field: &str, value: &Option<String>) -> Result<Option<NaiveDate>, AppError> {
    value
        .as_deref()
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .map_err(|_| bad_request(format!("{} must be YYYY-MM-DD, got {}", field, v)))
        })
        .transpose()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Search API ============

async fn handle_lookup(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<LookupResponse>, AppError> {
    let outcome = state.services.matching.lookup_by_identifier(&code).await?;
    Ok(Json(outcome.into()))
}

#[derive(Deserialize)]
struct SimilarRequest {
    #[serde(flatten)]
    query: SimilarQuery,
    #[serde(flatten)]
    page: PageRequest,
}

async fn handle_similar(
    State(state): State<AppState>,
    Json(req): Json<SimilarRequest>,
) -> Result<Json<SearchPage>, AppError> {
    let page = state
        .services
        .matching
        .search_similar(&req.query, &req.page)
        .await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
struct TextRequest {
    query: String,
    #[serde(default)]
    agency: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    date_from: Option<String>,
    #[serde(default)]
    date_to: Option<String>,
    #[serde(flatten)]
    page: PageRequest,
}

async fn handle_text(
    State(state): State<AppState>,
    Json(req): Json<TextRequest>,
) -> Result<Json<SearchPage>, AppError> {
    let filters = SearchFilters {
        agency: req.agency.as_deref().map(AgencyCode::new),
        region: req.region.clone(),
        date_from: parse_date("date_from", &req.date_from)?,
        date_to: parse_date("date_to", &req.date_to)?,
    };
    let page = state
        .services
        .matching
        .search_text(&req.query, &filters, &req.page)
        .await?;
    Ok(Json(page))
}

async fn handle_get_recall(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecallDetail>, AppError> {
    Ok(Json(state.services.matching.get_recall(&id).await?))
}

// ============ Ingestion API ============

#[derive(Deserialize)]
struct StartRunRequest {
    agency_code: String,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    full: bool,
}

#[derive(Serialize)]
struct StartRunResponse {
    run_id: Uuid,
}

async fn handle_start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    let from = match (req.full, req.since.as_deref()) {
        (true, Some(_)) => return Err(bad_request("full and since are mutually exclusive")),
        (true, None) => FetchFrom::Full,
        (false, Some(since)) => FetchFrom::Since(Watermark::parse(since)),
        (false, None) => FetchFrom::Resume,
    };
    let run_id = state
        .services
        .orchestrator
        .start_run(&AgencyCode::new(&req.agency_code), from)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

#[derive(Deserialize)]
struct ListRunsParams {
    agency: Option<String>,
    limit: Option<usize>,
}

async fn handle_list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Vec<IngestionRun>>, AppError> {
    let agency = params.agency.as_deref().map(AgencyCode::new);
    let runs = state
        .services
        .orchestrator
        .list_runs(agency.as_ref(), params.limit.unwrap_or(20).min(500))
        .await?;
    Ok(Json(runs))
}

async fn handle_run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IngestionRun>, AppError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(
        state.services.orchestrator.get_run_status(run_id).await?,
    ))
}

async fn handle_cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelOutcome>, AppError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(state.services.orchestrator.cancel_run(run_id).await?))
}

#[derive(Deserialize)]
struct FreshnessParams {
    agency: Option<String>,
}

async fn handle_freshness(
    State(state): State<AppState>,
    Query(params): Query<FreshnessParams>,
) -> Result<Json<Vec<Freshness>>, AppError> {
    let agency = params.agency.as_deref().map(AgencyCode::new);
    Ok(Json(
        state
            .services
            .orchestrator
            .get_freshness(agency.as_ref())
            .await?,
    ))
}
