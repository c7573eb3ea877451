//! Error taxonomy for connectors, the recall store, ingestion, and matching.
//!
//! Record-level problems ([`NormalizationError`]) are recovered locally by the
//! orchestrator. Run-level problems ([`ConnectorError`], [`IngestError`]) and
//! store outages ([`StoreError::Unavailable`]) are surfaced to the caller with
//! enough context to act on.

use thiserror::Error;
use uuid::Uuid;

/// Failure while fetching from an agency feed.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Network blip, timeout, 429, or 5xx. The fetch is restarted with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Auth failure or incompatible schema. The run fails without retry.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

/// A single raw record could not be mapped onto the canonical schema.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("recall not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// An active run already holds the agency's claim.
    #[error("agency {0} already has an active run")]
    Conflict(String),

    /// Optimistic check on `last_updated_at` failed; another writer got there first.
    #[error("stale write for recall {0}")]
    StaleWrite(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unavailable(format!("corrupt stored json: {}", err))
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("agency {0} already has an active run")]
    Conflict(String),

    #[error("no connector configured for agency {0}")]
    UnknownAgency(String),

    #[error("ingestion run not found: {0}")]
    RunNotFound(Uuid),

    /// The run is RUNNING in another process; only its owner can signal it.
    #[error("run {0} is owned by another process")]
    NotOwned(Uuid),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(agency) => IngestError::Conflict(agency),
            other => IngestError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    /// Malformed query, reported synchronously to the caller.
    #[error("invalid query: {0}")]
    Validation(String),

    #[error("recall not found: {0}")]
    NotFound(String),

    /// The store could not answer. Never reported as an empty result.
    #[error("search temporarily unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SearchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SearchError::NotFound(id),
            other => SearchError::Unavailable(other.to_string()),
        }
    }
}
