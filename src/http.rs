//! Shared HTTP client for agency connectors.
//!
//! Wraps a single `reqwest::Client` (connection pool, per-request timeout,
//! user agent) and classifies failures into [`ConnectorError`]:
//!
//! | Failure | Class |
//! |---------|-------|
//! | timeout, connection refused/reset | Transient |
//! | HTTP 429, 5xx | Transient |
//! | HTTP 401, 403, 404, 410, other 4xx | Permanent |
//! | body not valid JSON | Permanent |
//!
//! `file://` URLs are read from the local filesystem, which serves offline
//! backfills from downloaded agency exports.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::config::IngestConfig;
use crate::error::ConnectorError;

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// GET a URL and return the body. Non-2xx statuses are classified.
    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, ConnectorError> {
        match self.get_raw(url, query).await? {
            (status, body) if status.is_success() => Ok(body),
            (status, _) => Err(classify_status(status, url)),
        }
    }

    /// GET a URL and parse the body as JSON.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ConnectorError> {
        let body = self.get_text(url, query).await?;
        parse_json(&body, url)
    }

    /// Like [`get_json`](Self::get_json), but a 404 means "no results" and
    /// yields `None`. Some APIs answer an empty search that way.
    pub async fn get_json_or_empty(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, ConnectorError> {
        match self.get_raw(url, query).await? {
            (StatusCode::NOT_FOUND, _) => Ok(None),
            (status, body) if status.is_success() => parse_json(&body, url).map(Some),
            (status, _) => Err(classify_status(status, url)),
        }
    }

    async fn get_raw(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<(StatusCode, String), ConnectorError> {
        if let Some(path) = url.strip_prefix("file://") {
            let body = tokio::fs::read_to_string(path).await.map_err(|e| {
                ConnectorError::Permanent(format!("cannot read {}: {}", path, e))
            })?;
            return Ok((StatusCode::OK, body));
        }

        debug!(url, params = query.len(), "GET");
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        Ok((status, body))
    }
}

fn parse_json(body: &str, url: &str) -> Result<Value, ConnectorError> {
    serde_json::from_str(body)
        .map_err(|e| ConnectorError::Permanent(format!("invalid JSON from {}: {}", url, e)))
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode, url: &str) -> ConnectorError {
    let message = format!("HTTP {} from {}", status.as_u16(), url);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ConnectorError::Transient(message)
    } else {
        ConnectorError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> ConnectorError {
    if err.is_builder() {
        return ConnectorError::Permanent(err.to_string());
    }
    if let Some(status) = err.status() {
        return classify_status(status, err.url().map(|u| u.as_str()).unwrap_or(""));
    }
    ConnectorError::Transient(err.to_string())
}
