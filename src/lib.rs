//! # Recall Index
//!
//! Multi-agency product recall ingestion, normalization, and matching.
//!
//! Recall Index pulls recall notices from government safety agencies
//! (CPSC, openFDA, and any JSON, RSS, or HTML feed), normalizes them into
//! one canonical schema, links likely duplicates across agencies, and
//! answers "has this product been recalled?" by exact barcode, by fuzzy
//! brand/name/identifier-prefix match, or by free text.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Connectors  │──▶│ Orchestrator │──▶│  SQLite   │
//! │ CPSC/FDA/.. │   │ norm + dedup │   │ FTS5 trgm │
//! └─────────────┘   └──────────────┘   └─────┬─────┘
//!                                            │
//!                      ┌─────────────────────┤
//!                      ▼                     ▼
//!                 ┌──────────┐        ┌──────────┐
//!                 │   CLI    │        │   HTTP   │
//!                 │ (recall) │        │  (axum)  │
//!                 └──────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! recall init                     # create database
//! recall sync all                 # ingest every configured agency
//! recall lookup 012345678905      # exact barcode lookup
//! recall similar --brand Fisher-Price --name "Rock n Play"
//! recall serve                    # HTTP server + scheduler
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Canonical recall, run, and watermark types |
//! | [`error`] | Typed errors per layer |
//! | [`agencies`] | Known-agency catalogue |
//! | [`normalize`] | Identifier, date, severity, and text normalization |
//! | [`similarity`] | Trigram similarity and record comparison |
//! | [`connector`] | Connector trait, record streams, registry |
//! | [`http`] | Shared HTTP client with error classification |
//! | [`connector_cpsc`] | CPSC recalls API |
//! | [`connector_openfda`] | openFDA enforcement reports |
//! | [`connector_json`] | Mapped JSON/REST feeds |
//! | [`connector_rss`] | RSS feeds |
//! | [`connector_html`] | HTML table scraping |
//! | [`store`] | Store trait and in-memory store |
//! | [`sqlite_store`] | SQLite store |
//! | [`ingest`] | Run orchestration and scheduling |
//! | [`matching`] | Lookup, similarity, and text search |
//! | [`services`] | Service wiring shared by CLI and server |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agencies;
pub mod config;
pub mod connector;
pub mod connector_cpsc;
pub mod connector_html;
pub mod connector_json;
pub mod connector_openfda;
pub mod connector_rss;
pub mod db;
pub mod error;
pub mod get;
pub mod http;
pub mod ingest;
pub mod matching;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod search;
pub mod server;
pub mod services;
pub mod similarity;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod store;
pub mod sync;
