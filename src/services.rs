//! Service wiring.
//!
//! The store, orchestrator, and matching engine are built once per process
//! and handed to the CLI commands and HTTP handlers explicitly.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::db;
use crate::ingest::Orchestrator;
use crate::matching::MatchingEngine;
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::store::Store;

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub matching: Arc<MatchingEngine>,
    pool: Option<SqlitePool>,
}

impl Services {
    /// Open the configured database (migrating it if needed) and build one
    /// connector per `[agencies.<CODE>]` table.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let registry = ConnectorRegistry::from_config(config)?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let mut services = Self::assemble(config, store, registry);
        services.pool = Some(pool);
        Ok(services)
    }

    /// Wire services around an existing store and registry.
    pub fn assemble(config: &Config, store: Arc<dyn Store>, registry: ConnectorRegistry) -> Self {
        let orchestrator = Arc::new(Orchestrator::from_config(
            store.clone(),
            Arc::new(registry),
            config,
        ));
        let matching = Arc::new(MatchingEngine::new(store.clone(), config.matching.clone()));
        Self {
            config: config.clone(),
            store,
            orchestrator,
            matching,
            pool: None,
        }
    }

    /// Stop in-flight runs at their next batch boundary and close the pool.
    pub async fn close(self) {
        self.orchestrator.shutdown();
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}
