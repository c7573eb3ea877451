use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // `seq` doubles as the commit sequence behind search snapshots.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recalls (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            recall_id TEXT NOT NULL UNIQUE CHECK (length(recall_id) > 0),
            agency_code TEXT NOT NULL,
            agency_native_id TEXT NOT NULL,
            product_name TEXT NOT NULL DEFAULT '',
            brand TEXT NOT NULL DEFAULT '',
            model_number TEXT NOT NULL DEFAULT '',
            hazard_description TEXT NOT NULL DEFAULT '',
            remedy TEXT NOT NULL DEFAULT '',
            severity TEXT NOT NULL DEFAULT 'UNKNOWN',
            risk_category TEXT NOT NULL DEFAULT '',
            recall_date TEXT NOT NULL,
            region TEXT NOT NULL,
            source_url TEXT,
            raw_payload TEXT NOT NULL,
            dedupe_key TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            first_seen_at INTEGER NOT NULL,
            last_updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recall_identifiers (
            recall_id TEXT NOT NULL,
            id_type TEXT NOT NULL,
            value TEXT NOT NULL,
            canonical TEXT NOT NULL,
            trimmed TEXT NOT NULL,
            PRIMARY KEY (recall_id, id_type, value),
            FOREIGN KEY (recall_id) REFERENCES recalls(recall_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Superseded recall versions, kept so a search snapshot reads each
    // recall as it stood at its `as_of`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recall_versions (
            recall_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            superseded_seq INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (recall_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS duplicate_links (
            recall_id TEXT NOT NULL,
            linked_recall_id TEXT NOT NULL,
            similarity REAL NOT NULL,
            linked_at INTEGER NOT NULL,
            PRIMARY KEY (recall_id, linked_recall_id),
            CHECK (recall_id <> linked_recall_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_runs (
            run_id TEXT PRIMARY KEY,
            agency_code TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            records_fetched INTEGER NOT NULL DEFAULT 0,
            records_upserted INTEGER NOT NULL DEFAULT 0,
            records_skipped_errors INTEGER NOT NULL DEFAULT 0,
            records_linked INTEGER NOT NULL DEFAULT 0,
            watermark_before TEXT,
            watermark_after TEXT,
            error_summary TEXT NOT NULL DEFAULT '[]',
            failure TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='recalls_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE recalls_fts USING fts5(
                recall_id UNINDEXED,
                product_name,
                brand,
                hazard_description,
                tokenize = 'trigram'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_recalls_agency ON recalls(agency_code)",
        "CREATE INDEX IF NOT EXISTS idx_recalls_dedupe ON recalls(dedupe_key, region)",
        "CREATE INDEX IF NOT EXISTS idx_recalls_date ON recalls(recall_date DESC)",
        "CREATE INDEX IF NOT EXISTS idx_identifiers_canonical ON recall_identifiers(canonical)",
        "CREATE INDEX IF NOT EXISTS idx_identifiers_trimmed ON recall_identifiers(trimmed)",
        "CREATE INDEX IF NOT EXISTS idx_versions_superseded ON recall_versions(superseded_seq)",
        "CREATE INDEX IF NOT EXISTS idx_links_linked ON duplicate_links(linked_recall_id)",
        "CREATE INDEX IF NOT EXISTS idx_runs_agency_status ON ingestion_runs(agency_code, status)",
        "CREATE INDEX IF NOT EXISTS idx_runs_created ON ingestion_runs(created_at DESC)",
        // At most one PENDING or RUNNING run per agency, enforced by the database.
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active ON ingestion_runs(agency_code) \
         WHERE status IN ('PENDING', 'RUNNING')",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
