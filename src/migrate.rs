use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = migrate_pool(&pool).await;
    pool.close().await;
    result
}

/// Create every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            short_name TEXT,
            display_name TEXT,
            sortable_name TEXT,
            children_json TEXT NOT NULL DEFAULT '[]',
            cfr_references_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            agency_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(document_id, agency_id),
            FOREIGN KEY (agency_id) REFERENCES agencies(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_descriptors (
            id TEXT PRIMARY KEY,
            agency_id INTEGER NOT NULL,
            structure_index INTEGER NOT NULL,
            starts_on TEXT,
            ends_on TEXT,
            type TEXT,
            hierarchy_json TEXT NOT NULL DEFAULT '{}',
            hierarchy_headings_json TEXT NOT NULL DEFAULT 'null',
            headings_json TEXT NOT NULL DEFAULT 'null',
            full_text_excerpt TEXT,
            score REAL,
            reserved INTEGER NOT NULL DEFAULT 0,
            removed INTEGER NOT NULL DEFAULT 0,
            change_types_json TEXT NOT NULL DEFAULT 'null',
            processing_status INTEGER NOT NULL DEFAULT 0,
            document_ref TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE(agency_id, structure_index),
            FOREIGN KEY (agency_id) REFERENCES agencies(id) ON DELETE CASCADE,
            FOREIGN KEY (document_ref) REFERENCES documents(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_contents (
            id TEXT PRIMARY KEY,
            descriptor_id TEXT NOT NULL,
            agency_id INTEGER NOT NULL,
            version_date TEXT NOT NULL,
            raw_xml TEXT NOT NULL,
            processed_text TEXT,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(descriptor_id, version_date),
            FOREIGN KEY (descriptor_id) REFERENCES search_descriptors(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS historical_metrics (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            agency_id INTEGER NOT NULL,
            metrics_date TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            sentence_count INTEGER NOT NULL,
            paragraph_count INTEGER NOT NULL,
            flesch_reading_ease REAL NOT NULL,
            smog_index REAL NOT NULL,
            automated_readability_index REAL NOT NULL,
            combined_score REAL NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, metrics_date),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_progress (
            agency_id INTEGER PRIMARY KEY,
            total_count INTEGER NOT NULL,
            per_page INTEGER NOT NULL,
            current_page INTEGER NOT NULL DEFAULT 0,
            is_complete INTEGER NOT NULL DEFAULT 0,
            target_year INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (agency_id) REFERENCES agencies(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_descriptors_status ON search_descriptors(agency_id, processing_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_descriptors_document ON search_descriptors(document_ref)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contents_version ON document_contents(version_date)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_metrics_date ON historical_metrics(metrics_date DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
