//! Schema creation for the SQLite store.
//!
//! Every statement is `CREATE … IF NOT EXISTS`, so running the migrations
//! against an existing database is a no-op.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        plant_id TEXT NOT NULL,
        text TEXT NOT NULL,
        status TEXT NOT NULL,
        failure_reason TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    r#"
    CREATE TABLE IF NOT EXISTS extraction_cache (
        fingerprint TEXT PRIMARY KEY,
        extractor_version TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_orders (
        document_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (document_id, position),
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS failure_events (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        plant_id TEXT NOT NULL,
        equipment_tag TEXT NOT NULL,
        description TEXT NOT NULL,
        root_cause TEXT,
        repair_action TEXT,
        reported_at INTEGER NOT NULL,
        text_fingerprint TEXT NOT NULL,
        embedding BLOB,
        embedding_fingerprint TEXT,
        embedding_model TEXT,
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_failure_events_document ON failure_events(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_failure_events_reported ON failure_events(plant_id, reported_at)",
    r#"
    CREATE TABLE IF NOT EXISTS failure_patterns (
        id TEXT PRIMARY KEY,
        member_ids TEXT NOT NULL,
        centroid BLOB NOT NULL,
        first_occurrence INTEGER NOT NULL,
        last_occurrence INTEGER NOT NULL,
        equipment_tags TEXT NOT NULL,
        summary TEXT NOT NULL,
        detected_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cost_ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        units INTEGER NOT NULL,
        cost_usd REAL NOT NULL,
        recorded_at INTEGER NOT NULL
    )
    "#,
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Open the configured database and bring its schema up to date.
pub async fn init_database(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    run_migrations(&pool).await?;
    info!(path = %config.db.path.display(), "database initialized");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("data").join("mintel.sqlite"));
        let pool = init_database(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('documents', 'extraction_cache', 'work_orders', 'failure_events', \
              'failure_patterns', 'cost_ledger')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 6);
    }
}
