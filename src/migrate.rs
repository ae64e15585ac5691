use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per codebase: the last tree whose vectors the index accepted.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_records (
            codebase_id TEXT PRIMARY KEY,
            root_hash TEXT NOT NULL,
            tree_json TEXT NOT NULL,
            last_commit TEXT,
            manifest_json TEXT NOT NULL DEFAULT '{}',
            webhook_json TEXT,
            synced_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_records_synced_at ON sync_records(synced_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
