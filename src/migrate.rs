use sqlx::SqlitePool;

use crate::error::Result;

/// Create the snapshot tables if they do not exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per index entry; `position` preserves insertion order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            position INTEGER NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            section TEXT,
            content TEXT NOT NULL,
            length INTEGER NOT NULL,
            hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            vector BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_document_id ON entries(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_position ON entries(position)")
        .execute(pool)
        .await?;

    Ok(())
}
