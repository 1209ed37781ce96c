use anyhow::Result;
use sqlx::SqlitePool;

/// Table holding every loaded record.
pub const VECTORS_TABLE: &str = "dat_vectors";

/// Create the vector table and its indexes. Safe to run on every sync.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // No uniqueness on record_id: APPEND streams may store duplicates, and
    // UPSERT dedup happens through delete-then-load.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dat_vectors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            stream TEXT NOT NULL,
            record_id TEXT NOT NULL,
            document_chunk TEXT NOT NULL,
            embedding BLOB,
            dims INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            emitted_at INTEGER NOT NULL,
            loaded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dat_vectors_stream ON dat_vectors(namespace, stream)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dat_vectors_record ON dat_vectors(namespace, record_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
