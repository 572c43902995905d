use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema for a config's database and close the pool.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table this crate reads or writes. Idempotent.
///
/// The `files` table belongs to the external indexer. It is created here
/// only so the subsystem can run against a fresh database; nothing in this
/// crate inserts into or deletes from it. The remaining tables reference
/// files by identity only, without foreign keys or cascades.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            extension TEXT,
            size_bytes INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            drive_id TEXT NOT NULL,
            parent_dir TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_embeddings (
            file_id INTEGER PRIMARY KEY,
            embedding BLOB NOT NULL,
            model_name TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedded_at INTEGER NOT NULL,
            content_fingerprint TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_content_hashes (
            file_id INTEGER PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            computed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_edges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            target_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            strength REAL NOT NULL,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, target_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entropy_scores (
            subject TEXT PRIMARY KEY,
            subject_kind TEXT NOT NULL,
            file_count INTEGER NOT NULL,
            naming_entropy REAL NOT NULL,
            age_spread REAL NOT NULL,
            depth_waste REAL NOT NULL,
            duplicate_ratio REAL NOT NULL,
            orphan_score REAL NOT NULL,
            composite REAL NOT NULL,
            newest_modified_at INTEGER,
            computed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suggestions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            affected_paths TEXT NOT NULL,
            reason TEXT NOT NULL,
            confidence REAL NOT NULL,
            space_savings_bytes INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            deferred_until INTEGER,
            manifest_path TEXT,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_files_parent_dir ON files(parent_dir)",
        "CREATE INDEX IF NOT EXISTS idx_files_drive ON files(drive_id)",
        "CREATE INDEX IF NOT EXISTS idx_files_name ON files(name COLLATE NOCASE)",
        "CREATE INDEX IF NOT EXISTS idx_content_fingerprint ON file_content_hashes(fingerprint)",
        "CREATE INDEX IF NOT EXISTS idx_edges_source ON file_edges(source_id)",
        "CREATE INDEX IF NOT EXISTS idx_edges_target ON file_edges(target_id)",
        "CREATE INDEX IF NOT EXISTS idx_edges_kind ON file_edges(kind)",
        "CREATE INDEX IF NOT EXISTS idx_suggestions_status ON suggestions(status)",
        "CREATE INDEX IF NOT EXISTS idx_suggestions_kind ON suggestions(kind)",
        "CREATE INDEX IF NOT EXISTS idx_suggestions_fingerprint ON suggestions(fingerprint)",
    ];
    for stmt in indexes {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
