//! Content fingerprints.
//!
//! A fingerprint is the hex SHA-256 of a file's bytes. Files above
//! `content.hash_max_bytes` get no fingerprint and drop out of duplicate
//! detection only; they stay in the index. The stored row remembers the
//! size and mtime it was computed from so unchanged files are not re-read.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::files;
use crate::models::FileRecord;

/// Checksum of an entire file, with no size ceiling.
pub fn checksum_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    checksum_reader(BufReader::new(file))
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Streamed checksum of any reader, e.g. an entry inside an archive.
pub fn checksum_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint a file, or `None` when it exceeds `max_bytes`.
pub fn fingerprint_file(path: &Path, max_bytes: u64) -> Result<Option<String>> {
    let meta =
        std::fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    if meta.len() > max_bytes {
        return Ok(None);
    }
    checksum_file(path).map(Some)
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Outcome of a hashing pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HashStats {
    pub hashed: usize,
    pub unchanged: usize,
    pub oversized: usize,
    pub errors: usize,
}

/// Fingerprint every file whose size or mtime changed since its last hash.
///
/// Cancellation is checked between files; rows already written stay valid.
pub async fn hash_pending(
    pool: &SqlitePool,
    files: &[FileRecord],
    max_bytes: u64,
    cancel: &CancellationToken,
) -> Result<HashStats> {
    let known = stored_hash_keys(pool).await?;
    let mut stats = HashStats::default();

    for file in files {
        if cancel.is_cancelled() {
            break;
        }
        if known.get(&file.id) == Some(&(file.size_bytes, file.modified_at)) {
            stats.unchanged += 1;
            continue;
        }

        let path = Path::new(&file.path).to_path_buf();
        let result = tokio::task::spawn_blocking(move || fingerprint_file(&path, max_bytes)).await?;

        match result {
            Ok(Some(fingerprint)) => {
                store_content_hash(pool, file, &fingerprint).await?;
                stats.hashed += 1;
            }
            Ok(None) => {
                tracing::debug!(path = %file.path, "skipping fingerprint for oversized file");
                sqlx::query("DELETE FROM file_content_hashes WHERE file_id = ?")
                    .bind(file.id)
                    .execute(pool)
                    .await?;
                stats.oversized += 1;
            }
            Err(e) => {
                tracing::warn!(path = %file.path, error = %e, "failed to fingerprint file");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

pub async fn store_content_hash(
    pool: &SqlitePool,
    file: &FileRecord,
    fingerprint: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO file_content_hashes (file_id, fingerprint, size_bytes, modified_at, computed_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(file_id) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            size_bytes = excluded.size_bytes,
            modified_at = excluded.modified_at,
            computed_at = excluded.computed_at
        "#,
    )
    .bind(file.id)
    .bind(fingerprint)
    .bind(file.size_bytes)
    .bind(file.modified_at)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// All stored fingerprints keyed by file identity.
pub async fn content_hashes(pool: &SqlitePool) -> Result<HashMap<i64, String>> {
    let rows = sqlx::query("SELECT file_id, fingerprint FROM file_content_hashes")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("file_id"), row.get("fingerprint")))
        .collect())
}

async fn stored_hash_keys(pool: &SqlitePool) -> Result<HashMap<i64, (i64, i64)>> {
    let rows = sqlx::query("SELECT file_id, size_bytes, modified_at FROM file_content_hashes")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get("file_id"),
                (row.get("size_bytes"), row.get("modified_at")),
            )
        })
        .collect())
}

/// CLI entry point for `dsense hash`.
pub async fn run_hash(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let all = files::list_files(&pool).await?;
    let stats = hash_pending(
        &pool,
        &all,
        config.content.hash_max_bytes,
        &CancellationToken::new(),
    )
    .await?;

    println!("hash");
    println!("  hashed: {}", stats.hashed);
    println!("  unchanged: {}", stats.unchanged);
    println!("  oversized: {}", stats.oversized);
    if stats.errors > 0 {
        println!("  unreadable: {}", stats.errors);
    }
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::fixtures::{memory_pool, seed_file};
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_matches_for_equal_content() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("b.txt");
        std::fs::write(&a, "same bytes").unwrap();
        std::fs::write(&b, "same bytes").unwrap();

        let fa = fingerprint_file(&a, 1024).unwrap().unwrap();
        let fb = fingerprint_file(&b, 1024).unwrap().unwrap();
        assert_eq!(fa, fb);
        assert_eq!(fa, checksum_bytes(b"same bytes"));
    }

    #[test]
    fn test_oversized_file_has_no_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let big = tmp.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 2048]).unwrap();
        assert_eq!(fingerprint_file(&big, 1024).unwrap(), None);
        assert!(checksum_file(&big).is_ok());
    }

    #[tokio::test]
    async fn test_hash_pending_skips_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();

        let pool = memory_pool().await;
        let file = seed_file(&pool, 1, path.to_str().unwrap(), 5, 100, "t").await;
        let cancel = CancellationToken::new();

        let first = hash_pending(&pool, &[file.clone()], 1024, &cancel).await.unwrap();
        assert_eq!(first.hashed, 1);

        let second = hash_pending(&pool, &[file], 1024, &cancel).await.unwrap();
        assert_eq!(second.hashed, 0);
        assert_eq!(second.unchanged, 1);

        let hashes = content_hashes(&pool).await.unwrap();
        assert_eq!(hashes.get(&1).unwrap(), &checksum_bytes(b"hello"));
    }
}
