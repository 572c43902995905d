//! Read-only access to the external file index.
//!
//! The indexer that discovers files owns the `files` table. This module
//! only reads it, plus the glob-based text filter shared by the reference
//! analyzer and the embedding text builder.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::FileRecord;

pub(crate) const FILE_COLUMNS: &str =
    "id, path, name, extension, size_bytes, modified_at, drive_id, parent_dir";

pub(crate) fn row_to_file(row: &SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        path: row.get("path"),
        name: row.get("name"),
        extension: row.get("extension"),
        size_bytes: row.get("size_bytes"),
        modified_at: row.get("modified_at"),
        drive_id: row.get("drive_id"),
        parent_dir: row.get("parent_dir"),
    }
}

pub async fn list_files(pool: &SqlitePool) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(&format!("SELECT {} FROM files ORDER BY id", FILE_COLUMNS))
        .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_file).collect())
}

pub async fn files_in_directory(pool: &SqlitePool, dir: &str) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM files WHERE parent_dir = ? ORDER BY id",
        FILE_COLUMNS
    ))
    .bind(dir)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_file).collect())
}

/// Every distinct parent directory in the index, sorted.
pub async fn directories(pool: &SqlitePool) -> Result<Vec<String>> {
    let dirs: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT parent_dir FROM files ORDER BY parent_dir")
            .fetch_all(pool)
            .await?;
    Ok(dirs)
}

pub async fn file_by_id(pool: &SqlitePool, id: i64) -> Result<Option<FileRecord>> {
    let row = sqlx::query(&format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_file))
}

pub async fn file_by_path(pool: &SqlitePool, path: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query(&format!("SELECT {} FROM files WHERE path = ?", FILE_COLUMNS))
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_file))
}

pub async fn files_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<FileRecord>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(file) = file_by_id(pool, *id).await? {
            out.push(file);
        }
    }
    Ok(out)
}

pub async fn files_on_drive(pool: &SqlitePool, drive_id: &str) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM files WHERE drive_id = ? ORDER BY id",
        FILE_COLUMNS
    ))
    .bind(drive_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_file).collect())
}

/// File count per drive, by drive id.
pub async fn drive_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT drive_id, COUNT(*) AS n FROM files GROUP BY drive_id ORDER BY drive_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("drive_id"), r.get("n")))
        .collect())
}

pub async fn file_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Decides which files are text-like, from `content.text_globs`.
#[derive(Debug, Clone)]
pub struct TextFilter {
    set: GlobSet,
}

impl TextFilter {
    pub fn new(globs: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in globs {
            builder.add(
                Glob::new(pattern).with_context(|| format!("Invalid text glob: {}", pattern))?,
            );
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn is_text(&self, file: &FileRecord) -> bool {
        self.set.is_match(&file.path) || self.set.is_match(&file.name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Helpers that stand in for the external indexer in unit tests.

    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::Path;

    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        pool
    }

    pub async fn seed_file(
        pool: &SqlitePool,
        id: i64,
        path: &str,
        size_bytes: i64,
        modified_at: i64,
        drive_id: &str,
    ) -> FileRecord {
        let p = Path::new(path);
        let name = p.file_name().unwrap().to_string_lossy().to_string();
        let extension = p.extension().map(|e| e.to_string_lossy().to_string());
        let parent_dir = p.parent().unwrap().to_string_lossy().to_string();
        sqlx::query(
            "INSERT INTO files (id, path, name, extension, size_bytes, modified_at, drive_id, parent_dir, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id)
        .bind(path)
        .bind(&name)
        .bind(&extension)
        .bind(size_bytes)
        .bind(modified_at)
        .bind(drive_id)
        .bind(&parent_dir)
        .execute(pool)
        .await
        .unwrap();
        FileRecord {
            id,
            path: path.to_string(),
            name,
            extension,
            size_bytes,
            modified_at,
            drive_id: drive_id.to_string(),
            parent_dir,
        }
    }

    pub fn record(id: i64, path: &str, modified_at: i64, drive_id: &str) -> FileRecord {
        let p = Path::new(path);
        FileRecord {
            id,
            path: path.to_string(),
            name: p.file_name().unwrap().to_string_lossy().to_string(),
            extension: p.extension().map(|e| e.to_string_lossy().to_string()),
            size_bytes: 100,
            modified_at,
            drive_id: drive_id.to_string(),
            parent_dir: p.parent().unwrap().to_string_lossy().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn test_directory_listing() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/d/a/one.txt", 10, 0, "d").await;
        seed_file(&pool, 2, "/d/a/two.txt", 10, 0, "d").await;
        seed_file(&pool, 3, "/d/b/three.txt", 10, 0, "d").await;

        assert_eq!(directories(&pool).await.unwrap(), vec!["/d/a", "/d/b"]);
        assert_eq!(files_in_directory(&pool, "/d/a").await.unwrap().len(), 2);
        assert_eq!(
            file_by_path(&pool, "/d/b/three.txt").await.unwrap().unwrap().id,
            3
        );
        assert!(file_by_id(&pool, 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drive_lookups() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/mnt/usb/a.txt", 10, 0, "usb").await;
        seed_file(&pool, 2, "/home/b.txt", 10, 0, "root").await;
        seed_file(&pool, 3, "/home/c.txt", 10, 0, "root").await;

        let on_root = files_on_drive(&pool, "root").await.unwrap();
        assert_eq!(on_root.iter().map(|f| f.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(
            drive_counts(&pool).await.unwrap(),
            vec![("root".to_string(), 2), ("usb".to_string(), 1)]
        );
    }

    #[test]
    fn test_text_filter() {
        let filter = TextFilter::new(&["**/*.md".to_string()]).unwrap();
        assert!(filter.is_text(&record(1, "/x/readme.md", 0, "x")));
        assert!(!filter.is_text(&record(2, "/x/photo.jpg", 0, "x")));
    }
}
