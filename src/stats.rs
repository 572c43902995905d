//! Index health overview.
//!
//! A quick summary of what the background passes have produced: file count,
//! embedding coverage, edges per kind, entropy rows and suggestions per
//! status. Used by `dsense stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingCoverage};
use crate::files;
use crate::graph::{self, GraphStats};

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub files: i64,
    pub drives: Vec<(String, i64)>,
    pub hashed: i64,
    pub coverage: EmbeddingCoverage,
    pub graph: GraphStats,
    pub scored_directories: i64,
    pub suggestions_by_status: BTreeMap<String, i64>,
    pub last_scored_at: Option<i64>,
}

pub async fn collect_stats(pool: &SqlitePool, config: &Config) -> Result<IndexStats> {
    let files = files::file_count(pool).await?;
    let drives = files::drive_counts(pool).await?;
    let hashed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_content_hashes")
        .fetch_one(pool)
        .await?;
    let coverage = embedding::coverage(pool, config.embedding.model_name()).await?;
    let graph = graph::graph_stats(pool).await?;

    let scored_directories: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM entropy_scores WHERE subject_kind = 'directory'")
            .fetch_one(pool)
            .await?;
    let last_scored_at: Option<i64> =
        sqlx::query_scalar("SELECT MAX(computed_at) FROM entropy_scores")
            .fetch_one(pool)
            .await?;

    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM suggestions GROUP BY status")
        .fetch_all(pool)
        .await?;
    let suggestions_by_status = rows
        .iter()
        .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
        .collect();

    Ok(IndexStats {
        files,
        drives,
        hashed,
        coverage,
        graph,
        scored_directories,
        suggestions_by_status,
        last_scored_at,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool, config).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("dirsense stats");
    println!("==============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Files:       {}", stats.files);
    for (drive, n) in &stats.drives {
        println!("    {:<14} {:>8}", drive, n);
    }
    println!("  Hashed:      {}", stats.hashed);
    println!(
        "  Embedded:    {} / {} ({:.0}%) [{}]",
        stats.coverage.embedded,
        stats.coverage.total,
        stats.coverage.ratio() * 100.0,
        config.embedding.model_name()
    );

    println!();
    println!("  Edges:       {}", stats.graph.total);
    for (kind, n) in &stats.graph.by_kind {
        println!("    {:<14} {:>8}", kind, n);
    }

    println!();
    println!("  Scored dirs: {}", stats.scored_directories);
    if let Some(ts) = stats.last_scored_at {
        println!("  Last pass:   {}", format_ts_relative(ts));
    }

    if !stats.suggestions_by_status.is_empty() {
        println!();
        println!("  Suggestions:");
        for (status, n) in &stats.suggestions_by_status {
            println!("    {:<14} {:>8}", status, n);
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min ago", d / 60),
        d if d < 86_400 => format!("{} h ago", d / 3600),
        d if d < 86_400 * 30 => format!("{} days ago", d / 86_400),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::fixtures::{memory_pool, seed_file};
    use crate::models::{Edge, EdgeKind};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_collect_stats_counts_rows() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/a/x.txt", 1, 0, "d").await;
        seed_file(&pool, 2, "/a/y.txt", 1, 0, "d").await;
        graph::upsert_edges(&pool, &[Edge::new(1, 2, EdgeKind::Sibling, 0.5)])
            .await
            .unwrap();
        let config = Config::minimal(std::path::Path::new("/tmp/none.sqlite"));

        let stats = collect_stats(&pool, &config).await.unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.drives, vec![("d".to_string(), 2)]);
        assert_eq!(stats.coverage.total, 2);
        assert_eq!(stats.coverage.embedded, 0);
        assert_eq!(stats.graph.total, 1);
        assert!(stats.suggestions_by_status.is_empty());
        assert_eq!(stats.last_scored_at, None);
    }
}
