//! File relationship graph.
//!
//! Edges live in `file_edges`, unique on `(source_id, target_id, kind)`.
//! Writes go through [`upsert_edges`], which replaces strength and metadata
//! for an existing tuple. A graph pass uses [`replace_edges`] so that edges
//! an analyzer stopped producing are dropped in the same transaction.
//! Reads ([`related`], [`duplicates`], [`neighbors`], [`graph_stats`]) treat
//! edges as undirected and return empty results on an empty graph.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::analyzers::{self, AnalyzerInput, AnalyzerKind};
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::files::{self, TextFilter};
use crate::hasher;
use crate::models::{Edge, EdgeKind, FileRecord};

fn row_to_edge(row: &SqliteRow) -> Result<Edge> {
    let kind: String = row.get("kind");
    let metadata: Option<String> = row.get("metadata");
    Ok(Edge {
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        kind: kind.parse()?,
        strength: row.get("strength"),
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
    })
}

/// Write a pass's fresh edges and, for every kind in `settled`, delete the
/// stored edges of that kind the pass no longer produced. Runs in one
/// transaction so readers see either the old graph or the new one.
///
/// Returns `(written, removed)`.
pub async fn replace_edges(
    pool: &SqlitePool,
    edges: &[Edge],
    settled: &BTreeSet<EdgeKind>,
) -> Result<(usize, u64)> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    for edge in edges {
        let metadata = edge.metadata.as_ref().map(|m| m.to_string());
        sqlx::query(
            r#"
            INSERT INTO file_edges
                (source_id, target_id, kind, strength, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, target_id, kind) DO UPDATE SET
                strength = excluded.strength,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(edge.source_id)
        .bind(edge.target_id)
        .bind(edge.kind.as_str())
        .bind(edge.strength)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let mut removed = 0;
    for kind in settled {
        let live: HashSet<(i64, i64)> = edges
            .iter()
            .filter(|e| e.kind == *kind)
            .map(|e| (e.source_id, e.target_id))
            .collect();
        let stored: Vec<(i64, i64)> =
            sqlx::query_as("SELECT source_id, target_id FROM file_edges WHERE kind = ?")
                .bind(kind.as_str())
                .fetch_all(&mut *tx)
                .await?;
        for (source_id, target_id) in stored {
            if live.contains(&(source_id, target_id)) {
                continue;
            }
            removed += sqlx::query(
                "DELETE FROM file_edges WHERE source_id = ? AND target_id = ? AND kind = ?",
            )
            .bind(source_id)
            .bind(target_id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
    }

    tx.commit().await?;
    Ok((edges.len(), removed))
}

/// Insert or update edges in one transaction. Returns the number written.
pub async fn upsert_edges(pool: &SqlitePool, edges: &[Edge]) -> Result<usize> {
    let (written, _) = replace_edges(pool, edges, &BTreeSet::new()).await?;
    Ok(written)
}

/// Delete weak edges and edges pointing at files no longer in the index.
pub async fn prune_edges(pool: &SqlitePool, min_strength: f64) -> Result<u64> {
    let weak = sqlx::query("DELETE FROM file_edges WHERE strength < ?")
        .bind(min_strength)
        .execute(pool)
        .await?
        .rows_affected();
    let dangling = sqlx::query(
        "DELETE FROM file_edges
         WHERE source_id NOT IN (SELECT id FROM files)
            OR target_id NOT IN (SELECT id FROM files)",
    )
    .execute(pool)
    .await?
    .rows_affected();
    Ok(weak + dangling)
}

pub async fn neighbors(pool: &SqlitePool, file_id: i64) -> Result<Vec<Edge>> {
    let rows = sqlx::query(
        "SELECT source_id, target_id, kind, strength, metadata FROM file_edges
         WHERE source_id = ? OR target_id = ?
         ORDER BY strength DESC, source_id, target_id, kind",
    )
    .bind(file_id)
    .bind(file_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_edge).collect()
}

/// Strongest edge to each adjacent file, across all kinds.
async fn adjacent(pool: &SqlitePool, file_id: i64) -> Result<HashMap<i64, f64>> {
    let mut out: HashMap<i64, f64> = HashMap::new();
    for edge in neighbors(pool, file_id).await? {
        let other = if edge.source_id == file_id {
            edge.target_id
        } else {
            edge.source_id
        };
        let slot = out.entry(other).or_insert(0.0);
        *slot = slot.max(edge.strength);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct RelatedFile {
    pub file: FileRecord,
    /// Sum of edge strengths along the best shortest path.
    pub score: f64,
    pub hops: usize,
}

/// Breadth-first walk from `file_id` up to `depth` hops.
///
/// Each file is scored once, at the hop where it is first reached, with the
/// best `parent score + edge strength` among parents one hop closer.
pub async fn related(
    pool: &SqlitePool,
    file_id: i64,
    depth: usize,
    limit: usize,
) -> Result<Vec<RelatedFile>> {
    let mut scores: HashMap<i64, (f64, usize)> = HashMap::new();
    let mut visited: HashSet<i64> = HashSet::from([file_id]);
    let mut frontier: Vec<(i64, f64)> = vec![(file_id, 0.0)];

    for hop in 1..=depth {
        let mut next: HashMap<i64, f64> = HashMap::new();
        for (node, base) in &frontier {
            for (other, strength) in adjacent(pool, *node).await? {
                if visited.contains(&other) {
                    continue;
                }
                let slot = next.entry(other).or_insert(f64::MIN);
                *slot = slot.max(base + strength);
            }
        }
        if next.is_empty() {
            break;
        }
        for (id, score) in &next {
            visited.insert(*id);
            scores.insert(*id, (*score, hop));
        }
        frontier = next.into_iter().collect();
    }

    let mut ranked: Vec<(i64, f64, usize)> = scores
        .into_iter()
        .map(|(id, (score, hops))| (id, score, hops))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    ranked.truncate(limit);

    let mut out = Vec::with_capacity(ranked.len());
    for (id, score, hops) in ranked {
        if let Some(file) = files::file_by_id(pool, id).await? {
            out.push(RelatedFile { file, score, hops });
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub first: FileRecord,
    pub second: FileRecord,
    pub strength: f64,
}

/// Every pair joined by a duplicate edge, strongest first.
pub async fn duplicates(pool: &SqlitePool) -> Result<Vec<DuplicatePair>> {
    let rows = sqlx::query(
        "SELECT source_id, target_id, strength FROM file_edges
         WHERE kind = ? ORDER BY strength DESC, source_id, target_id",
    )
    .bind(EdgeKind::Duplicate.as_str())
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let first = files::file_by_id(pool, row.get("source_id")).await?;
        let second = files::file_by_id(pool, row.get("target_id")).await?;
        if let (Some(first), Some(second)) = (first, second) {
            out.push(DuplicatePair {
                first,
                second,
                strength: row.get("strength"),
            });
        }
    }
    Ok(out)
}

/// Files that appear on either end of a duplicate edge.
pub async fn duplicate_participants(pool: &SqlitePool) -> Result<HashSet<i64>> {
    let rows = sqlx::query("SELECT source_id, target_id FROM file_edges WHERE kind = ?")
        .bind(EdgeKind::Duplicate.as_str())
        .fetch_all(pool)
        .await?;
    Ok(endpoints(&rows))
}

/// Connected components of the duplicate edges, each sorted by id.
///
/// If A and B are duplicates and B and C are duplicates, all three land in
/// one group even when no A-C edge is stored.
pub async fn duplicate_groups(pool: &SqlitePool) -> Result<Vec<Vec<i64>>> {
    let rows = sqlx::query("SELECT source_id, target_id FROM file_edges WHERE kind = ?")
        .bind(EdgeKind::Duplicate.as_str())
        .fetch_all(pool)
        .await?;

    let mut parent: HashMap<i64, i64> = HashMap::new();
    fn find(parent: &mut HashMap<i64, i64>, x: i64) -> i64 {
        let p = *parent.entry(x).or_insert(x);
        if p == x {
            return x;
        }
        let root = find(parent, p);
        parent.insert(x, root);
        root
    }
    for row in &rows {
        let a = find(&mut parent, row.get("source_id"));
        let b = find(&mut parent, row.get("target_id"));
        if a != b {
            parent.insert(a.max(b), a.min(b));
        }
    }

    let ids: Vec<i64> = parent.keys().copied().collect();
    let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for id in ids {
        let root = find(&mut parent, id);
        groups.entry(root).or_default().push(id);
    }
    Ok(groups
        .into_values()
        .map(|mut g| {
            g.sort_unstable();
            g
        })
        .collect())
}

/// Files with at least one edge of any kind.
pub async fn connected_files(pool: &SqlitePool) -> Result<HashSet<i64>> {
    let rows = sqlx::query("SELECT source_id, target_id FROM file_edges")
        .fetch_all(pool)
        .await?;
    Ok(endpoints(&rows))
}

fn endpoints(rows: &[SqliteRow]) -> HashSet<i64> {
    rows.iter()
        .flat_map(|r| [r.get::<i64, _>("source_id"), r.get::<i64, _>("target_id")])
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    pub total: i64,
    pub by_kind: BTreeMap<String, i64>,
}

pub async fn graph_stats(pool: &SqlitePool) -> Result<GraphStats> {
    let rows =
        sqlx::query("SELECT kind, COUNT(*) AS n FROM file_edges GROUP BY kind ORDER BY kind")
            .fetch_all(pool)
            .await?;
    let by_kind: BTreeMap<String, i64> = rows
        .iter()
        .map(|r| (r.get("kind"), r.get("n")))
        .collect();
    Ok(GraphStats {
        total: by_kind.values().sum(),
        by_kind,
    })
}

// ============ Graph pass ============

/// What one analyzer pass did.
#[derive(Debug, Clone, Default)]
pub struct GraphReport {
    pub edges_by_analyzer: BTreeMap<&'static str, usize>,
    pub skipped: BTreeMap<&'static str, String>,
    pub failed: BTreeMap<&'static str, String>,
    /// Edges whose evidence disappeared since the last pass.
    pub stale: u64,
    pub pruned: u64,
    pub cancelled: bool,
}

impl GraphReport {
    pub fn edges_written(&self) -> usize {
        self.edges_by_analyzer.values().sum()
    }
}

/// Walk up from `dir` to the nearest directory containing `.git`.
fn find_repo_root(dir: &Path, memo: &mut HashMap<PathBuf, Option<PathBuf>>) -> Option<PathBuf> {
    let mut visited = Vec::new();
    let mut current = Some(dir);
    let mut found = None;
    while let Some(d) = current {
        if let Some(hit) = memo.get(d) {
            found = hit.clone();
            break;
        }
        visited.push(d.to_path_buf());
        if d.join(".git").exists() {
            found = Some(d.to_path_buf());
            break;
        }
        current = d.parent();
    }
    for d in visited {
        memo.insert(d, found.clone());
    }
    found
}

/// Repositories to read history from: configured ones plus any git work
/// tree that contains an indexed file.
pub fn discover_repositories(config: &Config, files: &[FileRecord]) -> Vec<PathBuf> {
    let mut repos: Vec<PathBuf> = config.graph.repositories.clone();
    let mut memo = HashMap::new();
    let dirs: HashSet<&str> = files.iter().map(|f| f.parent_dir.as_str()).collect();
    for dir in dirs {
        if let Some(root) = find_repo_root(Path::new(dir), &mut memo) {
            repos.push(root);
        }
    }
    repos.sort();
    repos.dedup();
    repos
}

/// Commit file sets mapped to file ids. Repositories without usable history
/// are logged and skipped.
pub fn collect_commits(config: &Config, files: &[FileRecord]) -> Vec<Vec<i64>> {
    let by_path: HashMap<&str, i64> = files.iter().map(|f| (f.path.as_str(), f.id)).collect();
    let mut commits = Vec::new();
    for repo in discover_repositories(config, files) {
        match analyzers::git_history(&repo, config.graph.comod_window_days) {
            Ok(history) => {
                for paths in history {
                    let ids: Vec<i64> = paths
                        .iter()
                        .filter_map(|p| by_path.get(p.to_string_lossy().as_ref()).copied())
                        .collect();
                    if ids.len() > 1 {
                        commits.push(ids);
                    }
                }
            }
            Err(e) => {
                tracing::info!(repo = %repo.display(), error = %e, "no git history, skipping");
            }
        }
    }
    commits
}

/// Run every analyzer over the current index and upsert their edges.
///
/// A failing analyzer is recorded in the report and does not stop the
/// others. Cancellation is checked between analyzers.
pub async fn build_graph(
    pool: &SqlitePool,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<GraphReport> {
    build_graph_inner(pool, config, cancel)
        .instrument(tracing::info_span!("graph_build"))
        .await
}

async fn build_graph_inner(
    pool: &SqlitePool,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<GraphReport> {
    let all_files = files::list_files(pool).await?;
    let text_filter = TextFilter::new(&config.content.text_globs)?;

    hasher::hash_pending(pool, &all_files, config.content.hash_max_bytes, cancel).await?;
    let content_hashes = hasher::content_hashes(pool).await?;

    let embeddings: HashMap<i64, Vec<f32>> =
        embedding::load_embeddings(pool, config.embedding.model_name())
            .await?
            .into_iter()
            .map(|e| (e.file_id, e.vector))
            .collect();

    let commits = {
        let config = config.clone();
        let for_git = all_files.clone();
        tokio::task::spawn_blocking(move || collect_commits(&config, &for_git)).await?
    };

    let input = AnalyzerInput {
        files: &all_files,
        content_hashes: &content_hashes,
        embeddings: &embeddings,
        commits: &commits,
        text_filter: &text_filter,
        config,
    };

    let mut report = GraphReport::default();
    let mut fresh: BTreeMap<(i64, i64, EdgeKind), Edge> = BTreeMap::new();
    let mut settled: BTreeSet<EdgeKind> = AnalyzerKind::ALL
        .iter()
        .flat_map(|k| k.emits().iter().copied())
        .collect();

    for kind in AnalyzerKind::ALL {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        // A skipped analyzer has no evidence, so it settles its kinds as empty.
        if let Some(reason) = kind.skip_reason(&input) {
            tracing::info!(analyzer = kind.name(), reason, "analyzer skipped");
            report.skipped.insert(kind.name(), reason.to_string());
            continue;
        }
        match kind.run(&input) {
            Ok(edges) => {
                report.edges_by_analyzer.insert(kind.name(), edges.len());
                for edge in edges {
                    merge_edge(&mut fresh, edge);
                }
            }
            Err(e) => {
                tracing::warn!(analyzer = kind.name(), error = %e, "analyzer failed");
                report.failed.insert(kind.name(), e.to_string());
                for k in kind.emits() {
                    settled.remove(k);
                }
            }
        }
        tokio::task::yield_now().await;
    }
    if report.cancelled {
        settled.clear();
    }

    let edges: Vec<Edge> = fresh.into_values().collect();
    let (_, stale) = replace_edges(pool, &edges, &settled).await?;
    report.stale = stale;
    report.pruned = prune_edges(pool, config.graph.prune_below).await?;
    Ok(report)
}

/// Keep the strongest evidence when two analyzers produce the same edge,
/// so a fingerprint match is never weakened by an embedding score.
fn merge_edge(fresh: &mut BTreeMap<(i64, i64, EdgeKind), Edge>, edge: Edge) {
    let key = (edge.source_id, edge.target_id, edge.kind);
    match fresh.get(&key) {
        Some(existing) if existing.strength >= edge.strength => {}
        _ => {
            fresh.insert(key, edge);
        }
    }
}

// ============ CLI ============

pub async fn run_graph_build(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = build_graph(&pool, config, &CancellationToken::new()).await?;

    println!("graph build");
    for (name, n) in &report.edges_by_analyzer {
        println!("  {}: {} edges", name, n);
    }
    for (name, reason) in &report.skipped {
        println!("  {}: skipped ({})", name, reason);
    }
    for (name, err) in &report.failed {
        println!("  {}: failed ({})", name, err);
    }
    println!("  stale removed: {}", report.stale);
    println!("  pruned: {}", report.pruned);

    pool.close().await;
    Ok(())
}

pub async fn run_graph_prune(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let pruned = prune_edges(&pool, config.graph.prune_below).await?;
    println!("graph prune");
    println!("  removed: {}", pruned);
    pool.close().await;
    Ok(())
}

pub async fn run_related(config: &Config, path: &str, depth: usize, limit: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let file = files::file_by_path(&pool, path)
        .await?
        .with_context(|| format!("File not in index: {}", path))?;

    let results = related(&pool, file.id, depth, limit).await?;
    if results.is_empty() {
        println!("No related files.");
    }
    for r in &results {
        println!("[{:.2}] {} ({} hops)", r.score, r.file.path, r.hops);
    }

    pool.close().await;
    Ok(())
}

pub async fn run_duplicates(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let pairs = duplicates(&pool).await?;
    if pairs.is_empty() {
        println!("No duplicates.");
    }
    for pair in &pairs {
        println!("[{:.2}] {}", pair.strength, pair.first.path);
        println!("       {}", pair.second.path);
    }
    pool.close().await;
    Ok(())
}
