//! Organizational entropy scoring.
//!
//! Five dimensions, each in `[0, 1]` where 0 is tidy:
//!
//! | Dimension | Measures |
//! |-----------|----------|
//! | naming | share of files whose naming pattern disagrees with the dominant one |
//! | age spread | newest minus oldest mtime, against `entropy.age_ceiling_days` |
//! | depth waste | share of the directory's depth spent in single-child chains |
//! | duplicate ratio | share of files with a duplicate edge |
//! | orphan score | share of files with no edge at all |
//!
//! The composite is the weighted mean under `entropy.weights`. An empty
//! file set scores 0 on every dimension.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use crate::config::{Config, EntropyConfig};
use crate::db;
use crate::files;
use crate::graph;
use crate::models::{EntropyScore, FileRecord, SubjectKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamingPattern {
    Kebab,
    Snake,
    ScreamingSnake,
    Pascal,
    Camel,
    Spaces,
    Lower,
    Other,
}

/// Case style and separator convention of a file name's stem.
pub fn classify_naming(name: &str) -> NamingPattern {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let has_upper = stem.chars().any(|c| c.is_uppercase());
    let has_lower = stem.chars().any(|c| c.is_lowercase());
    let plain = |sep: char| {
        stem.chars()
            .all(|c| c.is_lowercase() || c.is_ascii_digit() || c == sep)
    };

    if stem.contains(' ') {
        NamingPattern::Spaces
    } else if stem.contains('-') && plain('-') {
        NamingPattern::Kebab
    } else if stem.contains('_') && plain('_') {
        NamingPattern::Snake
    } else if stem.contains('_')
        && stem
            .chars()
            .all(|c| c.is_uppercase() || c.is_ascii_digit() || c == '_')
    {
        NamingPattern::ScreamingSnake
    } else if stem.contains(['_', '-']) {
        NamingPattern::Other
    } else if stem.starts_with(|c: char| c.is_uppercase()) && has_lower {
        NamingPattern::Pascal
    } else if stem.starts_with(|c: char| c.is_lowercase()) && has_upper {
        NamingPattern::Camel
    } else if has_lower && !has_upper {
        NamingPattern::Lower
    } else {
        NamingPattern::Other
    }
}

/// `(n - dominant) / (n - 1)`; 0 when every name follows one pattern.
pub fn naming_entropy(files: &[FileRecord]) -> f64 {
    let n = files.len();
    if n < 2 {
        return 0.0;
    }
    let mut counts: HashMap<NamingPattern, usize> = HashMap::new();
    for file in files {
        *counts.entry(classify_naming(&file.name)).or_insert(0) += 1;
    }
    let dominant = counts.values().copied().max().unwrap_or(n);
    ((n - dominant) as f64 / (n - 1) as f64).clamp(0.0, 1.0)
}

pub fn age_spread(files: &[FileRecord], ceiling_days: u32) -> f64 {
    let (Some(min), Some(max)) = (
        files.iter().map(|f| f.modified_at).min(),
        files.iter().map(|f| f.modified_at).max(),
    ) else {
        return 0.0;
    };
    let ceiling = ceiling_days.max(1) as f64 * 86_400.0;
    ((max - min) as f64 / ceiling).clamp(0.0, 1.0)
}

fn entry_count(dir: &Path) -> Option<usize> {
    std::fs::read_dir(dir).ok().map(|rd| rd.filter_map(|e| e.ok()).count())
}

fn only_child_dir(dir: &Path) -> Option<std::path::PathBuf> {
    let entries: Vec<_> = std::fs::read_dir(dir).ok()?.filter_map(|e| e.ok()).collect();
    match entries.as_slice() {
        [only] if only.path().is_dir() => Some(only.path()),
        _ => None,
    }
}

/// Single-child links above and below `dir`, over its total depth.
///
/// Ancestors count while each holds nothing but the next directory down;
/// below, the walk follows directories that hold a single subdirectory.
/// Both walks stop after `max_chain` steps. Unreadable paths count as
/// chain ends.
pub fn depth_waste(dir: &Path, max_chain: usize) -> f64 {
    let depth = dir
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();

    let mut up = 0usize;
    let mut current = dir;
    while up < max_chain {
        let Some(parent) = current.parent() else { break };
        if parent.parent().is_none() || entry_count(parent) != Some(1) {
            break;
        }
        up += 1;
        current = parent;
    }

    let mut down = 0usize;
    let mut cursor = dir.to_path_buf();
    while down < max_chain {
        match only_child_dir(&cursor) {
            Some(child) => {
                down += 1;
                cursor = child;
            }
            None => break,
        }
    }

    let total = depth + down;
    if total == 0 {
        return 0.0;
    }
    ((up + down) as f64 / total as f64).clamp(0.0, 1.0)
}

fn fraction(files: &[FileRecord], pred: impl Fn(&FileRecord) -> bool) -> f64 {
    if files.is_empty() {
        return 0.0;
    }
    files.iter().filter(|f| pred(f)).count() as f64 / files.len() as f64
}

pub fn duplicate_ratio(files: &[FileRecord], duplicated: &HashSet<i64>) -> f64 {
    fraction(files, |f| duplicated.contains(&f.id))
}

pub fn orphan_score(files: &[FileRecord], connected: &HashSet<i64>) -> f64 {
    fraction(files, |f| !connected.contains(&f.id))
}

/// Weighted mean of `[naming, age, depth, duplicate, orphan]`.
pub fn composite(dimensions: [f64; 5], weights: [f64; 5]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let sum: f64 = dimensions
        .iter()
        .zip(weights.iter())
        .map(|(d, w)| d.clamp(0.0, 1.0) * w)
        .sum();
    (sum / total).clamp(0.0, 1.0)
}

/// Graph-derived sets the scorers need, loaded once per pass.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub duplicated: HashSet<i64>,
    pub connected: HashSet<i64>,
}

impl GraphSnapshot {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        Ok(Self {
            duplicated: graph::duplicate_participants(pool).await?,
            connected: graph::connected_files(pool).await?,
        })
    }
}

/// Score one directory's direct files.
pub fn score_files(
    dir: &str,
    files: &[FileRecord],
    graph: &GraphSnapshot,
    config: &EntropyConfig,
    now: i64,
) -> EntropyScore {
    let dims = [
        naming_entropy(files),
        age_spread(files, config.age_ceiling_days),
        depth_waste(Path::new(dir), config.max_chain_depth),
        duplicate_ratio(files, &graph.duplicated),
        orphan_score(files, &graph.connected),
    ];
    EntropyScore {
        subject: dir.to_string(),
        subject_kind: SubjectKind::Directory,
        file_count: files.len(),
        naming_entropy: dims[0],
        age_spread: dims[1],
        depth_waste: dims[2],
        duplicate_ratio: dims[3],
        orphan_score: dims[4],
        composite: composite(dims, config.weights.as_array()),
        newest_modified_at: files.iter().map(|f| f.modified_at).max(),
        computed_at: now,
    }
}

/// Per-file score: only the duplicate and orphan dimensions apply.
pub fn score_file(
    file: &FileRecord,
    graph: &GraphSnapshot,
    config: &EntropyConfig,
    now: i64,
) -> EntropyScore {
    let single = std::slice::from_ref(file);
    let dims = [
        0.0,
        0.0,
        0.0,
        duplicate_ratio(single, &graph.duplicated),
        orphan_score(single, &graph.connected),
    ];
    EntropyScore {
        subject: file.path.clone(),
        subject_kind: SubjectKind::File,
        file_count: 1,
        naming_entropy: 0.0,
        age_spread: 0.0,
        depth_waste: 0.0,
        duplicate_ratio: dims[3],
        orphan_score: dims[4],
        composite: composite(dims, config.weights.as_array()),
        newest_modified_at: Some(file.modified_at),
        computed_at: now,
    }
}

/// Replace the stored row for this subject.
pub async fn upsert_score(pool: &SqlitePool, score: &EntropyScore) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entropy_scores (subject, subject_kind, file_count, naming_entropy, age_spread,
            depth_waste, duplicate_ratio, orphan_score, composite, newest_modified_at, computed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(subject) DO UPDATE SET
            subject_kind = excluded.subject_kind,
            file_count = excluded.file_count,
            naming_entropy = excluded.naming_entropy,
            age_spread = excluded.age_spread,
            depth_waste = excluded.depth_waste,
            duplicate_ratio = excluded.duplicate_ratio,
            orphan_score = excluded.orphan_score,
            composite = excluded.composite,
            newest_modified_at = excluded.newest_modified_at,
            computed_at = excluded.computed_at
        "#,
    )
    .bind(&score.subject)
    .bind(score.subject_kind.as_str())
    .bind(score.file_count as i64)
    .bind(score.naming_entropy)
    .bind(score.age_spread)
    .bind(score.depth_waste)
    .bind(score.duplicate_ratio)
    .bind(score.orphan_score)
    .bind(score.composite)
    .bind(score.newest_modified_at)
    .bind(score.computed_at)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_score(row: &SqliteRow) -> EntropyScore {
    let kind: String = row.get("subject_kind");
    let file_count: i64 = row.get("file_count");
    EntropyScore {
        subject: row.get("subject"),
        subject_kind: if kind == "file" {
            SubjectKind::File
        } else {
            SubjectKind::Directory
        },
        file_count: file_count as usize,
        naming_entropy: row.get("naming_entropy"),
        age_spread: row.get("age_spread"),
        depth_waste: row.get("depth_waste"),
        duplicate_ratio: row.get("duplicate_ratio"),
        orphan_score: row.get("orphan_score"),
        composite: row.get("composite"),
        newest_modified_at: row.get("newest_modified_at"),
        computed_at: row.get("computed_at"),
    }
}

pub async fn get_score(pool: &SqlitePool, subject: &str) -> Result<Option<EntropyScore>> {
    let row = sqlx::query("SELECT * FROM entropy_scores WHERE subject = ?")
        .bind(subject)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_score))
}

pub async fn directory_scores(pool: &SqlitePool) -> Result<Vec<EntropyScore>> {
    let rows = sqlx::query(
        "SELECT * FROM entropy_scores WHERE subject_kind = 'directory' ORDER BY subject",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_score).collect())
}

/// Score a directory from the index and store the result.
pub async fn score_directory(
    pool: &SqlitePool,
    config: &Config,
    graph: &GraphSnapshot,
    dir: &str,
) -> Result<EntropyScore> {
    let files = files::files_in_directory(pool, dir).await?;
    let now = chrono::Utc::now().timestamp();
    let score = score_files(dir, &files, graph, &config.entropy, now);
    upsert_score(pool, &score).await?;
    Ok(score)
}

fn print_score(score: &EntropyScore) {
    println!("entropy {} ({})", score.subject, score.subject_kind.as_str());
    println!("  files: {}", score.file_count);
    println!("  naming: {:.2}", score.naming_entropy);
    println!("  age spread: {:.2}", score.age_spread);
    println!("  depth waste: {:.2}", score.depth_waste);
    println!("  duplicate ratio: {:.2}", score.duplicate_ratio);
    println!("  orphan score: {:.2}", score.orphan_score);
    println!("  composite: {:.2}", score.composite);
}

/// CLI entry point for `dsense entropy <path>`.
pub async fn run_entropy(config: &Config, path: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let graph = GraphSnapshot::load(&pool).await?;
    let path = path.trim_end_matches('/');

    let score = match files::file_by_path(&pool, path).await? {
        Some(file) => {
            let score = score_file(&file, &graph, &config.entropy, chrono::Utc::now().timestamp());
            upsert_score(&pool, &score).await?;
            score
        }
        None => score_directory(&pool, config, &graph, path).await?,
    };
    print_score(&score);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::fixtures::{memory_pool, record, seed_file};

    fn named(names: &[&str]) -> Vec<FileRecord> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| record(i as i64 + 1, &format!("/pics/{}", n), 0, "d"))
            .collect()
    }

    #[test]
    fn test_naming_classification() {
        assert_eq!(classify_naming("photo_01.jpg"), NamingPattern::Snake);
        assert_eq!(classify_naming("img-03.jpg"), NamingPattern::Kebab);
        assert_eq!(classify_naming("Photo1.JPG"), NamingPattern::Pascal);
        assert_eq!(classify_naming("myPhoto.jpg"), NamingPattern::Camel);
        assert_eq!(classify_naming("README_FIRST.md"), NamingPattern::ScreamingSnake);
        assert_eq!(classify_naming("my photo.jpg"), NamingPattern::Spaces);
    }

    #[test]
    fn test_mixed_names_score_higher_than_consistent() {
        let mixed = named(&["Photo1.JPG", "photo_2.jpg", "img-03.jpg"]);
        let tidy = named(&["photo_01.jpg", "photo_02.jpg", "photo_03.jpg"]);
        assert!(naming_entropy(&mixed) > naming_entropy(&tidy));
        assert_eq!(naming_entropy(&tidy), 0.0);
        assert_eq!(naming_entropy(&mixed), 1.0);
    }

    #[test]
    fn test_empty_set_scores_zero() {
        let graph = GraphSnapshot::default();
        let config = EntropyConfig::default();
        let score = score_files("/does/not/exist", &[], &graph, &config, 0);
        let dims = [
            score.naming_entropy,
            score.age_spread,
            score.depth_waste,
            score.duplicate_ratio,
            score.orphan_score,
            score.composite,
        ];
        assert!(dims.iter().all(|d| *d == 0.0));
        assert_eq!(score.newest_modified_at, None);
    }

    #[test]
    fn test_dimensions_stay_bounded() {
        let mut files = named(&["A.txt", "b_c.txt", "d-e.txt", "f g.txt", "hI.txt"]);
        for (i, f) in files.iter_mut().enumerate() {
            f.modified_at = i as i64 * 400 * 86_400;
        }
        let graph = GraphSnapshot {
            duplicated: HashSet::from([1, 2]),
            connected: HashSet::from([1, 2, 3]),
        };
        let score = score_files("/pics", &files, &graph, &EntropyConfig::default(), 0);
        for d in [
            score.naming_entropy,
            score.age_spread,
            score.depth_waste,
            score.duplicate_ratio,
            score.orphan_score,
            score.composite,
        ] {
            assert!((0.0..=1.0).contains(&d), "{} out of range", d);
        }
        assert_eq!(score.age_spread, 1.0);
        assert!((score.duplicate_ratio - 0.4).abs() < 1e-9);
        assert!((score.orphan_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_composite_is_weighted_mean() {
        assert_eq!(composite([1.0; 5], [0.25, 0.20, 0.15, 0.25, 0.15]), 1.0);
        assert_eq!(composite([0.0; 5], [0.25, 0.20, 0.15, 0.25, 0.15]), 0.0);
        let weighted = composite([1.0, 0.0, 0.0, 0.0, 0.0], [2.0, 1.0, 1.0, 0.0, 0.0]);
        assert!((weighted - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_depth_waste_counts_single_child_chains() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("proj");
        let leaf = base.join("a").join("b").join("c");
        std::fs::create_dir_all(&leaf).unwrap();
        std::fs::write(leaf.join("file.txt"), "x").unwrap();
        std::fs::write(base.join("other.txt"), "x").unwrap();
        std::fs::write(tmp.path().join("sibling.txt"), "x").unwrap();

        let chained = depth_waste(&leaf, 20);
        let flat = depth_waste(&base, 20);
        assert!(chained > 0.0);
        assert_eq!(flat, 0.0);
        assert!(chained <= 1.0);
    }

    #[tokio::test]
    async fn test_score_directory_persists_one_row() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/nowhere/photo_01.jpg", 10, 0, "d").await;
        seed_file(&pool, 2, "/nowhere/photo_02.jpg", 10, 86_400, "d").await;
        let config = Config::minimal(Path::new("/tmp/x.sqlite"));
        let graph = GraphSnapshot::default();

        score_directory(&pool, &config, &graph, "/nowhere").await.unwrap();
        let score = score_directory(&pool, &config, &graph, "/nowhere").await.unwrap();
        assert_eq!(score.orphan_score, 1.0);
        assert_eq!(score.newest_modified_at, Some(86_400));

        let stored = directory_scores(&pool).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(get_score(&pool, "/nowhere").await.unwrap().unwrap(), score);
    }
}
