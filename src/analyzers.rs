//! Edge analyzers.
//!
//! Each [`AnalyzerKind`] turns the current file set, plus the auxiliary data
//! in [`AnalyzerInput`], into candidate edges. Analyzers never touch the
//! database; the graph pass gathers their input, runs them one at a time, and
//! upserts what they return.
//!
//! Symmetric kinds (sibling, duplicate, similar, co-modified) are emitted
//! with `source_id < target_id` so recomputation hits the same unique key.
//! References are directed from the scanning file to the referenced one.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::Config;
use crate::embedding::cosine_similarity;
use crate::files::TextFilter;
use crate::models::{Edge, EdgeKind, FileRecord};

const SAME_STEM_STRENGTH: f64 = 0.8;
const TEST_PAIR_STRENGTH: f64 = 0.7;
const EXAMPLE_PAIR_STRENGTH: f64 = 0.7;
const README_STRENGTH: f64 = 0.2;

/// Commits touching more files than this are bulk changes and say little
/// about which files belong together.
const MAX_FILES_PER_COMMIT: usize = 100;

/// Everything an analyzer may look at.
pub struct AnalyzerInput<'a> {
    pub files: &'a [FileRecord],
    /// File id to content fingerprint.
    pub content_hashes: &'a HashMap<i64, String>,
    /// File id to embedding vector, for the configured model.
    pub embeddings: &'a HashMap<i64, Vec<f32>>,
    /// Files touched together, one entry per commit, already mapped to ids.
    pub commits: &'a [Vec<i64>],
    pub text_filter: &'a TextFilter,
    pub config: &'a Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyzerKind {
    Sibling,
    Reference,
    Duplicate,
    CoModified,
    Similarity,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 5] = [
        AnalyzerKind::Sibling,
        AnalyzerKind::Reference,
        AnalyzerKind::Duplicate,
        AnalyzerKind::CoModified,
        AnalyzerKind::Similarity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnalyzerKind::Sibling => "sibling",
            AnalyzerKind::Reference => "reference",
            AnalyzerKind::Duplicate => "duplicate",
            AnalyzerKind::CoModified => "co_modified",
            AnalyzerKind::Similarity => "similarity",
        }
    }

    /// Edge kinds this analyzer is responsible for. After a successful run
    /// its output is the complete set of live edges of these kinds.
    pub fn emits(&self) -> &'static [EdgeKind] {
        match self {
            AnalyzerKind::Sibling => &[EdgeKind::Sibling],
            AnalyzerKind::Reference => &[EdgeKind::References],
            AnalyzerKind::Duplicate => &[EdgeKind::Duplicate],
            AnalyzerKind::CoModified => &[EdgeKind::CoModified],
            AnalyzerKind::Similarity => &[EdgeKind::Similar, EdgeKind::Duplicate],
        }
    }

    /// Why this analyzer has nothing to work with, if that is the case.
    pub fn skip_reason(&self, input: &AnalyzerInput<'_>) -> Option<&'static str> {
        match self {
            AnalyzerKind::Similarity if input.embeddings.is_empty() => Some("no embeddings"),
            AnalyzerKind::CoModified if input.commits.is_empty() => Some("no git history"),
            AnalyzerKind::Duplicate if input.content_hashes.is_empty() => {
                Some("no content fingerprints")
            }
            _ => None,
        }
    }

    /// Produce candidate edges. Edges that would cross drives are dropped.
    pub fn run(&self, input: &AnalyzerInput<'_>) -> Result<Vec<Edge>> {
        let edges = match self {
            AnalyzerKind::Sibling => sibling_edges(input),
            AnalyzerKind::Reference => reference_edges(input)?,
            AnalyzerKind::Duplicate => duplicate_edges(input),
            AnalyzerKind::CoModified => co_modified_edges(input),
            AnalyzerKind::Similarity => similarity_edges(input),
        };
        Ok(retain_same_drive(edges, input.files))
    }
}

fn ordered(a: i64, b: i64) -> (i64, i64) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Drop edges whose endpoints live on different drives or are unknown.
pub fn retain_same_drive(edges: Vec<Edge>, files: &[FileRecord]) -> Vec<Edge> {
    let drives: HashMap<i64, &str> = files.iter().map(|f| (f.id, f.drive_id.as_str())).collect();
    edges
        .into_iter()
        .filter(|e| match (drives.get(&e.source_id), drives.get(&e.target_id)) {
            (Some(a), Some(b)) => a == b && e.source_id != e.target_id,
            _ => false,
        })
        .collect()
}

fn group_by_directory(files: &[FileRecord]) -> BTreeMap<&str, Vec<&FileRecord>> {
    let mut dirs: BTreeMap<&str, Vec<&FileRecord>> = BTreeMap::new();
    for file in files {
        dirs.entry(file.parent_dir.as_str()).or_default().push(file);
    }
    dirs
}

// ============ Sibling ============

const TEST_MARKERS: [&str; 6] = ["_test", "-test", ".test", "_spec", "-spec", ".spec"];
const EXAMPLE_MARKERS: [&str; 6] = [
    ".example", "_example", "-example", ".sample", "_sample", "-sample",
];

fn is_test_counterpart(stem: &str, candidate: &str) -> bool {
    TEST_MARKERS
        .iter()
        .any(|m| candidate == format!("{}{}", stem, m))
        || candidate == format!("test_{}", stem)
}

/// `config.example.toml` → `config.toml`, `.env.sample` → `.env`.
fn strip_example_marker(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    EXAMPLE_MARKERS.iter().find_map(|m| {
        lower
            .find(m)
            .map(|pos| format!("{}{}", &lower[..pos], &lower[pos + m.len()..]))
    })
}

fn is_readme(file: &FileRecord) -> bool {
    file.stem().eq_ignore_ascii_case("readme")
}

/// Name-pattern pairs within one directory.
fn sibling_edges(input: &AnalyzerInput<'_>) -> Vec<Edge> {
    let max_files = input.config.graph.sibling_max_dir_files;
    let mut pairs: HashMap<(i64, i64), f64> = HashMap::new();
    let mut add = |a: i64, b: i64, strength: f64| {
        let key = ordered(a, b);
        let slot = pairs.entry(key).or_insert(0.0);
        *slot = slot.max(strength);
    };

    for files in group_by_directory(input.files).values() {
        if files.len() < 2 || files.len() > max_files {
            continue;
        }
        for (i, a) in files.iter().enumerate() {
            for b in &files[i + 1..] {
                let (sa, sb) = (a.stem().to_lowercase(), b.stem().to_lowercase());
                if sa == sb && a.extension != b.extension {
                    add(a.id, b.id, SAME_STEM_STRENGTH);
                }
                if is_test_counterpart(&sa, &sb) || is_test_counterpart(&sb, &sa) {
                    add(a.id, b.id, TEST_PAIR_STRENGTH);
                }
                let (na, nb) = (a.name.to_lowercase(), b.name.to_lowercase());
                if strip_example_marker(&na).as_deref() == Some(nb.as_str())
                    || strip_example_marker(&nb).as_deref() == Some(na.as_str())
                {
                    add(a.id, b.id, EXAMPLE_PAIR_STRENGTH);
                }
                if is_readme(a) != is_readme(b) {
                    add(a.id, b.id, README_STRENGTH);
                }
            }
        }
    }

    let mut edges: Vec<Edge> = pairs
        .into_iter()
        .map(|((a, b), s)| Edge::new(a, b, EdgeKind::Sibling, s))
        .collect();
    edges.sort_by_key(|e| (e.source_id, e.target_id));
    edges
}

// ============ Reference ============

fn read_text(path: &Path, max_bytes: u64) -> Result<Option<String>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > max_bytes {
        return Ok(None);
    }
    let mut buf = Vec::new();
    std::fs::File::open(path)?
        .take(max_bytes)
        .read_to_end(&mut buf)?;
    Ok(Some(String::from_utf8_lossy(&buf).to_lowercase()))
}

fn tokens(text: &str) -> HashSet<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Text files that mention another file's stem.
///
/// Unreadable or oversized files are skipped individually.
fn reference_edges(input: &AnalyzerInput<'_>) -> Result<Vec<Edge>> {
    let graph = &input.config.graph;
    let max_bytes = input.config.content.text_max_bytes;

    let mut by_stem: HashMap<(String, &str), Vec<i64>> = HashMap::new();
    for file in input.files {
        let stem = file.stem().to_lowercase();
        if stem.chars().count() >= graph.reference_min_stem_len {
            by_stem
                .entry((stem, file.drive_id.as_str()))
                .or_default()
                .push(file.id);
        }
    }
    if by_stem.is_empty() {
        return Ok(Vec::new());
    }

    let mut edges = Vec::new();
    for file in input.files.iter().filter(|f| input.text_filter.is_text(f)) {
        let text = match read_text(Path::new(&file.path), max_bytes) {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(path = %file.path, "skipping oversized file for references");
                continue;
            }
            Err(e) => {
                tracing::debug!(path = %file.path, error = %e, "unreadable file skipped");
                continue;
            }
        };

        let mut targets: Vec<i64> = tokens(&text)
            .into_iter()
            .filter_map(|t| by_stem.get(&(t.to_string(), file.drive_id.as_str())))
            .flatten()
            .copied()
            .filter(|id| *id != file.id)
            .collect();
        targets.sort_unstable();
        targets.dedup();

        edges.extend(
            targets
                .into_iter()
                .map(|t| Edge::new(file.id, t, EdgeKind::References, graph.reference_strength)),
        );
    }
    Ok(edges)
}

// ============ Duplicate ============

/// Groups of file ids sharing a content fingerprint, each sorted.
/// Singletons are left out.
pub fn duplicate_groups(hashes: &HashMap<i64, String>) -> Vec<Vec<i64>> {
    let mut groups: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for (id, fp) in hashes {
        groups.entry(fp.as_str()).or_default().push(*id);
    }
    groups
        .into_values()
        .filter(|g| g.len() > 1)
        .map(|mut g| {
            g.sort_unstable();
            g
        })
        .collect()
}

fn duplicate_edges(input: &AnalyzerInput<'_>) -> Vec<Edge> {
    let known: HashSet<i64> = input.files.iter().map(|f| f.id).collect();
    let filtered: HashMap<i64, String> = input
        .content_hashes
        .iter()
        .filter(|(id, _)| known.contains(id))
        .map(|(id, fp)| (*id, fp.clone()))
        .collect();

    let mut edges = Vec::new();
    for group in duplicate_groups(&filtered) {
        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                edges.push(Edge::new(*a, *b, EdgeKind::Duplicate, 1.0));
            }
        }
    }
    edges
}

// ============ Co-modified ============

fn co_modified_edges(input: &AnalyzerInput<'_>) -> Vec<Edge> {
    let mut counts: HashMap<(i64, i64), u32> = HashMap::new();
    for commit in input.commits {
        let mut ids = commit.clone();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() < 2 || ids.len() > MAX_FILES_PER_COMMIT {
            continue;
        }
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                *counts.entry((*a, *b)).or_insert(0) += 1;
            }
        }
    }

    let Some(max) = counts.values().copied().max() else {
        return Vec::new();
    };
    let min_strength = input.config.graph.comod_min_strength;

    let mut edges: Vec<Edge> = counts
        .into_iter()
        .filter_map(|((a, b), n)| {
            let strength = n as f64 / max as f64;
            (strength >= min_strength).then(|| {
                Edge::new(a, b, EdgeKind::CoModified, strength)
                    .with_metadata(serde_json::json!({ "commits": n }))
            })
        })
        .collect();
    edges.sort_by_key(|e| (e.source_id, e.target_id));
    edges
}

/// Parse `git log --name-only --pretty=format:@@commit` output into the
/// repository-relative paths touched by each commit.
pub fn parse_git_log(output: &str) -> Vec<Vec<String>> {
    let mut commits = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line == "@@commit" {
            if !current.is_empty() {
                commits.push(std::mem::take(&mut current));
            }
        } else if !line.is_empty() {
            current.push(line.to_string());
        }
    }
    if !current.is_empty() {
        commits.push(current);
    }
    commits
}

/// Absolute paths touched per commit within the last `window_days`.
///
/// Fails when `repo` is not a git work tree or git is not installed; the
/// caller treats that as "no history".
pub fn git_history(repo: &Path, window_days: u32) -> Result<Vec<Vec<PathBuf>>> {
    let output = Command::new("git")
        .args([
            "log",
            &format!("--since={}.days", window_days),
            "--name-only",
            "--pretty=format:@@commit",
        ])
        .current_dir(repo)
        .output()
        .with_context(|| "Failed to execute 'git log'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git log failed in {}: {}", repo.display(), stderr.trim());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_git_log(&stdout)
        .into_iter()
        .map(|paths| paths.into_iter().map(|p| repo.join(p)).collect())
        .collect())
}

// ============ Similarity ============

fn similarity_edge(a: i64, b: i64, sim: f64, threshold: f64, dup: f64) -> Option<Edge> {
    let (a, b) = ordered(a, b);
    if sim >= dup {
        Some(Edge::new(a, b, EdgeKind::Duplicate, sim))
    } else if sim >= threshold {
        Some(Edge::new(a, b, EdgeKind::Similar, sim))
    } else {
        None
    }
}

/// Embedding similarity within a directory, and optionally across
/// directories with a stricter threshold.
fn similarity_edges(input: &AnalyzerInput<'_>) -> Vec<Edge> {
    let graph = &input.config.graph;
    let embedded: Vec<&FileRecord> = input
        .files
        .iter()
        .filter(|f| input.embeddings.contains_key(&f.id))
        .collect();

    let mut edges = Vec::new();
    let mut compare = |a: &FileRecord, b: &FileRecord| {
        let threshold = if a.parent_dir == b.parent_dir {
            graph.similarity_threshold
        } else {
            graph.cross_directory_threshold
        };
        let sim = cosine_similarity(&input.embeddings[&a.id], &input.embeddings[&b.id]) as f64;
        edges.extend(similarity_edge(
            a.id,
            b.id,
            sim,
            threshold,
            graph.duplicate_similarity,
        ));
    };

    if graph.cross_directory_similarity {
        for (i, a) in embedded.iter().enumerate() {
            for b in &embedded[i + 1..] {
                compare(*a, *b);
            }
        }
    } else {
        let mut by_dir: BTreeMap<&str, Vec<&FileRecord>> = BTreeMap::new();
        for file in embedded {
            by_dir.entry(file.parent_dir.as_str()).or_default().push(file);
        }
        for files in by_dir.values() {
            for (i, a) in files.iter().enumerate() {
                for b in &files[i + 1..] {
                    compare(*a, *b);
                }
            }
        }
    }
    edges
}
