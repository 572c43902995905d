//! Hybrid file ranking.
//!
//! Three independently ranked candidate lists are fused with reciprocal-rank
//! fusion:
//!
//! - **lexical**: word-prefix match of the query against file names
//! - **fuzzy**: Jaro-Winkler similarity between the query and file names
//! - **semantic**: cosine similarity between the query embedding and stored
//!   file embeddings
//!
//! ```text
//! fused(f) = Σ_lists  w_list / (k + rank_list(f))      rank is 1-based
//! ```
//!
//! With intent weighting off every `w` is 1. The semantic list is skipped
//! when no embeddings exist or the endpoint fails; search then serves the
//! lexical and fuzzy lists alone.

use anyhow::Result;
use lru::LruCache;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, Embedder, EmbeddingClient};
use crate::files;
use crate::models::FileRecord;

/// Minimum Jaro-Winkler score for a name to enter the fuzzy list.
const FUZZY_MIN_SCORE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// Has an extension, a path separator, or identifier-style casing.
    Filename,
    /// Three or more plain words.
    NaturalLanguage,
    Mixed,
}

impl QueryIntent {
    /// `(lexical, fuzzy, semantic)` list weights.
    pub fn weights(&self) -> (f64, f64, f64) {
        match self {
            QueryIntent::Filename => (2.0, 2.0, 0.5),
            QueryIntent::NaturalLanguage => (0.5, 0.5, 2.0),
            QueryIntent::Mixed => (1.0, 1.0, 1.0),
        }
    }
}

pub fn classify_intent(query: &str) -> QueryIntent {
    let query = query.trim();
    let single_token = !query.contains(char::is_whitespace);
    let has_extension = query
        .rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && !ext.is_empty() && ext.len() <= 5)
        .unwrap_or(false);
    let has_path_sep = query.contains('/') || query.contains('\\');
    let mixed_case = query.chars().any(|c| c.is_uppercase())
        && query.chars().any(|c| c.is_lowercase())
        && single_token;
    let has_separator = (query.contains('_') || query.contains('-')) && single_token;

    if has_extension || has_path_sep || mixed_case || has_separator {
        QueryIntent::Filename
    } else if query.split_whitespace().count() >= 3 {
        QueryIntent::NaturalLanguage
    } else {
        QueryIntent::Mixed
    }
}

/// Fuse ranked lists. Each list is ordered best-first and carries a weight.
///
/// Ranks are 1-based. The result is sorted by fused score descending with
/// ties broken by ascending item, so equal inputs give equal output order.
pub fn reciprocal_rank_fusion<T>(lists: &[(&[T], f64)], k: f64) -> Vec<(T, f64)>
where
    T: Copy + Eq + Hash + Ord,
{
    let mut scores: HashMap<T, f64> = HashMap::new();
    for (list, weight) in lists {
        for (rank, item) in list.iter().enumerate() {
            *scores.entry(*item).or_insert(0.0) += weight / (k + (rank + 1) as f64);
        }
    }

    let mut fused: Vec<(T, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}

/// Bounded LRU map from normalized query text to its embedding.
pub struct QueryEmbeddingCache {
    inner: Mutex<LruCache<String, Vec<f32>>>,
}

impl QueryEmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Case and whitespace differences map to the same entry.
    fn key(query: &str) -> String {
        query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        let mut cache = self.inner.lock().ok()?;
        cache.get(&Self::key(query)).cloned()
    }

    pub fn put(&self, query: &str, vector: Vec<f32>) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(Self::key(query), vector);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One fused result with the rank it held in each signal, if any.
#[derive(Debug, Clone)]
pub struct RankedFile {
    pub file: FileRecord,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub fuzzy_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

// ============ Candidate lists ============

fn normalize_name(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '.') { ' ' } else { c })
        .collect()
}

/// Position class of a lexical hit, lower is better.
fn lexical_match_class(query: &str, file: &FileRecord) -> Option<u8> {
    let q = normalize_name(query.trim());
    if q.is_empty() {
        return None;
    }
    let stem = normalize_name(&file.stem());
    let name = normalize_name(&file.name);
    if stem == q {
        Some(0)
    } else if name.starts_with(&q) {
        Some(1)
    } else if name.contains(&format!(" {}", q)) {
        Some(2)
    } else {
        None
    }
}

/// Files whose name, or a word inside it, starts with the query.
pub async fn lexical_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: usize,
) -> Result<Vec<i64>> {
    let first_word = normalize_name(query)
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    if first_word.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(&format!(
        "SELECT {} FROM files WHERE instr(lower(name), ?) > 0",
        files::FILE_COLUMNS
    ))
    .bind(&first_word)
    .fetch_all(pool)
    .await?;

    let mut hits: Vec<(u8, usize, i64)> = rows
        .iter()
        .map(files::row_to_file)
        .filter_map(|file| {
            lexical_match_class(query, &file).map(|class| (class, file.name.len(), file.id))
        })
        .collect();

    hits.sort();
    hits.truncate(candidate_k);
    Ok(hits.into_iter().map(|(_, _, id)| id).collect())
}

/// Best Jaro-Winkler score of the query against a file's stem or full name.
pub fn fuzzy_score(query: &str, name: &str) -> f64 {
    let q = query.trim().to_lowercase();
    let name = name.to_lowercase();
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(&name);
    strsim::jaro_winkler(&q, &name).max(strsim::jaro_winkler(&q, stem))
}

pub async fn fuzzy_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: usize,
) -> Result<Vec<i64>> {
    let rows = sqlx::query("SELECT id, name FROM files")
        .fetch_all(pool)
        .await?;

    let mut scored: Vec<(i64, f64)> = rows
        .iter()
        .filter_map(|row| {
            let name: String = row.get("name");
            let score = fuzzy_score(query, &name);
            (score >= FUZZY_MIN_SCORE).then(|| (row.get("id"), score))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored.truncate(candidate_k);
    Ok(scored.into_iter().map(|(id, _)| id).collect())
}

/// Embed the query (cached) and rank stored embeddings by cosine similarity.
///
/// Returns an empty list, without calling the endpoint, when nothing is
/// embedded yet. Endpoint errors and timeouts also yield an empty list.
pub async fn semantic_candidates(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    cache: &QueryEmbeddingCache,
    query: &str,
    candidate_k: usize,
    timeout: Duration,
) -> Result<Vec<i64>> {
    let stored = embedding::load_embeddings(pool, embedder.model_name()).await?;
    if stored.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = match cache.get(query) {
        Some(v) => v,
        None => match tokio::time::timeout(timeout, embedder.embed_one(query)).await {
            Ok(Ok(v)) => {
                cache.put(query, v.clone());
                v
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query embedding failed; using lexical and fuzzy only");
                return Ok(Vec::new());
            }
            Err(_) => {
                tracing::warn!("query embedding timed out; using lexical and fuzzy only");
                return Ok(Vec::new());
            }
        },
    };

    let mut scored: Vec<(i64, f32)> = stored
        .iter()
        .map(|e| (e.file_id, embedding::cosine_similarity(&query_vec, &e.vector)))
        .filter(|(_, sim)| *sim > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored.truncate(candidate_k);
    Ok(scored.into_iter().map(|(id, _)| id).collect())
}

// ============ Fused search ============

fn rank_of(list: &[i64]) -> HashMap<i64, usize> {
    list.iter().enumerate().map(|(i, id)| (*id, i + 1)).collect()
}

/// Rank files for `query`, best first, at most `limit` results.
pub async fn search_files(
    pool: &SqlitePool,
    config: &Config,
    embedder: Option<&dyn Embedder>,
    cache: &QueryEmbeddingCache,
    query: &str,
    limit: usize,
) -> Result<Vec<RankedFile>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let retrieval = &config.retrieval;
    let lexical = lexical_candidates(pool, query, retrieval.candidate_k).await?;
    let fuzzy = fuzzy_candidates(pool, query, retrieval.candidate_k).await?;
    let semantic = match embedder {
        Some(embedder) => {
            semantic_candidates(
                pool,
                embedder,
                cache,
                query,
                retrieval.candidate_k,
                Duration::from_secs(config.embedding.timeout_secs),
            )
            .await?
        }
        None => Vec::new(),
    };

    let (w_lex, w_fuzzy, w_sem) = if retrieval.intent_weighting {
        classify_intent(query).weights()
    } else {
        (1.0, 1.0, 1.0)
    };

    let fused = reciprocal_rank_fusion(
        &[
            (lexical.as_slice(), w_lex),
            (fuzzy.as_slice(), w_fuzzy),
            (semantic.as_slice(), w_sem),
        ],
        retrieval.rrf_k,
    );

    let lex_ranks = rank_of(&lexical);
    let fuzzy_ranks = rank_of(&fuzzy);
    let sem_ranks = rank_of(&semantic);

    let mut results = Vec::new();
    for (id, score) in fused.into_iter().take(limit) {
        if let Some(file) = files::file_by_id(pool, id).await? {
            results.push(RankedFile {
                file,
                score,
                lexical_rank: lex_ranks.get(&id).copied(),
                fuzzy_rank: fuzzy_ranks.get(&id).copied(),
                semantic_rank: sem_ranks.get(&id).copied(),
            });
        }
    }
    Ok(results)
}

fn fmt_rank(rank: Option<usize>) -> String {
    rank.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
}

/// CLI entry point for `dsense search`.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let client = if config.embedding.is_enabled() {
        Some(EmbeddingClient::new(&config.embedding)?)
    } else {
        None
    };
    let cache = QueryEmbeddingCache::new(config.retrieval.query_cache_size);
    let limit = limit.unwrap_or(config.retrieval.final_limit);

    let results = search_files(
        &pool,
        config,
        client.as_ref().map(|c| c as &dyn Embedder),
        &cache,
        query,
        limit,
    )
    .await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let date = result.file.modified().format("%Y-%m-%d");
        println!("{}. [{:.4}] {}", i + 1, result.score, result.file.path);
        println!(
            "    modified: {}  size: {}  ranks: lexical {} / fuzzy {} / semantic {}",
            date,
            result.file.size_bytes,
            fmt_rank(result.lexical_rank),
            fmt_rank(result.fuzzy_rank),
            fmt_rank(result.semantic_rank),
        );
    }

    pool.close().await;
    Ok(())
}
