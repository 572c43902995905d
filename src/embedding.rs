//! Embedding client and vector utilities.
//!
//! - **[`Embedder`]**: the seam the ranker and the batch embedder depend on.
//! - **[`EmbeddingClient`]**: calls an Ollama-compatible `/api/embed` endpoint.
//! - [`build_embedding_text`]: the composite text submitted for each file.
//! - [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`]: vector helpers.
//!
//! # Batch contract
//!
//! A call embeds at most [`MAX_BATCH`] strings and returns one vector per
//! input in input order. Any transport error, non-success status, count
//! mismatch, or uneven dimensionality fails the whole batch; callers never
//! see partial results.
//!
//! The client sets no request deadline of its own. Callers wrap each call
//! in `tokio::time::timeout` and treat expiry as "endpoint unavailable".

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::io::Read;
use std::path::{Component, Path};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::models::{FileEmbedding, FileRecord};

/// Largest batch the endpoint accepts in one request.
pub const MAX_BATCH: usize = 32;

/// Rough characters-per-token ratio used to size the content head.
const CHARS_PER_TOKEN: usize = 4;

/// Anything that can turn strings into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored next to every vector this embedder produces.
    fn model_name(&self) -> &str;

    /// Embed up to [`MAX_BATCH`] texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Single-string convenience form.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

/// HTTP client for a local Ollama-style embedding endpoint.
pub struct EmbeddingClient {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if !config.is_enabled() {
            bail!("Embedding provider is disabled. Set [embedding] provider in config.");
        }
        Ok(Self::with_endpoint(config.endpoint(), config.model_name()))
    }

    pub fn with_endpoint(url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    /// Cheap reachability check against `/api/tags`.
    pub async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > MAX_BATCH {
            bail!(
                "Embedding batch of {} exceeds the limit of {}",
                texts.len(),
                MAX_BATCH
            );
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Embedding endpoint unreachable (is Ollama running at {}?)",
                    self.url
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Embedding endpoint error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Embedding endpoint returned invalid JSON")?;
        let vectors = parse_embed_response(&json)?;
        validate_batch(texts.len(), &vectors)?;
        Ok(vectors)
    }
}

/// Decode `{"embeddings": [[f32, ...], ...]}`.
pub fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let values = embedding.as_array().ok_or_else(|| {
            anyhow::anyhow!("Invalid embedding response: embedding is not an array")
        })?;
        let vec = values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: non-numeric value"))
            })
            .collect::<Result<Vec<f32>>>()?;
        result.push(vec);
    }
    Ok(result)
}

/// One vector per input, all of the same non-zero length.
pub fn validate_batch(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "Embedding response has {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    if let Some(first) = vectors.first() {
        let dims = first.len();
        if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
            bail!("Embedding response has inconsistent dimensionality");
        }
    }
    Ok(())
}

fn size_bucket(size_bytes: i64) -> &'static str {
    match size_bytes {
        s if s < 10 * 1024 => "tiny",
        s if s < 1024 * 1024 => "small",
        s if s < 100 * 1024 * 1024 => "medium",
        _ => "large",
    }
}

fn recency_bucket(modified_at: i64, now: i64) -> &'static str {
    let age_days = (now - modified_at).max(0) / 86_400;
    match age_days {
        d if d < 7 => "this week",
        d if d < 31 => "this month",
        d if d < 365 => "this year",
        _ => "older",
    }
}

fn last_components(path: &str, n: usize) -> String {
    let parts: Vec<String> = Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    let start = parts.len().saturating_sub(n);
    parts[start..].join("/")
}

/// Compose the text submitted to the embedding endpoint for one file.
///
/// ```text
/// name | ext | last/three/components | size bucket | recency bucket [| content head]
/// ```
pub fn build_embedding_text(file: &FileRecord, content_head: Option<&str>, now: i64) -> String {
    let mut parts = vec![
        file.name.clone(),
        file.extension.clone().unwrap_or_else(|| "none".to_string()),
        last_components(&file.path, 3),
        size_bucket(file.size_bytes).to_string(),
        recency_bucket(file.modified_at, now).to_string(),
    ];
    if let Some(head) = content_head.map(str::trim).filter(|h| !h.is_empty()) {
        parts.push(head.to_string());
    }
    parts.join(" | ")
}

/// Leading `tokens` worth of a text file, or `None` above `max_bytes`.
pub fn read_content_head(path: &Path, max_bytes: u64, tokens: usize) -> Result<Option<String>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > max_bytes || tokens == 0 {
        return Ok(None);
    }
    let limit = (tokens * CHARS_PER_TOKEN) as u64;
    let mut buf = Vec::new();
    std::fs::File::open(path)?.take(limit).read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    let head: String = text.chars().take(tokens * CHARS_PER_TOKEN).collect();
    Ok(Some(head))
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or when
/// either side has zero magnitude.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

// ============ Storage ============

/// Every stored embedding produced by `model`.
pub async fn load_embeddings(pool: &SqlitePool, model: &str) -> Result<Vec<FileEmbedding>> {
    let rows = sqlx::query(
        "SELECT file_id, embedding, model_name, content_fingerprint, embedded_at
         FROM file_embeddings WHERE model_name = ? ORDER BY file_id",
    )
    .bind(model)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            FileEmbedding {
                file_id: row.get("file_id"),
                vector: blob_to_vec(&blob),
                model_name: row.get("model_name"),
                content_fingerprint: row.get("content_fingerprint"),
                embedded_at: row.get("embedded_at"),
            }
        })
        .collect())
}

pub async fn upsert_embedding(
    pool: &SqlitePool,
    file_id: i64,
    model: &str,
    content_fingerprint: &str,
    vector: &[f32],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO file_embeddings (file_id, embedding, model_name, dims, embedded_at, content_fingerprint)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_id) DO UPDATE SET
            embedding = excluded.embedding,
            model_name = excluded.model_name,
            dims = excluded.dims,
            embedded_at = excluded.embedded_at,
            content_fingerprint = excluded.content_fingerprint
        "#,
    )
    .bind(file_id)
    .bind(vec_to_blob(vector))
    .bind(model)
    .bind(vector.len() as i64)
    .bind(now)
    .bind(content_fingerprint)
    .execute(pool)
    .await?;
    Ok(())
}

/// Share of indexed files that have an embedding from `model`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EmbeddingCoverage {
    pub embedded: i64,
    pub total: i64,
}

impl EmbeddingCoverage {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.embedded as f64 / self.total as f64
        }
    }
}

pub async fn coverage(pool: &SqlitePool, model: &str) -> Result<EmbeddingCoverage> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
        .fetch_one(pool)
        .await?;
    let embedded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM file_embeddings e JOIN files f ON f.id = e.file_id
         WHERE e.model_name = ?",
    )
    .bind(model)
    .fetch_one(pool)
    .await?;
    Ok(EmbeddingCoverage { embedded, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::fixtures::record;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_self_is_one() {
        let v = vec![0.3, -2.0, 7.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_symmetric() {
        let pairs = [
            (vec![1.0, 2.0, 3.0], vec![-4.0, 0.5, 2.0]),
            (vec![0.1, 0.1], vec![9.0, -3.0]),
            (vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]),
        ];
        for (a, b) in pairs {
            assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
        }
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        let json = serde_json::json!({"embeddings": [[0.1, "x"]]});
        assert!(parse_embed_response(&json).is_err());
        let json = serde_json::json!({"data": []});
        assert!(parse_embed_response(&json).is_err());
    }

    #[test]
    fn test_validate_batch() {
        assert!(validate_batch(2, &[vec![1.0, 2.0], vec![3.0, 4.0]]).is_ok());
        assert!(validate_batch(3, &[vec![1.0, 2.0], vec![3.0, 4.0]]).is_err());
        assert!(validate_batch(2, &[vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn test_embedding_text_composition() {
        let now = 1_700_000_000;
        let mut file = record(1, "/home/me/projects/notes/todo.md", now - 3 * 86_400, "home");
        file.size_bytes = 2048;

        let text = build_embedding_text(&file, Some("  buy milk  "), now);
        assert_eq!(
            text,
            "todo.md | md | projects/notes/todo.md | tiny | this week | buy milk"
        );

        file.modified_at = now - 400 * 86_400;
        file.size_bytes = 5 * 1024 * 1024;
        let text = build_embedding_text(&file, None, now);
        assert!(text.ends_with("medium | older"));
    }

    #[test]
    fn test_content_head_respects_limits() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("long.txt");
        std::fs::write(&path, "a".repeat(1000)).unwrap();

        let head = read_content_head(&path, 10_000, 10).unwrap().unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(read_content_head(&path, 500, 10).unwrap(), None);
    }
}
