use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, Embedder, EmbeddingClient};
use crate::files::{self, TextFilter};
use crate::hasher;
use crate::models::FileRecord;

/// A file whose stored embedding is missing or stale.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub file_id: i64,
    pub text: String,
    pub fingerprint: String,
}

/// Outcome of one `embed_pending` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedReport {
    pub pending: usize,
    pub embedded: usize,
    /// Set when a batch failed or timed out; remaining batches were skipped.
    pub endpoint_unavailable: bool,
    pub cancelled: bool,
}

/// Build the embedding text for each file and keep the ones whose text
/// fingerprint differs from what is stored for this model.
pub fn find_pending(
    files: &[FileRecord],
    stored: &HashMap<i64, String>,
    config: &Config,
    text_filter: &TextFilter,
    now: i64,
) -> Vec<PendingFile> {
    let mut pending = Vec::new();
    for file in files {
        let head = if text_filter.is_text(file) {
            embedding::read_content_head(
                Path::new(&file.path),
                config.content.text_max_bytes,
                config.embedding.content_tokens,
            )
            .unwrap_or_else(|e| {
                tracing::debug!(path = %file.path, error = %e, "content head unavailable");
                None
            })
        } else {
            None
        };

        let text = embedding::build_embedding_text(file, head.as_deref(), now);
        let fingerprint = hasher::checksum_bytes(text.as_bytes());
        if stored.get(&file.id) == Some(&fingerprint) {
            continue;
        }
        pending.push(PendingFile {
            file_id: file.id,
            text,
            fingerprint,
        });
    }
    pending
}

async fn stored_fingerprints(pool: &SqlitePool, model: &str) -> Result<HashMap<i64, String>> {
    let rows = sqlx::query(
        "SELECT file_id, content_fingerprint FROM file_embeddings WHERE model_name = ?",
    )
    .bind(model)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("file_id"), row.get("content_fingerprint")))
        .collect())
}

/// Embed files that are missing or have stale embeddings.
///
/// Each batch gets `embedding.timeout_secs`. A failed or expired batch marks
/// the endpoint unavailable and ends the run; batches already written stay.
/// Cancellation is checked between batches.
pub async fn embed_pending(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    config: &Config,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> Result<EmbedReport> {
    let model = embedder.model_name().to_string();
    let files = files::list_files(pool).await?;
    let stored = stored_fingerprints(pool, &model).await?;
    let text_filter = TextFilter::new(&config.content.text_globs)?;
    let now = chrono::Utc::now().timestamp();

    let mut pending = find_pending(&files, &stored, config, &text_filter, now);
    if let Some(limit) = limit {
        pending.truncate(limit);
    }

    let mut report = EmbedReport {
        pending: pending.len(),
        ..Default::default()
    };
    let batch_size = config.embedding.batch_size.clamp(1, embedding::MAX_BATCH);
    let deadline = Duration::from_secs(config.embedding.timeout_secs);

    for batch in pending.chunks(batch_size) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let vectors = match tokio::time::timeout(deadline, embedder.embed_batch(&texts)).await {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding batch failed; skipping semantic signal");
                report.endpoint_unavailable = true;
                break;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = config.embedding.timeout_secs,
                    "embedding batch timed out; skipping semantic signal"
                );
                report.endpoint_unavailable = true;
                break;
            }
        };

        for (item, vector) in batch.iter().zip(vectors.iter()) {
            embedding::upsert_embedding(pool, item.file_id, &model, &item.fingerprint, vector)
                .await?;
            report.embedded += 1;
        }
    }

    Ok(report)
}

/// CLI entry point for `dsense embed pending`.
pub async fn run_embed_pending(config: &Config, limit: Option<usize>) -> Result<()> {
    let client = EmbeddingClient::new(&config.embedding)?;
    let pool = db::connect(config).await?;
    let cancel = CancellationToken::new();

    let report = embed_pending(&pool, &client, config, limit, &cancel).await?;
    let coverage = embedding::coverage(&pool, client.model_name()).await?;

    println!("embed pending");
    println!("  pending: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    if report.endpoint_unavailable {
        println!("  endpoint unavailable, run again later");
    }
    println!(
        "  coverage: {}/{} ({:.0}%)",
        coverage.embedded,
        coverage.total,
        coverage.ratio() * 100.0
    );

    pool.close().await;
    Ok(())
}

#[cfg(test)]
pub(crate) mod stub {
    //! Deterministic in-process embedder.

    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps each text to a small vector derived from its bytes. Texts that
    /// share a prefix up to the first `|` get identical vectors.
    pub struct StubEmbedder {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl StubEmbedder {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        pub fn vector_for(text: &str) -> Vec<f32> {
            let key = text.split('|').next().unwrap_or("").trim();
            let mut v = vec![0.0f32; 4];
            for (i, b) in key.bytes().enumerate() {
                v[i % 4] += b as f32;
            }
            v
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("stub endpoint down");
            }
            Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubEmbedder;
    use super::*;
    use crate::files::fixtures::{memory_pool, seed_file};
    use std::sync::atomic::Ordering;

    fn test_config() -> Config {
        let mut config = Config::minimal(Path::new("/tmp/dsense-test.sqlite"));
        config.embedding.batch_size = 2;
        config
    }

    #[tokio::test]
    async fn test_embed_pending_is_incremental() {
        let pool = memory_pool().await;
        for id in 1..=3 {
            seed_file(&pool, id, &format!("/nowhere/f{}.bin", id), 10, 0, "d").await;
        }
        let embedder = StubEmbedder::new();
        let cancel = CancellationToken::new();
        let config = test_config();

        let first = embed_pending(&pool, &embedder, &config, None, &cancel).await.unwrap();
        assert_eq!(first.pending, 3);
        assert_eq!(first.embedded, 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        let second = embed_pending(&pool, &embedder, &config, None, &cancel).await.unwrap();
        assert_eq!(second.pending, 0);

        let cov = embedding::coverage(&pool, "stub").await.unwrap();
        assert_eq!((cov.embedded, cov.total), (3, 3));
    }

    #[tokio::test]
    async fn test_failing_endpoint_degrades() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/nowhere/a.bin", 10, 0, "d").await;
        let embedder = StubEmbedder::failing();

        let cancel = CancellationToken::new();
        let report = embed_pending(&pool, &embedder, &test_config(), None, &cancel)
            .await
            .unwrap();
        assert!(report.endpoint_unavailable);
        assert_eq!(report.embedded, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let pool = memory_pool().await;
        seed_file(&pool, 1, "/nowhere/a.bin", 10, 0, "d").await;
        let embedder = StubEmbedder::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = embed_pending(&pool, &embedder, &test_config(), None, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
