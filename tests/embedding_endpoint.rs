//! Embedding client and semantic search against a throwaway HTTP server
//! that speaks the Ollama `/api/embed` protocol.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dirsense::config::Config;
use dirsense::embed_cmd::embed_pending;
use dirsense::embedding::{Embedder, EmbeddingClient};
use dirsense::search::{search_files, QueryEmbeddingCache};
use dirsense::{db, migrate};

fn fake_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let invoice = if lower.contains("invoice") { 5.0 } else { 0.0 };
    let photo = if lower.contains("photo") { 5.0 } else { 0.0 };
    vec![1.0 + invoice, photo, 0.5]
}

async fn embed_handler(Json(body): Json<Value>) -> Json<Value> {
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    let embeddings: Vec<Vec<f32>> = inputs
        .iter()
        .map(|v| fake_vector(v.as_str().unwrap_or_default()))
        .collect();
    Json(json!({ "model": body["model"], "embeddings": embeddings }))
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn fake_ollama() -> SocketAddr {
    let app = Router::new()
        .route("/api/embed", post(embed_handler))
        .route("/api/tags", get(|| async { Json(json!({ "models": [] })) }));
    spawn(app).await
}

#[tokio::test]
async fn test_batch_preserves_order() {
    let addr = fake_ollama().await;
    let client = EmbeddingClient::with_endpoint(&format!("http://{}", addr), "fake-model");

    assert!(client.is_available().await);
    let vectors = client
        .embed_batch(&["a photo".to_string(), "an invoice".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], fake_vector("a photo"));
    assert_eq!(vectors[1], fake_vector("an invoice"));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_not_available() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = EmbeddingClient::with_endpoint(&format!("http://{}", addr), "fake-model");
    assert!(!client.is_available().await);
    assert!(client.embed_one("anything").await.is_err());
}

#[tokio::test]
async fn test_server_error_and_short_response_are_rejected() {
    let app = Router::new()
        .route(
            "/api/embed",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model not loaded") }),
        );
    let failing = spawn(app).await;
    let client = EmbeddingClient::with_endpoint(&format!("http://{}", failing), "m");
    let err = client.embed_one("x").await.unwrap_err().to_string();
    assert!(err.contains("500"), "got: {}", err);

    let app = Router::new().route(
        "/api/embed",
        post(|| async { Json(json!({ "embeddings": [[0.1, 0.2]] })) }),
    );
    let short = spawn(app).await;
    let client = EmbeddingClient::with_endpoint(&format!("http://{}", short), "m");
    let result = client
        .embed_batch(&["one".to_string(), "two".to_string()])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_semantic_signal_finds_file_by_meaning() {
    let addr = fake_ollama().await;
    let client = EmbeddingClient::with_endpoint(&format!("http://{}", addr), "fake-model");

    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(&tmp.path().join("dsense.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let now = chrono::Utc::now().timestamp();
    for (id, path) in [
        (1, "/home/me/invoices/bill_march.pdf"),
        (2, "/home/me/pictures/beach_photo.jpg"),
    ] {
        let p = std::path::Path::new(path);
        sqlx::query(
            "INSERT INTO files (id, path, name, extension, size_bytes, modified_at, drive_id, parent_dir, indexed_at)
             VALUES (?, ?, ?, ?, 2048, ?, 'root', ?, 0)",
        )
        .bind(id)
        .bind(path)
        .bind(p.file_name().unwrap().to_string_lossy().to_string())
        .bind(p.extension().map(|e| e.to_string_lossy().to_string()))
        .bind(now)
        .bind(p.parent().unwrap().to_string_lossy().to_string())
        .execute(&pool)
        .await
        .unwrap();
    }

    let report = embed_pending(&pool, &client, &config, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.embedded, 2);
    assert!(!report.endpoint_unavailable);

    let cache = QueryEmbeddingCache::new(8);
    let results = search_files(&pool, &config, Some(&client), &cache, "invoice", 5)
        .await
        .unwrap();
    assert_eq!(results[0].file.id, 1);
    assert_eq!(results[0].semantic_rank, Some(1));
    assert_eq!(results[0].lexical_rank, None);
    assert_eq!(cache.len(), 1);
}
