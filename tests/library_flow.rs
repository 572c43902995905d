//! End-to-end flow through the library API: a background pass over a small
//! index, then accepting and undoing an archive suggestion.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dirsense::config::Config;
use dirsense::graph;
use dirsense::models::{SuggestionKind, SuggestionStatus};
use dirsense::oplog::OpEvent;
use dirsense::scheduler::run_pass;
use dirsense::staging::SafeOps;
use dirsense::{db, files, migrate, suggest};

struct Env {
    _tmp: TempDir,
    data: PathBuf,
    config: Config,
    pool: sqlx::SqlitePool,
}

async fn index(pool: &sqlx::SqlitePool, id: i64, path: &Path, modified_at: i64) {
    sqlx::query(
        "INSERT INTO files (id, path, name, extension, size_bytes, modified_at, drive_id, parent_dir, indexed_at)
         VALUES (?, ?, ?, ?, ?, ?, 'root', ?, 0)",
    )
    .bind(id)
    .bind(path.to_string_lossy().to_string())
    .bind(path.file_name().unwrap().to_string_lossy().to_string())
    .bind(path.extension().map(|e| e.to_string_lossy().to_string()))
    .bind(fs::metadata(path).unwrap().len() as i64)
    .bind(modified_at)
    .bind(path.parent().unwrap().to_string_lossy().to_string())
    .execute(pool)
    .await
    .unwrap();
}

async fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    for dir in ["old_project", "docs", "backup"] {
        fs::create_dir_all(data.join(dir)).unwrap();
    }
    fs::write(data.join("old_project/main.c"), "int main() { return 0; }\n").unwrap();
    fs::write(data.join("old_project/notes.txt"), "build with make\n").unwrap();
    fs::write(data.join("docs/report.docx"), "quarterly numbers").unwrap();
    fs::write(data.join("backup/report.docx"), "quarterly numbers").unwrap();

    let config = Config::minimal(&tmp.path().join("db").join("dsense.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();

    let now = chrono::Utc::now().timestamp();
    let long_ago = now - 400 * 86_400;
    index(&pool, 1, &data.join("old_project/main.c"), long_ago).await;
    index(&pool, 2, &data.join("old_project/notes.txt"), long_ago).await;
    index(&pool, 3, &data.join("docs/report.docx"), now).await;
    index(&pool, 4, &data.join("backup/report.docx"), now).await;

    Env {
        _tmp: tmp,
        data,
        config,
        pool,
    }
}

#[tokio::test]
async fn test_pass_builds_graph_scores_and_suggests() {
    let env = setup().await;

    let report = run_pass(&env.pool, &env.config, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.directories_scored, 3);

    let related = graph::related(&env.pool, 3, 1, 10).await.unwrap();
    assert!(related.iter().any(|r| r.file.id == 4));

    let pending = suggest::list_suggestions(&env.pool, Some(SuggestionStatus::Pending))
        .await
        .unwrap();
    let kinds: Vec<SuggestionKind> = pending.iter().map(|s| s.kind).collect();
    assert!(kinds.contains(&SuggestionKind::Archive));
    assert!(kinds.contains(&SuggestionKind::Deduplicate));

    let dedupe = pending
        .iter()
        .find(|s| s.kind == SuggestionKind::Deduplicate)
        .unwrap();
    assert_eq!(dedupe.space_savings_bytes, "quarterly numbers".len() as i64);

    // a second pass finds the same problems and records nothing new
    let again = run_pass(&env.pool, &env.config, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.suggestions.unwrap().created, 0);
}

#[tokio::test]
async fn test_accept_archive_then_undo() {
    let env = setup().await;
    run_pass(&env.pool, &env.config, None, &CancellationToken::new())
        .await
        .unwrap();

    let archive = suggest::list_suggestions(&env.pool, Some(SuggestionStatus::Pending))
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.kind == SuggestionKind::Archive)
        .unwrap();
    assert_eq!(archive.affected_paths.len(), 2);

    let ops = SafeOps::new(env.pool.clone(), &env.config);
    let staged = ops.accept(archive.id).await.unwrap();
    assert!(staged.manifest.originals_removed);
    assert!(!env.data.join("old_project/main.c").exists());
    assert!(staged.manifest.archive.as_ref().unwrap().path.exists());

    let done = suggest::get_suggestion(&env.pool, archive.id).await.unwrap();
    assert_eq!(done.status, SuggestionStatus::Completed);
    assert_eq!(
        done.manifest_path.as_deref(),
        Some(staged.dir.to_string_lossy().as_ref())
    );

    let report = ops.undo(&staged.dir).await.unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(
        fs::read_to_string(env.data.join("old_project/notes.txt")).unwrap(),
        "build with make\n"
    );
    assert_eq!(
        suggest::get_suggestion(&env.pool, archive.id)
            .await
            .unwrap()
            .status,
        SuggestionStatus::Reverted
    );

    // the index itself is never modified
    assert_eq!(files::file_count(&env.pool).await.unwrap(), 4);

    let events: Vec<OpEvent> = ops
        .oplog()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect();
    assert_eq!(
        events,
        vec![
            OpEvent::Staged,
            OpEvent::Archived,
            OpEvent::OriginalsRemoved,
            OpEvent::Restored
        ]
    );
}
