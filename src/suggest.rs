//! Cleanup suggestions.
//!
//! A fixed rule table turns a directory's entropy score into candidate
//! suggestions:
//!
//! | Rule | Fires when | Kind |
//! |------|------------|------|
//! | inactivity | newest file older than `archive_inactive_days` | archive |
//! | duplicates | duplicate ratio above `duplicate_ratio` | deduplicate |
//! | nesting | depth waste above `depth_waste` | flatten |
//! | naming | naming entropy above `naming_entropy` (enough files) | rename |
//! | fallback | composite above `composite`, nothing above fired | organize |
//!
//! Confidence grows with the number of signals over threshold for the
//! directory. Candidates are deduplicated by a fingerprint of kind plus
//! sorted affected paths against pending and deferred rows.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::{Config, SuggestionConfig};
use crate::db;
use crate::entropy::{self, classify_naming, NamingPattern};
use crate::error::SafeOpsError;
use crate::files;
use crate::graph;
use crate::models::{EntropyScore, FileRecord, Suggestion, SuggestionKind, SuggestionStatus};

/// A suggestion before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub kind: SuggestionKind,
    pub affected_paths: Vec<String>,
    pub reason: String,
    pub confidence: f64,
    pub space_savings_bytes: i64,
}

impl Candidate {
    pub fn fingerprint(&self) -> String {
        fingerprint(self.kind, &self.affected_paths)
    }
}

/// SHA-256 over the kind and the sorted, newline-joined paths.
pub fn fingerprint(kind: SuggestionKind, paths: &[String]) -> String {
    let mut sorted: Vec<&str> = paths.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    for path in sorted {
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// 0.5 for a lone signal, +0.15 for each corroborating one, capped at 0.95.
pub fn confidence_for(signals: usize) -> f64 {
    if signals == 0 {
        return 0.0;
    }
    (0.5 + 0.15 * (signals - 1) as f64).min(0.95)
}

fn sorted_paths<'a>(files: impl IntoIterator<Item = &'a FileRecord>) -> Vec<String> {
    let mut paths: Vec<String> = files.into_iter().map(|f| f.path.clone()).collect();
    paths.sort();
    paths
}

/// Apply the rule table to one directory.
///
/// `dup_groups` holds the duplicate groups that have at least one member in
/// this directory, members from anywhere on the same drive.
pub fn evaluate_directory(
    score: &EntropyScore,
    files: &[FileRecord],
    dup_groups: &[Vec<FileRecord>],
    rules: &SuggestionConfig,
    now: i64,
) -> Vec<Candidate> {
    if files.is_empty() {
        return Vec::new();
    }

    let inactive_secs = rules.archive_inactive_days as i64 * 86_400;
    let inactive = score
        .newest_modified_at
        .map(|newest| now - newest >= inactive_secs)
        .unwrap_or(false);
    let duplicated = score.duplicate_ratio > rules.duplicate_ratio && !dup_groups.is_empty();
    let nested = score.depth_waste > rules.depth_waste;
    let misnamed =
        score.naming_entropy > rules.naming_entropy && files.len() >= rules.naming_min_files;
    let disordered = score.composite > rules.composite;

    let signals = [inactive, duplicated, nested, misnamed, disordered]
        .iter()
        .filter(|s| **s)
        .count();
    let confidence = confidence_for(signals);
    let dir = &score.subject;
    let mut out = Vec::new();

    if inactive {
        let days = score
            .newest_modified_at
            .map(|n| (now - n) / 86_400)
            .unwrap_or_default();
        out.push(Candidate {
            kind: SuggestionKind::Archive,
            affected_paths: sorted_paths(files),
            reason: format!("{} has not changed in {} days", dir, days),
            confidence,
            space_savings_bytes: files.iter().map(|f| f.size_bytes).sum(),
        });
    }

    if duplicated {
        let members: Vec<&FileRecord> = dup_groups.iter().flatten().collect();
        let savings: i64 = dup_groups
            .iter()
            .map(|g| {
                let total: i64 = g.iter().map(|f| f.size_bytes).sum();
                total - g.iter().map(|f| f.size_bytes).max().unwrap_or(0)
            })
            .sum();
        out.push(Candidate {
            kind: SuggestionKind::Deduplicate,
            affected_paths: sorted_paths(members),
            reason: format!(
                "{:.0}% of files in {} have identical copies",
                score.duplicate_ratio * 100.0,
                dir
            ),
            confidence,
            space_savings_bytes: savings,
        });
    }

    if nested {
        out.push(Candidate {
            kind: SuggestionKind::Flatten,
            affected_paths: sorted_paths(files),
            reason: format!("{} sits in a chain of single-child directories", dir),
            confidence,
            space_savings_bytes: 0,
        });
    }

    if misnamed {
        let mut counts: HashMap<NamingPattern, usize> = HashMap::new();
        for f in files {
            *counts.entry(classify_naming(&f.name)).or_insert(0) += 1;
        }
        let dominant = counts
            .iter()
            .max_by_key(|(pattern, n)| (**n, format!("{:?}", pattern)))
            .map(|(p, _)| *p);
        let outliers: Vec<&FileRecord> = files
            .iter()
            .filter(|f| Some(classify_naming(&f.name)) != dominant)
            .collect();
        out.push(Candidate {
            kind: SuggestionKind::Rename,
            affected_paths: sorted_paths(outliers),
            reason: format!("file names in {} follow mixed conventions", dir),
            confidence,
            space_savings_bytes: 0,
        });
    }

    if disordered && out.is_empty() {
        out.push(Candidate {
            kind: SuggestionKind::Organize,
            affected_paths: sorted_paths(files),
            reason: format!(
                "{} scores {:.2} overall organizational entropy",
                dir, score.composite
            ),
            confidence,
            space_savings_bytes: 0,
        });
    }

    out
}

// ============ Persistence ============

fn row_to_suggestion(row: &SqliteRow) -> Result<Suggestion> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let paths: String = row.get("affected_paths");
    Ok(Suggestion {
        id: row.get("id"),
        kind: kind.parse()?,
        fingerprint: row.get("fingerprint"),
        affected_paths: serde_json::from_str(&paths)?,
        reason: row.get("reason"),
        confidence: row.get("confidence"),
        space_savings_bytes: row.get("space_savings_bytes"),
        status: status.parse()?,
        deferred_until: row.get("deferred_until"),
        manifest_path: row.get("manifest_path"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Insert unless a pending or deferred suggestion has the same fingerprint.
/// Returns the new id, or `None` for a no-op.
pub async fn persist_candidate(pool: &SqlitePool, candidate: &Candidate) -> Result<Option<i64>> {
    let fp = candidate.fingerprint();
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM suggestions WHERE fingerprint = ? AND status IN ('pending', 'deferred')",
    )
    .bind(&fp)
    .fetch_optional(pool)
    .await?;
    if existing.is_some() {
        return Ok(None);
    }

    let now = chrono::Utc::now().timestamp();
    let id = sqlx::query(
        r#"
        INSERT INTO suggestions (kind, fingerprint, affected_paths, reason, confidence,
            space_savings_bytes, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(candidate.kind.as_str())
    .bind(&fp)
    .bind(serde_json::to_string(&candidate.affected_paths)?)
    .bind(&candidate.reason)
    .bind(candidate.confidence)
    .bind(candidate.space_savings_bytes)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(Some(id))
}

pub async fn get_suggestion(pool: &SqlitePool, id: i64) -> Result<Suggestion> {
    let row = sqlx::query("SELECT * FROM suggestions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(SafeOpsError::NotFound(id))?;
    row_to_suggestion(&row)
}

/// Suggestions, newest first, optionally filtered by status. Expired
/// deferrals are reactivated before reading.
pub async fn list_suggestions(
    pool: &SqlitePool,
    status: Option<SuggestionStatus>,
) -> Result<Vec<Suggestion>> {
    reactivate_expired(pool, chrono::Utc::now().timestamp()).await?;
    let rows = match status {
        Some(status) => {
            sqlx::query("SELECT * FROM suggestions WHERE status = ? ORDER BY id DESC")
                .bind(status.as_str())
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM suggestions ORDER BY id DESC")
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter().map(row_to_suggestion).collect()
}

/// Legal status moves. `accepted → accepted` is a retry after a failed
/// verification.
pub fn can_transition(from: SuggestionStatus, to: SuggestionStatus) -> bool {
    use SuggestionStatus::*;
    matches!(
        (from, to),
        (Pending, Dismissed)
            | (Pending, Deferred)
            | (Pending, Accepted)
            | (Deferred, Pending)
            | (Deferred, Dismissed)
            | (Accepted, Accepted)
            | (Accepted, Completed)
            | (Completed, Reverted)
    )
}

/// Move a suggestion to `to`, or fail with `InvalidTransition`.
pub async fn transition(pool: &SqlitePool, id: i64, to: SuggestionStatus) -> Result<Suggestion> {
    let current = get_suggestion(pool, id).await?;
    if !can_transition(current.status, to) {
        return Err(SafeOpsError::InvalidTransition {
            id,
            from: current.status,
            to,
        }
        .into());
    }
    sqlx::query("UPDATE suggestions SET status = ?, updated_at = ? WHERE id = ?")
        .bind(to.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    get_suggestion(pool, id).await
}

pub async fn dismiss(pool: &SqlitePool, id: i64) -> Result<Suggestion> {
    transition(pool, id, SuggestionStatus::Dismissed).await
}

/// Park a pending suggestion until `until` (unix seconds).
pub async fn defer(pool: &SqlitePool, id: i64, until: i64) -> Result<Suggestion> {
    transition(pool, id, SuggestionStatus::Deferred).await?;
    sqlx::query("UPDATE suggestions SET deferred_until = ? WHERE id = ?")
        .bind(until)
        .bind(id)
        .execute(pool)
        .await?;
    get_suggestion(pool, id).await
}

/// Deferred suggestions whose deadline has passed become pending again.
pub async fn reactivate_expired(pool: &SqlitePool, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE suggestions SET status = 'pending', deferred_until = NULL, updated_at = ?
         WHERE status = 'deferred' AND deferred_until IS NOT NULL AND deferred_until <= ?",
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn record_manifest(pool: &SqlitePool, id: i64, manifest_path: &str) -> Result<()> {
    sqlx::query("UPDATE suggestions SET manifest_path = ?, updated_at = ? WHERE id = ?")
        .bind(manifest_path)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Store or clear the last failure message shown for retry.
pub async fn record_error(pool: &SqlitePool, id: i64, error: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE suggestions SET last_error = ?, updated_at = ? WHERE id = ?")
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Suggestion pass ============

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuggestReport {
    pub directories: usize,
    pub created: usize,
    pub already_open: usize,
    pub reactivated: u64,
}

/// Run the rule table over stored directory scores and persist new
/// candidates.
pub async fn generate_suggestions(pool: &SqlitePool, config: &Config) -> Result<SuggestReport> {
    let now = chrono::Utc::now().timestamp();
    let mut report = SuggestReport {
        reactivated: reactivate_expired(pool, now).await?,
        ..Default::default()
    };

    let groups = graph::duplicate_groups(pool).await?;
    for score in entropy::directory_scores(pool).await? {
        report.directories += 1;
        let dir_files = files::files_in_directory(pool, &score.subject).await?;
        let dir_ids: std::collections::HashSet<i64> = dir_files.iter().map(|f| f.id).collect();

        let mut touching = Vec::new();
        for group in groups.iter().filter(|g| g.iter().any(|id| dir_ids.contains(id))) {
            touching.push(files::files_by_ids(pool, group).await?);
        }

        for candidate in evaluate_directory(&score, &dir_files, &touching, &config.suggestions, now)
        {
            match persist_candidate(pool, &candidate).await? {
                Some(id) => {
                    tracing::info!(
                        id,
                        kind = %candidate.kind,
                        dir = %score.subject,
                        "new suggestion"
                    );
                    report.created += 1;
                }
                None => report.already_open += 1,
            }
        }
    }
    Ok(report)
}

// ============ CLI ============

fn print_suggestion(s: &Suggestion) {
    println!(
        "#{} [{}] {} ({:.0}% confidence)",
        s.id,
        s.status,
        s.kind,
        s.confidence * 100.0
    );
    println!("    {}", s.reason);
    if s.space_savings_bytes > 0 {
        println!("    reclaimable: {} bytes", s.space_savings_bytes);
    }
    println!("    affects {} path(s)", s.affected_paths.len());
    if let Some(until) = s.deferred_until {
        let date = chrono::DateTime::from_timestamp(until, 0)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!("    deferred until: {}", date);
    }
    if let Some(err) = &s.last_error {
        println!("    last error: {}", err);
    }
}

pub async fn run_suggest(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = generate_suggestions(&pool, config).await?;
    println!("suggest run");
    println!("  directories: {}", report.directories);
    println!("  new suggestions: {}", report.created);
    println!("  already open: {}", report.already_open);
    pool.close().await;
    Ok(())
}

pub async fn run_list(config: &Config, status: Option<&str>) -> Result<()> {
    let status = status.map(str::parse::<SuggestionStatus>).transpose()?;
    let pool = db::connect(config).await?;
    let suggestions = list_suggestions(&pool, status).await?;
    if suggestions.is_empty() {
        println!("No suggestions.");
    }
    for s in &suggestions {
        print_suggestion(s);
    }
    pool.close().await;
    Ok(())
}

pub async fn run_dismiss(config: &Config, id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let s = dismiss(&pool, id).await?;
    print_suggestion(&s);
    pool.close().await;
    Ok(())
}

pub async fn run_defer(config: &Config, id: i64, days: u32) -> Result<()> {
    let pool = db::connect(config).await?;
    let until = chrono::Utc::now().timestamp() + days as i64 * 86_400;
    let s = defer(&pool, id, until).await?;
    print_suggestion(&s);
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::fixtures::{memory_pool, record};
    use crate::models::SubjectKind;

    const NOW: i64 = 1_700_000_000;

    fn score(dir: &str) -> EntropyScore {
        EntropyScore {
            subject: dir.to_string(),
            subject_kind: SubjectKind::Directory,
            file_count: 3,
            naming_entropy: 0.0,
            age_spread: 0.0,
            depth_waste: 0.0,
            duplicate_ratio: 0.0,
            orphan_score: 0.0,
            composite: 0.0,
            newest_modified_at: Some(NOW),
            computed_at: NOW,
        }
    }

    fn photos() -> Vec<FileRecord> {
        vec![
            record(1, "/pics/Photo1.JPG", NOW, "d"),
            record(2, "/pics/photo_2.jpg", NOW, "d"),
            record(3, "/pics/img-03.jpg", NOW, "d"),
            record(4, "/pics/photo_4.jpg", NOW, "d"),
        ]
    }

    #[test]
    fn test_fingerprint_ignores_path_order() {
        let a = fingerprint(SuggestionKind::Archive, &["/b".into(), "/a".into()]);
        let b = fingerprint(SuggestionKind::Archive, &["/a".into(), "/b".into()]);
        let c = fingerprint(SuggestionKind::Organize, &["/a".into(), "/b".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_confidence_grows_with_signals() {
        assert!(confidence_for(2) > confidence_for(1));
        assert!(confidence_for(5) <= 0.95);
        assert_eq!(confidence_for(0), 0.0);
    }

    #[test]
    fn test_inactive_directory_suggests_archive() {
        let mut s = score("/old");
        let eight_months_ago = NOW - 240 * 86_400;
        s.newest_modified_at = Some(eight_months_ago);
        let files = vec![record(1, "/old/a.txt", eight_months_ago, "d")];

        let out = evaluate_directory(&s, &files, &[], &SuggestionConfig::default(), NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, SuggestionKind::Archive);
        assert_eq!(out[0].space_savings_bytes, 100);
    }

    #[test]
    fn test_rename_targets_outliers() {
        let mut s = score("/pics");
        s.naming_entropy = 0.67;
        let out = evaluate_directory(&s, &photos(), &[], &SuggestionConfig::default(), NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, SuggestionKind::Rename);
        assert_eq!(
            out[0].affected_paths,
            vec!["/pics/Photo1.JPG".to_string(), "/pics/img-03.jpg".to_string()]
        );
    }

    #[test]
    fn test_dedupe_savings_keep_one_copy() {
        let mut s = score("/docs");
        s.duplicate_ratio = 1.0;
        let group = vec![
            record(1, "/docs/report.docx", NOW, "d"),
            record(2, "/docs/report_v2.docx", NOW, "d"),
            record(3, "/backup/report.docx", NOW, "d"),
        ];
        let out = evaluate_directory(
            &s,
            &group[..2],
            &[group.clone()],
            &SuggestionConfig::default(),
            NOW,
        );
        let dedupe = out
            .iter()
            .find(|c| c.kind == SuggestionKind::Deduplicate)
            .unwrap();
        assert_eq!(dedupe.space_savings_bytes, 200);
        assert_eq!(dedupe.affected_paths.len(), 3);
    }

    #[test]
    fn test_organize_only_without_specific_rule() {
        let mut s = score("/mess");
        s.composite = 0.8;
        let out = evaluate_directory(&s, &photos(), &[], &SuggestionConfig::default(), NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, SuggestionKind::Organize);

        s.naming_entropy = 0.9;
        let out = evaluate_directory(&s, &photos(), &[], &SuggestionConfig::default(), NOW);
        assert!(out.iter().all(|c| c.kind != SuggestionKind::Organize));
        assert!(out[0].confidence > confidence_for(1));
    }

    #[tokio::test]
    async fn test_persist_is_idempotent_while_open() {
        let pool = memory_pool().await;
        let candidate = Candidate {
            kind: SuggestionKind::Organize,
            affected_paths: vec!["/x/a".into()],
            reason: "messy".into(),
            confidence: 0.5,
            space_savings_bytes: 0,
        };

        let id = persist_candidate(&pool, &candidate).await.unwrap().unwrap();
        assert_eq!(persist_candidate(&pool, &candidate).await.unwrap(), None);

        defer(&pool, id, NOW + 1000).await.unwrap();
        assert_eq!(persist_candidate(&pool, &candidate).await.unwrap(), None);

        assert_eq!(list_suggestions(&pool, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let pool = memory_pool().await;
        let candidate = Candidate {
            kind: SuggestionKind::Archive,
            affected_paths: vec!["/x/a".into()],
            reason: "old".into(),
            confidence: 0.5,
            space_savings_bytes: 10,
        };
        let id = persist_candidate(&pool, &candidate).await.unwrap().unwrap();

        let deferred = defer(&pool, id, NOW).await.unwrap();
        assert_eq!(deferred.status, SuggestionStatus::Deferred);
        assert_eq!(reactivate_expired(&pool, NOW - 1).await.unwrap(), 0);
        assert_eq!(reactivate_expired(&pool, NOW).await.unwrap(), 1);
        assert_eq!(
            get_suggestion(&pool, id).await.unwrap().status,
            SuggestionStatus::Pending
        );

        dismiss(&pool, id).await.unwrap();
        let err = transition(&pool, id, SuggestionStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SafeOpsError>(),
            Some(SafeOpsError::InvalidTransition { .. })
        ));

        let missing = get_suggestion(&pool, 404).await.unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<SafeOpsError>(),
            Some(SafeOpsError::NotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_generate_suggestions_twice_creates_nothing_new() {
        let pool = memory_pool().await;
        let old = NOW - 400 * 86_400;
        crate::files::fixtures::seed_file(&pool, 1, "/stale/a.txt", 50, old, "d").await;
        crate::files::fixtures::seed_file(&pool, 2, "/stale/b.txt", 70, old, "d").await;
        let config = Config::minimal(std::path::Path::new("/tmp/x.sqlite"));
        let snapshot = entropy::GraphSnapshot::default();
        entropy::score_directory(&pool, &config, &snapshot, "/stale")
            .await
            .unwrap();

        let first = generate_suggestions(&pool, &config).await.unwrap();
        assert!(first.created >= 1);
        let second = generate_suggestions(&pool, &config).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.already_open, first.created);

        let archive = list_suggestions(&pool, Some(SuggestionStatus::Pending))
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.kind == SuggestionKind::Archive)
            .unwrap();
        assert_eq!(archive.space_savings_bytes, 120);
    }
}
