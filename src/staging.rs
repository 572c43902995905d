//! Safe operations: staging, archiving, undo and purge.
//!
//! Accepting a suggestion never touches an original before a verified copy
//! exists. The flow is:
//!
//! 1. `pending → accepted`.
//! 2. Copy every affected file into `<staging root>/<timestamp>-<op>/files/`
//!    and verify each copy's checksum against the original.
//! 3. Write `manifest.json` (original path, staged path, checksum per entry).
//! 4. Archive kind only: zip the staged copies into the archive directory,
//!    read the archive back and verify every entry, then remove the
//!    originals.
//! 5. `accepted → completed`.
//!
//! Any failure in 2–4 records `last_error` and leaves the suggestion in
//! `accepted` for retry. A staging attempt that fails before its manifest
//! is written is logged and its directory removed. Undo restores from a manifest all-or-nothing.
//! Staging directories older than the retention window are purged after
//! their checksums are logged.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db;
use crate::error::SafeOpsError;
use crate::hasher::{checksum_file, checksum_reader};
use crate::models::{
    ArchiveRecord, ManifestEntry, StagingManifest, Suggestion, SuggestionKind, SuggestionStatus,
};
use crate::oplog::{LoggedPath, OpEvent, OpLog};
use crate::suggest;

pub const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// A staging directory and the manifest describing it.
#[derive(Debug, Clone)]
pub struct StagedOperation {
    pub dir: PathBuf,
    pub manifest: StagingManifest,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Originals already present with the recorded content.
    pub already_present: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    pub purged: Vec<PathBuf>,
    pub kept: usize,
    /// Directories without a readable manifest; never deleted.
    pub unreadable: usize,
    pub freed_bytes: u64,
}

fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn logged(entries: &[ManifestEntry], staged: bool) -> Vec<LoggedPath> {
    entries
        .iter()
        .map(|e| LoggedPath {
            path: if staged {
                e.staged_path.clone()
            } else {
                e.original_path.clone()
            },
            checksum: e.checksum.clone(),
        })
        .collect()
}

// ============ Manifest I/O ============

pub fn write_manifest(dir: &Path, manifest: &StagingManifest) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
    let bytes = serde_json::to_vec_pretty(manifest)?;
    std::fs::write(&tmp, bytes).map_err(|e| SafeOpsError::io(&tmp, e))?;
    std::fs::rename(&tmp, dir.join(MANIFEST_FILE)).map_err(|e| SafeOpsError::io(dir, e))?;
    Ok(())
}

/// Read a manifest and check it against the staged copies on disk.
pub fn load_manifest(dir: &Path) -> Result<StagingManifest, SafeOpsError> {
    let path = dir.join(MANIFEST_FILE);
    let corrupt = |reason: String| SafeOpsError::CorruptManifest {
        path: path.clone(),
        reason,
    };

    let text = std::fs::read_to_string(&path).map_err(|e| corrupt(e.to_string()))?;
    let manifest: StagingManifest =
        serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))?;
    if manifest.entries.is_empty() {
        return Err(corrupt("no entries".to_string()));
    }
    for entry in &manifest.entries {
        match checksum_file(&entry.staged_path) {
            Ok(sum) if sum == entry.checksum => {}
            Ok(_) => {
                return Err(corrupt(format!(
                    "staged copy {} does not match its checksum",
                    entry.staged_path.display()
                )))
            }
            Err(e) => return Err(corrupt(format!("{:#}", e))),
        }
    }
    Ok(manifest)
}

// ============ Blocking steps ============

fn copy_verified(from: &Path, to: &Path, expected: &str) -> Result<()> {
    std::fs::copy(from, to).map_err(|e| SafeOpsError::io(from, e))?;
    let actual = checksum_file(to)?;
    if actual != expected {
        return Err(SafeOpsError::ChecksumMismatch {
            path: to.to_path_buf(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

fn copy_entries(
    files_dir: &Path,
    paths: &[String],
    entries: &mut Vec<ManifestEntry>,
) -> Result<()> {
    for (i, original) in paths.iter().enumerate() {
        let original = PathBuf::from(original);
        let meta = std::fs::metadata(&original).map_err(|e| SafeOpsError::io(&original, e))?;
        if !meta.is_file() {
            anyhow::bail!("{} is not a regular file", original.display());
        }
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staged = files_dir.join(format!("{:04}_{}", i, name));
        let checksum = checksum_file(&original)?;
        copy_verified(&original, &staged, &checksum)?;
        entries.push(ManifestEntry {
            original_path: original,
            staged_path: staged,
            checksum,
            size_bytes: meta.len(),
        });
    }
    Ok(())
}

/// Remove a staging directory that never got a manifest, after logging
/// whatever had already been copied into it.
fn abandon(dir: &Path, log: &OpLog, operation_id: &str, entries: &[ManifestEntry]) {
    if let Err(e) = log.append(operation_id, OpEvent::Abandoned, logged(entries, true)) {
        tracing::warn!(op = operation_id, error = %e, "could not log abandoned staging");
    }
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::info!(op = operation_id, dir = %dir.display(), "abandoned staging"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "could not remove staging"),
    }
}

fn stage_files(root: &Path, log: &OpLog, suggestion: &Suggestion) -> Result<StagedOperation> {
    let operation_id = uuid::Uuid::new_v4().to_string();
    let created_at = Utc::now();
    let dir = root.join(format!(
        "{}-{}",
        created_at.format("%Y%m%dT%H%M%S%3fZ"),
        &operation_id[..8]
    ));
    let files_dir = dir.join(FILES_DIR);

    let mut entries = Vec::with_capacity(suggestion.affected_paths.len());
    let copied = std::fs::create_dir_all(&files_dir)
        .map_err(|e| anyhow::Error::from(SafeOpsError::io(&files_dir, e)))
        .and_then(|()| copy_entries(&files_dir, &suggestion.affected_paths, &mut entries));
    let manifest = StagingManifest {
        operation_id,
        suggestion_id: suggestion.id,
        kind: suggestion.kind,
        created_at,
        entries,
        archive: None,
        originals_removed: false,
    };
    if let Err(e) = copied.and_then(|()| write_manifest(&dir, &manifest)) {
        abandon(&dir, log, &manifest.operation_id, &manifest.entries);
        return Err(e);
    }

    log.append(
        &manifest.operation_id,
        OpEvent::Staged,
        logged(&manifest.entries, true),
    )?;
    tracing::info!(
        op = %manifest.operation_id,
        entries = manifest.entries.len(),
        dir = %dir.display(),
        "staged"
    );
    Ok(StagedOperation { dir, manifest })
}

fn entry_name(entry: &ManifestEntry) -> String {
    entry
        .staged_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Writes the archive for a staged operation at the given path.
type ArchiveWriter = fn(&Path, &[ManifestEntry]) -> Result<()>;

fn write_zip(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    let file = File::create(path).map_err(|e| SafeOpsError::io(path, e))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in entries {
        zip.start_file(entry_name(entry), options)?;
        let mut source =
            File::open(&entry.staged_path).map_err(|e| SafeOpsError::io(&entry.staged_path, e))?;
        std::io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Read the archive back and check every entry against the manifest.
fn verify_archive(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    let file = File::open(path).map_err(|e| SafeOpsError::io(path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to reopen archive {}", path.display()))?;
    for entry in entries {
        let name = entry_name(entry);
        let actual = checksum_reader(archive.by_name(&name)?)?;
        if actual != entry.checksum {
            return Err(SafeOpsError::ChecksumMismatch {
                path: path.join(&name),
                expected: entry.checksum.clone(),
                actual,
            }
            .into());
        }
    }
    Ok(())
}

/// Zip the staged copies, then verify the result. An archive that fails
/// verification is deleted.
fn build_archive(
    archive_dir: &Path,
    staged: &StagedOperation,
    write: ArchiveWriter,
) -> Result<ArchiveRecord> {
    std::fs::create_dir_all(archive_dir).map_err(|e| SafeOpsError::io(archive_dir, e))?;
    let dir_name = staged
        .dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| staged.manifest.operation_id.clone());
    let path = archive_dir.join(format!("{}.zip", dir_name));

    let entries = &staged.manifest.entries;
    if let Err(e) = write(&path, entries).and_then(|()| verify_archive(&path, entries)) {
        let _ = std::fs::remove_file(&path);
        return Err(e);
    }

    Ok(ArchiveRecord {
        checksum: checksum_file(&path)?,
        path,
    })
}

/// Steps after staging. Staged copies are re-verified first, so a copy
/// damaged since staging stops the operation with every original intact.
fn finish_staged(
    archive_dir: &Path,
    log: &OpLog,
    mut staged: StagedOperation,
    write: ArchiveWriter,
) -> Result<StagedOperation> {
    for entry in &staged.manifest.entries {
        let actual = checksum_file(&entry.staged_path)?;
        if actual != entry.checksum {
            return Err(SafeOpsError::ChecksumMismatch {
                path: entry.staged_path.clone(),
                expected: entry.checksum.clone(),
                actual,
            }
            .into());
        }
    }

    if staged.manifest.kind != SuggestionKind::Archive || staged.manifest.originals_removed {
        return Ok(staged);
    }

    if staged.manifest.archive.is_none() {
        let record = build_archive(archive_dir, &staged, write)?;
        log.append(
            &staged.manifest.operation_id,
            OpEvent::Archived,
            vec![LoggedPath {
                path: record.path.clone(),
                checksum: record.checksum.clone(),
            }],
        )?;
        staged.manifest.archive = Some(record);
        write_manifest(&staged.dir, &staged.manifest)?;
    }

    log.append(
        &staged.manifest.operation_id,
        OpEvent::OriginalsRemoved,
        logged(&staged.manifest.entries, false),
    )?;
    for entry in &staged.manifest.entries {
        match std::fs::remove_file(&entry.original_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SafeOpsError::io(&entry.original_path, e).into()),
        }
    }
    staged.manifest.originals_removed = true;
    write_manifest(&staged.dir, &staged.manifest)?;
    Ok(staged)
}

/// Restore every manifest entry, or none of them.
fn restore_manifest(dir: &Path, log: &OpLog) -> Result<(StagingManifest, RestoreReport)> {
    let manifest = load_manifest(dir)?;

    let mut pending = Vec::new();
    let mut report = RestoreReport::default();
    for entry in &manifest.entries {
        if entry.original_path.exists() {
            let current = checksum_file(&entry.original_path)?;
            if current != entry.checksum {
                return Err(SafeOpsError::RestoreConflict {
                    path: entry.original_path.clone(),
                    reason: "a different file now exists at this path".to_string(),
                }
                .into());
            }
            report.already_present += 1;
        } else {
            pending.push(entry);
        }
    }

    let mut written: Vec<PathBuf> = Vec::new();
    let mut created_dirs: Vec<PathBuf> = Vec::new();
    let outcome = (|| -> Result<()> {
        for entry in &pending {
            let target = &entry.original_path;
            if let Some(parent) = target.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| SafeOpsError::io(parent, e))?;
                    created_dirs.push(parent.to_path_buf());
                }
            }
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let tmp = target.with_file_name(format!(".{}.dsense-restore", name));
            copy_verified(&entry.staged_path, &tmp, &entry.checksum)?;
            std::fs::rename(&tmp, target).map_err(|e| SafeOpsError::io(target, e))?;
            written.push(target.clone());
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        for path in written.iter().rev() {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %err, "rollback failed");
            }
        }
        for entry in &pending {
            let name = entry
                .original_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let _ = std::fs::remove_file(
                entry
                    .original_path
                    .with_file_name(format!(".{}.dsense-restore", name)),
            );
        }
        for dir in created_dirs.iter().rev() {
            let _ = std::fs::remove_dir(dir);
        }
        return Err(e);
    }

    report.restored = written.len();
    log.append(
        &manifest.operation_id,
        OpEvent::Restored,
        logged(&manifest.entries, false),
    )?;
    Ok((manifest, report))
}

fn purge_dirs(
    root: &Path,
    archive_dir: &Path,
    log: &OpLog,
    cutoff: DateTime<Utc>,
) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    let read = match std::fs::read_dir(root) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(SafeOpsError::io(root, e).into()),
    };

    for entry in read.filter_map(|e| e.ok()) {
        let dir = entry.path();
        if !dir.is_dir() || dir == archive_dir {
            continue;
        }
        let manifest: StagingManifest = match std::fs::read_to_string(dir.join(MANIFEST_FILE))
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
        {
            Some(m) => m,
            None => {
                tracing::warn!(dir = %dir.display(), "staging without a readable manifest");
                report.unreadable += 1;
                continue;
            }
        };
        if manifest.created_at > cutoff {
            report.kept += 1;
            continue;
        }

        log.append(
            &manifest.operation_id,
            OpEvent::Purged,
            logged(&manifest.entries, true),
        )?;
        let bytes = dir_size(&dir);
        std::fs::remove_dir_all(&dir).map_err(|e| SafeOpsError::io(&dir, e))?;
        tracing::info!(op = %manifest.operation_id, dir = %dir.display(), bytes, "purged staging");
        report.freed_bytes += bytes;
        report.purged.push(dir);
    }
    Ok(report)
}

// ============ Manager ============

/// Owns the staging root and runs every destructive step.
#[derive(Debug, Clone)]
pub struct SafeOps {
    pool: SqlitePool,
    staging_root: PathBuf,
    archive_dir: PathBuf,
    retention_days: u32,
    log: OpLog,
    write_archive: ArchiveWriter,
}

impl SafeOps {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        let staging_root = config.staging_root();
        Self {
            pool,
            log: OpLog::in_dir(&staging_root),
            archive_dir: config.archive_dir(),
            retention_days: config.staging.retention_days,
            staging_root,
            write_archive: write_zip,
        }
    }

    #[cfg(test)]
    fn with_archive_writer(mut self, write: ArchiveWriter) -> Self {
        self.write_archive = write;
        self
    }

    pub fn oplog(&self) -> &OpLog {
        &self.log
    }

    /// Accept a pending suggestion (or retry an accepted one) and carry it
    /// through to completion.
    pub async fn accept(&self, id: i64) -> Result<StagedOperation> {
        let suggestion = suggest::transition(&self.pool, id, SuggestionStatus::Accepted).await?;
        let staged = match self.stage(&suggestion).await {
            Ok(staged) => staged,
            Err(e) => return self.fail(id, e).await,
        };
        self.complete(&suggestion, staged).await
    }

    /// Copy and verify the affected files. The suggestion must be accepted.
    pub async fn stage(&self, suggestion: &Suggestion) -> Result<StagedOperation> {
        let root = self.staging_root.clone();
        let log = self.log.clone();
        let owned = suggestion.clone();
        let staged =
            tokio::task::spawn_blocking(move || stage_files(&root, &log, &owned)).await??;
        suggest::record_manifest(&self.pool, suggestion.id, &staged.dir.to_string_lossy())
            .await?;
        Ok(staged)
    }

    /// Verify, archive and remove originals as the kind requires, then mark
    /// the suggestion completed. On failure the suggestion stays accepted.
    pub async fn complete(
        &self,
        suggestion: &Suggestion,
        staged: StagedOperation,
    ) -> Result<StagedOperation> {
        let archive_dir = self.archive_dir.clone();
        let log = self.log.clone();
        let write = self.write_archive;
        let result =
            tokio::task::spawn_blocking(move || finish_staged(&archive_dir, &log, staged, write))
                .await?;
        match result {
            Ok(done) => {
                suggest::record_error(&self.pool, suggestion.id, None).await?;
                suggest::transition(&self.pool, suggestion.id, SuggestionStatus::Completed)
                    .await?;
                tracing::info!(id = suggestion.id, kind = %suggestion.kind, "suggestion completed");
                Ok(done)
            }
            Err(e) => self.fail(suggestion.id, e).await,
        }
    }

    async fn fail<T>(&self, id: i64, error: anyhow::Error) -> Result<T> {
        let message = format!("{:#}", error);
        tracing::warn!(id, error = %message, "operation aborted; suggestion left accepted");
        suggest::record_error(&self.pool, id, Some(&message)).await?;
        Err(error)
    }

    /// Restore a staging directory's manifest. A completed suggestion
    /// becomes reverted.
    pub async fn undo(&self, manifest_dir: &Path) -> Result<RestoreReport> {
        let dir = manifest_dir.to_path_buf();
        let log = self.log.clone();
        let (manifest, report) =
            tokio::task::spawn_blocking(move || restore_manifest(&dir, &log)).await??;

        match suggest::get_suggestion(&self.pool, manifest.suggestion_id).await {
            Ok(s) if s.status == SuggestionStatus::Completed => {
                suggest::transition(&self.pool, s.id, SuggestionStatus::Reverted).await?;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    id = manifest.suggestion_id,
                    error = %e,
                    "restored unknown suggestion"
                )
            }
        }
        tracing::info!(
            op = %manifest.operation_id,
            restored = report.restored,
            already_present = report.already_present,
            "undo complete"
        );
        Ok(report)
    }

    /// Permanently discard staging directories older than the retention
    /// window.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let cutoff = now - chrono::Duration::days(self.retention_days as i64);
        let root = self.staging_root.clone();
        let archive_dir = self.archive_dir.clone();
        let log = self.log.clone();
        let report =
            tokio::task::spawn_blocking(move || purge_dirs(&root, &archive_dir, &log, cutoff))
                .await??;
        for dir in &report.purged {
            sqlx::query("UPDATE suggestions SET manifest_path = NULL WHERE manifest_path = ?")
                .bind(dir.to_string_lossy().to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(report)
    }
}

// ============ CLI ============

pub async fn run_accept(config: &Config, id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let ops = SafeOps::new(pool.clone(), config);
    let result = ops.accept(id).await;
    pool.close().await;
    let staged = result?;
    println!("Suggestion #{} completed.", id);
    println!("  staged: {}", staged.dir.display());
    if let Some(archive) = &staged.manifest.archive {
        println!("  archive: {}", archive.path.display());
    }
    if staged.manifest.originals_removed {
        println!("  originals removed after verification");
    }
    println!("  undo with: dsense undo {}", staged.dir.display());
    Ok(())
}

pub async fn run_undo(config: &Config, dir: &Path) -> Result<()> {
    let pool = db::connect(config).await?;
    let ops = SafeOps::new(pool.clone(), config);
    let result = ops.undo(dir).await;
    pool.close().await;
    let report = result?;
    println!(
        "Restored {} file(s), {} already in place.",
        report.restored, report.already_present
    );
    Ok(())
}

pub async fn run_purge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let ops = SafeOps::new(pool.clone(), config);
    let result = ops.purge_expired(Utc::now()).await;
    pool.close().await;
    let report = result?;
    println!("staging purge");
    println!(
        "  purged: {} ({})",
        report.purged.len(),
        crate::stats::format_bytes(report.freed_bytes)
    );
    println!("  kept: {}", report.kept);
    if report.unreadable > 0 {
        println!("  unreadable (left alone): {}", report.unreadable);
    }
    Ok(())
}
