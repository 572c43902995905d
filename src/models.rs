//! Core data models shared by the ranker, the graph, the scorers, and the
//! safe-operations manager.
//!
//! [`FileRecord`] mirrors a row of the external file index and is read-only
//! here; every other type is owned by this crate and keyed by file identity.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One file as recorded by the external indexer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size_bytes: i64,
    /// Unix seconds.
    pub modified_at: i64,
    /// Storage root the file lives on. Edges never cross drives.
    pub drive_id: String,
    pub parent_dir: String,
}

impl FileRecord {
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn modified(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.modified_at, 0).unwrap_or_default()
    }
}

/// Stored embedding for a file. One row per file; regeneration replaces it.
#[derive(Debug, Clone)]
pub struct FileEmbedding {
    pub file_id: i64,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub content_fingerprint: String,
    pub embedded_at: i64,
}

/// Closed set of relationship kinds in the file graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Similar,
    CoModified,
    References,
    Sibling,
    Duplicate,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 5] = [
        EdgeKind::Similar,
        EdgeKind::CoModified,
        EdgeKind::References,
        EdgeKind::Sibling,
        EdgeKind::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Similar => "similar",
            EdgeKind::CoModified => "co_modified",
            EdgeKind::References => "references",
            EdgeKind::Sibling => "sibling",
            EdgeKind::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "similar" => Ok(EdgeKind::Similar),
            "co_modified" => Ok(EdgeKind::CoModified),
            "references" => Ok(EdgeKind::References),
            "sibling" => Ok(EdgeKind::Sibling),
            "duplicate" => Ok(EdgeKind::Duplicate),
            other => bail!("Unknown edge kind: {}", other),
        }
    }
}

/// A relationship produced by an analyzer, before or after persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source_id: i64,
    pub target_id: i64,
    pub kind: EdgeKind,
    /// In `[0, 1]`.
    pub strength: f64,
    pub metadata: Option<serde_json::Value>,
}

impl Edge {
    pub fn new(source_id: i64, target_id: i64, kind: EdgeKind, strength: f64) -> Self {
        Self {
            source_id,
            target_id,
            kind,
            strength: strength.clamp(0.0, 1.0),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Directory,
    File,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Directory => "directory",
            SubjectKind::File => "file",
        }
    }
}

/// Five entropy dimensions plus their weighted composite, all in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntropyScore {
    pub subject: String,
    pub subject_kind: SubjectKind,
    pub file_count: usize,
    pub naming_entropy: f64,
    pub age_spread: f64,
    pub depth_waste: f64,
    pub duplicate_ratio: f64,
    pub orphan_score: f64,
    pub composite: f64,
    /// Newest modification time among the subject's files (unix seconds).
    pub newest_modified_at: Option<i64>,
    pub computed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Archive,
    Deduplicate,
    Flatten,
    Rename,
    Organize,
}

impl SuggestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionKind::Archive => "archive",
            SuggestionKind::Deduplicate => "deduplicate",
            SuggestionKind::Flatten => "flatten",
            SuggestionKind::Rename => "rename",
            SuggestionKind::Organize => "organize",
        }
    }
}

impl fmt::Display for SuggestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "archive" => Ok(SuggestionKind::Archive),
            "deduplicate" => Ok(SuggestionKind::Deduplicate),
            "flatten" => Ok(SuggestionKind::Flatten),
            "rename" => Ok(SuggestionKind::Rename),
            "organize" => Ok(SuggestionKind::Organize),
            other => bail!("Unknown suggestion kind: {}", other),
        }
    }
}

/// Suggestion lifecycle.
///
/// ```text
/// pending ──▶ dismissed
///    │ ├────▶ deferred ──(deadline passes)──▶ pending
///    │ └────▶ accepted ──(verified)──▶ completed ──(undo)──▶ reverted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Dismissed,
    Deferred,
    Accepted,
    Completed,
    Reverted,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Dismissed => "dismissed",
            SuggestionStatus::Deferred => "deferred",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Completed => "completed",
            SuggestionStatus::Reverted => "reverted",
        }
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "dismissed" => Ok(SuggestionStatus::Dismissed),
            "deferred" => Ok(SuggestionStatus::Deferred),
            "accepted" => Ok(SuggestionStatus::Accepted),
            "completed" => Ok(SuggestionStatus::Completed),
            "reverted" => Ok(SuggestionStatus::Reverted),
            other => bail!("Unknown suggestion status: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub id: i64,
    pub kind: SuggestionKind,
    pub fingerprint: String,
    pub affected_paths: Vec<String>,
    pub reason: String,
    pub confidence: f64,
    pub space_savings_bytes: i64,
    pub status: SuggestionStatus,
    pub deferred_until: Option<i64>,
    pub manifest_path: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One staged copy: where it came from, where it lives now, and its checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub original_path: PathBuf,
    pub staged_path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub path: PathBuf,
    pub checksum: String,
}

/// Written as `manifest.json` inside each staging directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingManifest {
    pub operation_id: String,
    pub suggestion_id: i64,
    pub kind: SuggestionKind,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    #[serde(default)]
    pub archive: Option<ArchiveRecord>,
    /// Set once the originals have been removed after verification.
    #[serde(default)]
    pub originals_removed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_kind_str_roundtrip() {
        for kind in EdgeKind::ALL {
            assert_eq!(kind.as_str().parse::<EdgeKind>().unwrap(), kind);
        }
        assert!("friend".parse::<EdgeKind>().is_err());
    }

    #[test]
    fn test_edge_strength_is_clamped() {
        assert_eq!(Edge::new(1, 2, EdgeKind::Sibling, 1.7).strength, 1.0);
        assert_eq!(Edge::new(1, 2, EdgeKind::Sibling, -0.2).strength, 0.0);
    }

    #[test]
    fn test_file_record_stem() {
        let file = FileRecord {
            id: 1,
            path: "/a/report_v2.docx".to_string(),
            name: "report_v2.docx".to_string(),
            extension: Some("docx".to_string()),
            size_bytes: 10,
            modified_at: 0,
            drive_id: "root".to_string(),
            parent_dir: "/a".to_string(),
        };
        assert_eq!(file.stem(), "report_v2");
    }
}
