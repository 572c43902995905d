//! Append-only operation log (`op_log.jsonl` in the staging root).
//!
//! One JSON object per line. Entries are written before the filesystem
//! change they describe takes effect for deletions, and after it for
//! copies, so the log always names every checksum that ever left disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "op_log.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpEvent {
    Staged,
    /// A staging attempt failed partway; its partial copies were deleted.
    Abandoned,
    Archived,
    OriginalsRemoved,
    Restored,
    Purged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedPath {
    pub path: PathBuf,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub event: OpEvent,
    pub paths: Vec<LoggedPath>,
}

#[derive(Debug, Clone)]
pub struct OpLog {
    path: PathBuf,
}

impl OpLog {
    pub fn in_dir(staging_root: &Path) -> Self {
        Self {
            path: staging_root.join(LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, operation_id: &str, event: OpEvent, paths: Vec<LoggedPath>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let record = OpRecord {
            timestamp: Utc::now(),
            operation_id: operation_id.to_string(),
            event,
            paths,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open op log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// All records in append order. A missing log is empty.
    pub fn read_all(&self) -> Result<Vec<OpRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Malformed op log line"))
            .collect()
    }
}
