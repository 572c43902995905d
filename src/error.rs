use std::path::PathBuf;
use thiserror::Error;

use crate::models::SuggestionStatus;

/// Failures of the suggestion lifecycle and the staging area that callers
/// may want to tell apart. They travel inside `anyhow::Error`; use
/// `downcast_ref::<SafeOpsError>()` to inspect them.
#[derive(Debug, Error)]
pub enum SafeOpsError {
    #[error("checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("corrupt manifest at {path}: {reason}")]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("suggestion {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: SuggestionStatus,
        to: SuggestionStatus,
    },

    #[error("suggestion {0} not found")]
    NotFound(i64),

    #[error("cannot restore {path}: {reason}")]
    RestoreConflict { path: PathBuf, reason: String },

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SafeOpsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SafeOpsError::Io {
            path: path.into(),
            source,
        }
    }
}
