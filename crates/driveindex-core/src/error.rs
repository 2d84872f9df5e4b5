//! Error types for catalog, scan and search operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::GenerationStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The drive hint carries neither a hardware serial nor a user alias
    #[error("drive '{label}' has no hardware serial; supply an alias to identify it")]
    AmbiguousDrive { label: String },

    /// Another scan of the same drive has not finished yet
    #[error("a scan of drive '{drive}' is already in progress")]
    ScanInProgress { drive: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("scan root does not exist or is not a directory: {}", .0.display())]
    RootNotFound(PathBuf),

    /// The drive root could be found but not listed
    #[error("cannot read drive root {}: {cause}", .path.display())]
    RootUnreadable { path: PathBuf, cause: String },

    /// The walker produced nothing within the per-node timeout
    #[error("filesystem stopped responding for {secs}s; scan aborted")]
    ScanStalled { secs: u64 },

    #[error("scan cancelled")]
    Cancelled,

    #[error("generation {generation} is {status}, expected in-progress")]
    GenerationState {
        generation: i64,
        status: GenerationStatus,
    },

    #[error("drive not found: {0}")]
    DriveNotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog lock poisoned by a panicked thread")]
    LockPoisoned,
}

/// A single filesystem node that could not be read.
///
/// Access errors never abort a scan; they are collected into the
/// [`ScanReport`](crate::reconciler::ScanReport) so the user can see what was
/// skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessError {
    pub path: PathBuf,
    pub cause: String,
}

impl AccessError {
    pub fn new(path: impl Into<PathBuf>, cause: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            cause: cause.to_string(),
        }
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.cause)
    }
}

impl std::error::Error for AccessError {}

impl From<walkdir::Error> for AccessError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let cause = match err.io_error() {
            Some(io) => io.to_string(),
            None => err.to_string(),
        };
        Self { path, cause }
    }
}
