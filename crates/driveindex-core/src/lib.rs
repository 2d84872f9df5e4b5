use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod scanner;
pub mod search;

pub use catalog::{ChangeKind, DiffCounts, DriveRegistry, IndexStore, NameQuery};
pub use config::IndexConfig;
pub use error::{AccessError, Error, Result};
pub use reconciler::{CancelToken, ScanProgress, ScanReconciler, ScanReport};
pub use scanner::{extract, TreeWalker, WalkOptions};
pub use search::{MatchMode, MatchTier, SearchEngine, SearchHit, SearchQuery};

/// Stable identity of a physical drive.
///
/// Hardware serials are not always exposed (card readers, some USB bridges),
/// so the no-serial case is a separate variant carrying a user alias instead
/// of an optional field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriveIdentity {
    Hardware { label: String, serial: String },
    Alias { alias: String },
}

impl DriveIdentity {
    /// Build an identity from what drive detection reported.
    ///
    /// A serial wins over an alias. Without either the drive cannot be told
    /// apart from other drives sharing its label.
    pub fn from_hint(hint: &DriveHint) -> Result<Self> {
        let serial = hint.serial.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let alias = hint.alias.as_deref().map(str::trim).filter(|s| !s.is_empty());

        match (serial, alias) {
            (Some(serial), _) => Ok(DriveIdentity::Hardware {
                label: hint.label.clone(),
                serial: serial.to_string(),
            }),
            (None, Some(alias)) => Ok(DriveIdentity::Alias {
                alias: alias.to_string(),
            }),
            (None, None) => Err(Error::AmbiguousDrive {
                label: hint.label.clone(),
            }),
        }
    }

    /// Key used for exact matching in the catalog
    pub fn stable_key(&self) -> String {
        match self {
            DriveIdentity::Hardware { label, serial } => format!("hw:{}:{}", label, serial),
            DriveIdentity::Alias { alias } => format!("alias:{}", alias),
        }
    }
}

impl std::fmt::Display for DriveIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveIdentity::Hardware { label, serial } => write!(f, "{} (serial {})", label, serial),
            DriveIdentity::Alias { alias } => write!(f, "{} (alias)", alias),
        }
    }
}

/// Drive description handed over by mount detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveHint {
    pub label: String,
    pub serial: Option<String>,
    pub alias: Option<String>,
}

impl DriveHint {
    pub fn with_serial(label: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            serial: Some(serial.into()),
            alias: None,
        }
    }

    pub fn with_alias(label: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            serial: None,
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    pub id: Uuid,
    pub identity: DriveIdentity,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_scanned: Option<DateTime<Utc>>,
    pub entry_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    InProgress,
    /// The drive's current, searchable generation
    Committed,
    /// Retired by a newer commit; kept for audit until pruned
    Superseded,
    Aborted,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::InProgress => "in_progress",
            GenerationStatus::Committed => "committed",
            GenerationStatus::Superseded => "superseded",
            GenerationStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(GenerationStatus::InProgress),
            "committed" => Some(GenerationStatus::Committed),
            "superseded" => Some(GenerationStatus::Superseded),
            "aborted" => Some(GenerationStatus::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scan session of one drive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanGeneration {
    pub id: i64,
    pub drive_id: Uuid,
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: GenerationStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Link => "link",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(EntryKind::File),
            "dir" | "directory" => Some(EntryKind::Directory),
            "link" => Some(EntryKind::Link),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file, directory or link beneath a drive root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Relative to the drive root, `/`-separated
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    /// Bytes; zero for directories and links
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Empty for top-level entries
    pub parent_path: String,
}

/// An [`Entry`] as persisted in a scan generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub drive_id: Uuid,
    pub generation_id: i64,
    #[serde(flatten)]
    pub entry: Entry,
}

/// Format a byte count the way listings show it: `512 B`, `1.50 KB`, ...
pub fn format_size(size_bytes: u64) -> String {
    if size_bytes < 1024 {
        return format!("{} B", size_bytes);
    }

    let mut size = size_bytes as f64;
    for unit in ["KB", "MB", "GB", "TB"] {
        size /= 1024.0;
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
    }
    format!("{:.2} PB", size / 1024.0)
}
