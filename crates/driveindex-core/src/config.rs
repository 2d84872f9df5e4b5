//! Catalog and scan configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scanner::WalkOptions;

/// macOS writes these onto every volume it mounts
pub const DEFAULT_IGNORED_FILE_NAMES: &[&str] = &[".DS_Store", ".com.apple.timemachine.donotpresent"];

pub const DEFAULT_IGNORED_DIR_NAMES: &[&str] = &[".fseventsd"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// SQLite catalog file
    pub catalog_path: PathBuf,
    /// Entries written per `put_entries` call
    pub batch_size: usize,
    /// Bound of the walker → reconciler channel
    pub channel_capacity: usize,
    /// Longest wait for the walker to produce the next node
    pub node_timeout_secs: u64,
    /// In-progress generations without a heartbeat for this long are
    /// considered abandoned by a crashed scan
    pub stale_scan_secs: u64,
    /// Superseded generations kept per drive after each commit. At least
    /// one, so the generation a scan replaced survives for change listings
    pub retain_generations: usize,
    /// Skipped nodes listed in a scan report; the rest are only counted
    pub max_reported_errors: usize,
    pub max_search_limit: usize,
    pub ignored_file_names: Vec<String>,
    pub ignored_dir_names: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            catalog_path: Self::default_catalog_path()
                .unwrap_or_else(|| PathBuf::from("driveindex.db")),
            batch_size: 1000,
            channel_capacity: 4096,
            node_timeout_secs: 30,
            stale_scan_secs: 600,
            retain_generations: 2,
            max_reported_errors: 1000,
            max_search_limit: 1000,
            ignored_file_names: DEFAULT_IGNORED_FILE_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignored_dir_names: DEFAULT_IGNORED_DIR_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl IndexConfig {
    /// Default catalog location (~/.driveindex/catalog.db)
    pub fn default_catalog_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".driveindex").join("catalog.db"))
    }

    /// Default config file location (~/.driveindex/config.json)
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".driveindex").join("config.json"))
    }

    /// Catalog rooted at `path` with every other setting at its default
    pub fn with_catalog(path: impl Into<PathBuf>) -> Self {
        Self {
            catalog_path: path.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: IndexConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Load `path` if given, else the default config file if it exists,
    /// else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_config_path() {
                Some(default) if default.exists() => Self::load(default),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".to_string()));
        }
        if self.node_timeout_secs == 0 {
            return Err(Error::Config("node_timeout_secs must be at least 1".to_string()));
        }
        if self.stale_scan_secs == 0 {
            return Err(Error::Config("stale_scan_secs must be at least 1".to_string()));
        }
        if self.retain_generations == 0 {
            return Err(Error::Config("retain_generations must be at least 1".to_string()));
        }
        if self.max_search_limit == 0 {
            return Err(Error::Config("max_search_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn stale_scan_after(&self) -> Duration {
        Duration::from_secs(self.stale_scan_secs)
    }

    /// How often a running scan refreshes its heartbeat, independent of
    /// batch flushes
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_scan_after() / 4).max(Duration::from_millis(100))
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            ignored_file_names: self.ignored_file_names.clone(),
            ignored_dir_names: self.ignored_dir_names.clone(),
        }
    }
}
