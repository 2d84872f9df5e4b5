/// Name search over the catalog
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::catalog::{IndexStore, NameQuery};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::{Drive, EntryKind, StoredEntry};

/// How much of an entry name the pattern has to cover.
///
/// Each mode also accepts the stricter ones: a prefix search returns
/// exact matches too, a substring search returns everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    Prefix,
    #[default]
    Substring,
}

impl MatchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(MatchMode::Exact),
            "prefix" => Some(MatchMode::Prefix),
            "substring" => Some(MatchMode::Substring),
            _ => None,
        }
    }
}

/// How well a hit matched; lower sorts first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    Prefix,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub pattern: String,
    pub mode: MatchMode,
    pub kind: Option<EntryKind>,
    pub limit: usize,
    pub offset: usize,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            pattern: pattern.into(),
            mode,
            kind: None,
            limit: 50,
            offset: 0,
        }
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// One search result, annotated with the drive that holds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub drive_id: Uuid,
    pub drive_label: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub tier: MatchTier,
}

pub struct SearchEngine<'a> {
    store: &'a IndexStore,
    max_limit: usize,
}

impl<'a> SearchEngine<'a> {
    pub fn new(store: &'a IndexStore, config: &IndexConfig) -> Self {
        Self {
            store,
            max_limit: config.max_search_limit,
        }
    }

    /// Ranked, paginated search over the current generation of every
    /// drive. Identical queries always return identical pages.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let pattern = query.pattern.trim();
        if pattern.is_empty() {
            return Err(Error::InvalidQuery("search pattern is empty".to_string()));
        }

        let folded = fold_name(pattern);
        let name_query = NameQuery {
            pattern: folded.clone(),
            mode: query.mode,
            kind: query.kind,
            limit: Some(query.limit.min(self.max_limit)),
            offset: query.offset,
        };

        let hits: Vec<SearchHit> = self
            .store
            .find_by_name(&name_query)?
            .into_iter()
            .map(|(drive, entry)| to_hit(&folded, drive, entry))
            .collect();

        tracing::debug!(
            "Search '{}' ({:?}) returned {} hit(s)",
            pattern,
            query.mode,
            hits.len()
        );
        Ok(hits)
    }
}

/// Folding shared by indexing and querying. HFS+ stores names decomposed
/// (NFD) while keyboards produce composed text, so both sides are brought
/// to NFC before lowercasing.
pub(crate) fn fold_name(name: &str) -> String {
    name.nfc().collect::<String>().to_lowercase()
}

fn to_hit(folded_pattern: &str, drive: Drive, stored: StoredEntry) -> SearchHit {
    let name = fold_name(&stored.entry.name);
    let tier = if name == folded_pattern {
        MatchTier::Exact
    } else if name.starts_with(folded_pattern) {
        MatchTier::Prefix
    } else {
        MatchTier::Substring
    };

    SearchHit {
        drive_id: drive.id,
        drive_label: drive.label,
        path: stored.entry.path,
        kind: stored.entry.kind,
        size: stored.entry.size,
        modified: stored.entry.modified,
        tier,
    }
}
