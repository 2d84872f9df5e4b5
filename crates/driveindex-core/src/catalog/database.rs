//! SQLite catalog of drives, scan generations and their entries

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::search::{fold_name, MatchMode};
use crate::{Drive, DriveIdentity, Entry, EntryKind, GenerationStatus, ScanGeneration, StoredEntry};

const SCHEMA_VERSION: i64 = 1;

const DRIVE_COLUMNS: &str =
    "d.id, d.identity_json, d.label, d.first_seen, d.last_scanned, d.entry_count";
const DRIVE_COLUMN_COUNT: usize = 6;

const ENTRY_COLUMNS: &str =
    "g.drive_id, e.generation_id, e.path, e.name, e.kind, e.size, e.modified_at, e.parent_path";

const GENERATION_COLUMNS: &str = "id, drive_id, number, started_at, completed_at, status";

/// `n` is the newer generation's row, `p` the older one's, same path.
/// Directory mtimes move whenever a child is added or removed, which the
/// diff already counts, so they are not compared.
const CHANGED_PREDICATE: &str = "(n.kind <> p.kind \
     OR (n.kind <> 'dir' AND (n.size <> p.size OR n.modified_at IS NOT p.modified_at)))";

/// Persistent catalog. One instance per catalog file; share it between
/// threads behind an `Arc`.
pub struct IndexStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    stale_after: Duration,
}

/// Name lookup over the current generation of every drive
#[derive(Debug, Clone)]
pub struct NameQuery {
    pub pattern: String,
    pub mode: MatchMode,
    pub kind: Option<EntryKind>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl NameQuery {
    pub fn new(pattern: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            pattern: pattern.into(),
            mode,
            kind: None,
            limit: None,
            offset: 0,
        }
    }
}

/// Structural differences between two generations of one drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub added: u64,
    pub removed: u64,
    pub modified: u64,
    pub unchanged: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl IndexStore {
    /// Open or create a catalog at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        let store = Self::from_connection(conn, Some(db_path))?;
        tracing::debug!("Opened catalog at {}", store.describe());
        Ok(store)
    }

    /// Open the catalog a configuration points at
    pub fn open_with_config(config: &IndexConfig) -> Result<Self> {
        Ok(Self::open(&config.catalog_path)?.with_stale_scan_timeout(config.stale_scan_after()))
    }

    /// Catalog that lives only as long as this instance
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
            stale_after: Duration::from_secs(600),
        };
        store.configure_pragmas()?;
        store.initialize_schema()?;
        Ok(store)
    }

    /// How long an in-progress generation may go without a heartbeat
    /// before a new scan of the same drive treats it as abandoned.
    pub fn with_stale_scan_timeout(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Get the database file path (`None` for in-memory catalogs)
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn describe(&self) -> String {
        match &self.db_path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Initialize or migrate database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS drives (
                id TEXT PRIMARY KEY,
                identity_key TEXT NOT NULL UNIQUE,
                identity_json TEXT NOT NULL,
                label TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_scanned TEXT,
                entry_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS generations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                drive_id TEXT NOT NULL REFERENCES drives(id),
                number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                heartbeat_at TEXT NOT NULL,
                status TEXT NOT NULL,
                UNIQUE (drive_id, number)
            );

            CREATE INDEX IF NOT EXISTS idx_generations_drive_status
                ON generations(drive_id, status);

            CREATE TABLE IF NOT EXISTS entries (
                generation_id INTEGER NOT NULL REFERENCES generations(id),
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                name_folded TEXT NOT NULL,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL,
                modified_at TEXT,
                parent_path TEXT NOT NULL,
                PRIMARY KEY (generation_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_name
                ON entries(name_folded);

            CREATE TABLE IF NOT EXISTS current_generation (
                drive_id TEXT PRIMARY KEY REFERENCES drives(id),
                generation_id INTEGER NOT NULL UNIQUE REFERENCES generations(id)
            );
            "#,
        )?;

        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        }
        tracing::debug!("Catalog schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    // ----------------------------------------------------------------
    // Drives
    // ----------------------------------------------------------------

    /// Insert a drive for `identity`, or return the one already registered
    /// under the same stable key.
    pub fn insert_drive(&self, identity: &DriveIdentity, label: &str) -> Result<Drive> {
        let identity_json = serde_json::to_string(identity)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            r#"
            INSERT INTO drives (id, identity_key, identity_json, label, first_seen, entry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(identity_key) DO NOTHING
            "#,
            params![
                Uuid::new_v4().to_string(),
                identity.stable_key(),
                identity_json,
                label,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let drive = tx.query_row(
            &format!("SELECT {} FROM drives d WHERE d.identity_key = ?1", DRIVE_COLUMNS),
            [identity.stable_key()],
            |row| drive_from_row(row, 0),
        )?;
        tx.commit()?;

        if inserted > 0 {
            tracing::info!("Registered drive {} as {}", drive.label, drive.id);
        }
        Ok(drive)
    }

    pub fn drive_by_identity(&self, identity: &DriveIdentity) -> Result<Option<Drive>> {
        let conn = self.conn()?;
        let drive = conn
            .query_row(
                &format!("SELECT {} FROM drives d WHERE d.identity_key = ?1", DRIVE_COLUMNS),
                [identity.stable_key()],
                |row| drive_from_row(row, 0),
            )
            .optional()?;
        Ok(drive)
    }

    pub fn drive(&self, id: Uuid) -> Result<Option<Drive>> {
        let conn = self.conn()?;
        let drive = conn
            .query_row(
                &format!("SELECT {} FROM drives d WHERE d.id = ?1", DRIVE_COLUMNS),
                [id.to_string()],
                |row| drive_from_row(row, 0),
            )
            .optional()?;
        Ok(drive)
    }

    /// Find a drive by full id or unique id prefix
    pub fn find_drive(&self, id: &str) -> Result<Drive> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM drives d WHERE d.id = ?1 OR d.id LIKE ?2 ORDER BY d.id LIMIT 2",
            DRIVE_COLUMNS
        ))?;
        let prefix = format!("{}%", id.replace(['%', '_'], ""));
        let mut matches = stmt
            .query_map(params![id, prefix], |row| drive_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if let Some(exact) = matches.iter().position(|d| d.id.to_string() == id) {
            return Ok(matches.swap_remove(exact));
        }
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::DriveNotFound(id.to_string())),
            _ => Err(Error::DriveNotFound(format!("'{}' matches more than one drive", id))),
        }
    }

    /// All drives, connected or not, ordered by label
    pub fn list_drives(&self) -> Result<Vec<Drive>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM drives d ORDER BY d.label, d.id",
            DRIVE_COLUMNS
        ))?;
        let drives = stmt
            .query_map([], |row| drive_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(drives)
    }

    pub fn relabel_drive(&self, id: Uuid, label: &str) -> Result<()> {
        let rows = self.conn()?.execute(
            "UPDATE drives SET label = ?2 WHERE id = ?1",
            params![id.to_string(), label],
        )?;
        if rows == 0 {
            return Err(Error::DriveNotFound(id.to_string()));
        }
        tracing::info!("Relabelled drive {} to {}", id, label);
        Ok(())
    }

    /// Delete a drive with every generation and entry it owns
    pub fn remove_drive(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id_str = id.to_string();

        tx.execute("DELETE FROM current_generation WHERE drive_id = ?1", [&id_str])?;
        tx.execute(
            "DELETE FROM entries WHERE generation_id IN \
             (SELECT id FROM generations WHERE drive_id = ?1)",
            [&id_str],
        )?;
        tx.execute("DELETE FROM generations WHERE drive_id = ?1", [&id_str])?;
        let rows = tx.execute("DELETE FROM drives WHERE id = ?1", [&id_str])?;
        if rows == 0 {
            return Err(Error::DriveNotFound(id_str));
        }
        tx.commit()?;

        tracing::info!("Removed drive {} from the catalog", id);
        Ok(())
    }

    // ----------------------------------------------------------------
    // Generations
    // ----------------------------------------------------------------

    /// Start a new in-progress generation for `drive`.
    ///
    /// Fails with [`Error::ScanInProgress`] while another generation of the
    /// same drive is still being written. In-progress generations whose
    /// heartbeat is older than the stale timeout are aborted first.
    pub fn begin_generation(&self, drive: &Drive) -> Result<ScanGeneration> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let drive_id = drive.id.to_string();
        let now = Utc::now();

        let open: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, heartbeat_at FROM generations WHERE drive_id = ?1 AND status = ?2",
            )?;
            let rows = stmt
                .query_map(params![drive_id, GenerationStatus::InProgress.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (generation_id, heartbeat) in open {
            let heartbeat = parse_time(1, heartbeat)?;
            let stale = match (now - heartbeat).to_std() {
                Ok(age) => age > self.stale_after,
                Err(_) => false,
            };
            if !stale {
                return Err(Error::ScanInProgress {
                    drive: drive.label.clone(),
                });
            }
            tracing::warn!(
                "Aborting generation {} of drive {}: no heartbeat since {}",
                generation_id,
                drive.label,
                heartbeat.to_rfc3339()
            );
            mark_aborted(&tx, generation_id, now)?;
        }

        let number: u32 = tx.query_row(
            "SELECT COALESCE(MAX(number), 0) + 1 FROM generations WHERE drive_id = ?1",
            [&drive_id],
            |row| row.get(0),
        )?;
        tx.execute(
            r#"
            INSERT INTO generations (drive_id, number, started_at, heartbeat_at, status)
            VALUES (?1, ?2, ?3, ?3, ?4)
            "#,
            params![
                drive_id,
                number,
                now.to_rfc3339(),
                GenerationStatus::InProgress.as_str()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::debug!("Began generation {} (#{}) for drive {}", id, number, drive.label);
        Ok(ScanGeneration {
            id,
            drive_id: drive.id,
            number,
            started_at: now,
            completed_at: None,
            status: GenerationStatus::InProgress,
        })
    }

    /// Append entries to an in-progress generation.
    ///
    /// Writing the same path twice keeps the last write.
    pub fn put_entries(&self, generation: &ScanGeneration, entries: &[Entry]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        require_in_progress(&tx, generation.id)?;

        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR REPLACE INTO entries (
                    generation_id, path, name, name_folded, kind, size, modified_at, parent_path
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for entry in entries {
                stmt.execute(params![
                    generation.id,
                    entry.path,
                    entry.name,
                    fold_name(&entry.name),
                    entry.kind.as_str(),
                    entry.size as i64,
                    entry.modified.map(format_time_precise),
                    entry.parent_path,
                ])?;
            }
        }

        tx.execute(
            "UPDATE generations SET heartbeat_at = ?2 WHERE id = ?1",
            params![generation.id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        tracing::debug!("Wrote {} entries to generation {}", entries.len(), generation.id);
        Ok(entries.len())
    }

    /// Refresh the heartbeat of an in-progress generation so a concurrent
    /// begin does not take it for abandoned.
    pub fn touch_generation(&self, generation: &ScanGeneration) -> Result<()> {
        let conn = self.conn()?;
        require_in_progress(&conn, generation.id)?;
        conn.execute(
            "UPDATE generations SET heartbeat_at = ?2 WHERE id = ?1",
            params![generation.id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Make `generation` the drive's current generation.
    ///
    /// The previous current generation becomes superseded and the pointer
    /// flips in the same transaction, so readers see either the old
    /// snapshot or the new one.
    pub fn commit_generation(&self, generation: &ScanGeneration) -> Result<ScanGeneration> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_in_progress(&tx, generation.id)?;

        let drive_id = generation.drive_id.to_string();
        let now = Utc::now();
        let entry_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM entries WHERE generation_id = ?1",
            [generation.id],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"
            UPDATE generations SET status = ?2
            WHERE id = (SELECT generation_id FROM current_generation WHERE drive_id = ?1)
            "#,
            params![drive_id, GenerationStatus::Superseded.as_str()],
        )?;
        tx.execute(
            "UPDATE generations SET status = ?2, completed_at = ?3 WHERE id = ?1",
            params![
                generation.id,
                GenerationStatus::Committed.as_str(),
                now.to_rfc3339()
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO current_generation (drive_id, generation_id) VALUES (?1, ?2)
            ON CONFLICT(drive_id) DO UPDATE SET generation_id = excluded.generation_id
            "#,
            params![drive_id, generation.id],
        )?;
        tx.execute(
            "UPDATE drives SET last_scanned = ?2, entry_count = ?3 WHERE id = ?1",
            params![drive_id, now.to_rfc3339(), entry_count],
        )?;
        tx.commit()?;

        tracing::info!(
            "Committed generation #{} of drive {} ({} entries)",
            generation.number,
            generation.drive_id,
            entry_count
        );
        Ok(ScanGeneration {
            completed_at: Some(now),
            status: GenerationStatus::Committed,
            ..generation.clone()
        })
    }

    /// Abandon an in-progress generation and drop its entries.
    /// Aborting an already aborted generation is a no-op.
    pub fn abort_generation(&self, generation: &ScanGeneration) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        match generation_status(&tx, generation.id)? {
            GenerationStatus::InProgress => {}
            GenerationStatus::Aborted => return Ok(()),
            status => {
                return Err(Error::GenerationState {
                    generation: generation.id,
                    status,
                })
            }
        }

        mark_aborted(&tx, generation.id, Utc::now())?;
        tx.commit()?;

        tracing::info!(
            "Aborted generation #{} of drive {}",
            generation.number,
            generation.drive_id
        );
        Ok(())
    }

    pub fn generation(&self, id: i64) -> Result<Option<ScanGeneration>> {
        let conn = self.conn()?;
        let generation = conn
            .query_row(
                &format!("SELECT {} FROM generations WHERE id = ?1", GENERATION_COLUMNS),
                [id],
                generation_from_row,
            )
            .optional()?;
        Ok(generation)
    }

    pub fn current_generation(&self, drive_id: Uuid) -> Result<Option<ScanGeneration>> {
        let conn = self.conn()?;
        let generation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM generations \
                     WHERE id = (SELECT generation_id FROM current_generation WHERE drive_id = ?1)",
                    GENERATION_COLUMNS
                ),
                [drive_id.to_string()],
                generation_from_row,
            )
            .optional()?;
        Ok(generation)
    }

    /// Every retained generation of a drive, oldest first
    pub fn list_generations(&self, drive_id: Uuid) -> Result<Vec<ScanGeneration>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM generations WHERE drive_id = ?1 ORDER BY number",
            GENERATION_COLUMNS
        ))?;
        let generations = stmt
            .query_map([drive_id.to_string()], generation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(generations)
    }

    /// Delete aborted generations and all but the `keep_superseded` most
    /// recent superseded generations of a drive. Returns how many
    /// generations were removed.
    pub fn prune_generations(&self, drive_id: Uuid, keep_superseded: usize) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let drive_id_str = drive_id.to_string();

        let doomed: Vec<i64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, status FROM generations
                WHERE drive_id = ?1 AND status IN (?2, ?3)
                ORDER BY number DESC
                "#,
            )?;
            let rows = stmt
                .query_map(
                    params![
                        drive_id_str,
                        GenerationStatus::Superseded.as_str(),
                        GenerationStatus::Aborted.as_str()
                    ],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut kept = 0usize;
            rows.into_iter()
                .filter_map(|(id, status)| {
                    if status == GenerationStatus::Superseded.as_str() && kept < keep_superseded {
                        kept += 1;
                        None
                    } else {
                        Some(id)
                    }
                })
                .collect()
        };

        for generation_id in &doomed {
            tx.execute("DELETE FROM entries WHERE generation_id = ?1", [generation_id])?;
            tx.execute("DELETE FROM generations WHERE id = ?1", [generation_id])?;
        }
        tx.commit()?;

        if !doomed.is_empty() {
            tracing::info!(
                "Pruned {} old generation(s) of drive {}",
                doomed.len(),
                drive_id
            );
        }
        Ok(doomed.len())
    }

    // ----------------------------------------------------------------
    // Entries
    // ----------------------------------------------------------------

    /// Entries of the drive's current generation ordered by path.
    ///
    /// `path_prefix` selects one directory and everything beneath it; it
    /// matches whole path components.
    pub fn get_current_entries(
        &self,
        drive_id: Uuid,
        path_prefix: Option<&str>,
    ) -> Result<Vec<StoredEntry>> {
        let prefix = path_prefix.map(|p| p.trim_matches('/')).unwrap_or("");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM current_generation c
            JOIN generations g ON g.id = c.generation_id
            JOIN entries e ON e.generation_id = c.generation_id
            WHERE c.drive_id = ?1
              AND (?2 = '' OR e.path = ?2 OR substr(e.path, 1, ?3) = ?4)
            ORDER BY e.path
            "#,
            ENTRY_COLUMNS
        ))?;

        let child_prefix = format!("{}/", prefix);
        let entries = stmt
            .query_map(
                params![
                    drive_id.to_string(),
                    prefix,
                    child_prefix.chars().count() as i64,
                    child_prefix
                ],
                |row| entry_from_row(row, 0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Entries of any generation ordered by path, regardless of status
    pub fn generation_entries(&self, generation_id: i64) -> Result<Vec<StoredEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}
            FROM entries e
            JOIN generations g ON g.id = e.generation_id
            WHERE e.generation_id = ?1
            ORDER BY e.path
            "#,
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([generation_id], |row| entry_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Case-insensitive name search across the current generation of every
    /// drive.
    ///
    /// Results are ordered exact match first, then prefix, then substring;
    /// ties go to the shorter path, then the lexicographically smaller path,
    /// drive label and drive id. The order is total, so paging through it
    /// with `limit`/`offset` is stable.
    pub fn find_by_name(&self, query: &NameQuery) -> Result<Vec<(Drive, StoredEntry)>> {
        let pattern = fold_name(&query.pattern);
        let mode_clause = match query.mode {
            MatchMode::Exact => "e.name_folded = ?1",
            MatchMode::Prefix => "substr(e.name_folded, 1, ?2) = ?1",
            MatchMode::Substring => "instr(e.name_folded, ?1) > 0",
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {drive_columns}, {entry_columns},
                CASE
                    WHEN e.name_folded = ?1 THEN 0
                    WHEN substr(e.name_folded, 1, ?2) = ?1 THEN 1
                    ELSE 2
                END AS tier
            FROM current_generation c
            JOIN drives d ON d.id = c.drive_id
            JOIN generations g ON g.id = c.generation_id
            JOIN entries e ON e.generation_id = c.generation_id
            WHERE {mode_clause}
              AND (?3 IS NULL OR e.kind = ?3)
            ORDER BY tier, length(e.path), e.path, d.label, d.id
            LIMIT ?4 OFFSET ?5
            "#,
            drive_columns = DRIVE_COLUMNS,
            entry_columns = ENTRY_COLUMNS,
            mode_clause = mode_clause,
        ))?;

        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let hits = stmt
            .query_map(
                params![
                    pattern,
                    pattern.chars().count() as i64,
                    query.kind.map(|k| k.as_str()),
                    limit,
                    query.offset as i64,
                ],
                |row| {
                    let drive = drive_from_row(row, 0)?;
                    let entry = entry_from_row(row, DRIVE_COLUMN_COUNT)?;
                    Ok((drive, entry))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    /// Count structural changes from `previous` to `next`. With no previous
    /// generation every entry of `next` counts as added.
    pub fn diff_generations(&self, previous: Option<i64>, next: i64) -> Result<DiffCounts> {
        let conn = self.conn()?;

        let Some(previous) = previous else {
            let added: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE generation_id = ?1",
                [next],
                |row| row.get(0),
            )?;
            return Ok(DiffCounts {
                added: added as u64,
                ..Default::default()
            });
        };

        let (added, removed, modified, common): (i64, i64, i64, i64) = conn.query_row(
            &format!(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM entries n WHERE n.generation_id = ?2
                        AND NOT EXISTS (SELECT 1 FROM entries p
                                        WHERE p.generation_id = ?1 AND p.path = n.path)),
                    (SELECT COUNT(*) FROM entries p WHERE p.generation_id = ?1
                        AND NOT EXISTS (SELECT 1 FROM entries n
                                        WHERE n.generation_id = ?2 AND n.path = p.path)),
                    (SELECT COUNT(*) FROM entries n
                        JOIN entries p ON p.generation_id = ?1 AND p.path = n.path
                        WHERE n.generation_id = ?2 AND {changed}),
                    (SELECT COUNT(*) FROM entries n
                        JOIN entries p ON p.generation_id = ?1 AND p.path = n.path
                        WHERE n.generation_id = ?2)
                "#,
                changed = CHANGED_PREDICATE
            ),
            params![previous, next],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(DiffCounts {
            added: added as u64,
            removed: removed as u64,
            modified: modified as u64,
            unchanged: (common - modified) as u64,
        })
    }

    /// Paths behind one bucket of [`diff_generations`](Self::diff_generations),
    /// ordered by path.
    pub fn changed_paths(
        &self,
        previous: Option<i64>,
        next: i64,
        change: ChangeKind,
        limit: usize,
    ) -> Result<Vec<String>> {
        // A missing previous generation never matches any row
        let previous = previous.unwrap_or(-1);
        let sql = match change {
            ChangeKind::Added => "SELECT n.path FROM entries n WHERE n.generation_id = ?2 \
                 AND NOT EXISTS (SELECT 1 FROM entries p WHERE p.generation_id = ?1 AND p.path = n.path) \
                 ORDER BY n.path LIMIT ?3"
                .to_string(),
            ChangeKind::Removed => "SELECT p.path FROM entries p WHERE p.generation_id = ?1 \
                 AND NOT EXISTS (SELECT 1 FROM entries n WHERE n.generation_id = ?2 AND n.path = p.path) \
                 ORDER BY p.path LIMIT ?3"
                .to_string(),
            ChangeKind::Modified => format!(
                "SELECT n.path FROM entries n \
                 JOIN entries p ON p.generation_id = ?1 AND p.path = n.path \
                 WHERE n.generation_id = ?2 AND {} ORDER BY n.path LIMIT ?3",
                CHANGED_PREDICATE
            ),
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let paths = stmt
            .query_map(params![previous, next, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
    }

    /// Get the count of drives in the catalog
    pub fn count_drives(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM drives", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn require_in_progress(conn: &Connection, generation_id: i64) -> Result<()> {
    match generation_status(conn, generation_id)? {
        GenerationStatus::InProgress => Ok(()),
        status => Err(Error::GenerationState {
            generation: generation_id,
            status,
        }),
    }
}

fn generation_status(conn: &Connection, generation_id: i64) -> Result<GenerationStatus> {
    let status: String = conn.query_row(
        "SELECT status FROM generations WHERE id = ?1",
        [generation_id],
        |row| row.get(0),
    )?;
    GenerationStatus::parse(&status).ok_or_else(|| Error::Storage(conversion_error(0, status)))
}

fn mark_aborted(conn: &Connection, generation_id: i64, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE generations SET status = ?2, completed_at = ?3 WHERE id = ?1",
        params![generation_id, GenerationStatus::Aborted.as_str(), at.to_rfc3339()],
    )?;
    conn.execute("DELETE FROM entries WHERE generation_id = ?1", [generation_id])?;
    Ok(())
}

/// Entry mtimes keep full precision so an untouched file compares equal
/// across scans.
fn format_time_precise(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: usize, detail: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, detail.to_string().into())
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("invalid timestamp '{}': {}", raw, e)))
}

fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, format!("invalid UUID '{}': {}", raw, e)))
}

fn drive_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Drive> {
    let identity_json: String = row.get(offset + 1)?;
    let identity: DriveIdentity = serde_json::from_str(&identity_json)
        .map_err(|e| conversion_error(offset + 1, e))?;
    let last_scanned: Option<String> = row.get(offset + 4)?;
    let entry_count: i64 = row.get(offset + 5)?;

    Ok(Drive {
        id: parse_uuid(offset, row.get(offset)?)?,
        identity,
        label: row.get(offset + 2)?,
        first_seen: parse_time(offset + 3, row.get(offset + 3)?)?,
        last_scanned: last_scanned
            .map(|raw| parse_time(offset + 4, raw))
            .transpose()?,
        entry_count: entry_count as u64,
    })
}

fn entry_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<StoredEntry> {
    let kind: String = row.get(offset + 4)?;
    let size: i64 = row.get(offset + 5)?;
    let modified: Option<String> = row.get(offset + 6)?;

    Ok(StoredEntry {
        drive_id: parse_uuid(offset, row.get(offset)?)?,
        generation_id: row.get(offset + 1)?,
        entry: Entry {
            path: row.get(offset + 2)?,
            name: row.get(offset + 3)?,
            kind: EntryKind::parse(&kind)
                .ok_or_else(|| conversion_error(offset + 4, format!("unknown kind '{}'", kind)))?,
            size: size as u64,
            modified: modified.map(|raw| parse_time(offset + 6, raw)).transpose()?,
            parent_path: row.get(offset + 7)?,
        },
    })
}

fn generation_from_row(row: &Row<'_>) -> rusqlite::Result<ScanGeneration> {
    let completed_at: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;

    Ok(ScanGeneration {
        id: row.get(0)?,
        drive_id: parse_uuid(1, row.get(1)?)?,
        number: row.get(2)?,
        started_at: parse_time(3, row.get(3)?)?,
        completed_at: completed_at.map(|raw| parse_time(4, raw)).transpose()?,
        status: GenerationStatus::parse(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown status '{}'", status)))?,
    })
}
