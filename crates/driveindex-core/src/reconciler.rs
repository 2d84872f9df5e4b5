/// Scan sessions: walk a drive, stage its entries as a new generation and
/// swap that generation in atomically
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::catalog::{DriveRegistry, IndexStore};
use crate::config::IndexConfig;
use crate::error::{AccessError, Error, Result};
use crate::scanner::TreeWalker;
use crate::{Drive, DriveHint, Entry, ScanGeneration};

type WalkItem = std::result::Result<Entry, AccessError>;

/// Outcome of a committed scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub drive: Drive,
    pub generation: ScanGeneration,
    /// The generation this scan replaced, if the drive had one
    pub previous_generation: Option<i64>,
    pub added: u64,
    pub removed: u64,
    /// Same path as before, different kind, size or mtime
    pub modified: u64,
    pub unchanged: u64,
    pub entries_indexed: u64,
    /// Nodes that could not be read and were left out
    pub errors: Vec<AccessError>,
    /// Skipped nodes beyond `max_reported_errors`
    pub errors_omitted: u64,
    pub duration_ms: u64,
}

impl ScanReport {
    pub fn has_changes(&self) -> bool {
        self.added + self.removed + self.modified > 0
    }

    pub fn skipped(&self) -> u64 {
        self.errors.len() as u64 + self.errors_omitted
    }
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub drive_label: String,
    pub entries_indexed: u64,
    pub errors: u64,
    pub last_path: Option<String>,
}

/// Shared flag for cancelling a running scan from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs scan sessions against one catalog
pub struct ScanReconciler<'a> {
    store: &'a IndexStore,
    config: &'a IndexConfig,
    cancel: CancelToken,
    progress_callback: Option<Box<dyn Fn(ScanProgress) + Send + Sync>>,
}

struct Ingested {
    entries: u64,
    errors: Vec<AccessError>,
    errors_omitted: u64,
}

impl Ingested {
    fn record_error(&mut self, err: AccessError, cap: usize) {
        if self.errors.len() < cap {
            self.errors.push(err);
        } else {
            self.errors_omitted += 1;
        }
    }

    fn skipped(&self) -> u64 {
        self.errors.len() as u64 + self.errors_omitted
    }
}

impl<'a> ScanReconciler<'a> {
    pub fn new(store: &'a IndexStore, config: &'a IndexConfig) -> Self {
        Self {
            store,
            config,
            cancel: CancelToken::new(),
            progress_callback: None,
        }
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Scan the drive mounted at `root` and make the result its current
    /// snapshot.
    ///
    /// Unreadable nodes are skipped and listed in the report. Anything that
    /// stops the generation from being completed (an unreadable root,
    /// storage failure, a stalled device, cancellation) aborts it and leaves
    /// the previous snapshot current.
    pub fn scan(&self, root: impl AsRef<Path>, hint: &DriveHint) -> Result<ScanReport> {
        let root = root.as_ref();
        let walk_root = root.to_path_buf();
        let options = self.config.walk_options();
        self.scan_from(root, hint, move || TreeWalker::new(walk_root, &options))
    }

    /// Run a scan session over whatever `source` yields for `root`. The
    /// source is built and drained on a separate thread.
    fn scan_from<S, I>(&self, root: &Path, hint: &DriveHint, source: S) -> Result<ScanReport>
    where
        S: FnOnce() -> I + Send + 'static,
        I: Iterator<Item = WalkItem>,
    {
        let start = Instant::now();
        if !root.is_dir() {
            return Err(Error::RootNotFound(root.to_path_buf()));
        }

        let drive = DriveRegistry::new(self.store).resolve(hint)?;
        tracing::info!("Starting scan of {} as drive {}", root.display(), drive.label);

        let generation = self.store.begin_generation(&drive)?;

        let report = match self.complete(root, &drive, &generation, source) {
            Ok(done) => done,
            Err(err) => {
                tracing::warn!(
                    "Scan of drive {} failed, keeping previous snapshot: {}",
                    drive.label,
                    err
                );
                if let Err(abort_err) = self.store.abort_generation(&generation) {
                    tracing::error!(
                        "Could not abort generation {}: {}",
                        generation.id,
                        abort_err
                    );
                } else {
                    self.forget_unscanned(&drive);
                }
                return Err(err);
            }
        };

        // Keeping at least one superseded generation keeps `previous_generation`
        // available to `changed_paths`
        if let Err(err) = self
            .store
            .prune_generations(drive.id, self.config.retain_generations.max(1))
        {
            tracing::warn!("Pruning old generations of {} failed: {}", drive.label, err);
        }

        // The commit already happened; a failed re-read must not turn it
        // into a reported failure.
        let drive = self.store.drive(drive.id).ok().flatten().unwrap_or(drive);

        let report = ScanReport {
            drive,
            duration_ms: start.elapsed().as_millis() as u64,
            ..report
        };

        tracing::info!(
            "Scan of {} committed: {} added, {} removed, {} modified, {} unchanged, {} skipped",
            report.drive.label,
            report.added,
            report.removed,
            report.modified,
            report.unchanged,
            report.skipped()
        );
        Ok(report)
    }

    /// Drives only exist once a scan of them has committed
    fn forget_unscanned(&self, drive: &Drive) {
        match self.store.current_generation(drive.id) {
            Ok(None) => {
                if let Err(err) = self.store.remove_drive(drive.id) {
                    tracing::warn!("Could not drop never-scanned drive {}: {}", drive.label, err);
                }
            }
            Ok(Some(_)) => {}
            Err(err) => tracing::warn!("Could not check drive {}: {}", drive.label, err),
        }
    }

    /// Everything between `begin_generation` and a successful commit
    fn complete<S, I>(
        &self,
        root: &Path,
        drive: &Drive,
        generation: &ScanGeneration,
        source: S,
    ) -> Result<ScanReport>
    where
        S: FnOnce() -> I + Send + 'static,
        I: Iterator<Item = WalkItem>,
    {
        let ingested = self.ingest(root, drive, generation, source)?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // The begin above guarantees nobody else moves the pointer meanwhile
        let previous = self.store.current_generation(drive.id)?.map(|g| g.id);
        let diff = self.store.diff_generations(previous, generation.id)?;
        let committed = self.store.commit_generation(generation)?;

        Ok(ScanReport {
            drive: drive.clone(),
            generation: committed,
            previous_generation: previous,
            added: diff.added,
            removed: diff.removed,
            modified: diff.modified,
            unchanged: diff.unchanged,
            entries_indexed: ingested.entries,
            errors: ingested.errors,
            errors_omitted: ingested.errors_omitted,
            duration_ms: 0,
        })
    }

    /// Stream the walk into the generation in batches.
    ///
    /// The channel is polled in short slices so the heartbeat stays fresh
    /// and cancellation is noticed while a slow device is still answering.
    fn ingest<S, I>(
        &self,
        root: &Path,
        drive: &Drive,
        generation: &ScanGeneration,
        source: S,
    ) -> Result<Ingested>
    where
        S: FnOnce() -> I + Send + 'static,
        I: Iterator<Item = WalkItem>,
    {
        let (tx, rx) = mpsc::sync_channel::<WalkItem>(self.config.channel_capacity);
        let cancel = self.cancel.clone();

        let walker = thread::Builder::new()
            .name("driveindex-walker".to_string())
            .spawn(move || {
                for item in source() {
                    // A closed channel means the scan was abandoned
                    if cancel.is_cancelled() || tx.send(item).is_err() {
                        break;
                    }
                }
            })?;

        let node_timeout = self.config.node_timeout();
        let heartbeat_every = self.config.heartbeat_interval();
        let tick = node_timeout.min(heartbeat_every);
        let mut waiting_since = Instant::now();
        let mut last_beat = Instant::now();

        let mut batch: Vec<Entry> = Vec::with_capacity(self.config.batch_size);
        let mut ingested = Ingested {
            entries: 0,
            errors: Vec::new(),
            errors_omitted: 0,
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match rx.recv_timeout(tick) {
                Ok(Ok(entry)) => {
                    waiting_since = Instant::now();
                    batch.push(entry);
                    if batch.len() >= self.config.batch_size {
                        self.flush(drive, generation, &mut batch, &mut ingested)?;
                        last_beat = Instant::now();
                    }
                }
                Ok(Err(access)) if access.path == root => {
                    // Nothing beneath the root can be trusted to be absent
                    return Err(Error::RootUnreadable {
                        path: access.path,
                        cause: access.cause,
                    });
                }
                Ok(Err(access)) => {
                    waiting_since = Instant::now();
                    ingested.record_error(access, self.config.max_reported_errors);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if waiting_since.elapsed() >= node_timeout {
                        // The walker thread stays blocked on the device; it is
                        // detached and exits once its next send fails.
                        return Err(Error::ScanStalled {
                            secs: self.config.node_timeout_secs,
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_beat.elapsed() >= heartbeat_every {
                self.store.touch_generation(generation)?;
                last_beat = Instant::now();
            }
        }

        if walker.join().is_err() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "walker thread panicked",
            )));
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.flush(drive, generation, &mut batch, &mut ingested)?;
        Ok(ingested)
    }

    fn flush(
        &self,
        drive: &Drive,
        generation: &ScanGeneration,
        batch: &mut Vec<Entry>,
        ingested: &mut Ingested,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let written = self.store.put_entries(generation, batch)?;
        ingested.entries += written as u64;
        let last_path = batch.last().map(|e| e.path.clone());
        batch.clear();

        if let Some(callback) = &self.progress_callback {
            callback(ScanProgress {
                drive_label: drive.label.clone(),
                entries_indexed: ingested.entries,
                errors: ingested.skipped(),
                last_path,
            });
        }
        Ok(())
    }
}
