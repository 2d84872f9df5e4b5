/// Depth-first traversal of a drive, one entry at a time
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, FilterEntry, WalkDir};

use super::metadata::entry_from_metadata;
use crate::error::AccessError;
use crate::Entry;

/// Names to leave out of the index.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Files with these exact names are skipped
    pub ignored_file_names: Vec<String>,
    /// Directories with these exact names are skipped with their subtree
    pub ignored_dir_names: Vec<String>,
}

type EntryFilter = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Lazy, finite walk over everything beneath a root.
///
/// Parents come before their children; sibling order is whatever the
/// filesystem returns. A node that cannot be read is yielded as an `Err`
/// item and the walk carries on with the next node, so one unreadable
/// subtree never ends the sequence. Links are yielded but not descended
/// into. The root itself is not yielded.
///
/// The exception is the root: if it cannot be listed, the error is yielded
/// with the root as its path and the walk ends there. Directories whose own
/// entry cannot be built (unreadable metadata, a name that is not UTF-8) are
/// reported once and not descended into.
///
/// The walker cannot be rewound; create a new one to walk again.
pub struct TreeWalker {
    root: PathBuf,
    inner: FilterEntry<walkdir::IntoIter, EntryFilter>,
    finished: bool,
}

impl TreeWalker {
    pub fn new(root: impl AsRef<Path>, options: &WalkOptions) -> Self {
        let root = root.as_ref().to_path_buf();
        let ignored_files: HashSet<String> = options.ignored_file_names.iter().cloned().collect();
        let ignored_dirs: HashSet<String> = options.ignored_dir_names.iter().cloned().collect();

        let filter: EntryFilter = Box::new(move |entry: &DirEntry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                !ignored_dirs.contains(name.as_ref())
            } else {
                !ignored_files.contains(name.as_ref())
            }
        });

        let inner = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(filter);

        Self {
            root,
            inner,
            finished: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Iterator for TreeWalker {
    type Item = Result<Entry, AccessError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let dir_entry = match self.inner.next()? {
                Ok(dir_entry) => dir_entry,
                Err(err) => {
                    let at_root = err.depth() == 0;
                    let mut err = AccessError::from(err);
                    if at_root {
                        if err.path.as_os_str().is_empty() {
                            err.path = self.root.clone();
                        }
                        self.finished = true;
                        tracing::warn!("Cannot list drive root {}", err);
                    } else {
                        tracing::warn!("Skipping unreadable node {}", err);
                    }
                    return Some(Err(err));
                }
            };

            if dir_entry.depth() == 0 {
                continue;
            }

            let result = dir_entry
                .metadata()
                .map_err(AccessError::from)
                .and_then(|metadata| entry_from_metadata(&self.root, dir_entry.path(), &metadata));

            if let Err(err) = &result {
                tracing::warn!("Skipping node {}", err);
                if dir_entry.file_type().is_dir() {
                    self.inner.skip_current_dir();
                }
            }
            return Some(result);
        }
    }
}
