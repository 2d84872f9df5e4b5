/// Metadata extraction for a single filesystem node
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Component, Path};

use crate::error::AccessError;
use crate::{Entry, EntryKind};

/// Read the entry for `path`, a node somewhere beneath the drive `root`.
///
/// Symbolic links are reported as [`EntryKind::Link`] and never followed.
pub fn extract(root: &Path, path: &Path) -> Result<Entry, AccessError> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| AccessError::new(path, e))?;
    entry_from_metadata(root, path, &metadata)
}

/// Build an entry from metadata the caller already holds (the walker gets
/// it from the directory listing).
pub(crate) fn entry_from_metadata(
    root: &Path,
    path: &Path,
    metadata: &Metadata,
) -> Result<Entry, AccessError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| AccessError::new(path, format!("not beneath {}", root.display())))?;

    // A lossy conversion would let two distinct names collide on one path
    let mut components: Vec<String> = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            let part = part
                .to_str()
                .ok_or_else(|| AccessError::new(path, "name is not valid UTF-8"))?;
            components.push(part.to_string());
        }
    }

    let Some((name, parents)) = components.split_last() else {
        return Err(AccessError::new(path, "drive root has no entry"));
    };

    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Link
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };

    let size = match kind {
        EntryKind::File => metadata.len(),
        EntryKind::Directory | EntryKind::Link => 0,
    };

    // Some filesystems (and some FUSE drivers) do not report mtimes
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    Ok(Entry {
        path: components.join("/"),
        name: name.clone(),
        kind,
        size,
        modified,
        parent_path: parents.join("/"),
    })
}
