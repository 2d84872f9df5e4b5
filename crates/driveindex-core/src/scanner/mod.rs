//! Filesystem scanning: per-node metadata extraction and lazy tree walking.
//!
//! Nothing in here touches the catalog. The walker yields entries one at a
//! time so callers can batch them into the store without holding a whole
//! drive in memory.

pub mod metadata;
pub mod walker;

pub use metadata::extract;
pub use walker::{TreeWalker, WalkOptions};
