//! Catalog persistence module
//!
//! This module provides the SQLite-backed index of drives, their scan
//! generations and the entries each generation recorded, so drives can be
//! searched while they are not connected.

pub mod database;
pub mod registry;

// Re-export main types
pub use database::{ChangeKind, DiffCounts, IndexStore, NameQuery};
pub use registry::DriveRegistry;
