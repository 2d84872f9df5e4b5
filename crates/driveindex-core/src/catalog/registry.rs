//! Drive identity resolution

use uuid::Uuid;

use super::database::IndexStore;
use crate::error::Result;
use crate::{Drive, DriveHint, DriveIdentity};

/// Maps drive identities to catalog drives.
///
/// Matching is exact on the stable key. Two drives that merely share a
/// label are never merged.
pub struct DriveRegistry<'a> {
    store: &'a IndexStore,
}

impl<'a> DriveRegistry<'a> {
    pub fn new(store: &'a IndexStore) -> Self {
        Self { store }
    }

    pub fn lookup(&self, identity: &DriveIdentity) -> Result<Option<Drive>> {
        self.store.drive_by_identity(identity)
    }

    /// Register a drive. Registering an identity twice returns the drive
    /// created the first time.
    pub fn register(&self, identity: &DriveIdentity, label: &str) -> Result<Drive> {
        self.store.insert_drive(identity, label)
    }

    /// Find the drive a hint refers to, registering it on first sight.
    ///
    /// Fails with [`Error::AmbiguousDrive`](crate::Error::AmbiguousDrive)
    /// when the hint carries neither a serial nor an alias. The mount path
    /// plays no part, so a drive mounted somewhere new still resolves to
    /// its existing record.
    pub fn resolve(&self, hint: &DriveHint) -> Result<Drive> {
        let identity = DriveIdentity::from_hint(hint)?;

        if let Some(drive) = self.lookup(&identity)? {
            tracing::debug!("Resolved {} to drive {}", identity, drive.id);
            return Ok(drive);
        }

        let label = match (&identity, hint.label.trim()) {
            (DriveIdentity::Alias { alias }, "") => alias.clone(),
            (_, label) => label.to_string(),
        };
        self.register(&identity, &label)
    }

    pub fn find(&self, id_or_prefix: &str) -> Result<Drive> {
        self.store.find_drive(id_or_prefix)
    }

    pub fn list(&self) -> Result<Vec<Drive>> {
        self.store.list_drives()
    }

    /// Change the human label; the identity stays as registered
    pub fn relabel(&self, drive_id: Uuid, label: &str) -> Result<()> {
        self.store.relabel_drive(drive_id, label)
    }

    /// Forget a drive and everything indexed from it
    pub fn remove(&self, drive_id: Uuid) -> Result<()> {
        self.store.remove_drive(drive_id)
    }
}
