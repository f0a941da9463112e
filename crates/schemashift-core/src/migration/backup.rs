//! Backup and rollback of the store of record.

use super::error::MigrationError;
use crate::storage::{JournalState, SnapshotHandle, StoreLocation};
use tracing::{info, warn};

/// Takes the pre-run snapshot and restores it on failure.
pub struct BackupManager<'a, L: StoreLocation> {
    location: &'a L,
    verify: bool,
}

impl<'a, L: StoreLocation> BackupManager<'a, L> {
    /// Manage backups of `location`. With `verify`, every restore is checked
    /// against the snapshot digest.
    pub fn new(location: &'a L, verify: bool) -> Self {
        Self { location, verify }
    }

    /// Copy the store of record aside.
    pub fn snapshot(&self, taken_at: i64) -> Result<SnapshotHandle, MigrationError> {
        let handle = self
            .location
            .snapshot(taken_at)
            .map_err(|e| MigrationError::store("taking backup", e))?;
        info!(location = %self.location.describe(), digest = %handle.digest(), "backup taken");
        Ok(handle)
    }

    /// Put the snapshot back in place, leaving the store byte-identical.
    pub fn restore(&self, handle: &SnapshotHandle) -> Result<(), MigrationError> {
        warn!(location = %self.location.describe(), "restoring backup");
        self.location
            .restore(handle)
            .map_err(|e| MigrationError::store("restoring backup", e))?;

        if self.verify {
            let digest = self
                .location
                .digest()
                .map_err(|e| MigrationError::store("digesting restored store", e))?;
            if digest != handle.digest() {
                return Err(MigrationError::store(
                    "verifying restored store",
                    crate::error::Error::InvalidData(format!(
                        "digest {} does not match backup digest {}",
                        digest,
                        handle.digest()
                    )),
                ));
            }
        }
        Ok(())
    }

    /// Delete a snapshot that is no longer needed.
    pub fn release(&self, handle: SnapshotHandle) -> Result<(), MigrationError> {
        self.location
            .release(handle)
            .map_err(|e| MigrationError::store("releasing backup", e))
    }

    /// Finish a run that died mid-flight, according to its journal.
    ///
    /// A run that never committed is rolled back from its backup; a committed
    /// run only has its sidecars cleaned up. Returns the journal state found,
    /// or `None` when there was nothing to reconcile.
    pub fn reconcile(&self) -> Result<Option<JournalState>, MigrationError> {
        let Some(journal) = self
            .location
            .read_journal()
            .map_err(|e| MigrationError::store("reading journal", e))?
        else {
            return Ok(None);
        };

        warn!(
            location = %self.location.describe(),
            state = ?journal.state,
            from = journal.from_version,
            target = journal.target_version,
            "reconciling interrupted migration"
        );

        let handle = SnapshotHandle::new(
            journal.backup_path.clone(),
            journal.backup_digest.clone(),
            journal.created_at,
        );
        if journal.state != JournalState::Committed {
            self.restore(&handle)?;
        }

        for version in journal.from_version.saturating_add(1)..=journal.target_version {
            self.location
                .discard_scratch(&version.to_string())
                .map_err(|e| MigrationError::store("discarding scratch store", e))?;
        }
        self.release(handle)?;
        self.location
            .clear_journal()
            .map_err(|e| MigrationError::store("clearing journal", e))?;
        Ok(Some(journal.state))
    }
}
