//! Crash journal written next to the store while a run is in flight.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Phase recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    /// Backup taken, steps not yet finished.
    Prepared,
    /// Scratch store is being swapped in.
    Committing,
    /// Swap completed; only sidecar cleanup remains.
    Committed,
}

/// Journal contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJournal {
    /// Journal format version.
    pub format: u32,
    /// Phase of the run.
    pub state: JournalState,
    /// Store version when the run started.
    pub from_version: u32,
    /// Version the run is migrating to.
    pub target_version: u32,
    /// Backup directory taken before the run.
    pub backup_path: PathBuf,
    /// Digest of the store when the backup was taken.
    pub backup_digest: String,
    /// When the run started (microseconds since epoch).
    pub created_at: i64,
}

impl MigrationJournal {
    /// Current journal format.
    pub const FORMAT: u32 = 1;

    /// Create a journal in the `Prepared` state.
    pub fn prepared(
        from_version: u32,
        target_version: u32,
        backup_path: PathBuf,
        backup_digest: String,
        created_at: i64,
    ) -> Self {
        Self {
            format: Self::FORMAT,
            state: JournalState::Prepared,
            from_version,
            target_version,
            backup_path,
            backup_digest,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&JournalState::Committing).unwrap();
        assert_eq!(json, "\"committing\"");
    }

    #[test]
    fn test_journal_json() {
        let journal = MigrationJournal::prepared(45, 46, PathBuf::from("/tmp/b"), "ab".into(), 7);
        let json = serde_json::to_string_pretty(&journal).unwrap();
        let back: MigrationJournal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, journal);
        assert_eq!(back.state, JournalState::Prepared);
    }
}
