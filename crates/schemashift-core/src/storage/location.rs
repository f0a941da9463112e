//! Where a store lives: store-of-record, scratch stores, backups and sidecars.
//!
//! Sidecar layout for a store at `<dir>/<name>`:
//!
//! | Path | Purpose |
//! |------|---------|
//! | `<name>.migration.lock` | advisory single-run lock |
//! | `<name>.migration.journal.json` | crash journal |
//! | `<name>.migration.backup` | pre-run snapshot |
//! | `<name>.migration.scratch.<label>` | scratch stores under construction |
//! | `<name>.migration.restoring` | restore staging copy |
//! | `<name>.migration.retired` | store of record being replaced |

use super::{MigrationJournal, SledStore, StorageConfig, Store};
use crate::error::Error;
use crate::value::current_timestamp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Opaque handle to a pre-run snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    path: PathBuf,
    digest: String,
    taken_at: i64,
}

impl SnapshotHandle {
    /// Rebuild a handle, e.g. from a crash journal.
    pub fn new(path: impl Into<PathBuf>, digest: impl Into<String>, taken_at: i64) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
            taken_at,
        }
    }

    /// Where the snapshot lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content digest of the store at snapshot time.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// When the snapshot was taken (microseconds since epoch).
    pub fn taken_at(&self) -> i64 {
        self.taken_at
    }
}

/// Held for the whole run; releases the lock file on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Contents of the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: i64,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: current_timestamp(),
        }
    }
}

/// Create the lock file holding `record`. Returns false if it already exists.
///
/// The record is written to a private file first and hard-linked into place,
/// so the lock file never exists without its contents.
fn try_create_lock(path: &Path, record: &LockRecord) -> Result<bool, Error> {
    let staged = path.with_extension(format!("lock.{}.tmp", record.pid));
    let contents =
        serde_json::to_vec(record).map_err(|e| Error::Serialization(e.to_string()))?;
    fs::write(&staged, contents).map_err(|e| Error::io(&staged, e))?;

    let linked = fs::hard_link(&staged, path);
    let _ = fs::remove_file(&staged);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Whether the lock at `path` was left behind by a process that is gone.
fn lock_is_stale(path: &Path) -> Result<bool, Error> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(Error::io(path, e)),
    };
    match serde_json::from_slice::<LockRecord>(&contents) {
        Ok(record) => Ok(!pid_is_alive(record.pid)),
        Err(_) => Ok(true),
    }
}

/// Move a stale lock aside, keeping it for inspection.
fn archive_stale_lock(path: &Path) -> Result<(), Error> {
    let archived = path.with_extension(format!("lock.stale.{}", current_timestamp()));
    match fs::rename(path, &archived) {
        Ok(()) => {
            warn!(lock = %path.display(), archived = %archived.display(), "took over stale migration lock");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

/// Store lifecycle operations the orchestrator needs beyond row access.
///
/// Every method that replaces the store of record does so by directory
/// rename, so a reader never observes a half-written store. A swap is two
/// renames; between them the store-of-record path is absent. Readers that
/// hold the lock never see that window, and taking the lock puts back a store
/// left retired by a crash mid-swap. Callers must drop all open store handles
/// before promoting or restoring.
pub trait StoreLocation {
    /// Store type opened at this location.
    type Store: Store;

    /// Human-readable location used in logs.
    fn describe(&self) -> String;

    /// Whether a store of record exists.
    fn exists(&self) -> bool;

    /// Take the advisory single-run lock. A lock whose owning process is
    /// gone is taken over.
    fn lock(&self) -> Result<LockGuard, Error>;

    /// Open the store of record.
    fn open_record(&self) -> Result<Self::Store, Error>;

    /// Create a fresh, empty scratch store.
    fn create_scratch(&self, label: &str) -> Result<Self::Store, Error>;

    /// Delete a scratch store. Missing scratch stores are not an error.
    fn discard_scratch(&self, label: &str) -> Result<(), Error>;

    /// Replace the store of record with a scratch store.
    fn promote_scratch(&self, label: &str) -> Result<(), Error>;

    /// Content digest of the store of record.
    fn digest(&self) -> Result<String, Error>;

    /// Copy the store of record aside.
    fn snapshot(&self, taken_at: i64) -> Result<SnapshotHandle, Error>;

    /// Replace the store of record with the snapshot contents.
    fn restore(&self, handle: &SnapshotHandle) -> Result<(), Error>;

    /// Delete a snapshot that is no longer needed.
    fn release(&self, handle: SnapshotHandle) -> Result<(), Error>;

    /// Write or overwrite the crash journal.
    fn write_journal(&self, journal: &MigrationJournal) -> Result<(), Error>;

    /// Read the crash journal, if one exists.
    fn read_journal(&self) -> Result<Option<MigrationJournal>, Error>;

    /// Delete the crash journal.
    fn clear_journal(&self) -> Result<(), Error>;
}

/// A sled store directory and its sidecars.
#[derive(Debug, Clone)]
pub struct SledLocation {
    config: StorageConfig,
}

impl SledLocation {
    /// Location of the store described by `config`.
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Path of the store of record.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn sidecar(&self, suffix: &str) -> Result<PathBuf, Error> {
        let path = &self.config.path;
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidData(format!("invalid store path: {}", path.display())))?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::InvalidData("store path must be valid unicode".into()))?;
        Ok(parent.join(format!("{}.migration.{}", name, suffix)))
    }

    fn scratch_path(&self, label: &str) -> Result<PathBuf, Error> {
        self.sidecar(&format!("scratch.{}", label))
    }

    /// Move `incoming` into the store-of-record path, keeping the previous
    /// store until the swap has succeeded.
    fn swap_into_record(&self, incoming: &Path) -> Result<(), Error> {
        let record = &self.config.path;
        let retired = self.sidecar("retired")?;
        remove_dir_if_exists(&retired)?;

        let had_record = record.exists();
        if had_record {
            fs::rename(record, &retired).map_err(|e| Error::io(record, e))?;
        }
        if let Err(e) = fs::rename(incoming, record) {
            if had_record {
                if let Err(put_back) = fs::rename(&retired, record) {
                    error!(
                        record = %record.display(),
                        retired = %retired.display(),
                        error = %put_back,
                        "store of record could not be put back after a failed swap"
                    );
                    return Err(Error::InvalidData(format!(
                        "swapping in {} failed ({}); previous store left at {} ({})",
                        incoming.display(),
                        e,
                        retired.display(),
                        put_back
                    )));
                }
            }
            return Err(Error::io(incoming, e));
        }
        remove_dir_if_exists(&retired)
    }

    /// Put back a store of record left retired by a crash between the two
    /// renames of a swap.
    fn recover_interrupted_swap(&self) -> Result<(), Error> {
        let record = &self.config.path;
        let retired = self.sidecar("retired")?;
        if record.exists() || !retired.is_dir() {
            return Ok(());
        }
        warn!(record = %record.display(), "putting back store of record from an interrupted swap");
        fs::rename(&retired, record).map_err(|e| Error::io(&retired, e))
    }
}

impl StoreLocation for SledLocation {
    type Store = SledStore;

    fn describe(&self) -> String {
        self.config.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.config.path.is_dir()
    }

    fn lock(&self) -> Result<LockGuard, Error> {
        let path = self.sidecar("lock")?;
        let record = LockRecord::current();
        if !try_create_lock(&path, &record)? {
            if !lock_is_stale(&path)? {
                return Err(Error::Locked(path));
            }
            archive_stale_lock(&path)?;
            if !try_create_lock(&path, &record)? {
                return Err(Error::Locked(path));
            }
        }

        let guard = LockGuard { path };
        self.recover_interrupted_swap()?;
        Ok(guard)
    }

    fn open_record(&self) -> Result<SledStore, Error> {
        if !self.exists() {
            return Err(Error::NotFound(format!("store {}", self.describe())));
        }
        SledStore::open(&self.config)
    }

    fn create_scratch(&self, label: &str) -> Result<SledStore, Error> {
        let path = self.scratch_path(label)?;
        remove_dir_if_exists(&path)?;
        SledStore::open(&self.config.at(path))
    }

    fn discard_scratch(&self, label: &str) -> Result<(), Error> {
        remove_dir_if_exists(&self.scratch_path(label)?)
    }

    fn promote_scratch(&self, label: &str) -> Result<(), Error> {
        let scratch = self.scratch_path(label)?;
        if !scratch.is_dir() {
            return Err(Error::NotFound(format!("scratch store {}", scratch.display())));
        }
        self.swap_into_record(&scratch)
    }

    fn digest(&self) -> Result<String, Error> {
        digest_dir(&self.config.path)
    }

    fn snapshot(&self, taken_at: i64) -> Result<SnapshotHandle, Error> {
        let backup = self.sidecar("backup")?;
        if backup.exists() {
            if self.read_journal()?.is_some() {
                return Err(Error::InvalidData(format!(
                    "refusing to overwrite backup at {} of an unreconciled run",
                    backup.display()
                )));
            }
            // No journal: the run died before touching the store of record.
            remove_dir_if_exists(&backup)?;
        }

        let digest = self.digest()?;
        copy_dir(&self.config.path, &backup)?;
        let copied = digest_dir(&backup)?;
        if copied != digest {
            remove_dir_if_exists(&backup)?;
            return Err(Error::InvalidData(format!(
                "backup digest {} does not match store digest {}",
                copied, digest
            )));
        }

        Ok(SnapshotHandle {
            path: backup,
            digest,
            taken_at,
        })
    }

    fn restore(&self, handle: &SnapshotHandle) -> Result<(), Error> {
        let staging = self.sidecar("restoring")?;
        remove_dir_if_exists(&staging)?;
        copy_dir(&handle.path, &staging)?;
        self.swap_into_record(&staging)
    }

    fn release(&self, handle: SnapshotHandle) -> Result<(), Error> {
        remove_dir_if_exists(&handle.path)
    }

    fn write_journal(&self, journal: &MigrationJournal) -> Result<(), Error> {
        let path = self.sidecar("journal.json")?;
        let json = serde_json::to_vec_pretty(journal)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))
    }

    fn read_journal(&self) -> Result<Option<MigrationJournal>, Error> {
        let path = self.sidecar("journal.json")?;
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Deserialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    fn clear_journal(&self) -> Result<(), Error> {
        let path = self.sidecar("journal.json")?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&path, e)),
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Recursively copy a directory.
fn copy_dir(from: &Path, to: &Path) -> Result<(), Error> {
    fs::create_dir_all(to).map_err(|e| Error::io(to, e))?;
    for entry in fs::read_dir(from).map_err(|e| Error::io(from, e))? {
        let entry = entry.map_err(|e| Error::io(from, e))?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::io(&source, e))?;
        if file_type.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            fs::copy(&source, &target).map_err(|e| Error::io(&source, e))?;
        }
    }
    Ok(())
}

/// Collect file paths under `root`, relative to it, sorted.
fn list_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
        if file_type.is_dir() {
            list_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Blake3 digest over every file's relative path and contents.
pub fn digest_dir(root: &Path) -> Result<String, Error> {
    let mut files = Vec::new();
    list_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = blake3::Hasher::new();
    for relative in files {
        let full = root.join(&relative);
        let contents = fs::read(&full).map_err(|e| Error::io(&full, e))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(&(contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}
