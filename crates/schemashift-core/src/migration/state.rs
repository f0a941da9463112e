//! Run state: phases, tallies, run-scoped caches and the applied-step history.
//!
//! The history is persisted in the meta tree of every migrated store so the
//! path a store took through the versions can be audited after the fact.

use super::error::MigrationError;
use crate::storage::Store;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// Meta key prefix of applied-step history records.
pub const HISTORY_PREFIX: &[u8] = b"migration:history:";

/// Phase of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Not started.
    Idle,
    /// Computing the chain of steps.
    Resolving,
    /// Running the step that produces this version.
    Running(u32),
    /// Verifying the step that produced this version.
    Verifying(u32),
    /// Swapping the final scratch store in.
    Committing,
    /// Finished successfully.
    Done,
    /// A step or the commit failed.
    Failed,
    /// Restoring the pre-run backup.
    RollingBack,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Resolving => write!(f, "resolving"),
            RunPhase::Running(v) => write!(f, "running({})", v),
            RunPhase::Verifying(v) => write!(f, "verifying({})", v),
            RunPhase::Committing => write!(f, "committing"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Failed => write!(f, "failed"),
            RunPhase::RollingBack => write!(f, "rolling_back"),
        }
    }
}

/// Per-entity counters for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntityTally {
    /// Rows read from the old store.
    pub read: u64,
    /// Rows that made it through the migrator.
    pub processed: u64,
    /// Rows present in the new store after the step.
    pub written: u64,
    /// Rows dropped on purpose (de-duplication, hooks).
    pub skipped: u64,
    /// Rows added beyond the migrated ones (side effects, epilogue).
    pub inserted: u64,
    /// Rows removed by the epilogue.
    pub removed: u64,
}

/// Per-tenant (or any other scope) sequence allocator.
///
/// Keeps the first claimant of a value and hands later colliding claimants
/// the next value above everything claimed or reserved so far.
#[derive(Debug, Clone, Default)]
pub struct SequenceAllocator {
    claimed: BTreeSet<i64>,
    ceiling: Option<i64>,
}

impl SequenceAllocator {
    /// Make sure reassigned values land above `value`.
    pub fn reserve(&mut self, value: i64) {
        self.ceiling = Some(self.ceiling.map_or(value, |c| c.max(value)));
    }

    /// Claim `candidate`, or the next free value above the maximum if it is taken.
    pub fn claim(&mut self, candidate: i64) -> i64 {
        let value = if self.claimed.contains(&candidate) {
            self.max().map_or(candidate, |max| max + 1)
        } else {
            candidate
        };
        self.claimed.insert(value);
        value
    }

    /// Highest value claimed or reserved.
    pub fn max(&self) -> Option<i64> {
        match (self.claimed.last().copied(), self.ceiling) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Mutable state scoped to one migration run.
///
/// Overrides stay pure; only row hooks and epilogues receive this cache.
#[derive(Debug, Default)]
pub struct RunCache {
    seen: HashMap<String, HashSet<String>>,
    sequences: HashMap<String, SequenceAllocator>,
}

impl RunCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` in `scope`. Returns true if it was already present.
    pub fn seen(&mut self, scope: &str, key: impl Into<String>) -> bool {
        !self.seen.entry(scope.to_string()).or_default().insert(key.into())
    }

    /// Sequence allocator for `scope`, created on first use.
    pub fn sequence(&mut self, scope: &str) -> &mut SequenceAllocator {
        self.sequences.entry(scope.to_string()).or_default()
    }
}

/// Time budget of one step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepBudget {
    step: u32,
    started: Instant,
    limit: Option<Duration>,
}

impl StepBudget {
    pub(crate) fn start(step: u32, limit: Option<Duration>) -> Self {
        Self {
            step,
            started: Instant::now(),
            limit,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail once the limit is exceeded.
    pub(crate) fn check(&self) -> Result<(), MigrationError> {
        match self.limit {
            Some(limit) if self.elapsed() > limit => Err(MigrationError::Timeout {
                step: self.step,
                elapsed: self.elapsed(),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

/// Transient state of a run.
#[derive(Debug)]
pub struct MigrationRun {
    phase: RunPhase,
    from_version: u32,
    target_version: u32,
    started_at: i64,
    started: Instant,
    cache: RunCache,
}

impl MigrationRun {
    /// Create a run towards `target_version`. `started_at` is the run timestamp
    /// every override sees as "now".
    pub fn new(target_version: u32, started_at: i64) -> Self {
        Self {
            phase: RunPhase::Idle,
            from_version: 0,
            target_version,
            started_at,
            started: Instant::now(),
            cache: RunCache::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Move to another phase.
    pub fn transition(&mut self, phase: RunPhase) {
        debug!(from = %self.phase, to = %phase, "migration phase");
        self.phase = phase;
    }

    /// Version the store held when the run started.
    pub fn from_version(&self) -> u32 {
        self.from_version
    }

    pub(crate) fn set_from_version(&mut self, version: u32) {
        self.from_version = version;
    }

    /// Requested target version.
    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// Run timestamp (microseconds since epoch).
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Run-scoped cache.
    pub fn cache_mut(&mut self) -> &mut RunCache {
        &mut self.cache
    }
}

/// Per-entity part of a history record.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct AppliedEntity {
    /// Entity name.
    pub name: String,
    /// Rows in the new store after the step.
    pub written: u64,
    /// Declared skips.
    pub skipped: u64,
    /// Declared inserts.
    pub inserted: u64,
    /// Declared removals.
    pub removed: u64,
}

/// One applied step, persisted in the migrated store.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct AppliedStep {
    /// Version before the step.
    pub from_version: u32,
    /// Version after the step.
    pub to_version: u32,
    /// Run timestamp (microseconds since epoch).
    pub applied_at: i64,
    /// Time the step took, in microseconds.
    pub duration_micros: u64,
    /// Per-entity counts.
    pub entities: Vec<AppliedEntity>,
}

impl AppliedStep {
    /// Build a record from a step's tallies.
    pub fn from_tallies(
        from_version: u32,
        to_version: u32,
        applied_at: i64,
        duration: Duration,
        tallies: &BTreeMap<String, EntityTally>,
    ) -> Self {
        let entities = tallies
            .iter()
            .map(|(name, tally)| AppliedEntity {
                name: name.clone(),
                written: tally.written,
                skipped: tally.skipped,
                inserted: tally.inserted,
                removed: tally.removed,
            })
            .collect();
        Self {
            from_version,
            to_version,
            applied_at,
            duration_micros: duration.as_micros() as u64,
            entities,
        }
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }

    fn key(&self) -> Vec<u8> {
        let mut key = HISTORY_PREFIX.to_vec();
        key.extend_from_slice(&self.to_version.to_be_bytes());
        key
    }
}

/// Applied-step history of a store, oldest first.
pub fn load_history(store: &dyn Store) -> Result<Vec<AppliedStep>, MigrationError> {
    store
        .meta_scan(HISTORY_PREFIX)
        .map_err(|e| MigrationError::store("reading migration history", e))?
        .iter()
        .map(|(_, bytes)| AppliedStep::from_bytes(bytes))
        .collect()
}

/// Copy the history of `old` into `new`.
pub(crate) fn carry_history(old: &dyn Store, new: &dyn Store) -> Result<(), MigrationError> {
    let entries = old
        .meta_scan(HISTORY_PREFIX)
        .map_err(|e| MigrationError::store("reading migration history", e))?;
    for (key, value) in entries {
        new.meta_put(&key, &value)
            .map_err(|e| MigrationError::store("writing migration history", e))?;
    }
    Ok(())
}

/// Append one record to the history of `store`.
pub(crate) fn record_step(store: &dyn Store, applied: &AppliedStep) -> Result<(), MigrationError> {
    store
        .meta_put(&applied.key(), &applied.to_bytes()?)
        .map_err(|e| MigrationError::store("writing migration history", e))
}
