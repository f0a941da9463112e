//! Version chain orchestrator.
//!
//! Runs every step between the store version and the target into a fresh
//! scratch store, verifies it, and swaps the last scratch store in only after
//! the whole chain succeeded. Any failure restores the pre-run backup.

use super::backup::BackupManager;
use super::error::MigrationError;
use super::registry::StepRegistry;
use super::report::{MigrationReport, StepReport};
use super::state::{carry_history, record_step, AppliedStep, MigrationRun, RunPhase, StepBudget};
use super::verifier::IntegrityVerifier;
use crate::storage::{JournalState, MigrationJournal, SnapshotHandle, Store, StoreLocation};
use crate::value::current_timestamp;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Migration executor configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Time limit of a single step. None disables the limit.
    pub step_timeout: Option<Duration>,
    /// Check the store digest after every restore.
    pub verify_restore: bool,
    /// Keep the pre-run backup after a successful run.
    pub keep_backup: bool,
    /// Record applied steps in the migrated store.
    pub record_history: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(Duration::from_secs(3600)),
            verify_restore: true,
            keep_backup: false,
            record_history: true,
        }
    }
}

impl MigrationConfig {
    /// Set the per-step time limit.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Enable or disable digest verification of restores.
    pub fn with_verify_restore(mut self, verify: bool) -> Self {
        self.verify_restore = verify;
        self
    }

    /// Keep or delete the backup after success.
    pub fn with_keep_backup(mut self, keep: bool) -> Self {
        self.keep_backup = keep;
        self
    }

    /// Enable or disable the applied-step history.
    pub fn with_record_history(mut self, record: bool) -> Self {
        self.record_history = record;
        self
    }
}

/// Result of the step loop: per-step reports and the scratch label to promote.
type ChainOutcome = (Vec<StepReport>, Option<String>);

/// Migration executor - orchestrates a run against one store location.
pub struct MigrationExecutor<'a, L: StoreLocation> {
    location: &'a L,
    registry: &'a StepRegistry,
    config: MigrationConfig,
}

impl<'a, L: StoreLocation> MigrationExecutor<'a, L> {
    /// Create a new migration executor.
    pub fn new(location: &'a L, registry: &'a StepRegistry, config: MigrationConfig) -> Self {
        Self {
            location,
            registry,
            config,
        }
    }

    /// Migrate the store to `target`.
    ///
    /// On success the store of record holds `target`. On failure it is
    /// restored byte-for-byte, unless the restore itself failed, which is
    /// reported as [`MigrationError::Unrecoverable`].
    #[instrument(skip(self), fields(location = %self.location.describe()))]
    pub fn execute(&self, target: u32) -> Result<MigrationReport, MigrationError> {
        let _lock = self
            .location
            .lock()
            .map_err(|e| MigrationError::store("acquiring migration lock", e))?;

        let backups = BackupManager::new(self.location, self.config.verify_restore);
        if let Some(state) = backups.reconcile()? {
            warn!(?state, "previous run was interrupted and has been reconciled");
        }
        if !self.location.exists() {
            return Err(MigrationError::store(
                "opening store of record",
                crate::error::Error::NotFound(self.location.describe()),
            ));
        }

        let mut run = MigrationRun::new(target, current_timestamp());
        let handle = backups.snapshot(run.started_at())?;
        let mut journal = MigrationJournal::prepared(
            0,
            target,
            handle.path().to_path_buf(),
            handle.digest().to_string(),
            run.started_at(),
        );
        if let Err(e) = self.write_journal(&journal) {
            return Err(self.roll_back(&mut run, &backups, &journal, handle, e));
        }

        let (steps, label) = match self.run_chain(&mut run, &mut journal) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.roll_back(&mut run, &backups, &journal, handle, e)),
        };

        let Some(label) = label else {
            run.transition(RunPhase::Done);
            self.finish(&backups, handle)?;
            return Ok(MigrationReport::unchanged(run.from_version(), run.started_at()));
        };

        run.transition(RunPhase::Committing);
        journal.state = JournalState::Committing;
        let committed = self.write_journal(&journal).and_then(|()| {
            self.location
                .promote_scratch(&label)
                .map_err(|e| MigrationError::store("swapping in migrated store", e))
        });
        if let Err(e) = committed {
            return Err(self.roll_back(&mut run, &backups, &journal, handle, e));
        }

        journal.state = JournalState::Committed;
        self.write_journal(&journal)?;
        run.transition(RunPhase::Done);
        self.finish(&backups, handle)?;

        let report = MigrationReport {
            from_version: run.from_version(),
            to_version: target,
            started_at: run.started_at(),
            elapsed_ms: run.elapsed().as_millis() as u64,
            steps,
        };
        report.log();
        Ok(report)
    }

    /// Run the resolved steps. Every store handle is closed on return.
    fn run_chain(
        &self,
        run: &mut MigrationRun,
        journal: &mut MigrationJournal,
    ) -> Result<ChainOutcome, MigrationError> {
        run.transition(RunPhase::Resolving);
        let target = run.target_version();

        let record = self
            .location
            .open_record()
            .map_err(|e| MigrationError::store("opening store of record", e))?;
        let from = record
            .version()
            .map_err(|e| MigrationError::store("reading store version", e))?
            .unwrap_or(0);
        run.set_from_version(from);
        journal.from_version = from;
        self.write_journal(journal)?;

        self.registry.check_range(from, target)?;
        let steps = self.registry.resolve(from, target)?;
        for step in &steps {
            step.validate()?;
        }
        if steps.is_empty() {
            info!(version = from, "store already at target version");
            return Ok((Vec::new(), None));
        }
        info!(from, target, steps = steps.len(), "migration chain resolved");

        let now = run.started_at();
        let mut reports = Vec::with_capacity(steps.len());
        let mut current = record;
        let mut current_label: Option<String> = None;

        for step in steps {
            let version = step.to_version();
            run.transition(RunPhase::Running(version));
            let budget = StepBudget::start(version, self.config.step_timeout);

            let label = version.to_string();
            let scratch = self
                .location
                .create_scratch(&label)
                .map_err(|e| MigrationError::store("creating scratch store", e))?;

            let tallies = step.run(&current, &scratch, now, &budget, run.cache_mut())?;

            run.transition(RunPhase::Verifying(version));
            let checks = IntegrityVerifier::verify(step, &tallies, &current, &scratch)?;

            if self.config.record_history {
                carry_history(&current, &scratch)?;
                let applied = AppliedStep::from_tallies(
                    step.from_version(),
                    version,
                    now,
                    budget.elapsed(),
                    &tallies,
                );
                record_step(&scratch, &applied)?;
            }
            scratch
                .set_version(version)
                .and_then(|()| scratch.flush())
                .map_err(|e| MigrationError::store("finalizing scratch store", e))?;
            budget.check()?;

            info!(
                from = step.from_version(),
                to = version,
                elapsed_ms = budget.elapsed().as_millis() as u64,
                "step verified"
            );
            reports.push(StepReport {
                from_version: step.from_version(),
                to_version: version,
                elapsed_ms: budget.elapsed().as_millis() as u64,
                entities: tallies,
                checks,
            });

            drop(std::mem::replace(&mut current, scratch));
            if let Some(previous) = current_label.replace(label) {
                self.location
                    .discard_scratch(&previous)
                    .map_err(|e| MigrationError::store("discarding scratch store", e))?;
            }
        }

        drop(current);
        Ok((reports, current_label))
    }

    /// Restore the backup after `cause`, returning the error to report.
    fn roll_back(
        &self,
        run: &mut MigrationRun,
        backups: &BackupManager<'_, L>,
        journal: &MigrationJournal,
        handle: SnapshotHandle,
        cause: MigrationError,
    ) -> MigrationError {
        run.transition(RunPhase::Failed);
        warn!(error = %cause, phase = %run.phase(), "migration failed, rolling back");
        run.transition(RunPhase::RollingBack);

        for version in journal.from_version.saturating_add(1)..=journal.target_version {
            if let Err(e) = self.location.discard_scratch(&version.to_string()) {
                warn!(version, error = %e, "failed to discard scratch store");
            }
        }

        match backups.restore(&handle) {
            Ok(()) => {
                if let Err(e) = self.finish(backups, handle) {
                    warn!(error = %e, "failed to clean up after rollback");
                }
                run.transition(RunPhase::Idle);
                info!("store of record restored");
                cause
            }
            Err(restore_error) => {
                error!(error = %cause, restore_error = %restore_error, "rollback failed; backup and journal kept for reconciliation");
                MigrationError::Unrecoverable {
                    cause: Box::new(cause),
                    restore_error: restore_error.to_string(),
                }
            }
        }
    }

    /// Drop the backup (unless kept) and the journal.
    fn finish(&self, backups: &BackupManager<'_, L>, handle: SnapshotHandle) -> Result<(), MigrationError> {
        if self.config.keep_backup {
            info!(path = %handle.path().display(), "backup kept");
        } else {
            backups.release(handle)?;
        }
        self.location
            .clear_journal()
            .map_err(|e| MigrationError::store("clearing journal", e))
    }

    fn write_journal(&self, journal: &MigrationJournal) -> Result<(), MigrationError> {
        self.location
            .write_journal(journal)
            .map_err(|e| MigrationError::store("writing journal", e))
    }
}

/// Migrate the store at `location` to `target` with the default
/// configuration. Returns the version the store holds afterwards.
pub fn migrate<L: StoreLocation>(
    location: &L,
    registry: &StepRegistry,
    target: u32,
) -> Result<u32, MigrationError> {
    MigrationExecutor::new(location, registry, MigrationConfig::default())
        .execute(target)
        .map(|report| report.to_version)
}

/// Finish a run that died mid-flight. Returns the journal state found, or
/// `None` when there was nothing to reconcile.
pub fn reconcile<L: StoreLocation>(location: &L) -> Result<Option<JournalState>, MigrationError> {
    let _lock = location
        .lock()
        .map_err(|e| MigrationError::store("acquiring migration lock", e))?;
    BackupManager::new(location, true).reconcile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityDef, FieldDef, ScalarType, SchemaSnapshot};
    use crate::migration::{load_history, EntityMigrator, MigrationStep};
    use crate::storage::{Row, RowKey, SledLocation, SledStore, StorageConfig};
    use crate::value::Value;

    fn tenant(version_field: &str) -> EntityDef {
        EntityDef::new("Tenant", "id").with_fields([
            FieldDef::new("id", ScalarType::Int),
            FieldDef::new(version_field, ScalarType::String),
        ])
    }

    fn registry() -> StepRegistry {
        let v1 = SchemaSnapshot::new(1).with_entity(tenant("label"));
        let v2 = SchemaSnapshot::new(2).with_entity(tenant("name"));
        StepRegistry::new(1, 2)
            .unwrap()
            .with_step(MigrationStep::new(v1, v2).rename("Tenant", "label", "name"))
            .unwrap()
    }

    fn seeded(dir: &tempfile::TempDir, version: u32) -> SledLocation {
        let config = StorageConfig::new(dir.path().join("store"));
        {
            let store = SledStore::open(&config).unwrap();
            store
                .insert(
                    "Tenant",
                    &RowKey::new(vec![Value::Int(1)]),
                    &Row::new().with("id", 1).with("label", "root"),
                )
                .unwrap();
            store.set_version(version).unwrap();
            store.flush().unwrap();
        }
        SledLocation::new(config)
    }

    #[test]
    fn test_config_builder() {
        let config = MigrationConfig::default()
            .with_step_timeout(None)
            .with_keep_backup(true)
            .with_record_history(false)
            .with_verify_restore(false);
        assert!(config.step_timeout.is_none());
        assert!(config.keep_backup);
        assert!(!config.record_history);
        assert!(!config.verify_restore);
    }

    #[test]
    fn test_execute_single_step() {
        let dir = tempfile::tempdir().unwrap();
        let location = seeded(&dir, 1);
        let registry = registry();

        let report = MigrationExecutor::new(&location, &registry, MigrationConfig::default())
            .execute(2)
            .unwrap();
        assert_eq!((report.from_version, report.to_version), (1, 2));
        assert_eq!(report.steps_applied(), 1);

        let store = location.open_record().unwrap();
        assert_eq!(store.version().unwrap(), Some(2));
        let row = store.get("Tenant", &RowKey::new(vec![Value::Int(1)])).unwrap().unwrap();
        assert_eq!(row.str("name"), Some("root"));
        assert_eq!(load_history(&store).unwrap().len(), 1);

        assert!(!dir.path().join("store.migration.backup").exists());
        assert!(!dir.path().join("store.migration.journal.json").exists());
        assert!(!dir.path().join("store.migration.lock").exists());
    }

    #[test]
    fn test_execute_at_target_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let location = seeded(&dir, 2);
        let registry = registry();

        assert_eq!(migrate(&location, &registry, 2).unwrap(), 2);
        assert!(!dir.path().join("store.migration.backup").exists());
    }

    #[test]
    fn test_transform_failure_restores_store() {
        let dir = tempfile::tempdir().unwrap();
        let location = seeded(&dir, 1);
        let before = location.digest().unwrap();

        let v1 = SchemaSnapshot::new(1).with_entity(tenant("label"));
        let v2 = SchemaSnapshot::new(2).with_entity(tenant("name"));
        let registry = StepRegistry::new(1, 2)
            .unwrap()
            .with_step(MigrationStep::new(v1, v2).migrator(
                EntityMigrator::new("Tenant")
                    .derive("name", |_| Err(crate::migration::TransformError::invalid("boom"))),
            ))
            .unwrap();

        let err = migrate(&location, &registry, 2).unwrap_err();
        assert!(matches!(err, MigrationError::Transform { step: 2, .. }));
        assert_eq!(location.digest().unwrap(), before);
        assert!(!dir.path().join("store.migration.scratch.2").exists());
        assert!(!dir.path().join("store.migration.journal.json").exists());
    }

    #[test]
    fn test_keep_backup() {
        let dir = tempfile::tempdir().unwrap();
        let location = seeded(&dir, 1);
        let registry = registry();

        MigrationExecutor::new(&location, &registry, MigrationConfig::default().with_keep_backup(true))
            .execute(2)
            .unwrap();
        assert!(dir.path().join("store.migration.backup").exists());
    }

    #[test]
    fn test_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let location = SledLocation::new(StorageConfig::new(dir.path().join("absent")));
        let err = migrate(&location, &registry(), 2).unwrap_err();
        assert!(matches!(err, MigrationError::Store { .. }));
    }
}
