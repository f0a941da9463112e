//! Versioned migration engine.
//!
//! A store is advanced one version at a time by [`MigrationStep`]s, each
//! holding the frozen from/to snapshots and per-entity migrators:
//!
//! - Fields present in both snapshots are copied; renames, derived values,
//!   static values and dropped-with-side-effect fields are declared per
//!   entity
//! - Every step writes into a fresh scratch store, followed by an optional
//!   epilogue and a row-count check
//! - The last scratch store replaces the store of record only after the
//!   whole chain succeeded; any failure restores the pre-run backup
//! - A journal next to the store lets an interrupted run be reconciled
//!
//! # Count law
//!
//! For every entity that is not exempted:
//!
//! ```text
//! new_count == old_count + inserted - skipped - removed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use schemashift_core::migration::{migrate, EntityMigrator, MigrationStep, StepRegistry};
//!
//! let step = MigrationStep::new(v1(), v2())
//!     .rename("FieldOption", "order", "presentation_order")
//!     .migrator(EntityMigrator::new("InternalFile").dedup_on(["filename"]));
//!
//! let registry = StepRegistry::new(1, 2)?.with_step(step)?;
//! let version = migrate(&location, &registry, 2)?;
//! ```

pub mod backup;
pub mod error;
pub mod executor;
pub mod migrator;
pub mod registry;
pub mod report;
pub mod state;
pub mod step;
pub mod verifier;

// Error types
pub use error::{ConfigError, MigrationError, TransformError};

// Declaration types
pub use migrator::{EntityMigrator, FieldOverride, RowContext, RowOutcome, SideEffect};
pub use registry::StepRegistry;
pub use step::{CountPolicy, EpilogueContext, MigrationStep};

// Run types
pub use backup::BackupManager;
pub use executor::{migrate, reconcile, MigrationConfig, MigrationExecutor};
pub use report::{MigrationReport, StepReport};
pub use state::{
    load_history, AppliedEntity, AppliedStep, EntityTally, MigrationRun, RunCache, RunPhase,
    SequenceAllocator,
};
pub use verifier::{EntityCheck, IntegrityVerifier};
