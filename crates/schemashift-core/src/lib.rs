//! SchemaShift Core - versioned schema-migration engine.
//!
//! Advances an offline store one schema version at a time, from the version
//! it holds up to the version the application expects. Each step copies rows
//! from the old store into a fresh scratch store under a frozen pair of
//! schema snapshots; the scratch store replaces the store of record only
//! after every step and its integrity check succeeded. Any failure restores
//! the pre-run backup.

pub mod catalog;
pub mod error;
pub mod migration;
pub mod storage;
pub mod value;

pub use catalog::{DefaultValue, EntityDef, FieldDef, ScalarType, SchemaSnapshot};
pub use error::Error;
pub use migration::{
    migrate, reconcile, ConfigError, EntityMigrator, EpilogueContext, IntegrityVerifier,
    MigrationConfig, MigrationError, MigrationExecutor, MigrationReport, MigrationStep,
    RowContext, RowOutcome, RunCache, StepRegistry, TransformError,
};
pub use storage::{Row, RowKey, SledLocation, SledStore, StorageConfig, Store, StoreLocation};
pub use value::{current_timestamp, Value, TIMESTAMP_NEVER, TIMESTAMP_NULL};
