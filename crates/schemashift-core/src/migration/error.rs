//! Migration-specific error types.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Declaration errors, detected before any store mutation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The registry bounds are inconsistent.
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),

    /// No step is registered to leave this version.
    #[error("no migration step registered from version {from}")]
    MissingStep {
        /// Version the missing step would start from.
        from: u32,
    },

    /// Two steps leave the same version.
    #[error("migration step from version {from} registered twice")]
    DuplicateStep {
        /// Version both steps start from.
        from: u32,
    },

    /// A step is malformed.
    #[error("invalid step {from} -> {to}: {reason}")]
    InvalidStep {
        /// From-version.
        from: u32,
        /// To-version.
        to: u32,
        /// What is wrong.
        reason: String,
    },

    /// A declaration names an entity that is not in the relevant snapshot.
    #[error("step {step}: unknown entity {entity}")]
    UnknownEntity {
        /// To-version of the step.
        step: u32,
        /// Entity name.
        entity: String,
    },

    /// A declaration names a field that is not in the relevant entity.
    #[error("step {step}: unknown field {entity}.{field}")]
    UnknownField {
        /// To-version of the step.
        step: u32,
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
    },

    /// A new required field has no source, override or default.
    #[error("step {step}: no source, override or default for required field {entity}.{field}")]
    UnsourcedField {
        /// To-version of the step.
        step: u32,
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
    },

    /// A count exemption was declared without a reason.
    #[error("step {step}: count exemption for {entity} must carry a reason")]
    MissingReason {
        /// To-version of the step.
        step: u32,
        /// Entity name.
        entity: String,
    },
}

/// Errors raised by overrides, row hooks and epilogues.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The old row lacks a field the override needs.
    #[error("missing field {0}")]
    MissingField(String),

    /// A value has the wrong semantic type.
    #[error("field {field}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared type.
        expected: String,
        /// Type of the offending value.
        found: String,
    },

    /// Null written to a required field.
    #[error("field {0} is not nullable")]
    NullValue(String),

    /// Row carries a field its entity does not declare.
    #[error("field {field} is not declared on {entity}")]
    UndeclaredField {
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
    },

    /// Entity is not part of the target snapshot.
    #[error("entity {0} is not declared")]
    UndeclaredEntity(String),

    /// Malformed legacy data.
    #[error("{0}")]
    Invalid(String),

    /// Store access from within a transform failed.
    #[error(transparent)]
    Store(#[from] crate::error::Error),
}

impl TransformError {
    /// Shorthand for [`TransformError::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        TransformError::Invalid(message.into())
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A step or registry declaration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The store version is outside what the application supports.
    #[error(
        "store version {store} is outside the supported range {min_supported}..={target}"
    )]
    VersionRange {
        /// Version recorded in the store (0 if none).
        store: u32,
        /// Oldest version the registry can migrate from.
        min_supported: u32,
        /// Requested target version.
        target: u32,
    },

    /// An override, hook or epilogue failed.
    #[error("step {step}: transform of {entity} row {row} failed: {cause}")]
    Transform {
        /// To-version of the step.
        step: u32,
        /// Entity being migrated.
        entity: String,
        /// Identity of the offending row.
        row: String,
        /// Underlying failure.
        #[source]
        cause: TransformError,
    },

    /// Row counts after a step do not match the declared deltas.
    #[error("step {step}: integrity mismatch on {entity}: expected {expected} rows, found {actual}")]
    IntegrityMismatch {
        /// To-version of the step.
        step: u32,
        /// Entity name.
        entity: String,
        /// Expected row count.
        expected: i64,
        /// Row count found in the new store.
        actual: i64,
    },

    /// Store I/O failed.
    #[error("{context}: {source}")]
    Store {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: crate::error::Error,
    },

    /// A step exceeded its time limit.
    #[error("step {step} exceeded its time limit of {limit:?} (elapsed {elapsed:?})")]
    Timeout {
        /// To-version of the step.
        step: u32,
        /// Time spent so far.
        elapsed: Duration,
        /// Configured limit.
        limit: Duration,
    },

    /// Another run holds the store lock.
    #[error("store is locked by another migration run: {0}")]
    Locked(PathBuf),

    /// Restoring the backup failed after another failure.
    #[error("rollback failed after {cause}; restore error: {restore_error}")]
    Unrecoverable {
        /// The failure that triggered the rollback.
        cause: Box<MigrationError>,
        /// Why the restore failed.
        restore_error: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Wrap a storage error with context.
    pub fn store(context: impl Into<String>, source: crate::error::Error) -> Self {
        match source {
            crate::error::Error::Locked(path) => MigrationError::Locked(path),
            source => MigrationError::Store {
                context: context.into(),
                source,
            },
        }
    }

    /// Whether the store of record may have been left modified.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, MigrationError::Unrecoverable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::IntegrityMismatch {
            step: 46,
            entity: "InternalFile".to_string(),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("step 46"));
        assert!(msg.contains("InternalFile"));
        assert!(msg.contains("expected 3"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: MigrationError = ConfigError::MissingStep { from: 46 }.into();
        assert!(matches!(err, MigrationError::Config(ConfigError::MissingStep { from: 46 })));
    }

    #[test]
    fn test_store_lock_maps_to_locked() {
        let err = MigrationError::store(
            "acquiring lock",
            crate::error::Error::Locked(PathBuf::from("/tmp/x.migration.lock")),
        );
        assert!(matches!(err, MigrationError::Locked(_)));
    }

    #[test]
    fn test_unrecoverable_wraps_cause() {
        let err = MigrationError::Unrecoverable {
            cause: Box::new(MigrationError::Timeout {
                step: 46,
                elapsed: Duration::from_secs(2),
                limit: Duration::from_secs(1),
            }),
            restore_error: "disk full".to_string(),
        };
        assert!(err.is_unrecoverable());
        assert!(err.to_string().contains("disk full"));
    }
}
