//! Core error types.

use std::path::PathBuf;
use thiserror::Error;

/// Storage and catalog errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Filesystem error on a store directory or sidecar.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// A row with the same identity already exists.
    #[error("duplicate identity {key} in entity {entity}")]
    DuplicateKey {
        /// Entity name.
        entity: String,
        /// Rendered identity.
        key: String,
    },

    /// Row lacks a value for one of its identity fields.
    #[error("row of {entity} has no value for identity field {field}")]
    MissingIdentity {
        /// Entity name.
        entity: String,
        /// Identity field name.
        field: String,
    },

    /// Another process holds the store lock.
    #[error("store is locked by another run: {0}")]
    Locked(PathBuf),

    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
