//! The store abstraction the migration engine is written against.

use super::{Row, RowKey};
use crate::error::Error;

/// Meta key holding the schema version of a store.
pub const VERSION_KEY: &[u8] = b"schema_version";

/// Row-level access to one store.
///
/// Scans yield rows in a stable order (identity order for the sled store),
/// which de-duplication and sequence reassignment rely on.
pub trait Store {
    /// Scan all rows of an entity in stable order. Unknown entities yield nothing.
    fn scan<'a>(&'a self, entity: &str) -> Box<dyn Iterator<Item = Result<Row, Error>> + 'a>;

    /// Get a row by identity.
    fn get(&self, entity: &str, key: &RowKey) -> Result<Option<Row>, Error>;

    /// Insert a new row. Fails with [`Error::DuplicateKey`] if the identity exists.
    fn insert(&self, entity: &str, key: &RowKey, row: &Row) -> Result<(), Error>;

    /// Overwrite an existing row. Returns false if no row had this identity.
    fn replace(&self, entity: &str, key: &RowKey, row: &Row) -> Result<bool, Error>;

    /// Remove a row. Returns whether a row was removed.
    fn remove(&self, entity: &str, key: &RowKey) -> Result<bool, Error>;

    /// Number of rows of an entity.
    fn count(&self, entity: &str) -> Result<u64, Error>;

    /// Names of entities holding at least one row.
    fn entity_names(&self) -> Result<Vec<String>, Error>;

    /// Read a metadata value.
    fn meta_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Write a metadata value.
    fn meta_put(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// All metadata entries whose key starts with `prefix`, in key order.
    fn meta_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error>;

    /// Flush all pending writes to disk.
    fn flush(&self) -> Result<(), Error>;

    /// Schema version recorded in the store, if any.
    fn version(&self) -> Result<Option<u32>, Error> {
        match self.meta_get(VERSION_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidData("schema version is not 4 bytes".into()))?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Record the schema version.
    fn set_version(&self, version: u32) -> Result<(), Error> {
        self.meta_put(VERSION_KEY, &version.to_be_bytes())
    }
}
