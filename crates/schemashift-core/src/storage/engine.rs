//! Sled-backed store.

use super::codec::{decode_row, encode_row};
use super::{Row, RowKey, StorageConfig, Store};
use crate::error::Error;
use sled::{Db, Tree};

/// Tree name for store metadata (schema version, migration history).
const META_TREE: &str = "meta";

/// Prefix of per-entity tree names.
const ENTITY_TREE_PREFIX: &str = "entity:";

/// A store wrapping one sled database; one tree per entity.
pub struct SledStore {
    /// The underlying sled database.
    db: Db,

    /// Tree for metadata.
    meta_tree: Tree,
}

impl SledStore {
    /// Open or create a store with the given configuration.
    pub fn open(config: &StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let meta_tree = db.open_tree(META_TREE)?;
        Ok(Self { db, meta_tree })
    }

    fn tree_name(entity: &str) -> String {
        format!("{}{}", ENTITY_TREE_PREFIX, entity)
    }

    /// Open an entity tree for writing, creating it if needed.
    fn entity_tree(&self, entity: &str) -> Result<Tree, Error> {
        Ok(self.db.open_tree(Self::tree_name(entity))?)
    }

    /// Open an entity tree only if it already exists, so that reads never
    /// create trees in a store that is being migrated away from.
    fn existing_tree(&self, entity: &str) -> Result<Option<Tree>, Error> {
        let name = Self::tree_name(entity);
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|n| &**n == name.as_bytes());
        if exists {
            Ok(Some(self.db.open_tree(name)?))
        } else {
            Ok(None)
        }
    }
}

impl Store for SledStore {
    fn scan<'a>(&'a self, entity: &str) -> Box<dyn Iterator<Item = Result<Row, Error>> + 'a> {
        match self.existing_tree(entity) {
            Ok(Some(tree)) => Box::new(tree.iter().map(|result| {
                let (_, value) = result?;
                decode_row(&value)
            })),
            Ok(None) => Box::new(std::iter::empty()),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn get(&self, entity: &str, key: &RowKey) -> Result<Option<Row>, Error> {
        let Some(tree) = self.existing_tree(entity)? else {
            return Ok(None);
        };
        match tree.get(key.encode()?)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, entity: &str, key: &RowKey, row: &Row) -> Result<(), Error> {
        let tree = self.entity_tree(entity)?;
        let value = encode_row(row)?;
        let swapped = tree.compare_and_swap(key.encode()?, None as Option<&[u8]>, Some(value))?;
        swapped.map_err(|_| Error::DuplicateKey {
            entity: entity.to_string(),
            key: key.to_string(),
        })
    }

    fn replace(&self, entity: &str, key: &RowKey, row: &Row) -> Result<bool, Error> {
        let Some(tree) = self.existing_tree(entity)? else {
            return Ok(false);
        };
        let key_bytes = key.encode()?;
        if !tree.contains_key(&key_bytes)? {
            return Ok(false);
        }
        tree.insert(key_bytes, encode_row(row)?)?;
        Ok(true)
    }

    fn remove(&self, entity: &str, key: &RowKey) -> Result<bool, Error> {
        let Some(tree) = self.existing_tree(entity)? else {
            return Ok(false);
        };
        Ok(tree.remove(key.encode()?)?.is_some())
    }

    fn count(&self, entity: &str) -> Result<u64, Error> {
        match self.existing_tree(entity)? {
            Some(tree) => Ok(tree.len() as u64),
            None => Ok(0),
        }
    }

    fn entity_names(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for raw in self.db.tree_names() {
            let Ok(name) = std::str::from_utf8(&raw) else {
                continue;
            };
            if let Some(entity) = name.strip_prefix(ENTITY_TREE_PREFIX) {
                if self.count(entity)? > 0 {
                    names.push(entity.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn meta_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.meta_tree.get(key)?.map(|v| v.to_vec()))
    }

    fn meta_put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.meta_tree.insert(key, value)?;
        Ok(())
    }

    fn meta_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        self.meta_tree
            .scan_prefix(prefix)
            .map(|result| {
                let (k, v) = result?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }

    fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}
