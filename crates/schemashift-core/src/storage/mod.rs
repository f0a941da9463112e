//! Storage layer.
//!
//! Rows are stored in a sled database with one tree per entity, keyed by an
//! order-preserving encoding of the row identity. [`Store`] is the row-level
//! abstraction the migration engine works against; [`StoreLocation`] covers
//! the store-of-record lifecycle (scratch stores, swap, snapshot, restore).

mod codec;
mod config;
mod engine;
mod journal;
mod location;
mod row;
mod store;

pub use codec::{decode_row, encode_row};
pub use config::StorageConfig;
pub use engine::SledStore;
pub use journal::{JournalState, MigrationJournal};
pub use location::{digest_dir, LockGuard, SledLocation, SnapshotHandle, StoreLocation};
pub use row::{Row, RowKey};
pub use store::{Store, VERSION_KEY};
