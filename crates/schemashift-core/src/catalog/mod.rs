//! Frozen per-version schema declarations.
//!
//! A [`SchemaSnapshot`] describes every entity's shape at one schema version.
//! Snapshots are built once, wrapped in `Arc`, and never mutated afterwards;
//! each version declares its own snapshot from scratch.

mod entity;
mod field;
mod snapshot;
mod types;

pub use entity::EntityDef;
pub use field::{DefaultValue, FieldDef};
pub use snapshot::SchemaSnapshot;
pub use types::ScalarType;
