//! Built-in migration steps of the whistleblowing platform store.
//!
//! Each `update_NN` module freezes the schemas on both sides of its step so
//! later schema changes never alter how an old store is migrated.

mod fields;
pub mod update_46;
pub mod update_52;

use schemashift_core::migration::{ConfigError, StepRegistry};

/// Oldest store version the built-in steps can migrate.
pub const MIN_SUPPORTED_VERSION: u32 = 45;

/// Version the application expects.
pub const CURRENT_VERSION: u32 = 52;

/// Registry holding every built-in step.
///
/// Steps 46 through 51 are not shipped, so a chain crossing them fails with
/// [`ConfigError::MissingStep`] before any data is touched.
pub fn builtin_registry() -> Result<StepRegistry, ConfigError> {
    StepRegistry::new(MIN_SUPPORTED_VERSION, CURRENT_VERSION)?
        .with_step(update_46::step())?
        .with_step(update_52::step())
}
