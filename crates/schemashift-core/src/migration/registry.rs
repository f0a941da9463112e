//! Registry of the steps an application ships with.

use super::error::{ConfigError, MigrationError};
use super::step::MigrationStep;
use std::collections::BTreeMap;

/// Every step the application can run, keyed by from-version.
#[derive(Debug)]
pub struct StepRegistry {
    min_supported: u32,
    current: u32,
    steps: BTreeMap<u32, MigrationStep>,
}

impl StepRegistry {
    /// Create an empty registry.
    ///
    /// `min_supported` is the oldest store version that can be migrated;
    /// `current` is the version the application expects.
    pub fn new(min_supported: u32, current: u32) -> Result<Self, ConfigError> {
        if min_supported == 0 {
            return Err(ConfigError::InvalidRegistry(
                "minimum supported version must be at least 1".to_string(),
            ));
        }
        if current < min_supported {
            return Err(ConfigError::InvalidRegistry(format!(
                "current version {} is below minimum supported version {}",
                current, min_supported
            )));
        }
        Ok(Self {
            min_supported,
            current,
            steps: BTreeMap::new(),
        })
    }

    /// Register a step.
    pub fn register(&mut self, step: MigrationStep) -> Result<(), ConfigError> {
        let from = step.from_version();
        let to = step.to_version();
        if from < self.min_supported || to > self.current {
            return Err(ConfigError::InvalidStep {
                from,
                to,
                reason: format!(
                    "outside the registry range {}..={}",
                    self.min_supported, self.current
                ),
            });
        }
        if self.steps.contains_key(&from) {
            return Err(ConfigError::DuplicateStep { from });
        }
        step.validate()?;
        self.steps.insert(from, step);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_step(mut self, step: MigrationStep) -> Result<Self, ConfigError> {
        self.register(step)?;
        Ok(self)
    }

    /// Oldest store version that can be migrated.
    pub fn min_supported(&self) -> u32 {
        self.min_supported
    }

    /// Version the application expects.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Step leaving `from`, if registered.
    pub fn get(&self, from: u32) -> Option<&MigrationStep> {
        self.steps.get(&from)
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step is registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check that a store at `store_version` may be migrated to `target`.
    pub fn check_range(&self, store_version: u32, target: u32) -> Result<(), MigrationError> {
        let out_of_range = store_version < self.min_supported
            || store_version > target
            || target > self.current;
        if out_of_range {
            return Err(MigrationError::VersionRange {
                store: store_version,
                min_supported: self.min_supported,
                target,
            });
        }
        Ok(())
    }

    /// Steps for `[from + 1 ..= target]` in order, failing on any gap.
    pub fn resolve(&self, from: u32, target: u32) -> Result<Vec<&MigrationStep>, ConfigError> {
        (from..target)
            .map(|version| {
                self.steps
                    .get(&version)
                    .ok_or(ConfigError::MissingStep { from: version })
            })
            .collect()
    }
}
