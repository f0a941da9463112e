//! Run reports.

use super::error::MigrationError;
use super::state::EntityTally;
use super::verifier::EntityCheck;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// What one step did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Version before the step.
    pub from_version: u32,
    /// Version after the step.
    pub to_version: u32,
    /// Time the step took, in milliseconds.
    pub elapsed_ms: u64,
    /// Per-entity counters.
    pub entities: BTreeMap<String, EntityTally>,
    /// Row-count checks.
    pub checks: Vec<EntityCheck>,
}

impl StepReport {
    /// Counters of one entity, zero if untouched.
    pub fn tally(&self, entity: &str) -> EntityTally {
        self.entities.get(entity).copied().unwrap_or_default()
    }
}

/// What a whole run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Version the store held before the run.
    pub from_version: u32,
    /// Version the store holds after the run.
    pub to_version: u32,
    /// Run timestamp (microseconds since epoch).
    pub started_at: i64,
    /// Total run time, in milliseconds.
    pub elapsed_ms: u64,
    /// Applied steps, in order.
    pub steps: Vec<StepReport>,
}

impl MigrationReport {
    /// Report of a run that had nothing to do.
    pub fn unchanged(version: u32, started_at: i64) -> Self {
        Self {
            from_version: version,
            to_version: version,
            started_at,
            elapsed_ms: 0,
            steps: Vec::new(),
        }
    }

    /// Report of the step that produced `version`.
    pub fn step(&self, version: u32) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.to_version == version)
    }

    /// Number of applied steps.
    pub fn steps_applied(&self) -> usize {
        self.steps.len()
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, MigrationError> {
        serde_json::to_string_pretty(self).map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Emit the report as structured events.
    pub fn log(&self) {
        for step in &self.steps {
            for (entity, tally) in &step.entities {
                info!(
                    step = step.to_version,
                    entity = %entity,
                    read = tally.read,
                    processed = tally.processed,
                    written = tally.written,
                    skipped = tally.skipped,
                    inserted = tally.inserted,
                    removed = tally.removed,
                    "entity migrated"
                );
            }
            info!(
                from = step.from_version,
                to = step.to_version,
                elapsed_ms = step.elapsed_ms,
                "step applied"
            );
        }
        info!(
            from = self.from_version,
            to = self.to_version,
            steps = self.steps.len(),
            elapsed_ms = self.elapsed_ms,
            "migration complete"
        );
    }
}
