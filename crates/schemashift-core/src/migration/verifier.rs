//! Per-step row-count verification.

use super::error::MigrationError;
use super::state::EntityTally;
use super::step::{CountPolicy, MigrationStep};
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of the count check of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCheck {
    /// Entity name.
    pub entity: String,
    /// Rows in the old source entity.
    pub old_count: u64,
    /// Expected rows, `None` when exempt.
    pub expected: Option<i64>,
    /// Rows found in the new store.
    pub actual: u64,
    /// Exemption reason, if exempt.
    pub exemption: Option<String>,
}

/// Compares old and new row counts against the declared deltas.
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Check every entity of the step's to-snapshot.
    ///
    /// For non-exempt entities `actual` must equal
    /// `old_count + inserted - skipped - removed`; entities new in the
    /// to-snapshot have `old_count = 0`. A mismatch is fatal.
    pub fn verify(
        step: &MigrationStep,
        tallies: &BTreeMap<String, EntityTally>,
        old: &dyn Store,
        new: &dyn Store,
    ) -> Result<Vec<EntityCheck>, MigrationError> {
        let version = step.to_version();
        let mut checks = Vec::with_capacity(step.to_snapshot().entities().len());

        for def in step.to_snapshot().entities() {
            let source = step.source_of(&def.name);
            let old_count = if step.from_snapshot().has_entity(source) {
                old.count(source)
                    .map_err(|e| MigrationError::store(format!("counting old {}", source), e))?
            } else {
                0
            };
            let actual = new
                .count(&def.name)
                .map_err(|e| MigrationError::store(format!("counting new {}", def.name), e))?;
            let tally = tallies.get(&def.name).copied().unwrap_or_default();

            match step.count_policy(&def.name) {
                CountPolicy::Exempt { reason } => {
                    warn!(step = version, entity = %def.name, old_count, actual, %reason, "row count check exempted");
                    checks.push(EntityCheck {
                        entity: def.name.clone(),
                        old_count,
                        expected: None,
                        actual,
                        exemption: Some(reason),
                    });
                }
                CountPolicy::Checked => {
                    let expected = old_count as i64 + tally.inserted as i64
                        - tally.skipped as i64
                        - tally.removed as i64;
                    if expected != actual as i64 {
                        return Err(MigrationError::IntegrityMismatch {
                            step: version,
                            entity: def.name.clone(),
                            expected,
                            actual: actual as i64,
                        });
                    }
                    debug!(step = version, entity = %def.name, old_count, actual, "row count verified");
                    checks.push(EntityCheck {
                        entity: def.name.clone(),
                        old_count,
                        expected: Some(expected),
                        actual,
                        exemption: None,
                    });
                }
            }
        }
        Ok(checks)
    }
}
