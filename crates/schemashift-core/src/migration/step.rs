//! A single version step: from-snapshot, to-snapshot, migrators, epilogue.

use super::error::{ConfigError, MigrationError, TransformError};
use super::migrator::{check_row, complete_row, EntityMigrator, RowContext, RowOutcome};
use super::state::{EntityTally, RunCache, StepBudget};
use crate::catalog::{EntityDef, SchemaSnapshot};
use crate::storage::{Row, RowKey, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cross-entity fix-up run after every entity of the step was migrated.
pub type EpilogueFn =
    Arc<dyn Fn(&mut EpilogueContext<'_>) -> Result<(), TransformError> + Send + Sync>;

/// Whether the integrity verifier checks an entity's row count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountPolicy {
    /// `expected = old + inserted - skipped - removed`.
    Checked,
    /// Not checked, with the reason recorded.
    Exempt {
        /// Why the count cannot be predicted.
        reason: String,
    },
}

/// Migration from one schema version to the next.
pub struct MigrationStep {
    from: SchemaSnapshot,
    to: SchemaSnapshot,
    migrators: BTreeMap<String, EntityMigrator>,
    /// entity -> (old field -> new field)
    renames: BTreeMap<String, BTreeMap<String, String>>,
    exemptions: BTreeMap<String, String>,
    epilogue: Option<EpilogueFn>,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from", &self.from.version())
            .field("to", &self.to.version())
            .field("migrators", &self.migrators.keys().collect::<Vec<_>>())
            .field("renames", &self.renames)
            .field("exemptions", &self.exemptions)
            .field("epilogue", &self.epilogue.is_some())
            .finish()
    }
}

impl MigrationStep {
    /// Create a step between two snapshots; every entity is copied generically
    /// until a migrator is declared for it.
    pub fn new(from: SchemaSnapshot, to: SchemaSnapshot) -> Self {
        Self {
            from,
            to,
            migrators: BTreeMap::new(),
            renames: BTreeMap::new(),
            exemptions: BTreeMap::new(),
            epilogue: None,
        }
    }

    /// Declare the migrator of one entity.
    pub fn migrator(mut self, migrator: EntityMigrator) -> Self {
        self.migrators.insert(migrator.entity().to_string(), migrator);
        self
    }

    /// Declare a field rename on `entity` (new entity name).
    pub fn rename(
        mut self,
        entity: impl Into<String>,
        old_field: impl Into<String>,
        new_field: impl Into<String>,
    ) -> Self {
        self.renames
            .entry(entity.into())
            .or_default()
            .insert(old_field.into(), new_field.into());
        self
    }

    /// Exempt `entity` from the row-count check.
    pub fn exempt(mut self, entity: impl Into<String>, reason: impl Into<String>) -> Self {
        self.exemptions.insert(entity.into(), reason.into());
        self
    }

    /// Set the epilogue.
    pub fn epilogue<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut EpilogueContext<'_>) -> Result<(), TransformError> + Send + Sync + 'static,
    {
        self.epilogue = Some(Arc::new(f));
        self
    }

    /// Version the step starts from.
    pub fn from_version(&self) -> u32 {
        self.from.version()
    }

    /// Version the step produces.
    pub fn to_version(&self) -> u32 {
        self.to.version()
    }

    /// Snapshot the step reads.
    pub fn from_snapshot(&self) -> &SchemaSnapshot {
        &self.from
    }

    /// Snapshot the step writes.
    pub fn to_snapshot(&self) -> &SchemaSnapshot {
        &self.to
    }

    /// Migrator declared for `entity`, if any.
    pub fn migrator_for(&self, entity: &str) -> Option<&EntityMigrator> {
        self.migrators.get(entity)
    }

    /// Old entity that `entity` is sourced from.
    pub fn source_of<'a>(&'a self, entity: &'a str) -> &'a str {
        self.migrators.get(entity).map_or(entity, |m| m.source())
    }

    /// Count policy of `entity`.
    pub fn count_policy(&self, entity: &str) -> CountPolicy {
        match self.exemptions.get(entity) {
            Some(reason) => CountPolicy::Exempt {
                reason: reason.clone(),
            },
            None => CountPolicy::Checked,
        }
    }

    /// Renames of `entity`, keyed by new field.
    pub fn renames_for(&self, entity: &str) -> BTreeMap<String, String> {
        self.renames
            .get(entity)
            .map(|m| m.iter().map(|(old, new)| (new.clone(), old.clone())).collect())
            .unwrap_or_default()
    }

    /// Check every declaration against the two snapshots.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let step = self.to_version();
        if self.from.version().checked_add(1) != Some(step) {
            return Err(ConfigError::InvalidStep {
                from: self.from.version(),
                to: step,
                reason: "a step must advance exactly one version".to_string(),
            });
        }

        let unknown_entity = |entity: &str| ConfigError::UnknownEntity {
            step,
            entity: entity.to_string(),
        };
        let unknown_field = |entity: &str, field: &str| ConfigError::UnknownField {
            step,
            entity: entity.to_string(),
            field: field.to_string(),
        };

        for (name, migrator) in &self.migrators {
            let def = self.to.get_entity(name).ok_or_else(|| unknown_entity(name))?;
            let old_def = self.from.get_entity(migrator.source());
            if old_def.is_none() && migrator.source() != name {
                return Err(unknown_entity(migrator.source()));
            }

            for field in migrator.overrides().keys() {
                if !def.has_field(field) {
                    return Err(unknown_field(name, field));
                }
            }
            for effect in migrator.side_effects() {
                if !old_def.is_some_and(|d| d.has_field(&effect.field)) {
                    return Err(unknown_field(migrator.source(), &effect.field));
                }
                if !self.to.has_entity(&effect.target) {
                    return Err(unknown_entity(&effect.target));
                }
            }
            for field in migrator.dedup_key().unwrap_or_default() {
                if !old_def.is_some_and(|d| d.has_field(field)) {
                    return Err(unknown_field(migrator.source(), field));
                }
            }
        }

        for (entity, fields) in &self.renames {
            let def = self.to.get_entity(entity).ok_or_else(|| unknown_entity(entity))?;
            let source = self.source_of(entity);
            let old_def = self.from.get_entity(source).ok_or_else(|| unknown_entity(source))?;
            for (old_field, new_field) in fields {
                if !old_def.has_field(old_field) {
                    return Err(unknown_field(source, old_field));
                }
                if !def.has_field(new_field) {
                    return Err(unknown_field(entity, new_field));
                }
            }
        }

        for (entity, reason) in &self.exemptions {
            if !self.to.has_entity(entity) {
                return Err(unknown_entity(entity));
            }
            if reason.trim().is_empty() {
                return Err(ConfigError::MissingReason {
                    step,
                    entity: entity.clone(),
                });
            }
        }

        for def in self.to.entities() {
            let Some(old_def) = self.from.get_entity(self.source_of(&def.name)) else {
                continue;
            };
            let overrides = self.migrators.get(&def.name).map(|m| m.overrides());
            let renames = self.renames_for(&def.name);
            for field in &def.fields {
                let source = renames.get(&field.name).unwrap_or(&field.name);
                let sourced = overrides.is_some_and(|o| o.contains_key(&field.name))
                    || old_def.has_field(source)
                    || field.nullable
                    || field.has_default();
                if !sourced {
                    return Err(ConfigError::UnsourcedField {
                        step,
                        entity: def.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Migrate every entity of the to-snapshot from `old` into `new`, then run
    /// the epilogue. Returns the per-entity tallies.
    pub(crate) fn run(
        &self,
        old: &dyn Store,
        new: &dyn Store,
        now: i64,
        budget: &StepBudget,
        cache: &mut RunCache,
    ) -> Result<BTreeMap<String, EntityTally>, MigrationError> {
        let step = self.to_version();
        let mut tallies: BTreeMap<String, EntityTally> = self
            .to
            .entities()
            .iter()
            .map(|e| (e.name.clone(), EntityTally::default()))
            .collect();

        for def in self.to.entities() {
            let generic;
            let migrator = match self.migrators.get(&def.name) {
                Some(m) => m,
                None => {
                    generic = EntityMigrator::new(def.name.clone());
                    &generic
                }
            };
            let Some(old_def) = self.from.get_entity(migrator.source()) else {
                debug!(step, entity = %def.name, "entity has no old source");
                continue;
            };

            self.migrate_entity(def, old_def, migrator, old, new, now, budget, cache, &mut tallies)?;
        }

        if let Some(epilogue) = &self.epilogue {
            budget.check()?;
            let mut ctx = EpilogueContext {
                step,
                now,
                to: &self.to,
                old,
                new,
                tallies: &mut tallies,
                cache,
                last_entity: None,
            };
            if let Err(cause) = epilogue(&mut ctx) {
                return Err(MigrationError::Transform {
                    step,
                    entity: ctx.last_entity.unwrap_or_else(|| "<epilogue>".to_string()),
                    row: "-".to_string(),
                    cause,
                });
            }
            budget.check()?;
        }

        for (entity, tally) in tallies.iter_mut() {
            tally.written = new
                .count(entity)
                .map_err(|e| MigrationError::store(format!("counting {}", entity), e))?;
        }
        Ok(tallies)
    }

    #[allow(clippy::too_many_arguments)]
    fn migrate_entity(
        &self,
        def: &EntityDef,
        old_def: &EntityDef,
        migrator: &EntityMigrator,
        old: &dyn Store,
        new: &dyn Store,
        now: i64,
        budget: &StepBudget,
        cache: &mut RunCache,
        tallies: &mut BTreeMap<String, EntityTally>,
    ) -> Result<(), MigrationError> {
        let step = self.to_version();
        let source = migrator.source();
        let renames = self.renames_for(&def.name);
        let dedup_scope = format!("dedup:{}:{}", step, def.name);

        debug!(step, entity = %def.name, source, "migrating entity");

        for result in old.scan(source) {
            budget.check()?;
            let old_row =
                result.map_err(|e| MigrationError::store(format!("reading {}", source), e))?;
            tally(tallies, &def.name).read += 1;

            let transform = |cause: TransformError| MigrationError::Transform {
                step,
                entity: def.name.clone(),
                row: old_def
                    .key_of(&old_row)
                    .map(|k| k.to_string())
                    .unwrap_or_else(|_| "<no identity>".to_string()),
                cause,
            };

            if let Some(key) = migrator.dedup_value(&old_row) {
                if cache.seen(&dedup_scope, key) {
                    warn!(step, entity = %def.name, row = ?old_def.key_of(&old_row).ok(), "skipping duplicate row");
                    tally(tallies, &def.name).skipped += 1;
                    continue;
                }
            }

            let ctx = RowContext {
                step,
                entity: &def.name,
                old: &old_row,
                now,
                old_store: old,
                new_store: new,
            };

            let mut row = migrator.build_row(&ctx, def, &renames).map_err(&transform)?;
            if migrator.apply_hooks(&ctx, &mut row, cache).map_err(&transform)? == RowOutcome::Skip {
                tally(tallies, &def.name).skipped += 1;
                continue;
            }
            check_row(def, &row).map_err(&transform)?;

            for (target, rows) in migrator.side_effect_rows(&ctx).map_err(&transform)? {
                let target_def = self
                    .to
                    .get_entity(target)
                    .ok_or_else(|| transform(TransformError::UndeclaredEntity(target.to_string())))?;
                for extra in rows {
                    let extra = complete_row(target_def, extra, now).map_err(&transform)?;
                    let key = target_def.key_of(&extra).map_err(|e| transform(e.into()))?;
                    new.insert(target, &key, &extra).map_err(|e| transform(e.into()))?;
                    tally(tallies, target).inserted += 1;
                }
            }

            let key = def.key_of(&row).map_err(|e| transform(e.into()))?;
            new.insert(&def.name, &key, &row).map_err(|e| transform(e.into()))?;
            tally(tallies, &def.name).processed += 1;
        }
        Ok(())
    }
}

fn tally<'t>(tallies: &'t mut BTreeMap<String, EntityTally>, entity: &str) -> &'t mut EntityTally {
    tallies.entry(entity.to_string()).or_default()
}

/// Both stores of a step, handed to the epilogue.
///
/// Every insert and removal made through the context is tallied as a
/// declared delta of the affected entity.
pub struct EpilogueContext<'a> {
    step: u32,
    now: i64,
    to: &'a SchemaSnapshot,
    old: &'a dyn Store,
    new: &'a dyn Store,
    tallies: &'a mut BTreeMap<String, EntityTally>,
    cache: &'a mut RunCache,
    last_entity: Option<String>,
}

impl<'a> EpilogueContext<'a> {
    /// To-version of the running step.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Run timestamp.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Run-scoped cache.
    pub fn cache(&mut self) -> &mut RunCache {
        self.cache
    }

    fn entity_def(&mut self, entity: &str) -> Result<&'a EntityDef, TransformError> {
        self.last_entity = Some(entity.to_string());
        self.to
            .get_entity(entity)
            .ok_or_else(|| TransformError::UndeclaredEntity(entity.to_string()))
    }

    /// All rows of an entity in the old store.
    pub fn scan_old(&mut self, entity: &str) -> Result<Vec<Row>, TransformError> {
        self.last_entity = Some(entity.to_string());
        Ok(self.old.scan(entity).collect::<Result<Vec<_>, _>>()?)
    }

    /// All rows of an entity in the new store.
    pub fn scan_new(&mut self, entity: &str) -> Result<Vec<Row>, TransformError> {
        self.last_entity = Some(entity.to_string());
        Ok(self.new.scan(entity).collect::<Result<Vec<_>, _>>()?)
    }

    /// Look a row up in the new store.
    pub fn get_new(&mut self, entity: &str, key: &RowKey) -> Result<Option<Row>, TransformError> {
        self.last_entity = Some(entity.to_string());
        Ok(self.new.get(entity, key)?)
    }

    /// Insert a row into the new store; missing fields take their defaults.
    pub fn insert(&mut self, entity: &str, row: Row) -> Result<(), TransformError> {
        let def = self.entity_def(entity)?;
        let row = complete_row(def, row, self.now)?;
        let key = def.key_of(&row)?;
        self.new.insert(entity, &key, &row)?;
        tally(self.tallies, entity).inserted += 1;
        Ok(())
    }

    /// Overwrite an existing row of the new store.
    pub fn replace(&mut self, entity: &str, row: Row) -> Result<bool, TransformError> {
        let def = self.entity_def(entity)?;
        let row = complete_row(def, row, self.now)?;
        let key = def.key_of(&row)?;
        Ok(self.new.replace(entity, &key, &row)?)
    }

    /// Remove a row from the new store.
    pub fn remove(&mut self, entity: &str, key: &RowKey) -> Result<bool, TransformError> {
        self.entity_def(entity)?;
        let removed = self.new.remove(entity, key)?;
        if removed {
            tally(self.tallies, entity).removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DefaultValue, FieldDef, ScalarType};
    use crate::storage::{SledStore, StorageConfig};
    use crate::value::Value;

    fn option_entity(order_field: &str) -> EntityDef {
        EntityDef::new("FieldOption", "id").with_fields([
            FieldDef::new("id", ScalarType::String),
            FieldDef::new(order_field, ScalarType::Int),
            FieldDef::new("score_points", ScalarType::Int),
        ])
    }

    fn step() -> MigrationStep {
        let from = SchemaSnapshot::new(1).with_entity(option_entity("order"));
        let to = SchemaSnapshot::new(2).with_entity(
            option_entity("presentation_order")
                .with_field(FieldDef::new("score_type", ScalarType::Int)),
        );
        MigrationStep::new(from, to)
            .rename("FieldOption", "order", "presentation_order")
            .migrator(EntityMigrator::new("FieldOption").derive("score_type", |ctx| {
                let points = ctx.field("score_points")?.as_i64().unwrap_or(0);
                Ok(Value::Int(if points != 0 { 1 } else { 0 }))
            }))
    }

    struct Stores {
        old: SledStore,
        new: SledStore,
        _dir: tempfile::TempDir,
    }

    fn stores() -> Stores {
        let dir = tempfile::tempdir().unwrap();
        let old = SledStore::open(&StorageConfig::new(dir.path().join("old"))).unwrap();
        let new = SledStore::open(&StorageConfig::new(dir.path().join("new"))).unwrap();
        Stores { old, new, _dir: dir }
    }

    fn key(id: &str) -> RowKey {
        RowKey::new(vec![Value::from(id)])
    }

    #[test]
    fn test_validate_ok() {
        step().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_version_gap() {
        let step = MigrationStep::new(SchemaSnapshot::new(1), SchemaSnapshot::new(3));
        assert!(matches!(step.validate(), Err(ConfigError::InvalidStep { .. })));
    }

    #[test]
    fn test_validate_rejects_unsourced_field() {
        let from = SchemaSnapshot::new(1).with_entity(option_entity("order"));
        let to = SchemaSnapshot::new(2).with_entity(
            option_entity("order").with_field(FieldDef::new("score_type", ScalarType::Int)),
        );
        let err = MigrationStep::new(from, to).validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnsourcedField { field, .. } if field == "score_type"));
    }

    #[test]
    fn test_validate_accepts_defaulted_field() {
        let from = SchemaSnapshot::new(1).with_entity(option_entity("order"));
        let to = SchemaSnapshot::new(2).with_entity(option_entity("order").with_field(
            FieldDef::new("score_type", ScalarType::Int).with_default(DefaultValue::Int(0)),
        ));
        MigrationStep::new(from, to).validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_names() {
        let err = step()
            .rename("FieldOption", "missing", "presentation_order")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { field, .. } if field == "missing"));

        let err = step()
            .migrator(EntityMigrator::new("Ghost"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEntity { entity, .. } if entity == "Ghost"));
    }

    #[test]
    fn test_validate_requires_exemption_reason() {
        let err = step().exempt("FieldOption", "  ").validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingReason { .. }));
        step()
            .exempt("FieldOption", "rows are regenerated")
            .validate()
            .unwrap();
    }

    #[test]
    fn test_run_copies_renames_and_derives() {
        let stores = stores();
        for (id, order, points) in [("a", 1, 0), ("b", 2, 5)] {
            stores
                .old
                .insert(
                    "FieldOption",
                    &key(id),
                    &Row::new().with("id", id).with("order", order).with("score_points", points),
                )
                .unwrap();
        }

        let budget = StepBudget::start(2, None);
        let mut cache = RunCache::new();
        let tallies = step()
            .run(&stores.old, &stores.new, 0, &budget, &mut cache)
            .unwrap();

        let b = stores.new.get("FieldOption", &key("b")).unwrap().unwrap();
        assert_eq!(b.int("presentation_order"), Some(2));
        assert_eq!(b.int("score_type"), Some(1));
        assert!(!b.contains("order"));
        let a = stores.new.get("FieldOption", &key("a")).unwrap().unwrap();
        assert_eq!(a.int("score_type"), Some(0));

        let tally = tallies["FieldOption"];
        assert_eq!((tally.read, tally.processed, tally.written), (2, 2, 2));
    }

    #[test]
    fn test_epilogue_tallies_inserts_and_removals() {
        let stores = stores();
        stores
            .old
            .insert(
                "FieldOption",
                &key("a"),
                &Row::new().with("id", "a").with("order", 1).with("score_points", 0),
            )
            .unwrap();

        let step = step().epilogue(|ctx| {
            ctx.insert(
                "FieldOption",
                Row::new()
                    .with("id", "z")
                    .with("presentation_order", 9)
                    .with("score_points", 0)
                    .with("score_type", 0),
            )?;
            ctx.remove("FieldOption", &RowKey::new(vec![Value::from("a")]))?;
            Ok(())
        });

        let budget = StepBudget::start(2, None);
        let mut cache = RunCache::new();
        let tallies = step
            .run(&stores.old, &stores.new, 0, &budget, &mut cache)
            .unwrap();
        let tally = tallies["FieldOption"];
        assert_eq!((tally.inserted, tally.removed, tally.written), (1, 1, 1));
    }

    #[test]
    fn test_transform_error_names_row() {
        let stores = stores();
        stores
            .old
            .insert(
                "FieldOption",
                &key("a"),
                &Row::new().with("id", "a").with("order", "first").with("score_points", 0),
            )
            .unwrap();

        let budget = StepBudget::start(2, None);
        let mut cache = RunCache::new();
        let err = step()
            .run(&stores.old, &stores.new, 0, &budget, &mut cache)
            .unwrap_err();
        match err {
            MigrationError::Transform { step, entity, row, cause } => {
                assert_eq!(step, 2);
                assert_eq!(entity, "FieldOption");
                assert_eq!(row, "(\"a\")");
                assert!(matches!(cause, TransformError::TypeMismatch { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
