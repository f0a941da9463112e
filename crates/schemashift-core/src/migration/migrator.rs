//! Per-entity row migration.
//!
//! An [`EntityMigrator`] turns one old row into one new row. Fields present in
//! both snapshots under the same (or renamed) name are copied verbatim; the
//! rest come from overrides or the field's default. Overrides are pure
//! functions of the old row and read-only lookups; mutable run-scoped state
//! is only handed to row hooks.

use super::error::TransformError;
use super::state::RunCache;
use crate::catalog::EntityDef;
use crate::storage::{Row, RowKey, Store};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Computes a new field value.
pub type DeriveFn = Arc<dyn Fn(&RowContext<'_>) -> Result<Value, TransformError> + Send + Sync>;

/// Produces rows of another entity out of a dropped field.
pub type SideEffectFn =
    Arc<dyn Fn(&RowContext<'_>) -> Result<Vec<Row>, TransformError> + Send + Sync>;

/// Adjusts a freshly built row using run-scoped state.
pub type RowHookFn = Arc<
    dyn Fn(&RowContext<'_>, &mut Row, &mut RunCache) -> Result<RowOutcome, TransformError>
        + Send
        + Sync,
>;

/// What a row hook decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// Write the row.
    Write,
    /// Drop the row; counted as a declared skip.
    Skip,
}

/// How a new field gets its value when it is not a plain copy.
#[derive(Clone)]
pub enum FieldOverride {
    /// Computed from the old row and lookups.
    Derive(DeriveFn),
    /// Fixed value.
    Static(Value),
}

impl std::fmt::Debug for FieldOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldOverride::Derive(_) => write!(f, "Derive(..)"),
            FieldOverride::Static(v) => write!(f, "Static({:?})", v),
        }
    }
}

/// An old field redistributed into rows of another entity.
#[derive(Clone)]
pub struct SideEffect {
    /// Old field that disappears.
    pub field: String,
    /// Entity receiving the produced rows.
    pub target: String,
    produce: SideEffectFn,
}

impl std::fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffect")
            .field("field", &self.field)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Read-only view handed to overrides and hooks for one old row.
pub struct RowContext<'a> {
    pub(crate) step: u32,
    pub(crate) entity: &'a str,
    pub(crate) old: &'a Row,
    pub(crate) now: i64,
    pub(crate) old_store: &'a dyn Store,
    pub(crate) new_store: &'a dyn Store,
}

impl<'a> RowContext<'a> {
    /// To-version of the running step.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Entity being migrated (new name).
    pub fn entity(&self) -> &str {
        self.entity
    }

    /// The old row.
    pub fn old(&self) -> &Row {
        self.old
    }

    /// A field of the old row, failing if absent.
    pub fn field(&self, name: &str) -> Result<&Value, TransformError> {
        self.old
            .get(name)
            .ok_or_else(|| TransformError::MissingField(name.to_string()))
    }

    /// Run timestamp.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Look a row up by identity in the old store.
    pub fn lookup_old(&self, entity: &str, key: &RowKey) -> Result<Option<Row>, TransformError> {
        Ok(self.old_store.get(entity, key)?)
    }

    /// All rows of an entity in the old store.
    pub fn scan_old(&self, entity: &str) -> Result<Vec<Row>, TransformError> {
        Ok(self.old_store.scan(entity).collect::<Result<Vec<_>, _>>()?)
    }

    /// Look an already-migrated row up in the new store.
    pub fn lookup_new(&self, entity: &str, key: &RowKey) -> Result<Option<Row>, TransformError> {
        Ok(self.new_store.get(entity, key)?)
    }
}

/// Migration rules for one entity of the to-snapshot.
#[derive(Clone, Debug)]
pub struct EntityMigrator {
    entity: String,
    source: Option<String>,
    overrides: BTreeMap<String, FieldOverride>,
    side_effects: Vec<SideEffect>,
    dedup_key: Option<Vec<String>>,
    hooks: Vec<HookEntry>,
}

#[derive(Clone)]
struct HookEntry(RowHookFn);

impl std::fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RowHook(..)")
    }
}

impl EntityMigrator {
    /// Generic copy of `entity` with no overrides.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            source: None,
            overrides: BTreeMap::new(),
            side_effects: Vec::new(),
            dedup_key: None,
            hooks: Vec::new(),
        }
    }

    /// Read rows from a differently-named old entity.
    pub fn from_entity(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Compute `field` from the old row.
    pub fn derive<F>(mut self, field: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RowContext<'_>) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        self.overrides
            .insert(field.into(), FieldOverride::Derive(Arc::new(f)));
        self
    }

    /// Set `field` to a fixed value.
    pub fn constant(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides
            .insert(field.into(), FieldOverride::Static(value.into()));
        self
    }

    /// Redistribute the dropped old `field` into rows of `target`.
    pub fn drop_into<F>(mut self, field: impl Into<String>, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RowContext<'_>) -> Result<Vec<Row>, TransformError> + Send + Sync + 'static,
    {
        self.side_effects.push(SideEffect {
            field: field.into(),
            target: target.into(),
            produce: Arc::new(f),
        });
        self
    }

    /// Keep only the first row for each value of `fields`.
    pub fn dedup_on<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedup_key = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Run `hook` on every built row, in declaration order.
    pub fn on_row<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RowContext<'_>, &mut Row, &mut RunCache) -> Result<RowOutcome, TransformError>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.push(HookEntry(Arc::new(hook)));
        self
    }

    /// Entity produced (new name).
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Old entity rows are read from.
    pub fn source(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.entity)
    }

    /// Declared overrides, keyed by new field.
    pub fn overrides(&self) -> &BTreeMap<String, FieldOverride> {
        &self.overrides
    }

    /// Declared side effects.
    pub fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }

    /// De-duplication key, if any.
    pub fn dedup_key(&self) -> Option<&[String]> {
        self.dedup_key.as_deref()
    }

    /// Rendered de-duplication key of an old row.
    pub(crate) fn dedup_value(&self, row: &Row) -> Option<String> {
        let fields = self.dedup_key.as_ref()?;
        let parts: Vec<String> = fields
            .iter()
            .map(|f| row.get(f).map_or_else(|| "null".to_string(), |v| format!("{:?}", v)))
            .collect();
        Some(parts.join("\u{1f}"))
    }

    /// Build the new row for `def` out of `ctx.old()`.
    ///
    /// `renames` maps new field names to old ones.
    pub(crate) fn build_row(
        &self,
        ctx: &RowContext<'_>,
        def: &EntityDef,
        renames: &BTreeMap<String, String>,
    ) -> Result<Row, TransformError> {
        let mut row = Row::new();
        for field in &def.fields {
            let value = match self.overrides.get(&field.name) {
                Some(FieldOverride::Derive(f)) => f(ctx)?,
                Some(FieldOverride::Static(v)) => v.clone(),
                None => {
                    let source = renames.get(&field.name).unwrap_or(&field.name);
                    match ctx.old.get(source) {
                        Some(v) => v.clone(),
                        None => field
                            .fallback(ctx.now)
                            .ok_or_else(|| TransformError::MissingField(source.clone()))?,
                    }
                }
            };
            row.set(field.name.clone(), value);
        }
        Ok(row)
    }

    /// Run the row hooks in order; stops at the first skip.
    pub(crate) fn apply_hooks(
        &self,
        ctx: &RowContext<'_>,
        row: &mut Row,
        cache: &mut RunCache,
    ) -> Result<RowOutcome, TransformError> {
        for HookEntry(hook) in &self.hooks {
            if hook(ctx, row, cache)? == RowOutcome::Skip {
                return Ok(RowOutcome::Skip);
            }
        }
        Ok(RowOutcome::Write)
    }

    /// Rows produced by the side effects, with their target entity.
    pub(crate) fn side_effect_rows(
        &self,
        ctx: &RowContext<'_>,
    ) -> Result<Vec<(&str, Vec<Row>)>, TransformError> {
        self.side_effects
            .iter()
            .map(|effect| Ok((effect.target.as_str(), (effect.produce)(ctx)?)))
            .collect()
    }
}

/// Fill missing declared fields from their fallbacks and check every value
/// against the declared type and nullability.
pub(crate) fn complete_row(def: &EntityDef, mut row: Row, now: i64) -> Result<Row, TransformError> {
    for (name, _) in row.iter() {
        if !def.has_field(name) {
            return Err(TransformError::UndeclaredField {
                entity: def.name.clone(),
                field: name.to_string(),
            });
        }
    }
    for field in &def.fields {
        if !row.contains(&field.name) {
            let value = field
                .fallback(now)
                .ok_or_else(|| TransformError::MissingField(field.name.clone()))?;
            row.set(field.name.clone(), value);
        }
    }
    check_row(def, &row)?;
    Ok(row)
}

/// Check every declared field of `row` against its type and nullability.
pub(crate) fn check_row(def: &EntityDef, row: &Row) -> Result<(), TransformError> {
    for field in &def.fields {
        let value = row
            .get(&field.name)
            .ok_or_else(|| TransformError::MissingField(field.name.clone()))?;
        if field.admits(value) {
            continue;
        }
        if value.is_null() {
            return Err(TransformError::NullValue(field.name.clone()));
        }
        return Err(TransformError::TypeMismatch {
            field: field.name.clone(),
            expected: field.scalar.to_string(),
            found: value.type_name().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DefaultValue, FieldDef, ScalarType};
    use crate::storage::{SledStore, StorageConfig};

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

    fn context_def() -> EntityDef {
        EntityDef::new("Context", "id").with_fields([
            FieldDef::new("id", ScalarType::String),
            FieldDef::new("name", ScalarType::String),
            FieldDef::new("status", ScalarType::Int),
            FieldDef::new("tip_timetolive", ScalarType::Int).with_default(DefaultValue::Int(90)),
            FieldDef::optional("description", ScalarType::String),
        ])
    }

    fn ctx<'a>(stores: &'a Stores, old: &'a Row) -> RowContext<'a> {
        RowContext {
            step: 46,
            entity: "Context",
            old,
            now: 1_000,
            old_store: &stores.old,
            new_store: &stores.new,
        }
    }

    #[test]
    fn test_generic_copy_and_defaults() {
        let stores = stores();
        let old = Row::new()
            .with("id", "c1")
            .with("name", "Default")
            .with("status", 1)
            .with("show_context", true);

        let row = EntityMigrator::new("Context")
            .build_row(&ctx(&stores, &old), &context_def(), &BTreeMap::new())
            .unwrap();

        assert_eq!(row.str("name"), Some("Default"));
        assert_eq!(row.int("tip_timetolive"), Some(90));
        assert_eq!(row.get("description"), Some(&Value::Null));
        assert!(!row.contains("show_context"));
    }

    #[test]
    fn test_derive_and_rename() {
        let stores = stores();
        let old = Row::new()
            .with("id", "c1")
            .with("label", "Default")
            .with("show_context", false);

        let migrator = EntityMigrator::new("Context").derive("status", |ctx| {
            let shown = ctx.field("show_context")?.as_bool().unwrap_or(false);
            Ok(Value::Int(if shown { 1 } else { 2 }))
        });
        let mut renames = BTreeMap::new();
        renames.insert("name".to_string(), "label".to_string());

        let row = migrator
            .build_row(&ctx(&stores, &old), &context_def(), &renames)
            .unwrap();
        assert_eq!(row.str("name"), Some("Default"));
        assert_eq!(row.int("status"), Some(2));
    }

    #[test]
    fn test_missing_required_source() {
        let stores = stores();
        let old = Row::new().with("id", "c1").with("name", "x");

        let err = EntityMigrator::new("Context")
            .build_row(&ctx(&stores, &old), &context_def(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingField(f) if f == "status"));
    }

    #[test]
    fn test_lookup_with_fallback() {
        let stores = stores();
        let key = RowKey::new(vec![Value::from("u1")]);
        stores
            .old
            .insert("Receiver", &key, &Row::new().with("id", "u1").with("can_delete", true))
            .unwrap();

        let migrator = EntityMigrator::new("User").derive("can_delete_submission", |ctx| {
            let key = RowKey::new(vec![ctx.field("id")?.clone()]);
            Ok(ctx
                .lookup_old("Receiver", &key)?
                .and_then(|r| r.bool("can_delete"))
                .unwrap_or(false)
                .into())
        });
        let def = EntityDef::new("User", "id").with_fields([
            FieldDef::new("id", ScalarType::String),
            FieldDef::new("can_delete_submission", ScalarType::Bool),
        ]);

        for (id, expected) in [("u1", true), ("u2", false)] {
            let old = Row::new().with("id", id);
            let row = migrator
                .build_row(&ctx(&stores, &old), &def, &BTreeMap::new())
                .unwrap();
            assert_eq!(row.bool("can_delete_submission"), Some(expected));
        }
    }

    #[test]
    fn test_hooks_and_dedup_value() {
        let stores = stores();
        let old = Row::new().with("id", "f1").with("filename", "x.pdf");
        let migrator = EntityMigrator::new("InternalFile")
            .dedup_on(["filename"])
            .on_row(|_, row, cache| {
                let name = row.str("filename").unwrap_or_default().to_string();
                Ok(if cache.seen("hook", name) {
                    RowOutcome::Skip
                } else {
                    RowOutcome::Write
                })
            });

        assert_eq!(
            migrator.dedup_value(&old),
            migrator.dedup_value(&Row::new().with("id", "f2").with("filename", "x.pdf"))
        );

        let mut cache = RunCache::new();
        let mut row = old.clone();
        let context = ctx(&stores, &old);
        assert_eq!(migrator.apply_hooks(&context, &mut row, &mut cache).unwrap(), RowOutcome::Write);
        assert_eq!(migrator.apply_hooks(&context, &mut row, &mut cache).unwrap(), RowOutcome::Skip);
    }

    #[test]
    fn test_complete_row_checks_types() {
        let def = context_def();

        let row = complete_row(
            &def,
            Row::new().with("id", "c").with("name", "n").with("status", 1),
            0,
        )
        .unwrap();
        assert_eq!(row.int("tip_timetolive"), Some(90));

        let err = complete_row(
            &def,
            Row::new().with("id", "c").with("name", "n").with("status", "enabled"),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::TypeMismatch { .. }));

        let err = complete_row(
            &def,
            Row::new().with("id", "c").with("name", Value::Null).with("status", 1),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::NullValue(f) if f == "name"));

        let err = complete_row(&def, Row::new().with("bogus", 1), 0).unwrap_err();
        assert!(matches!(err, TransformError::UndeclaredField { .. }));
    }
}
