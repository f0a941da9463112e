//! Entity definitions.

use super::field::FieldDef;
use crate::error::Error;
use crate::storage::{Row, RowKey};

/// An entity definition (table shape) at one schema version.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    /// Entity name (unique within a snapshot).
    pub name: String,
    /// Names of the identity (primary key) fields, in key order.
    pub identity: Vec<String>,
    /// Field definitions, in declaration order.
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    /// Create a new entity definition with a single identity field.
    pub fn new(name: impl Into<String>, identity_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: vec![identity_field.into()],
            fields: Vec::new(),
        }
    }

    /// Create an entity with a composite identity.
    pub fn with_composite_identity<I, S>(name: impl Into<String>, identity: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            identity: identity.into_iter().map(Into::into).collect(),
            fields: Vec::new(),
        }
    }

    /// Add a field to the entity.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add multiple fields.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Get a field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check whether a field is declared.
    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    /// Iterate field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Extract the identity key of a row.
    pub fn key_of(&self, row: &Row) -> Result<RowKey, Error> {
        let mut values = Vec::with_capacity(self.identity.len());
        for field in &self.identity {
            match row.get(field) {
                Some(value) if !value.is_null() => values.push(value.clone()),
                _ => {
                    return Err(Error::MissingIdentity {
                        entity: self.name.clone(),
                        field: field.clone(),
                    })
                }
            }
        }
        Ok(RowKey::new(values))
    }
}
