//! Schema snapshot - frozen description of the entire schema at one version.

use super::EntityDef;

/// A versioned, ordered description of every entity.
///
/// Entity order is significant: it is the order in which a migration step
/// populates the scratch store, so entities referenced by others come first.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSnapshot {
    version: u32,
    entities: Vec<EntityDef>,
}

impl SchemaSnapshot {
    /// Create an empty snapshot.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entities: Vec::new(),
        }
    }

    /// Add an entity. A later declaration with the same name replaces the
    /// earlier one in place.
    pub fn with_entity(mut self, entity: EntityDef) -> Self {
        match self.entities.iter_mut().find(|e| e.name == entity.name) {
            Some(existing) => *existing = entity,
            None => self.entities.push(entity),
        }
        self
    }

    /// Schema version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Entities in declared order.
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    /// Get an entity by name.
    pub fn get_entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Check whether an entity is declared.
    pub fn has_entity(&self, name: &str) -> bool {
        self.get_entity(name).is_some()
    }

    /// List all entity names in declared order.
    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }
}
