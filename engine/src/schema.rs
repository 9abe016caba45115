//! Tracked-table registry.
//!
//! Capture and apply both route by table name. The registry is built once
//! at schema-registration time, so dispatch is a map lookup rather than
//! per-entry string matching scattered through the code. Link tables are
//! registered like entity tables and replicate through the same path.

use std::collections::HashMap;

/// Whether a table holds entities or relationship edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// A primary entity table
    Entity,
    /// A junction table whose rows are links between two records
    Link,
}

/// One tracked table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub kind: TableKind,
}

impl TableDef {
    /// Define an entity table.
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Entity,
        }
    }

    /// Define a link table.
    pub fn link(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Link,
        }
    }
}

/// The set of tables a replica tracks.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: HashMap<String, TableDef>,
}

impl TableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_table(mut self, def: TableDef) -> Self {
        self.register(def);
        self
    }

    /// Register a table, replacing any previous definition of that name.
    pub fn register(&mut self, def: TableDef) {
        self.tables.insert(def.name.clone(), def);
    }

    /// Look up a table by name.
    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Whether a table is tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Names of all tracked tables.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of tracked tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
