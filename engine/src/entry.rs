//! Change entries - the unit of replication.
//!
//! Every committed mutation on a tracked table is captured as one
//! [`ChangeEntry`] in the same transaction. Entries are immutable once
//! created except for the synced flag, and are never deleted.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable, replica-independent 128-bit identifier.
///
/// Assigned once at creation and never changed. Ordering compares the raw
/// bytes, which makes the conflict-resolution tiebreak identical on every
/// replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(Uuid);

impl GlobalId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an identifier from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 raw bytes of this identifier.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse the hyphenated form, as carried in the `last-event-id`
    /// query parameter.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind of mutation an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    /// Single-byte wire code.
    pub fn code(self) -> u8 {
        match self {
            Op::Insert => 0,
            Op::Update => 1,
            Op::Delete => 2,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Op::Insert),
            1 => Some(Op::Update),
            2 => Some(Op::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Insert => write!(f, "insert"),
            Op::Update => write!(f, "update"),
            Op::Delete => write!(f, "delete"),
        }
    }
}

/// Field name to new value, as captured at the originating replica.
///
/// Inserts carry every persisted field, updates only the fields that
/// changed, deletes none.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// One captured mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Unique identifier of the entry itself; dedup and tiebreak key
    pub global_id: GlobalId,
    /// Logical name of the affected table (entity or link table)
    pub table: String,
    /// Mutation kind
    pub op: Op,
    /// Stable identifier of the target row
    pub target: GlobalId,
    /// Replica-local integer key of the target row; never transmitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_id: Option<i64>,
    /// Changed fields (insert/update) or empty (delete)
    pub fields: FieldMap,
    /// Wall-clock seconds since epoch at the originating replica
    pub timestamp: Timestamp,
    /// True once the relay has acknowledged durable receipt
    pub synced: bool,
}

impl ChangeEntry {
    /// Capture an insert of a new row carrying all of its fields.
    pub fn insert(
        table: impl Into<String>,
        target: GlobalId,
        fields: FieldMap,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            global_id: GlobalId::random(),
            table: table.into(),
            op: Op::Insert,
            target,
            row_id: None,
            fields,
            timestamp,
            synced: false,
        }
    }

    /// Capture an update carrying only the changed fields.
    pub fn update(
        table: impl Into<String>,
        target: GlobalId,
        changed: FieldMap,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            global_id: GlobalId::random(),
            table: table.into(),
            op: Op::Update,
            target,
            row_id: None,
            fields: changed,
            timestamp,
            synced: false,
        }
    }

    /// Capture a delete; no fields travel with it.
    pub fn delete(table: impl Into<String>, target: GlobalId, timestamp: Timestamp) -> Self {
        Self {
            global_id: GlobalId::random(),
            table: table.into(),
            op: Op::Delete,
            target,
            row_id: None,
            fields: FieldMap::new(),
            timestamp,
            synced: false,
        }
    }

    /// Whether this entry is a tombstone.
    pub fn is_delete(&self) -> bool {
        self.op == Op::Delete
    }
}
