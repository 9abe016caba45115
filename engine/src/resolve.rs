//! Conflict resolution between an incoming entry and current record state.
//!
//! Both the client apply path and the relay apply path call [`resolve`]
//! with whatever state they hold for the target record; the decision is a
//! pure function of its arguments, so every replica that sees the same set
//! of entries converges on the same winner regardless of delivery order.
//!
//! # Rules
//!
//! 1. Deletes always win; a record that is already a tombstone absorbs
//!    further deletes silently.
//! 2. Inserts and updates against a tombstone are rejected. Re-creating a
//!    deleted record takes a fresh global id.
//! 3. Otherwise the higher timestamp wins; equal timestamps fall back to
//!    comparing entry global ids, larger wins.

use crate::{ChangeEntry, GlobalId, Timestamp};
use std::cmp::Ordering;

/// What the caller should do with an incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Apply the entry to the record state
    Apply,
    /// Drop the entry; current state is newer and will win everywhere
    Reject,
    /// Nothing to do (duplicate of the entry already applied, or a
    /// redundant tombstone)
    Skip,
}

/// The last-applied state of one record, as seen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordVersion {
    /// Timestamp of the entry that last touched the record
    pub timestamp: Timestamp,
    /// Global id of that entry
    pub entry_id: GlobalId,
    /// True if the record has been deleted
    pub deleted: bool,
}

impl RecordVersion {
    /// State after applying `entry`.
    pub fn from_entry(entry: &ChangeEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            entry_id: entry.global_id,
            deleted: entry.is_delete(),
        }
    }
}

/// Decide whether `incoming` supersedes `current`.
///
/// `current` is `None` when this replica has never seen the target record.
/// Idempotence is handled one level up: callers skip entries whose global
/// id is already in the local change log before resolving.
pub fn resolve(incoming: &ChangeEntry, current: Option<&RecordVersion>) -> Resolution {
    let Some(current) = current else {
        return Resolution::Apply;
    };

    if current.deleted {
        return if incoming.is_delete() {
            Resolution::Skip
        } else {
            Resolution::Reject
        };
    }

    if incoming.is_delete() {
        return Resolution::Apply;
    }

    match incoming.timestamp.total_cmp(&current.timestamp) {
        Ordering::Greater => Resolution::Apply,
        Ordering::Less => Resolution::Reject,
        Ordering::Equal => match incoming.global_id.cmp(&current.entry_id) {
            Ordering::Greater => Resolution::Apply,
            Ordering::Less => Resolution::Reject,
            // Same entry redelivered with no log record of it; harmless
            Ordering::Equal => Resolution::Skip,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FieldMap;
    use serde_json::json;

    fn fields() -> FieldMap {
        json!({"value": 1}).as_object().unwrap().clone()
    }

    fn live(timestamp: Timestamp, entry_id: GlobalId) -> RecordVersion {
        RecordVersion {
            timestamp,
            entry_id,
            deleted: false,
        }
    }

    #[test]
    fn apply_to_unknown_record() {
        let entry = ChangeEntry::insert("notes", GlobalId::random(), fields(), 100.0);
        assert_eq!(resolve(&entry, None), Resolution::Apply);
    }

    #[test]
    fn newer_timestamp_wins() {
        let entry = ChangeEntry::update("notes", GlobalId::random(), fields(), 200.0);
        let current = live(100.0, GlobalId::random());
        assert_eq!(resolve(&entry, Some(&current)), Resolution::Apply);
    }

    #[test]
    fn older_timestamp_loses() {
        let entry = ChangeEntry::update("notes", GlobalId::random(), fields(), 100.0);
        let current = live(200.0, GlobalId::random());
        assert_eq!(resolve(&entry, Some(&current)), Resolution::Reject);
    }

    #[test]
    fn equal_timestamp_larger_id_wins() {
        let lo = GlobalId::from_bytes([1u8; 16]);
        let hi = GlobalId::from_bytes([2u8; 16]);

        let mut entry = ChangeEntry::update("notes", GlobalId::random(), fields(), 100.0);
        entry.global_id = hi;
        assert_eq!(resolve(&entry, Some(&live(100.0, lo))), Resolution::Apply);

        entry.global_id = lo;
        assert_eq!(resolve(&entry, Some(&live(100.0, hi))), Resolution::Reject);
    }

    #[test]
    fn same_entry_skips() {
        let entry = ChangeEntry::update("notes", GlobalId::random(), fields(), 100.0);
        let current = live(100.0, entry.global_id);
        assert_eq!(resolve(&entry, Some(&current)), Resolution::Skip);
    }

    #[test]
    fn delete_beats_newer_update_state() {
        // Tombstone semantics: a delete is never rejected by timestamp.
        let entry = ChangeEntry::delete("notes", GlobalId::random(), 100.0);
        let current = live(500.0, GlobalId::random());
        assert_eq!(resolve(&entry, Some(&current)), Resolution::Apply);
    }

    #[test]
    fn duplicate_delete_skips() {
        let entry = ChangeEntry::delete("notes", GlobalId::random(), 300.0);
        let current = RecordVersion {
            timestamp: 200.0,
            entry_id: GlobalId::random(),
            deleted: true,
        };
        assert_eq!(resolve(&entry, Some(&current)), Resolution::Skip);
    }

    #[test]
    fn update_against_tombstone_rejected() {
        let entry = ChangeEntry::update("notes", GlobalId::random(), fields(), 900.0);
        let current = RecordVersion {
            timestamp: 300.0,
            entry_id: GlobalId::random(),
            deleted: true,
        };
        assert_eq!(resolve(&entry, Some(&current)), Resolution::Reject);
    }

    #[test]
    fn resolution_is_order_independent() {
        // Two concurrent updates resolve to the same winner no matter
        // which one a replica applies first.
        let a = ChangeEntry::update("notes", GlobalId::random(), fields(), 150.0);
        let b = ChangeEntry::update("notes", a.target, fields(), 200.0);

        // a first, then b: b applies over a.
        let after_a = RecordVersion::from_entry(&a);
        assert_eq!(resolve(&b, Some(&after_a)), Resolution::Apply);

        // b first, then a: a is rejected.
        let after_b = RecordVersion::from_entry(&b);
        assert_eq!(resolve(&a, Some(&after_b)), Resolution::Reject);
    }
}
