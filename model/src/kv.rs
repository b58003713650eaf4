use serde::{Deserialize, Serialize};

use crate::lease::LeaseId;

/// Process-wide monotone revision counter. Starts at 0; incremented by
/// exactly one per applied mutating operation (SPEC_FULL.md §3).
pub type Revision = u64;

/// The atomic unit of storage (SPEC_FULL.md §3, `KeyValue`).
///
/// Invariant: for any live key, `create_revision <= mod_revision`,
/// `version >= 1`, and `mod_revision <= current_revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: u64,
    pub lease_id: LeaseId,
}

impl KeyValue {
    /// Build the first live version of a key, as produced by a Put against
    /// an absent key: `create_revision == mod_revision == revision`.
    pub fn created(key: Vec<u8>, value: Vec<u8>, revision: Revision, lease_id: LeaseId) -> Self {
        KeyValue {
            key,
            value,
            create_revision: revision,
            mod_revision: revision,
            version: 1,
            lease_id,
        }
    }

    /// Apply a subsequent Put against an already-live key: `create_revision`
    /// and `version` carry forward per the data-model rules (SPEC_FULL.md §4.3).
    pub fn updated(&self, value: Vec<u8>, revision: Revision, lease_id: LeaseId) -> Self {
        KeyValue {
            key: self.key.clone(),
            value,
            create_revision: self.create_revision,
            mod_revision: revision,
            version: self.version + 1,
            lease_id,
        }
    }

    /// The tombstone stamp for a Delete's watch event: carries the deleted
    /// key's last live value but `mod_revision` set to the delete's own
    /// revision, not the revision of whatever Put last touched it. Watch
    /// streams filter events on `mod_revision >= start_revision`
    /// (SPEC_FULL.md §3), so a Delete must be stamped with the revision it
    /// actually occurred at or a watch starting between the last Put and
    /// the Delete would never see it.
    pub fn deleted_at(&self, revision: Revision) -> Self {
        KeyValue {
            mod_revision: revision,
            ..self.clone()
        }
    }
}

/// Maximum key size in bytes (SPEC_FULL.md §3: "≤ 1.5 KiB").
pub const MAX_KEY_BYTES: usize = 1536;
/// Maximum value size in bytes (SPEC_FULL.md §3: "≤ 1 MiB").
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// `range_end` sentinel meaning "all keys >= key" (SPEC_FULL.md §4.1).
pub const RANGE_END_OPEN: &[u8] = &[0u8];

/// Classify a `(key, range_end)` pair into its three forms (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind<'a> {
    /// `range_end` empty: a single-key lookup.
    Point,
    /// `range_end == "\x00"`: open upper bound, all keys `>= key`.
    Open,
    /// Otherwise: the half-open interval `[key, range_end)`.
    Bounded(&'a [u8]),
}

pub fn classify_range<'a>(range_end: &'a [u8]) -> RangeKind<'a> {
    if range_end.is_empty() {
        RangeKind::Point
    } else if range_end == RANGE_END_OPEN {
        RangeKind::Open
    } else {
        RangeKind::Bounded(range_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_sets_create_and_mod_revision_equal() {
        let kv = KeyValue::created(b"a".to_vec(), b"1".to_vec(), 1, 0);
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 1);
        assert_eq!(kv.version, 1);
    }

    #[test]
    fn updated_preserves_create_revision_and_bumps_version() {
        let kv = KeyValue::created(b"a".to_vec(), b"1".to_vec(), 1, 0);
        let kv2 = kv.updated(b"2".to_vec(), 2, 0);
        assert_eq!(kv2.create_revision, 1);
        assert_eq!(kv2.mod_revision, 2);
        assert_eq!(kv2.version, 2);
    }

    #[test]
    fn deleted_at_stamps_the_delete_revision_without_touching_version() {
        let kv = KeyValue::created(b"a".to_vec(), b"1".to_vec(), 1, 0);
        let tombstone = kv.deleted_at(5);
        assert_eq!(tombstone.mod_revision, 5);
        assert_eq!(tombstone.create_revision, 1);
        assert_eq!(tombstone.version, 1);
        assert_eq!(tombstone.value, b"1");
    }

    #[test]
    fn classify_range_matches_spec_forms() {
        assert_eq!(classify_range(b""), RangeKind::Point);
        assert_eq!(classify_range(RANGE_END_OPEN), RangeKind::Open);
        assert_eq!(classify_range(b"z"), RangeKind::Bounded(b"z"));
    }
}
