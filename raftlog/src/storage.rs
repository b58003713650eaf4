use metastore_model::raft::{ConfState, Entry, HardState, Snapshot};
use metastore_model::{CResult, Revision};

/// The capability set required by the Raft Node (SPEC_FULL.md §4.5),
/// implemented by both `MemStorage` and `LsmRaftStorage`.
///
/// `Revision` is reused here as the type alias for a Raft log index — both
/// are monotone `u64` counters and the reuse avoids a redundant type.
pub trait RaftStorage: Send + Sync {
    fn initial_state(&self) -> CResult<(HardState, ConfState)>;

    /// Entries in `[lo, hi)`, cut off after the first entry if a single
    /// entry exceeds `max_size`.
    fn entries(&self, lo: u64, hi: u64, max_size: Option<u64>) -> CResult<Vec<Entry>>;

    /// `*Compacted*` if `index` is below the log floor, `*Unavailable*` if
    /// beyond the horizon (SPEC_FULL.md §4.5).
    fn term(&self, index: u64) -> CResult<u64>;

    fn first_index(&self) -> CResult<u64>;

    fn last_index(&self) -> CResult<u64>;

    fn snapshot(&self) -> CResult<Snapshot>;

    /// Overwrites any conflicting tail; atomic with respect to readers.
    /// Must be durable before the Raft Node sends outbound messages
    /// derived from the appended entries (SPEC_FULL.md §4.5).
    fn append(&self, entries: &[Entry]) -> CResult<()>;

    /// Must be durable before the Raft Node sends outbound messages
    /// derived from this update.
    fn set_hard_state(&self, hs: HardState) -> CResult<()>;

    fn create_snapshot(&self, index: u64, conf_state: ConfState, data: Vec<u8>) -> CResult<()>;

    /// Used only on followers receiving a snapshot from the leader.
    fn apply_snapshot(&self, snap: Snapshot) -> CResult<()>;

    /// Drops entries strictly below `index`; rejects (`*Compacted*`) if the
    /// requested floor is below the current floor.
    fn compact(&self, index: Revision) -> CResult<()>;
}
