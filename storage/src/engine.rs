use metastore_model::{CResult, KeyValue, LeaseId, Revision, TxnRequest, TxnResponse, WatchEvent};
use serde::{Deserialize, Serialize};

/// A pending change to a lease's key set, produced by applying a Put or
/// Delete against a leased key. The engine itself does not own lease
/// bookkeeping (that's the Lease Registry's job) — it only reports what
/// changed so the caller can forward the delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDelta {
    Associate { lease_id: LeaseId, key: Vec<u8> },
    Dissociate { lease_id: LeaseId, key: Vec<u8> },
}

/// The per-operation result shape returned by the Store facade
/// (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Put {
        revision: Revision,
        prev_kv: Option<KeyValue>,
    },
    DeleteRange {
        revision: Revision,
        deleted: Vec<KeyValue>,
    },
    Txn(TxnResponse),
}

/// Everything produced by applying one committed operation: the client-
/// visible result, the watch events it generates, and any lease deltas.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub outcome: OpOutcome,
    pub events: Vec<WatchEvent>,
    pub lease_deltas: Vec<LeaseDelta>,
}

/// The capability set both KV backends implement (SPEC_FULL.md §9: "avoid
/// inheritance; use a small interface with two implementations chosen at
/// startup").
///
/// `range` is a read that never touches Raft; the four `apply_*` methods are
/// only ever called from the single apply loop consuming the Raft commit
/// stream, already-validated and already-decoded.
pub trait KvStore: Send + Sync {
    /// Serve a Range read directly against live state. `revision` must
    /// already have been checked against the current/compacted bounds by
    /// the caller (the Store facade); engines only service
    /// `revision == current_revision` (SPEC_FULL.md §9, decided: no
    /// historical MVCC).
    fn range(
        &self,
        key: &[u8],
        range_end: &[u8],
        limit: u64,
    ) -> (Vec<KeyValue>, u64);

    fn apply_put(&self, key: Vec<u8>, value: Vec<u8>, lease_id: LeaseId) -> ApplyOutcome;

    fn apply_delete_range(&self, key: &[u8], range_end: &[u8]) -> ApplyOutcome;

    fn apply_txn(&self, txn: &TxnRequest) -> ApplyOutcome;

    fn current_revision(&self) -> Revision;

    fn compacted_revision(&self) -> Revision;

    /// Raise the compaction floor. Rejects a floor at or below the current
    /// one, or above `current_revision` (SPEC_FULL.md §4.1, §8).
    fn compact(&self, revision: Revision) -> CResult<()>;

    /// Serialize `{current_revision, compacted_revision, keys}` into the
    /// envelope format described in SPEC_FULL.md §6.
    fn snapshot(&self) -> CResult<Vec<u8>>;

    /// Replace all live state with the contents of a snapshot envelope.
    fn restore(&self, data: &[u8]) -> CResult<()>;
}

/// The KV-only slice of the full snapshot envelope described in
/// SPEC_FULL.md §6 (`{current_revision, compacted_revision, []Lease,
/// []KeyValue}`). `store` composes this with the Lease Registry's own
/// export to build the full wire envelope; both `MemoryStore` and
/// `LsmStore` encode/decode exactly this shape so `store` never needs to
/// know which backend produced the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSnapshotEnvelope {
    pub current_revision: Revision,
    pub compacted_revision: Revision,
    pub kvs: Vec<KeyValue>,
}
