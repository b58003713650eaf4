//! Bridges `metastore_raftlog::RaftStorage` (our own trait, shared with
//! `raftlog`'s tests and independent of any consensus crate) to
//! `raft::storage::Storage`, the trait raft-rs's `RawNode` actually drives.

use std::sync::Arc;

use metastore_raftlog::RaftStorage;
use raft::prelude::{ConfState as WireConfState, Entry as WireEntry, Snapshot as WireSnapshot};
use raft::{Error as RaftError, GetEntriesContext, RaftState, Result as RaftResult, StorageError};

use crate::convert::{conf_state_from_wire, entry_to_wire, hard_state_from_wire, snapshot_to_wire};

/// Adapts any `RaftStorage` implementation (`MemStorage`, `LsmRaftStorage`)
/// to the trait raft-rs expects from a `RawNode`'s backing store.
pub struct StorageAdapter<S: RaftStorage + ?Sized> {
    inner: Arc<S>,
}

impl<S: RaftStorage + ?Sized> StorageAdapter<S> {
    pub fn new(inner: Arc<S>) -> Self {
        StorageAdapter { inner }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

impl<S: RaftStorage + ?Sized> Clone for StorageAdapter<S> {
    fn clone(&self) -> Self {
        StorageAdapter {
            inner: self.inner.clone(),
        }
    }
}

fn to_raft_error(e: metastore_model::Error) -> RaftError {
    use metastore_model::Error as E;
    match e {
        E::Compacted { .. } => RaftError::Store(StorageError::Compacted),
        E::Unavailable(_) => RaftError::Store(StorageError::Unavailable),
        other => RaftError::Store(StorageError::Other(Box::new(other))),
    }
}

impl<S: RaftStorage + ?Sized> raft::storage::Storage for StorageAdapter<S> {
    fn initial_state(&self) -> RaftResult<RaftState> {
        let (hs, cs) = self.inner.initial_state().map_err(to_raft_error)?;
        Ok(RaftState {
            hard_state: {
                let mut out = raft::prelude::HardState::default();
                out.set_term(hs.term);
                out.set_vote(hs.vote);
                out.set_commit(hs.commit);
                out
            },
            conf_state: {
                let mut out = WireConfState::default();
                out.set_voters(cs.voters);
                out.set_learners(cs.learners);
                out
            },
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> RaftResult<Vec<WireEntry>> {
        let entries = self
            .inner
            .entries(low, high, max_size.into())
            .map_err(to_raft_error)?;
        Ok(entries.iter().map(entry_to_wire).collect())
    }

    fn term(&self, idx: u64) -> RaftResult<u64> {
        self.inner.term(idx).map_err(to_raft_error)
    }

    fn first_index(&self) -> RaftResult<u64> {
        self.inner.first_index().map_err(to_raft_error)
    }

    fn last_index(&self) -> RaftResult<u64> {
        self.inner.last_index().map_err(to_raft_error)
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> RaftResult<WireSnapshot> {
        let snap = self.inner.snapshot().map_err(to_raft_error)?;
        Ok(snapshot_to_wire(&snap))
    }
}

/// Persists a `Ready`'s hard state / entries / snapshot into the underlying
/// `RaftStorage`, used by `RaftNode::advance` after applying a `Ready`.
pub fn persist_hard_state<S: RaftStorage>(
    store: &S,
    hs: &raft::prelude::HardState,
) -> metastore_model::CResult<()> {
    store.set_hard_state(hard_state_from_wire(hs))
}

pub fn persist_entries<S: RaftStorage>(
    store: &S,
    entries: &[WireEntry],
) -> metastore_model::CResult<()> {
    let converted: Vec<_> = entries.iter().map(crate::convert::entry_from_wire).collect();
    store.append(&converted)
}

pub fn persist_snapshot<S: RaftStorage>(
    store: &S,
    snap: &WireSnapshot,
) -> metastore_model::CResult<()> {
    store.apply_snapshot(crate::convert::snapshot_from_wire(snap))
}

pub fn wire_conf_state_from(cs: &WireConfState) -> metastore_model::raft::ConfState {
    conf_state_from_wire(cs)
}
