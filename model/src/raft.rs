//! The Raft log data model (SPEC_FULL.md §3, "Raft Log"), kept independent
//! of any particular consensus crate's wire types so `raftlog` can be
//! tested and reasoned about on its own. `consensus` is responsible for
//! converting between these types and `raft::prelude::*` at the boundary
//! where it drives a `raft::RawNode`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    ConfChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub entry_type: EntryType,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
}

/// `{index, term, conf_state, opaque_application_state}` (SPEC_FULL.md §3).
/// `data` is the opaque bytes produced by the KV Engine's `snapshot()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Snapshot {
            metadata: SnapshotMetadata {
                index: 0,
                term: 0,
                conf_state: ConfState::default(),
            },
            data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0 && self.data.is_empty()
    }
}
