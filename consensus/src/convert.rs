//! Conversions between `metastore_model::raft`'s storage-facing types and
//! `raft::prelude`'s wire types. `raftlog` is deliberately independent of
//! raft-rs (SPEC_FULL.md's design note that the storage layer should not
//! need to know about the consensus crate's wire format); this module is
//! the one place the two meet.

use metastore_model::raft as m;
use raft::prelude as r;

pub fn entry_to_wire(e: &m::Entry) -> r::Entry {
    let mut out = r::Entry::default();
    out.set_term(e.term);
    out.set_index(e.index);
    out.set_entry_type(match e.entry_type {
        m::EntryType::Normal => r::EntryType::EntryNormal,
        m::EntryType::ConfChange => r::EntryType::EntryConfChange,
    });
    out.set_data(e.data.clone().into());
    out
}

pub fn entry_from_wire(e: &r::Entry) -> m::Entry {
    m::Entry {
        term: e.get_term(),
        index: e.get_index(),
        entry_type: match e.get_entry_type() {
            r::EntryType::EntryNormal => m::EntryType::Normal,
            r::EntryType::EntryConfChange | r::EntryType::EntryConfChangeV2 => {
                m::EntryType::ConfChange
            }
        },
        data: e.get_data().to_vec(),
    }
}

pub fn hard_state_to_wire(hs: &m::HardState) -> r::HardState {
    let mut out = r::HardState::default();
    out.set_term(hs.term);
    out.set_vote(hs.vote);
    out.set_commit(hs.commit);
    out
}

pub fn hard_state_from_wire(hs: &r::HardState) -> m::HardState {
    m::HardState {
        term: hs.get_term(),
        vote: hs.get_vote(),
        commit: hs.get_commit(),
    }
}

pub fn conf_state_to_wire(cs: &m::ConfState) -> r::ConfState {
    let mut out = r::ConfState::default();
    out.set_voters(cs.voters.clone());
    out.set_learners(cs.learners.clone());
    out
}

pub fn conf_state_from_wire(cs: &r::ConfState) -> m::ConfState {
    m::ConfState {
        voters: cs.get_voters().to_vec(),
        learners: cs.get_learners().to_vec(),
    }
}

pub fn snapshot_to_wire(snap: &m::Snapshot) -> r::Snapshot {
    let mut out = r::Snapshot::default();
    let mut meta = r::SnapshotMetadata::default();
    meta.set_index(snap.metadata.index);
    meta.set_term(snap.metadata.term);
    meta.set_conf_state(conf_state_to_wire(&snap.metadata.conf_state));
    out.set_metadata(meta);
    out.set_data(snap.data.clone().into());
    out
}

pub fn snapshot_from_wire(snap: &r::Snapshot) -> m::Snapshot {
    let meta = snap.get_metadata();
    m::Snapshot {
        metadata: m::SnapshotMetadata {
            index: meta.get_index(),
            term: meta.get_term(),
            conf_state: conf_state_from_wire(meta.get_conf_state()),
        },
        data: snap.get_data().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_through_the_wire_type() {
        let e = m::Entry {
            term: 3,
            index: 7,
            entry_type: m::EntryType::Normal,
            data: vec![1, 2, 3],
        };
        let back = entry_from_wire(&entry_to_wire(&e));
        assert_eq!(e, back);
    }

    #[test]
    fn hard_state_round_trips_through_the_wire_type() {
        let hs = m::HardState {
            term: 9,
            vote: 2,
            commit: 41,
        };
        assert_eq!(hs, hard_state_from_wire(&hard_state_to_wire(&hs)));
    }

    #[test]
    fn conf_state_round_trips_through_the_wire_type() {
        let cs = m::ConfState {
            voters: vec![1, 2, 3],
            learners: vec![4],
        };
        assert_eq!(cs, conf_state_from_wire(&conf_state_to_wire(&cs)));
    }

    #[test]
    fn snapshot_round_trips_through_the_wire_type() {
        let snap = m::Snapshot {
            metadata: m::SnapshotMetadata {
                index: 5,
                term: 2,
                conf_state: m::ConfState {
                    voters: vec![1],
                    learners: vec![],
                },
            },
            data: vec![9, 9, 9],
        };
        assert_eq!(snap, snapshot_from_wire(&snapshot_to_wire(&snap)));
    }
}
