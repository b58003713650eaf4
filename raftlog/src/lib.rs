//! Raft Storage (SPEC_FULL.md §4.5): the persistent log + metadata store
//! required by the Raft protocol, with two interchangeable implementations
//! mirroring the KV Engine's backend split.

pub mod lsm;
pub mod storage;
pub mod wal;

pub use lsm::LsmRaftStorage;
pub use storage::RaftStorage;
pub use wal::MemStorage;
