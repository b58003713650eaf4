//! The Batch Proposer and Raft Node (SPEC_FULL.md §4.2, §4.4): the layer
//! that turns client writes into a replicated, ordered log and back into
//! committed entries for the KV Engine to apply.
//!
//! `raft`-rs requires a `slog::Logger`; [`logger::bridge_logger`] routes
//! that into the `log` facade the rest of the stack uses, so callers never
//! need to configure a second logging pipeline.

mod convert;
mod logger;
mod storage_adapter;

pub mod node;
pub mod proposer;
pub mod transport;

pub use node::{CommitBatch, CommittedEntry, RaftNode};
pub use proposer::{Batch, BatchProposer, ProposeFn};
pub use storage_adapter::StorageAdapter;
pub use transport::{NullTransport, Transport};
