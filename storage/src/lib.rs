//! The KV Engine (SPEC_FULL.md §4.3): two interchangeable backends behind
//! one `KvStore` trait, sharing the apply path, codec, and revision
//! bookkeeping rules.

pub mod apply;
pub mod codec;
pub mod engine;
pub mod lsm;
pub mod memory;

#[cfg(test)]
mod testkit;

pub use engine::{ApplyOutcome, KvSnapshotEnvelope, KvStore, LeaseDelta, OpOutcome};
pub use lsm::LsmStore;
pub use memory::MemoryStore;
