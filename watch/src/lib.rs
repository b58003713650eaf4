//! The Watch Hub (SPEC_FULL.md §4.1, §9): a registry of per-stream bounded
//! channels fed by the KV Engine's apply path, delivering events in
//! revision order on each stream.
//!
//! The registry shape follows SPEC_FULL.md §5's own description verbatim:
//! "one read-write lock around the stream registry; per-stream delivery is
//! lock-free beyond its own buffer."

pub mod hub;

pub use hub::{WatchHandle, WatchHub};
