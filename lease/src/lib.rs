//! The Lease Registry (SPEC_FULL.md §3 "Lease", §4.1, §5): TTL-bounded
//! tokens that own a set of keys, expired by a dedicated sweep thread.
//!
//! The per-lease locking scheme follows SPEC_FULL.md §5's own description:
//! "per-lease record with fine-grained locking; the expiry sweeper acquires
//! records one at a time."

pub mod registry;

pub use registry::LeaseRegistry;
