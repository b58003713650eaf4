//! Shared types for MetaStore: the wire-level data model, the error
//! taxonomy, and node configuration. Every other crate in the workspace
//! depends on this one; it has no I/O of its own.

pub mod config;
pub mod error;
pub mod kv;
pub mod lease;
pub mod raft;
pub mod txn;
pub mod watch;

pub use error::{CResult, Error};
pub use kv::{KeyValue, Revision};
pub use lease::{Lease, LeaseId};
pub use txn::{Compare, CompareOp, CompareTarget, Op, TxnRequest, TxnResponse};
pub use watch::{WatchEvent, WatchEventKind, WatchId};
