//! Outbound message delivery (SPEC_FULL.md §4.4, §9). `RaftNode` only knows
//! it must hand a `Message` to *some* peer; actually dialing a peer and
//! putting bytes on a wire is an external-interfaces concern owned by the
//! binary that wires up a `Transport` impl (`cli`, in this repo) — keeping
//! "what to send" separate from "how to send it".

use raft::prelude::Message;

/// One implementor per process; every raft node it drives shares it.
/// Implementations must not block the Ready-loop thread for long — queue
/// and return, the way `metastore_watch::WatchHub::dispatch` queues events
/// rather than calling out synchronously.
pub trait Transport: Send + Sync {
    fn send(&self, messages: Vec<Message>);
}

/// A `Transport` that drops everything, for single-node deployments and
/// tests where there are no peers to reach.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _messages: Vec<Message>) {}
}
