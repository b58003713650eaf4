//! The wire shape proposed to Raft by the `store` facade: one item per
//! caller, wrapped with a correlation id so the apply loop can route the
//! resulting outcome back to whichever `propose`/await call is still
//! waiting (or to nobody, for fire-and-forget commands like an expiry
//! sweep's revokes). Consensus's `Batch` (SPEC_FULL.md §4.2) then wraps
//! zero or more of these into one Raft entry.

use metastore_model::{CResult, Lease, LeaseId, Revision, TxnRequest};
use metastore_storage::ApplyOutcome;
use serde::{Deserialize, Serialize};

/// `0` means "no one is waiting on this command's outcome" (used by the
/// lease expiry sweeper and other internally-originated proposals).
pub const NO_CORRELATION: u64 = 0;

/// One state-machine transition, replicated through Raft so every replica
/// applies it identically. Lease grant/renew carry `now_millis` stamped by
/// the proposer rather than read independently by each replica on apply —
/// time is part of the command, not an ambient input, so the apply step
/// stays deterministic (SPEC_FULL.md §5, ordering guarantees).
#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    /// An already-encoded `storage::codec::encode_op` payload (Put or
    /// DeleteRange).
    Op(Vec<u8>),
    Txn(TxnRequest),
    Compact(Revision),
    LeaseGrant {
        id: LeaseId,
        ttl_seconds: u64,
        now_millis: u64,
    },
    LeaseRevoke {
        id: LeaseId,
    },
    LeaseRenew {
        id: LeaseId,
        now_millis: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProposalEnvelope {
    pub correlation_id: u64,
    pub command: Command,
}

/// The result handed back to a waiting caller once its command's effects
/// have actually been applied (not merely accepted into the raft log).
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Applied(ApplyOutcome),
    Compacted,
    LeaseGranted(Lease),
    LeaseRevoked,
    LeaseRenewed(u64),
}

pub type PendingResult = CResult<CommandOutcome>;
