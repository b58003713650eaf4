//! The apply loop: the single consumer of the Raft Node's commit stream
//! (SPEC_FULL.md §4.3, §5, §9). Turns each `CommitBatch` into KV Engine
//! mutations, lease bookkeeping, and watch dispatch, then resolves whichever
//! caller (if any) is still waiting on a proposal's `correlation_id`.
//!
//! Per SPEC_FULL.md §9's channel-ownership rule, this module never drops
//! `CommitBatch::apply_done` silently — it always sends on it, even when a
//! batch decoded to nothing applicable.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::warn;
use metastore_consensus::{Batch, CommitBatch};
use metastore_lease::LeaseRegistry;
use metastore_storage::{apply, codec, ApplyOutcome, KvStore, LeaseDelta};
use metastore_watch::WatchHub;
use parking_lot::Mutex;

use crate::command::{Command, CommandOutcome, PendingResult, ProposalEnvelope, NO_CORRELATION};

/// State shared between the facade and the apply loop thread: the two
/// backends the loop mutates, plus the table of callers still waiting on a
/// proposal they made.
pub(crate) struct ApplyContext {
    pub kv: Arc<dyn KvStore>,
    pub leases: Arc<LeaseRegistry>,
    pub watch_hub: Arc<WatchHub>,
    pending: Mutex<HashMap<u64, Sender<PendingResult>>>,
}

impl ApplyContext {
    pub fn new(kv: Arc<dyn KvStore>, leases: Arc<LeaseRegistry>, watch_hub: Arc<WatchHub>) -> Self {
        ApplyContext {
            kv,
            leases,
            watch_hub,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, correlation_id: u64, responder: Sender<PendingResult>) {
        self.pending.lock().insert(correlation_id, responder);
    }

    pub fn forget(&self, correlation_id: u64) {
        self.pending.lock().remove(&correlation_id);
    }

    fn resolve(&self, correlation_id: u64, result: PendingResult) {
        if correlation_id == NO_CORRELATION {
            if let Err(e) = result {
                warn!("fire-and-forget command failed to apply: {}", e);
            }
            return;
        }
        if let Some(responder) = self.pending.lock().remove(&correlation_id) {
            let _ = responder.send(result);
        }
    }
}

/// Runs once after every `apply_done` is signaled for a batch, so the
/// facade can poll `RaftNode::snapshot_due` without the apply loop needing
/// to know anything about Raft itself.
pub(crate) type PostApplyHook = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn spawn(
    ctx: Arc<ApplyContext>,
    commit_rx: Receiver<CommitBatch>,
    post_apply: PostApplyHook,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("kv-apply-loop".to_string())
        .spawn(move || {
            while let Ok(batch) = commit_rx.recv() {
                for entry in &batch.entries {
                    apply_entry(&ctx, &entry.data);
                }
                // Signal completion before anything else: the Raft Node's
                // ready loop blocks on this and must never wait on our own
                // housekeeping (SPEC_FULL.md §9).
                let _ = batch.apply_done.send(());
                post_apply();
            }
        })
        .expect("failed to spawn kv-apply-loop thread")
}

fn apply_entry(ctx: &ApplyContext, data: &[u8]) {
    let wire_batch: Batch = match bincode::deserialize(data) {
        Ok(b) => b,
        Err(e) => {
            warn!("skipping a committed entry with an undecodable Batch envelope: {}", e);
            return;
        }
    };
    for item in wire_batch.items {
        let envelope: ProposalEnvelope = match bincode::deserialize(&item) {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping a committed item with an undecodable ProposalEnvelope: {}", e);
                continue;
            }
        };
        let result = apply_command(ctx, envelope.command);
        ctx.resolve(envelope.correlation_id, result);
    }
}

fn apply_command(ctx: &ApplyContext, command: Command) -> PendingResult {
    match command {
        Command::Op(payload) => {
            let op = codec::decode_op(&payload)?;
            let outcome = apply::apply_op(ctx.kv.as_ref(), op)?;
            dispatch_side_effects(ctx, &outcome);
            Ok(CommandOutcome::Applied(outcome))
        }
        Command::Txn(txn) => {
            let outcome = apply::apply_txn(ctx.kv.as_ref(), &txn)?;
            dispatch_side_effects(ctx, &outcome);
            Ok(CommandOutcome::Applied(outcome))
        }
        Command::Compact(revision) => {
            ctx.kv.compact(revision)?;
            Ok(CommandOutcome::Compacted)
        }
        Command::LeaseGrant { id, ttl_seconds, now_millis } => {
            let lease = ctx.leases.grant(id, ttl_seconds, now_millis)?;
            Ok(CommandOutcome::LeaseGranted(lease))
        }
        Command::LeaseRevoke { id } => {
            let keys = ctx.leases.revoke(id)?;
            for key in keys {
                let outcome = ctx.kv.apply_delete_range(&key, &[]);
                ctx.watch_hub.dispatch(&outcome.events);
            }
            Ok(CommandOutcome::LeaseRevoked)
        }
        Command::LeaseRenew { id, now_millis } => {
            let ttl = ctx.leases.renew(id, now_millis)?;
            Ok(CommandOutcome::LeaseRenewed(ttl))
        }
    }
}

fn dispatch_side_effects(ctx: &ApplyContext, outcome: &ApplyOutcome) {
    ctx.watch_hub.dispatch(&outcome.events);
    for delta in &outcome.lease_deltas {
        match delta {
            LeaseDelta::Associate { lease_id, key } => {
                if let Err(e) = ctx.leases.associate(*lease_id, key.clone()) {
                    warn!("lease {} vanished between validation and apply: {}", lease_id, e);
                }
            }
            LeaseDelta::Dissociate { lease_id, key } => ctx.leases.dissociate(*lease_id, key),
        }
    }
}
