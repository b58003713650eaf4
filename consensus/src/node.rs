//! The Raft Node (SPEC_FULL.md §4.4): drives a `raft::RawNode` through its
//! Ready protocol on a dedicated thread, persisting to `metastore_raftlog`
//! and sending outbound messages through a `Transport`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use metastore_model::config::RaftConfig;
use metastore_model::raft::ConfState as ModelConfState;
use metastore_model::{CResult, Error};
use parking_lot::Mutex;
use raft::prelude::Message;
use raft::{RawNode, StateRole};

use crate::convert::entry_from_wire;
use crate::logger::bridge_logger;
use crate::storage_adapter::{persist_entries, persist_hard_state, persist_snapshot, StorageAdapter};
use crate::transport::Transport;
use metastore_raftlog::RaftStorage;

/// One committed log entry, already stripped of raft-rs's wire wrapper. Its
/// `data` is still the Batch Proposer's wire format (SPEC_FULL.md §4.2);
/// unwrapping that into individual ops is `store`'s job, not this crate's.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// A batch of committed entries plus the synchronization handle the
/// consumer (the KV Engine, via `store`) must close after applying them.
/// Per SPEC_FULL.md §9: the Raft Node creates and closes the `commit`
/// channel; the consumer only ever closes `apply_done`.
pub struct CommitBatch {
    pub entries: Vec<CommittedEntry>,
    pub apply_done: Sender<()>,
}

struct LeaderLease {
    lease_duration: Duration,
    renewed_at: Option<Instant>,
}

impl LeaderLease {
    fn new(cfg: &RaftConfig) -> Self {
        let election_timeout =
            Duration::from_millis(cfg.tick_interval_millis * cfg.election_tick as u64);
        let heartbeat_interval =
            Duration::from_millis(cfg.tick_interval_millis * cfg.heartbeat_tick as u64);
        let clock_drift = Duration::from_millis(cfg.tick_interval_millis);
        let candidate = std::cmp::min(election_timeout / 2, heartbeat_interval * 3);
        let lease_duration = candidate.saturating_sub(clock_drift);
        LeaderLease {
            lease_duration,
            renewed_at: None,
        }
    }

    fn renew(&mut self, now: Instant) {
        self.renewed_at = Some(now);
    }

    fn clear(&mut self) {
        self.renewed_at = None;
    }

    fn is_valid(&self, now: Instant) -> bool {
        match self.renewed_at {
            Some(t) => now.saturating_duration_since(t) <= self.lease_duration,
            None => false,
        }
    }
}

/// Wraps a `raft::RawNode` over a `RaftStorage` backend, driving its Ready
/// loop on a background thread. `S` is the storage backend type
/// (`raftlog::MemStorage` or `raftlog::LsmRaftStorage`); it is shared with
/// whatever compacts/snapshots it directly.
pub struct RaftNode<S: RaftStorage + ?Sized + 'static> {
    id: u64,
    raw: Mutex<RawNode<StorageAdapter<S>>>,
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    snapshot_count: u64,
    snapshot_catchup_entries: u64,
    applied_index: AtomicU64,
    snapshot_index: AtomicU64,
    lease: Mutex<LeaderLease>,
    shutdown: AtomicBool,
    commit_tx: Sender<CommitBatch>,
}

impl<S: RaftStorage + ?Sized + 'static> RaftNode<S> {
    pub fn new(
        id: u64,
        peers: &[u64],
        cfg: &RaftConfig,
        store: Arc<S>,
        transport: Arc<dyn Transport>,
    ) -> CResult<(Arc<Self>, Receiver<CommitBatch>)> {
        let mut raft_cfg = raft::Config {
            id,
            election_tick: cfg.election_tick,
            heartbeat_tick: cfg.heartbeat_tick,
            max_size_per_msg: cfg.max_size_per_msg,
            max_inflight_msgs: cfg.max_inflight_msgs,
            pre_vote: cfg.pre_vote,
            check_quorum: cfg.check_quorum,
            ..Default::default()
        };
        raft_cfg.validate().map_err(|e| Error::Internal(format!("invalid raft config: {}", e)))?;

        let adapter = StorageAdapter::new(store.clone());
        bootstrap_voters(&store, peers)?;

        let logger = bridge_logger();
        let raw = RawNode::new(&raft_cfg, adapter, &logger)
            .map_err(|e| Error::Internal(format!("raft::RawNode::new: {}", e)))?;

        // commit channel: owned (created and eventually dropped) by the
        // Raft Node, per SPEC_FULL.md §9.
        let (commit_tx, commit_rx) = bounded(1024);

        let node = Arc::new(RaftNode {
            id,
            raw: Mutex::new(raw),
            store,
            transport,
            snapshot_count: cfg.snapshot_count,
            snapshot_catchup_entries: cfg.snapshot_catchup_entries,
            applied_index: AtomicU64::new(0),
            snapshot_index: AtomicU64::new(0),
            lease: Mutex::new(LeaderLease::new(cfg)),
            shutdown: AtomicBool::new(false),
            commit_tx,
        });

        Ok((node, commit_rx))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.raw.lock().raft.state == StateRole::Leader
    }

    fn is_single_node_quorum(&self) -> bool {
        let raw = self.raw.lock();
        let voters = raw.raft.prs().conf().voters().ids();
        voters.len() == 1 && voters.contains(self.id)
    }

    /// True if a linearizable read may be served from local state without a
    /// ReadIndex round trip (SPEC_FULL.md §4.4). A follower always returns
    /// false; a single-node cluster is always its own quorum.
    pub fn has_valid_read_lease(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        if self.is_single_node_quorum() {
            return true;
        }
        self.lease.lock().is_valid(Instant::now())
    }

    pub fn propose(&self, payload: Vec<u8>) -> CResult<()> {
        if !self.is_leader() {
            return Err(Error::FailedPrecondition("not the raft leader".to_string()));
        }
        self.raw
            .lock()
            .propose(vec![], payload)
            .map_err(|e| Error::Unavailable(format!("raft propose failed: {}", e)))
    }

    pub fn propose_conf_change(&self, cc: raft::prelude::ConfChange) -> CResult<()> {
        self.raw
            .lock()
            .propose_conf_change(vec![], cc)
            .map_err(|e| Error::Unavailable(format!("raft propose_conf_change failed: {}", e)))
    }

    pub fn step(&self, msg: Message) -> CResult<()> {
        self.raw
            .lock()
            .step(msg)
            .map_err(|e| Error::Unavailable(format!("raft step failed: {}", e)))
    }

    pub fn tick(&self) {
        self.raw.lock().tick();
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn current_term(&self) -> u64 {
        self.raw.lock().raft.term
    }

    /// The cluster membership as raft-rs currently tracks it, converted to
    /// our storage-facing `ConfState` (SPEC_FULL.md §3). Used by `store` to
    /// stamp a KV Engine snapshot with the membership in effect when it was
    /// taken.
    pub fn current_conf_state(&self) -> ModelConfState {
        let raw = self.raw.lock();
        let cs = raw.raft.prs().conf().to_conf_state();
        ModelConfState {
            voters: cs.get_voters().to_vec(),
            learners: cs.get_learners().to_vec(),
        }
    }

    /// `Some(applied_index)` once `applied_index - snapshot_index` has
    /// crossed `snapshot_count` (SPEC_FULL.md §4.4). `store` polls this
    /// after applying each commit batch and, if due, takes a KV Engine
    /// snapshot and hands it to `record_snapshot`.
    pub fn snapshot_due(&self) -> Option<u64> {
        let applied = self.applied_index();
        let last_snapshot = self.snapshot_index.load(Ordering::Acquire);
        if applied > last_snapshot && applied - last_snapshot >= self.snapshot_count {
            Some(applied)
        } else {
            None
        }
    }

    /// Runs one Ready cycle if one is pending: persists to storage, sends
    /// outbound messages, and hands committed entries to the consumer over
    /// the commit channel (blocking until `apply_done` closes, so the Raft
    /// Node never races ahead of what's actually been applied).
    pub fn process_ready(&self) -> CResult<()> {
        let mut raw = self.raw.lock();
        if !raw.has_ready() {
            return Ok(());
        }
        let mut ready = raw.ready();

        if !ready.messages().is_empty() {
            // Must not leave the lock while persisting below; outbound
            // messages are queued for the transport to drain once this
            // Ready cycle's storage writes are durable (SPEC_FULL.md §4.5).
        }

        if !ready.entries().is_empty() {
            persist_entries(&self.store, ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            persist_hard_state(&self.store, hs)?;
        }
        if *ready.snapshot() != raft::prelude::Snapshot::default() {
            persist_snapshot(&self.store, ready.snapshot())?;
        }

        let outbound = ready.take_messages();
        if !outbound.is_empty() {
            self.transport.send(outbound);
        }

        if let Some(committed) = ready.committed_entries.take() {
            self.dispatch_committed(committed)?;
        }

        let persisted_msgs = ready.take_persisted_messages();
        if !persisted_msgs.is_empty() {
            self.transport.send(persisted_msgs);
        }

        let mut light = raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            debug!("raft node {} advanced commit index to {}", self.id, commit);
        }
        let outbound = light.take_messages();
        if !outbound.is_empty() {
            self.transport.send(outbound);
        }
        let committed = light.take_committed_entries();
        if !committed.is_empty() {
            self.dispatch_committed(committed)?;
        }
        raw.advance_apply();

        self.lease.lock().renew(Instant::now());
        self.maybe_trigger_snapshot()?;
        Ok(())
    }

    fn dispatch_committed(&self, committed: Vec<raft::prelude::Entry>) -> CResult<()> {
        if committed.is_empty() {
            return Ok(());
        }
        let mut normal = Vec::new();
        let mut highest_index = self.applied_index();
        for wire_entry in &committed {
            let entry = entry_from_wire(wire_entry);
            highest_index = highest_index.max(entry.index);
            match entry.entry_type {
                metastore_model::raft::EntryType::Normal => {
                    if !entry.data.is_empty() {
                        normal.push(CommittedEntry {
                            index: entry.index,
                            term: entry.term,
                            data: entry.data,
                        });
                    }
                }
                metastore_model::raft::EntryType::ConfChange => {
                    warn!(
                        "raft node {} committed a conf-change entry at index {}; \
                         membership changes beyond bootstrap are not applied by this node",
                        self.id, entry.index
                    );
                }
            }
        }

        if !normal.is_empty() {
            let (done_tx, done_rx) = bounded(1);
            self.commit_tx
                .send(CommitBatch {
                    entries: normal,
                    apply_done: done_tx,
                })
                .map_err(|_| Error::Internal("commit channel consumer has gone away".to_string()))?;
            // Block until the consumer signals it applied this batch, so the
            // Raft Node never marks entries applied before the KV Engine has
            // actually run them (SPEC_FULL.md §9).
            done_rx
                .recv()
                .map_err(|_| Error::Internal("apply_done sender dropped without signaling".to_string()))?;
        }

        self.applied_index.store(highest_index, Ordering::Release);
        Ok(())
    }

    fn maybe_trigger_snapshot(&self) -> CResult<()> {
        let applied = self.applied_index();
        let last_snapshot = self.snapshot_index.load(Ordering::Acquire);
        if applied < last_snapshot || applied - last_snapshot < self.snapshot_count {
            return Ok(());
        }

        // The caller wires up the actual KV Engine snapshot bytes via
        // `record_snapshot`; this node only knows it's time to ask for one.
        info!(
            "raft node {} crossed snapshot_count ({} applied entries since index {}); \
             awaiting a snapshot from the KV Engine",
            self.id, applied - last_snapshot, last_snapshot
        );
        Ok(())
    }

    /// Called by `store` once it has produced a KV Engine snapshot for
    /// `index`/`term`/`conf_state`, to record it in Raft Storage and compact
    /// the log behind `snapshot_catchup_entries`.
    pub fn record_snapshot(&self, index: u64, term: u64, conf_state: ModelConfState, data: Vec<u8>) -> CResult<()> {
        self.store.create_snapshot(index, conf_state, data)?;
        self.snapshot_index.store(index, Ordering::Release);
        let floor = index.saturating_sub(self.snapshot_catchup_entries);
        if floor > 0 {
            self.store.compact(floor)?;
        }
        let _ = term;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.lease.lock().clear();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Spawns the dedicated thread that ticks the node and drains its Ready
/// queue (SPEC_FULL.md §5: "one loop driving the Ready protocol, serial
/// with respect to Raft state"). Inbound peer messages are delivered via
/// `RaftNode::step` from whatever transport receives them; this loop only
/// owns ticking and draining readiness.
pub fn spawn_ready_loop<S: RaftStorage + ?Sized + 'static>(
    node: Arc<RaftNode<S>>,
    tick_interval: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("raft-ready-loop-{}", node.id()))
        .spawn(move || {
            let mut last_tick = Instant::now();
            while !node.is_shutdown() {
                if last_tick.elapsed() >= tick_interval {
                    node.tick();
                    last_tick = Instant::now();
                }
                if let Err(e) = node.process_ready() {
                    error!("raft node {} failed to process a ready cycle: {}", node.id(), e);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("failed to spawn raft-ready-loop thread")
}

/// On first start with an empty log, seeds the storage's initial conf
/// state with the given peer set so the first `Ready` already reflects
/// cluster membership, matching raft-rs's documented bootstrap convention.
fn bootstrap_voters<S: RaftStorage + ?Sized>(store: &Arc<S>, peers: &[u64]) -> CResult<()> {
    let (hs, cs) = store.initial_state()?;
    if hs.commit == 0 && cs.voters.is_empty() && !peers.is_empty() {
        store.create_snapshot(
            0,
            metastore_model::raft::ConfState {
                voters: peers.to_vec(),
                learners: Vec::new(),
            },
            Vec::new(),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_lease_duration_uses_the_tighter_of_the_two_bounds() {
        let cfg = RaftConfig {
            tick_interval_millis: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            ..RaftConfig::default()
        };
        // election_timeout/2 = 500ms, heartbeat*3 = 900ms -> 500ms, minus
        // one tick of clock drift (100ms) = 400ms.
        let lease = LeaderLease::new(&cfg);
        assert_eq!(lease.lease_duration, Duration::from_millis(400));
    }

    #[test]
    fn leader_lease_is_invalid_until_renewed() {
        let cfg = RaftConfig::default();
        let lease = LeaderLease::new(&cfg);
        assert!(!lease.is_valid(Instant::now()));
    }
}
