//! The Store API facade (SPEC_FULL.md §4.1): one `Store` handle per node,
//! wiring the KV Engine, Raft Node, Batch Proposer, Watch Hub, and Lease
//! Registry together behind the operation set a client actually calls.
//!
//! Mutating calls (`put`, `delete_range`, `txn`, `compact`, `lease_grant`,
//! `lease_revoke`, `lease_renew`) validate synchronously, then propose
//! through Raft and block until the apply loop has actually run the
//! command — never until it has merely been accepted into the local log.
//! Reads (`range`, `watch`, `cancel_watch`, `current_revision`,
//! `lease_time_to_live`, `get_snapshot`) never touch Raft at all
//! (SPEC_FULL.md §2's data-flow split).

mod apply_loop;
pub mod command;
pub mod snapshot;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::warn;
use metastore_consensus::node::spawn_ready_loop;
use metastore_consensus::{BatchProposer, ProposeFn, RaftNode, Transport};
use metastore_lease::LeaseRegistry;
use metastore_model::config::NodeConfig;
use metastore_model::kv::{MAX_KEY_BYTES, MAX_VALUE_BYTES};
use metastore_model::{CResult, Error, KeyValue, Lease, LeaseId, Revision, TxnRequest, TxnResponse};
use metastore_raftlog::{LsmRaftStorage, MemStorage, RaftStorage};
use metastore_storage::{KvSnapshotEnvelope, KvStore, LsmStore, MemoryStore, OpOutcome};
use metastore_watch::{WatchHandle, WatchHub};

use apply_loop::ApplyContext;
use command::{Command, CommandOutcome, ProposalEnvelope, NO_CORRELATION};

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn validate_key(key: &[u8]) -> CResult<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(Error::InvalidArgument(format!(
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_KEY_BYTES
        )));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> CResult<()> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(Error::InvalidArgument(format!(
            "value of {} bytes exceeds the {} byte limit",
            value.len(),
            MAX_VALUE_BYTES
        )));
    }
    Ok(())
}

fn build_snapshot_bytes(ctx: &ApplyContext) -> CResult<Vec<u8>> {
    let kv_bytes = ctx.kv.snapshot()?;
    let envelope: KvSnapshotEnvelope =
        bincode::deserialize(&kv_bytes).map_err(|e| Error::Internal(format!("decode kv snapshot: {}", e)))?;
    let leases = ctx.leases.snapshot_leases();
    snapshot::encode(envelope, leases)
}

/// One node's handle onto the replicated store. Generic over the Raft
/// Storage backend (`metastore_raftlog::MemStorage` or `LsmRaftStorage`);
/// the KV Engine itself is always held as a trait object since both of its
/// backends already share one interface (SPEC_FULL.md §9).
pub struct Store<S: RaftStorage + 'static> {
    ctx: Arc<ApplyContext>,
    raft: Arc<RaftNode<S>>,
    proposer: Arc<BatchProposer>,
    next_correlation: AtomicU64,
    next_watch_id: AtomicU64,
    _ready_loop: thread::JoinHandle<()>,
    _apply_loop: thread::JoinHandle<()>,
    _sweeper: thread::JoinHandle<()>,
}

impl<S: RaftStorage + 'static> Store<S> {
    /// Assembles a `Store` around an already-open KV Engine and Raft Storage
    /// backend. `peers` bootstraps initial cluster membership when the Raft
    /// log is empty (SPEC_FULL.md §6); pass `&[node_id]` for a single node.
    pub fn new(
        kv: Arc<dyn KvStore>,
        raft_storage: Arc<S>,
        node_id: u64,
        peers: &[u64],
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
    ) -> CResult<Arc<Self>> {
        let (raft_node, commit_rx) = RaftNode::new(node_id, peers, &config.raft, raft_storage, transport)?;

        let ready_loop = spawn_ready_loop(
            raft_node.clone(),
            Duration::from_millis(config.raft.tick_interval_millis),
        );

        let ctx = Arc::new(ApplyContext::new(
            kv,
            Arc::new(LeaseRegistry::new()),
            Arc::new(WatchHub::new(
                config.limits.watch_buffer_size,
                Duration::from_millis(config.limits.watch_send_deadline_millis),
            )),
        ));

        let snapshot_ctx = ctx.clone();
        let snapshot_raft = raft_node.clone();
        let post_apply: apply_loop::PostApplyHook = Arc::new(move || {
            let index = match snapshot_raft.snapshot_due() {
                Some(index) => index,
                None => return,
            };
            match build_snapshot_bytes(&snapshot_ctx) {
                Ok(bytes) => {
                    let term = snapshot_raft.current_term();
                    let conf_state = snapshot_raft.current_conf_state();
                    if let Err(e) = snapshot_raft.record_snapshot(index, term, conf_state, bytes) {
                        warn!("failed to record a triggered snapshot at index {}: {}", index, e);
                    }
                }
                Err(e) => warn!("failed to build a triggered snapshot's payload: {}", e),
            }
        });
        let apply_handle = apply_loop::spawn(ctx.clone(), commit_rx, post_apply);

        let propose_node = raft_node.clone();
        let propose_fn: ProposeFn = Arc::new(move |bytes| propose_node.propose(bytes));
        let proposer = Arc::new(BatchProposer::new(config.proposer.clone(), propose_fn));

        let sweep_raft = raft_node.clone();
        let sweep_ctx = ctx.clone();
        let sweep_proposer = proposer.clone();
        // No fixed cadence is specified; polling on the raft tick interval
        // keeps expiry detection within one election-timeout's worth of
        // the lease's actual deadline.
        let sweep_interval = Duration::from_millis(config.raft.tick_interval_millis.max(50));
        let sweeper = thread::Builder::new()
            .name("lease-expiry-sweeper".to_string())
            .spawn(move || loop {
                thread::sleep(sweep_interval);
                // Only the leader may originate a revocation: followers
                // would otherwise each independently decide a lease is
                // expired off their own clock, diverging from the
                // replicated log (SPEC_FULL.md §5).
                if !sweep_raft.is_leader() {
                    continue;
                }
                let now = now_millis();
                for id in sweep_ctx.leases.expired_ids(now) {
                    let envelope = ProposalEnvelope {
                        correlation_id: NO_CORRELATION,
                        command: Command::LeaseRevoke { id },
                    };
                    match bincode::serialize(&envelope) {
                        Ok(bytes) => {
                            if let Err(e) = sweep_proposer.propose(bytes) {
                                warn!("failed to propose an expiry revoke for lease {}: {}", id, e);
                            }
                        }
                        Err(e) => warn!("failed to encode an expiry revoke for lease {}: {}", id, e),
                    }
                }
            })
            .expect("failed to spawn lease-expiry-sweeper thread");

        Ok(Arc::new(Store {
            ctx,
            raft: raft_node,
            proposer,
            next_correlation: AtomicU64::new(1),
            next_watch_id: AtomicU64::new(1),
            _ready_loop: ready_loop,
            _apply_loop: apply_handle,
            _sweeper: sweeper,
        }))
    }

    /// Proposes `command`, blocking until the apply loop has run it (or the
    /// proposal is rejected, or no response arrives within a generous
    /// timeout — the latter only ever fires if the apply loop itself has
    /// wedged, since a healthy cluster always eventually commits an
    /// accepted proposal).
    fn propose_command(&self, command: Command) -> CResult<CommandOutcome> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.ctx.register(correlation_id, tx);

        let envelope = ProposalEnvelope { correlation_id, command };
        let payload =
            bincode::serialize(&envelope).map_err(|e| Error::Internal(format!("encode proposal: {}", e)))?;

        if let Err(e) = self.proposer.propose(payload) {
            self.ctx.forget(correlation_id);
            return Err(e);
        }

        match rx.recv_timeout(Duration::from_secs(30)) {
            Ok(result) => result,
            Err(_) => {
                self.ctx.forget(correlation_id);
                Err(Error::Unavailable(
                    "timed out waiting for the proposed command to apply".to_string(),
                ))
            }
        }
    }

    /// SPEC_FULL.md §4.1 Range: a local read, never proposed through Raft.
    /// `revision = 0`, or any `revision` with `compacted_revision ≤
    /// revision ≤ current_revision`, returns the current live state (no
    /// historical MVCC, per SPEC_FULL.md §9's Open Question decision); a
    /// `revision` above `current_revision` is `FutureRev`, and one strictly
    /// below the compaction floor is `Compacted`.
    pub fn range(&self, key: &[u8], range_end: &[u8], limit: u64, revision: Revision) -> CResult<(Vec<KeyValue>, u64)> {
        validate_key(key)?;
        let current = self.ctx.kv.current_revision();
        if revision > current {
            return Err(Error::FutureRev { requested: revision, current });
        }
        if revision > 0 {
            let floor = self.ctx.kv.compacted_revision();
            if revision < floor {
                return Err(Error::Compacted { requested: revision, floor });
            }
        }
        Ok(self.ctx.kv.range(key, range_end, limit))
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, lease_id: LeaseId) -> CResult<(Revision, Option<KeyValue>)> {
        validate_key(&key)?;
        validate_value(&value)?;
        if lease_id != 0 && !self.ctx.leases.exists(lease_id) {
            return Err(Error::LeaseNotFound);
        }
        let op = metastore_model::Op::Put { key, value, lease_id };
        let payload = metastore_storage::codec::encode_op(&op)?;
        match self.propose_command(Command::Op(payload))? {
            CommandOutcome::Applied(outcome) => match outcome.outcome {
                OpOutcome::Put { revision, prev_kv } => Ok((revision, prev_kv)),
                _ => Err(Error::Internal("apply loop returned the wrong outcome shape for Put".into())),
            },
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for Put".into())),
        }
    }

    pub fn delete_range(&self, key: Vec<u8>, range_end: Vec<u8>) -> CResult<(Revision, Vec<KeyValue>)> {
        validate_key(&key)?;
        let op = metastore_model::Op::DeleteRange { key, range_end };
        let payload = metastore_storage::codec::encode_op(&op)?;
        match self.propose_command(Command::Op(payload))? {
            CommandOutcome::Applied(outcome) => match outcome.outcome {
                OpOutcome::DeleteRange { revision, deleted } => Ok((revision, deleted)),
                _ => Err(Error::Internal("apply loop returned the wrong outcome shape for DeleteRange".into())),
            },
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for DeleteRange".into())),
        }
    }

    pub fn txn(&self, request: TxnRequest) -> CResult<TxnResponse> {
        for op in request.compare.iter().map(|c| &c.key) {
            validate_key(op)?;
        }
        for op in request.success.iter().chain(request.failure.iter()) {
            if let metastore_model::Op::Put { key, value, .. } = op {
                validate_key(key)?;
                validate_value(value)?;
            }
        }
        match self.propose_command(Command::Txn(request))? {
            CommandOutcome::Applied(outcome) => match outcome.outcome {
                OpOutcome::Txn(response) => Ok(response),
                _ => Err(Error::Internal("apply loop returned the wrong outcome shape for Txn".into())),
            },
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for Txn".into())),
        }
    }

    /// SPEC_FULL.md §4.1 Compact: raises the compaction floor. Rejects a
    /// revision at or below the current floor, or beyond `current_revision`.
    pub fn compact(&self, revision: Revision) -> CResult<()> {
        match self.propose_command(Command::Compact(revision))? {
            CommandOutcome::Compacted => Ok(()),
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for Compact".into())),
        }
    }

    /// Registers a new watch stream. `start_revision == 0` resolves to
    /// `current_revision + 1` ("from now on"); a floor already behind the
    /// compaction point is rejected up front rather than silently starting
    /// with gaps (SPEC_FULL.md §4.1, §3).
    pub fn watch(&self, key: Vec<u8>, range_end: Vec<u8>, start_revision: Revision) -> CResult<WatchHandle> {
        validate_key(&key)?;
        let current = self.ctx.kv.current_revision();
        let effective_start = if start_revision == 0 { current + 1 } else { start_revision };
        let compacted = self.ctx.kv.compacted_revision();
        if effective_start <= compacted {
            return Err(Error::Compacted { requested: effective_start, floor: compacted });
        }
        let watch_id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        Ok(self.ctx.watch_hub.create(watch_id, key, range_end, effective_start))
    }

    pub fn cancel_watch(&self, watch_id: u64) -> CResult<()> {
        self.ctx.watch_hub.cancel(watch_id)
    }

    pub fn lease_grant(&self, id: LeaseId, ttl_seconds: u64) -> CResult<Lease> {
        if id != 0 && self.ctx.leases.exists(id) {
            return Err(Error::LeaseExists);
        }
        match self.propose_command(Command::LeaseGrant {
            id,
            ttl_seconds,
            now_millis: now_millis(),
        })? {
            CommandOutcome::LeaseGranted(lease) => Ok(lease),
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for LeaseGrant".into())),
        }
    }

    pub fn lease_revoke(&self, id: LeaseId) -> CResult<()> {
        match self.propose_command(Command::LeaseRevoke { id })? {
            CommandOutcome::LeaseRevoked => Ok(()),
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for LeaseRevoke".into())),
        }
    }

    pub fn lease_renew(&self, id: LeaseId) -> CResult<u64> {
        match self.propose_command(Command::LeaseRenew { id, now_millis: now_millis() })? {
            CommandOutcome::LeaseRenewed(ttl) => Ok(ttl),
            _ => Err(Error::Internal("apply loop returned the wrong outcome kind for LeaseRenew".into())),
        }
    }

    /// Local read of a lease's remaining TTL and owned keys; not replicated
    /// since it mutates nothing observable to other replicas (an expired
    /// lease discovered here is evicted from this node's own registry only,
    /// same as etcd's lessor does on a stale `TimeToLive` call).
    pub fn lease_time_to_live(&self, id: LeaseId) -> CResult<(u64, Vec<Vec<u8>>)> {
        self.ctx.leases.time_to_live(id, now_millis())
    }

    pub fn current_revision(&self) -> Revision {
        self.ctx.kv.current_revision()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn has_valid_read_lease(&self) -> bool {
        self.raft.has_valid_read_lease()
    }

    /// SPEC_FULL.md §4.1 GetSnapshot / §6: the full envelope
    /// `{current_revision, compacted_revision, []Lease, []KeyValue}`.
    pub fn get_snapshot(&self) -> CResult<Vec<u8>> {
        build_snapshot_bytes(&self.ctx)
    }

    /// Replaces live KV and lease state from a previously captured full
    /// snapshot. Used at startup to resume from a locally-recorded
    /// snapshot; a genuine cross-node snapshot transfer would additionally
    /// need `Transport` wiring, which is out of scope here.
    pub fn restore_snapshot(&self, data: &[u8]) -> CResult<()> {
        let (kv_envelope, leases) = snapshot::decode(data)?;
        let kv_bytes =
            bincode::serialize(&kv_envelope).map_err(|e| Error::Internal(format!("re-encode kv envelope: {}", e)))?;
        self.ctx.kv.restore(&kv_bytes)?;
        self.ctx.leases.restore_leases(leases);
        Ok(())
    }

    /// Stops accepting new ticks and drops every live watch stream
    /// (SPEC_FULL.md §3: watches terminate on "engine shutdown"). The apply
    /// loop and expiry sweeper are daemon threads left running until the
    /// process exits; full graceful process lifecycle is out of scope
    /// (SPEC_FULL.md §1).
    pub fn shutdown(&self) {
        self.raft.shutdown();
        self.ctx.watch_hub.shutdown();
    }
}

/// Opens a `Store` backed by the sharded in-memory KV Engine and a
/// WAL-backed Raft Storage (SPEC_FULL.md §4.3.a, §4.5.a). `config.storage
/// .data_dir` becomes the WAL directory.
pub fn open_memory(
    config: &NodeConfig,
    node_id: u64,
    peers: &[u64],
    transport: Arc<dyn Transport>,
) -> CResult<Arc<Store<MemStorage>>> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let wal_dir = Path::new(&config.storage.data_dir).join("raft-wal");
    let raft_storage = Arc::new(MemStorage::open(wal_dir)?);
    Store::new(kv, raft_storage, node_id, peers, config, transport)
}

/// Opens a `Store` backed by a single `sled::Db` shared between the LSM KV
/// Engine and LSM Raft Storage backends, each keeping to their own key
/// prefix (SPEC_FULL.md §4.3.b, §4.5.b).
pub fn open_lsm(
    config: &NodeConfig,
    node_id: u64,
    peers: &[u64],
    transport: Arc<dyn Transport>,
) -> CResult<Arc<Store<LsmRaftStorage>>> {
    let db = Arc::new(
        sled::open(&config.storage.data_dir).map_err(|e| Error::Internal(format!("sled::open: {}", e)))?,
    );
    let kv: Arc<dyn KvStore> = Arc::new(LsmStore::open(db.clone())?);
    let raft_storage = Arc::new(LsmRaftStorage::open(db)?);
    Store::new(kv, raft_storage, node_id, peers, config, transport)
}

/// Either concrete backend, for callers (namely `cli`) that pick the engine
/// at startup from `NodeConfig::storage::engine` and want one type to hold
/// onto afterward (SPEC_FULL.md §9: "choose at startup").
pub enum AnyStore {
    Memory(Arc<Store<MemStorage>>),
    Lsm(Arc<Store<LsmRaftStorage>>),
}

impl AnyStore {
    pub fn current_revision(&self) -> Revision {
        match self {
            AnyStore::Memory(s) => s.current_revision(),
            AnyStore::Lsm(s) => s.current_revision(),
        }
    }

    pub fn is_leader(&self) -> bool {
        match self {
            AnyStore::Memory(s) => s.is_leader(),
            AnyStore::Lsm(s) => s.is_leader(),
        }
    }

    pub fn compact(&self, revision: Revision) -> CResult<()> {
        match self {
            AnyStore::Memory(s) => s.compact(revision),
            AnyStore::Lsm(s) => s.compact(revision),
        }
    }

    pub fn get_snapshot(&self) -> CResult<Vec<u8>> {
        match self {
            AnyStore::Memory(s) => s.get_snapshot(),
            AnyStore::Lsm(s) => s.get_snapshot(),
        }
    }

    pub fn shutdown(&self) {
        match self {
            AnyStore::Memory(s) => s.shutdown(),
            AnyStore::Lsm(s) => s.shutdown(),
        }
    }
}

pub fn open(
    config: &NodeConfig,
    node_id: u64,
    peers: &[u64],
    transport: Arc<dyn Transport>,
) -> CResult<AnyStore> {
    match config.storage.engine {
        metastore_model::config::StorageEngine::Memory => {
            open_memory(config, node_id, peers, transport).map(AnyStore::Memory)
        }
        metastore_model::config::StorageEngine::Lsm => {
            open_lsm(config, node_id, peers, transport).map(AnyStore::Lsm)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_consensus::NullTransport;
    use metastore_model::{Compare, CompareOp, CompareTarget};
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.storage.data_dir = dir.to_string_lossy().to_string();
        // Keep single-node integration tests fast: short ticks, tiny
        // batching window, aggressive single-node quorum.
        cfg.raft.tick_interval_millis = 5;
        cfg.raft.election_tick = 10;
        cfg.raft.heartbeat_tick = 2;
        cfg.proposer.batch_max_wait_millis = 1;
        cfg.fix_settings();
        cfg
    }

    fn single_node_store(dir: &Path) -> Arc<Store<MemStorage>> {
        let cfg = test_config(dir);
        let store = open_memory(&cfg, 1, &[1], Arc::new(NullTransport)).unwrap();
        wait_for_leader(&store);
        store
    }

    fn wait_for_leader(store: &Store<MemStorage>) {
        for _ in 0..200 {
            if store.is_leader() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("single-node store never became leader");
    }

    // S1: a key's full create/update/delete lifecycle keeps revision and
    // version bookkeeping consistent end to end.
    #[test]
    fn s1_single_key_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        let (rev1, prev) = store.put(b"foo".to_vec(), b"1".to_vec(), 0).unwrap();
        assert!(prev.is_none());

        let (rev2, prev) = store.put(b"foo".to_vec(), b"2".to_vec(), 0).unwrap();
        assert!(rev2 > rev1);
        assert_eq!(prev.unwrap().value, b"1");

        let (kvs, count) = store.range(b"foo", &[], 0, 0).unwrap();
        assert_eq!(count, 1);
        assert_eq!(kvs[0].value, b"2");
        assert_eq!(kvs[0].version, 2);

        let (rev3, deleted) = store.delete_range(b"foo".to_vec(), vec![]).unwrap();
        assert!(rev3 > rev2);
        assert_eq!(deleted.len(), 1);

        let (kvs, count) = store.range(b"foo", &[], 0, 0).unwrap();
        assert_eq!(count, 0);
        assert!(kvs.is_empty());
    }

    // S2: range semantics over point, open, and bounded forms.
    #[test]
    fn s2_range_semantics() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        for k in ["a", "b", "c", "d"] {
            store.put(k.as_bytes().to_vec(), b"v".to_vec(), 0).unwrap();
        }

        let (kvs, count) = store.range(b"a", &[], 0, 0).unwrap();
        assert_eq!((kvs.len(), count), (1, 1));

        let (kvs, count) = store.range(b"b", metastore_model::kv::RANGE_END_OPEN, 0, 0).unwrap();
        assert_eq!(count, 3);
        assert_eq!(kvs.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let (kvs, count) = store.range(b"a", b"c", 0, 0).unwrap();
        assert_eq!(count, 2);
        assert_eq!(kvs.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec()]);

        let (kvs, count) = store.range(b"a", metastore_model::kv::RANGE_END_OPEN, 2, 0).unwrap();
        assert_eq!(count, 4);
        assert_eq!(kvs.len(), 2);
    }

    // S3: a transaction's compare gates which branch runs, atomically.
    #[test]
    fn s3_transaction_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());
        store.put(b"key".to_vec(), b"init".to_vec(), 0).unwrap();

        let txn = TxnRequest {
            compare: vec![Compare {
                target: CompareTarget::Value,
                key: b"key".to_vec(),
                op: CompareOp::Equal,
                value: Some(b"init".to_vec()),
                int_value: None,
            }],
            success: vec![metastore_model::Op::Put {
                key: b"key".to_vec(),
                value: b"swapped".to_vec(),
                lease_id: 0,
            }],
            failure: vec![metastore_model::Op::Put {
                key: b"key".to_vec(),
                value: b"unreachable".to_vec(),
                lease_id: 0,
            }],
        };
        let response = store.txn(txn).unwrap();
        assert!(response.succeeded);

        let (kvs, _) = store.range(b"key", &[], 0, 0).unwrap();
        assert_eq!(kvs[0].value, b"swapped");
    }

    // S4: a leased key is revoked once its TTL elapses, without any client
    // driving the revocation.
    #[test]
    fn s4_lease_expiry_deletes_owned_keys() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        let lease = store.lease_grant(0, 1).unwrap();
        store.put(b"leased".to_vec(), b"v".to_vec(), lease.id).unwrap();

        let (kvs, _) = store.range(b"leased", &[], 0, 0).unwrap();
        assert_eq!(kvs.len(), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (kvs, _) = store.range(b"leased", &[], 0, 0).unwrap();
            if kvs.is_empty() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("leased key was never swept after expiry");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    // S5: a watch stream delivers events from its start revision onward and
    // observes cancellation as channel disconnection.
    #[test]
    fn s5_watch_delivers_from_start_revision_then_cancels() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        store.put(b"w".to_vec(), b"0".to_vec(), 0).unwrap();
        let handle = store.watch(b"w".to_vec(), vec![], 0).unwrap();

        store.put(b"w".to_vec(), b"1".to_vec(), 0).unwrap();
        let event = handle.events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.kv.value, b"1");
        assert_eq!(event.watch_id, handle.watch_id);

        store.cancel_watch(handle.watch_id).unwrap();
        assert!(handle.events.recv_timeout(Duration::from_secs(1)).is_err());
    }

    // S6: a snapshot captures live KV and lease state and can be restored
    // into a fresh store.
    #[test]
    fn s6_snapshot_round_trips_kv_and_leases() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        store.put(b"a".to_vec(), b"1".to_vec(), 0).unwrap();
        let lease = store.lease_grant(0, 60).unwrap();
        store.put(b"b".to_vec(), b"2".to_vec(), lease.id).unwrap();

        let snapshot = store.get_snapshot().unwrap();

        let other_dir = TempDir::new().unwrap();
        let other = single_node_store(other_dir.path());
        other.restore_snapshot(&snapshot).unwrap();

        assert_eq!(other.current_revision(), store.current_revision());
        let (kvs, count) = other.range(b"a", metastore_model::kv::RANGE_END_OPEN, 0, 0).unwrap();
        assert_eq!(count, 2);
        assert_eq!(kvs[0].value, b"1");
        assert_eq!(kvs[1].value, b"2");
    }

    #[test]
    fn put_rejects_an_unknown_lease_before_proposing() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());
        let err = store.put(b"k".to_vec(), b"v".to_vec(), 999).unwrap_err();
        assert!(matches!(err, Error::LeaseNotFound));
    }

    #[test]
    fn range_rejects_a_revision_beyond_current() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());
        let err = store.range(b"k", &[], 0, 999).unwrap_err();
        assert!(matches!(err, Error::FutureRev { .. }));
    }

    // A client reading back at the revision its own Put returned must see
    // live state even once later writes have moved current_revision ahead
    // of it — only a revision below the compaction floor is Compacted.
    #[test]
    fn range_at_a_past_but_uncompacted_revision_returns_live_state() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        let (put_rev, _) = store.put(b"k".to_vec(), b"1".to_vec(), 0).unwrap();
        store.put(b"k".to_vec(), b"2".to_vec(), 0).unwrap();
        store.put(b"other".to_vec(), b"x".to_vec(), 0).unwrap();
        assert!(store.current_revision() > put_rev);

        let (kvs, count) = store.range(b"k", &[], 0, put_rev).unwrap();
        assert_eq!(count, 1);
        assert_eq!(kvs[0].value, b"2");
    }

    #[test]
    fn range_below_the_compacted_floor_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = single_node_store(dir.path());

        store.put(b"k".to_vec(), b"1".to_vec(), 0).unwrap();
        store.put(b"k".to_vec(), b"2".to_vec(), 0).unwrap();
        let current = store.current_revision();
        store.compact(current).unwrap();

        let err = store.range(b"k", &[], 0, 1).unwrap_err();
        assert!(matches!(err, Error::Compacted { .. }));
    }
}
