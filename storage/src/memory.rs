//! The sharded in-memory backend (SPEC_FULL.md §4.3.a).
//!
//! A fixed-width shard array (rather than a single map behind one lock) so
//! that point operations only ever take one shard's lock, while multi-key
//! operations (DeleteRange, Txn) take a coarser lock that blocks all
//! point writers for their duration.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use metastore_model::kv::classify_range;
use metastore_model::{
    kv::RangeKind, CResult, Error, KeyValue, LeaseId, Revision, TxnRequest, WatchEventKind,
};
use parking_lot::{Mutex, RwLock};

use crate::engine::{ApplyOutcome, KvSnapshotEnvelope, KvStore, LeaseDelta, OpOutcome};

const SHARD_COUNT: usize = 256;

fn shard_index(key: &[u8]) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

struct Shard {
    entries: Mutex<HashMap<Vec<u8>, KeyValue>>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// The sharded in-memory `KvStore`. Snapshot/restore serialize the union of
/// all shards plus the revision counters, per SPEC_FULL.md §4.3.a.
pub struct MemoryStore {
    shards: Vec<Shard>,
    /// Point operations take a shared guard here (so many can proceed at
    /// once, each further serialized only by its own shard lock);
    /// multi-key operations take the exclusive guard.
    coarse: RwLock<()>,
    current_revision: AtomicU64,
    compacted_revision: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Shard::new());
        }
        MemoryStore {
            shards,
            coarse: RwLock::new(()),
            current_revision: AtomicU64::new(0),
            compacted_revision: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[shard_index(key)]
    }

    fn next_revision(&self) -> Revision {
        self.current_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a single Put without taking the coarse lock itself — callers
    /// (both the public `apply_put` and the Txn executor) are responsible
    /// for already holding the appropriate coarse guard.
    fn put_locked(&self, key: Vec<u8>, value: Vec<u8>, lease_id: LeaseId) -> ApplyOutcome {
        let revision = self.next_revision();
        let shard = self.shard(&key);
        let mut entries = shard.entries.lock();
        let prev = entries.get(&key).cloned();
        let new_kv = match &prev {
            Some(existing) => existing.updated(value, revision, lease_id),
            None => KeyValue::created(key.clone(), value, revision, lease_id),
        };
        entries.insert(key.clone(), new_kv.clone());
        drop(entries);

        let mut lease_deltas = Vec::new();
        if let Some(existing) = &prev {
            if existing.lease_id != 0 && existing.lease_id != lease_id {
                lease_deltas.push(LeaseDelta::Dissociate {
                    lease_id: existing.lease_id,
                    key: key.clone(),
                });
            }
        }
        let already_associated = matches!(&prev, Some(p) if p.lease_id == lease_id);
        if lease_id != 0 && !already_associated {
            lease_deltas.push(LeaseDelta::Associate { lease_id, key: key.clone() });
        }

        ApplyOutcome {
            outcome: OpOutcome::Put {
                revision,
                prev_kv: prev,
            },
            events: vec![metastore_model::WatchEvent {
                watch_id: 0,
                kind: WatchEventKind::Put,
                kv: new_kv,
                prev_kv: None,
            }],
            lease_deltas,
        }
    }

    /// Apply a single DeleteRange without taking the coarse lock itself.
    fn delete_range_locked(&self, key: &[u8], range_end: &[u8]) -> ApplyOutcome {
        let matches = self.matching_keys(key, range_end);
        if matches.is_empty() {
            return ApplyOutcome {
                outcome: OpOutcome::DeleteRange {
                    revision: self.current_revision(),
                    deleted: Vec::new(),
                },
                events: Vec::new(),
                lease_deltas: Vec::new(),
            };
        }

        let revision = self.next_revision();
        let mut deleted = Vec::with_capacity(matches.len());
        let mut events = Vec::with_capacity(matches.len());
        let mut lease_deltas = Vec::new();
        for k in matches {
            let shard = self.shard(&k);
            let removed = shard.entries.lock().remove(&k);
            if let Some(kv) = removed {
                if kv.lease_id != 0 {
                    lease_deltas.push(LeaseDelta::Dissociate {
                        lease_id: kv.lease_id,
                        key: k.clone(),
                    });
                }
                events.push(metastore_model::WatchEvent {
                    watch_id: 0,
                    kind: WatchEventKind::Delete,
                    kv: kv.deleted_at(revision),
                    prev_kv: Some(kv.clone()),
                });
                deleted.push(kv);
            }
        }

        ApplyOutcome {
            outcome: OpOutcome::DeleteRange { revision, deleted },
            events,
            lease_deltas,
        }
    }

    fn matching_keys(&self, key: &[u8], range_end: &[u8]) -> Vec<Vec<u8>> {
        match classify_range(range_end) {
            RangeKind::Point => {
                let shard = self.shard(key);
                if shard.entries.lock().contains_key(key) {
                    vec![key.to_vec()]
                } else {
                    Vec::new()
                }
            }
            RangeKind::Open => {
                let mut out = Vec::new();
                for shard in &self.shards {
                    for k in shard.entries.lock().keys() {
                        if k.as_slice() >= key {
                            out.push(k.clone());
                        }
                    }
                }
                out.sort();
                out
            }
            RangeKind::Bounded(end) => {
                let mut out = Vec::new();
                for shard in &self.shards {
                    for k in shard.entries.lock().keys() {
                        if k.as_slice() >= key && k.as_slice() < end {
                            out.push(k.clone());
                        }
                    }
                }
                out.sort();
                out
            }
        }
    }
}

impl KvStore for MemoryStore {
    fn range(&self, key: &[u8], range_end: &[u8], limit: u64) -> (Vec<KeyValue>, u64) {
        let _guard = self.coarse.read();
        let kvs: Vec<KeyValue> = match classify_range(range_end) {
            RangeKind::Point => {
                let shard = self.shard(key);
                shard
                    .entries
                    .lock()
                    .get(key)
                    .cloned()
                    .into_iter()
                    .collect()
            }
            RangeKind::Open => {
                let mut out: Vec<KeyValue> = self
                    .shards
                    .iter()
                    .flat_map(|shard| {
                        shard
                            .entries
                            .lock()
                            .values()
                            .filter(|kv| kv.key.as_slice() >= key)
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .collect();
                out.sort_by(|a, b| a.key.cmp(&b.key));
                out
            }
            RangeKind::Bounded(end) => {
                let mut out: Vec<KeyValue> = self
                    .shards
                    .iter()
                    .flat_map(|shard| {
                        shard
                            .entries
                            .lock()
                            .values()
                            .filter(|kv| kv.key.as_slice() >= key && kv.key.as_slice() < end)
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .collect();
                out.sort_by(|a, b| a.key.cmp(&b.key));
                out
            }
        };
        let count = kvs.len() as u64;
        if limit == 0 || (kvs.len() as u64) <= limit {
            (kvs, count)
        } else {
            (kvs.into_iter().take(limit as usize).collect(), count)
        }
    }

    fn apply_put(&self, key: Vec<u8>, value: Vec<u8>, lease_id: LeaseId) -> ApplyOutcome {
        let _guard = self.coarse.read();
        self.put_locked(key, value, lease_id)
    }

    fn apply_delete_range(&self, key: &[u8], range_end: &[u8]) -> ApplyOutcome {
        let _guard = self.coarse.write();
        self.delete_range_locked(key, range_end)
    }

    fn apply_txn(&self, txn: &TxnRequest) -> ApplyOutcome {
        let _guard = self.coarse.write();

        let all_pass = txn.compare.iter().all(|cmp| {
            let matches = self.matching_keys(&cmp.key, &[]);
            let kv = matches
                .first()
                .and_then(|k| self.shard(k).entries.lock().get(k).cloned());
            cmp.evaluate(kv.as_ref())
        });

        let branch = if all_pass { &txn.success } else { &txn.failure };

        let mut responses = Vec::with_capacity(branch.len());
        let mut events = Vec::new();
        let mut lease_deltas = Vec::new();
        let mut last_revision = self.current_revision();

        for op in branch {
            match op {
                metastore_model::Op::Put {
                    key,
                    value,
                    lease_id,
                } => {
                    let out = self.put_locked(key.clone(), value.clone(), *lease_id);
                    if let OpOutcome::Put { revision, prev_kv } = out.outcome {
                        last_revision = revision;
                        responses.push(metastore_model::txn::OpResponse::Put { revision, prev_kv });
                    }
                    events.extend(out.events);
                    lease_deltas.extend(out.lease_deltas);
                }
                metastore_model::Op::DeleteRange { key, range_end } => {
                    let out = self.delete_range_locked(key, range_end);
                    if let OpOutcome::DeleteRange { revision, deleted } = out.outcome {
                        if !deleted.is_empty() {
                            last_revision = revision;
                        }
                        responses.push(metastore_model::txn::OpResponse::DeleteRange {
                            deleted: deleted.len() as u64,
                            prev_kvs: deleted,
                        });
                    }
                    events.extend(out.events);
                    lease_deltas.extend(out.lease_deltas);
                }
                metastore_model::Op::Range {
                    key,
                    range_end,
                    limit,
                } => {
                    let (kvs, count) = self.range(key, range_end, *limit);
                    responses.push(metastore_model::txn::OpResponse::Range { kvs, count });
                }
            }
        }

        ApplyOutcome {
            outcome: OpOutcome::Txn(metastore_model::TxnResponse {
                succeeded: all_pass,
                responses,
                revision: last_revision,
            }),
            events,
            lease_deltas,
        }
    }

    fn current_revision(&self) -> Revision {
        self.current_revision.load(Ordering::SeqCst)
    }

    fn compacted_revision(&self) -> Revision {
        self.compacted_revision.load(Ordering::SeqCst)
    }

    fn compact(&self, revision: Revision) -> CResult<()> {
        let current = self.current_revision();
        if revision > current {
            return Err(Error::FutureRev {
                requested: revision,
                current,
            });
        }
        let floor = self.compacted_revision();
        if revision <= floor {
            return Err(Error::Compacted {
                requested: revision,
                floor,
            });
        }
        self.compacted_revision.store(revision, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot(&self) -> CResult<Vec<u8>> {
        let _guard = self.coarse.write();
        let kvs: Vec<KeyValue> = self
            .shards
            .iter()
            .flat_map(|shard| shard.entries.lock().values().cloned().collect::<Vec<_>>())
            .collect();
        let envelope = KvSnapshotEnvelope {
            current_revision: self.current_revision(),
            compacted_revision: self.compacted_revision(),
            kvs,
        };
        bincode::serialize(&envelope).map_err(|e| Error::Internal(format!("snapshot encode: {}", e)))
    }

    fn restore(&self, data: &[u8]) -> CResult<()> {
        let envelope: KvSnapshotEnvelope = bincode::deserialize(data)
            .map_err(|e| Error::Internal(format!("snapshot decode: {}", e)))?;
        let _guard = self.coarse.write();
        for shard in &self.shards {
            shard.entries.lock().clear();
        }
        for kv in envelope.kvs {
            self.shard(&kv.key).entries.lock().insert(kv.key.clone(), kv);
        }
        self.current_revision
            .store(envelope.current_revision, Ordering::SeqCst);
        self.compacted_revision
            .store(envelope.compacted_revision, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[test]
    fn memory_store_passes_the_shared_engine_contract() {
        testkit::run_engine_contract(|| MemoryStore::new());
    }

    #[test]
    fn snapshot_round_trips() {
        let a = MemoryStore::new();
        a.apply_put(b"a".to_vec(), b"1".to_vec(), 0);
        a.apply_put(b"b".to_vec(), b"2".to_vec(), 0);
        let snap = a.snapshot().unwrap();

        let b = MemoryStore::new();
        b.restore(&snap).unwrap();
        assert_eq!(b.current_revision(), a.current_revision());
        let (kvs, count) = b.range(b"a", metastore_model::kv::RANGE_END_OPEN, 0);
        assert_eq!(count, 2);
        assert_eq!(kvs[0].value, b"1");
        assert_eq!(kvs[1].value, b"2");
    }
}
