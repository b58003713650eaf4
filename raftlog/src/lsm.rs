//! The LSM-keyed Raft Storage variant (SPEC_FULL.md §4.5, §6), sharing the
//! same `sled::Db` directory as `storage::LsmStore` and `lease`'s persistent
//! backend, distinguished by the `raft/` key prefix.
//!
//! Durability comes from `sled`'s own atomic batch write, mirroring
//! `storage::LsmStore`'s choice not to call `Db::flush` on the hot path —
//! the difference is that here the log *is* the durability mechanism the
//! rest of the system relies on, so every `append`/`set_hard_state` batch is
//! applied before this call returns (SPEC_FULL.md §4.5: "must be durable
//! before the Raft Node sends outbound messages derived from those updates").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use metastore_model::raft::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use metastore_model::{CResult, Error, Revision};
use parking_lot::Mutex;

use crate::storage::RaftStorage;

const LOG_PREFIX: &str = "raft/log/";
const HARD_STATE_KEY: &[u8] = b"raft/hard_state";
const CONF_STATE_KEY: &[u8] = b"raft/conf_state";
const SNAPSHOT_META_KEY: &[u8] = b"raft/snapshot_meta";
const SNAPSHOT_DATA_KEY: &[u8] = b"raft/snapshot_data";

fn log_key(index: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOG_PREFIX.len() + 8);
    out.extend_from_slice(LOG_PREFIX.as_bytes());
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, index);
    out.extend_from_slice(&buf);
    out
}

fn index_of_log_key(key: &[u8]) -> u64 {
    BigEndian::read_u64(&key[LOG_PREFIX.len()..])
}

/// The sled-backed Raft Storage. One instance owns the `raft/` prefix of a
/// shared `sled::Db` (SPEC_FULL.md §6: "a single directory containing the
/// LSM store").
pub struct LsmRaftStorage {
    db: Arc<sled::Db>,
    /// Serializes the read-modify-write needed to keep `first_index` and
    /// the log entries consistent across an `append`/`compact` pair.
    write_lock: Mutex<()>,
    first_index: AtomicU64,
    last_index: AtomicU64,
}

impl LsmRaftStorage {
    pub fn open(db: Arc<sled::Db>) -> CResult<Self> {
        let snapshot_index = db
            .get(SNAPSHOT_META_KEY)
            .map_err(sled_err)?
            .and_then(|v| bincode::deserialize::<SnapshotMetadata>(&v).ok())
            .map(|m| m.index)
            .unwrap_or(0);

        let mut first_index = snapshot_index + 1;
        let mut last_index = snapshot_index;
        for entry in db.scan_prefix(LOG_PREFIX.as_bytes()) {
            let (k, _) = entry.map_err(sled_err)?;
            let idx = index_of_log_key(&k);
            if last_index < idx || last_index == snapshot_index {
                last_index = idx;
            }
        }
        if let Some(min_idx) = db
            .scan_prefix(LOG_PREFIX.as_bytes())
            .filter_map(|r| r.ok())
            .map(|(k, _)| index_of_log_key(&k))
            .min()
        {
            first_index = min_idx;
        }
        if last_index < first_index.saturating_sub(1) {
            last_index = first_index.saturating_sub(1);
        }

        Ok(LsmRaftStorage {
            db,
            write_lock: Mutex::new(()),
            first_index: AtomicU64::new(first_index),
            last_index: AtomicU64::new(last_index),
        })
    }

    fn get_entry(&self, index: u64) -> CResult<Option<Entry>> {
        Ok(self
            .db
            .get(log_key(index))
            .map_err(sled_err)?
            .map(|v| bincode::deserialize::<Entry>(&v))
            .transpose()
            .map_err(bincode_err)?)
    }
}

impl RaftStorage for LsmRaftStorage {
    fn initial_state(&self) -> CResult<(HardState, ConfState)> {
        let hs = self
            .db
            .get(HARD_STATE_KEY)
            .map_err(sled_err)?
            .map(|v| bincode::deserialize::<HardState>(&v))
            .transpose()
            .map_err(bincode_err)?
            .unwrap_or_default();
        let cs = self
            .db
            .get(CONF_STATE_KEY)
            .map_err(sled_err)?
            .map(|v| bincode::deserialize::<ConfState>(&v))
            .transpose()
            .map_err(bincode_err)?
            .unwrap_or_default();
        Ok((hs, cs))
    }

    fn entries(&self, lo: u64, hi: u64, max_size: Option<u64>) -> CResult<Vec<Entry>> {
        let first = self.first_index.load(Ordering::SeqCst);
        let last = self.last_index.load(Ordering::SeqCst);
        if lo < first {
            return Err(Error::Compacted {
                requested: lo,
                floor: first,
            });
        }
        if hi > last + 1 {
            return Err(Error::Unavailable(format!(
                "requested entries up to {} but last index is {}",
                hi, last
            )));
        }
        let mut out = Vec::new();
        let mut total = 0u64;
        for index in lo..hi {
            let entry = self
                .get_entry(index)?
                .ok_or_else(|| Error::Internal(format!("missing raft log entry at {}", index)))?;
            let size = entry.data.len() as u64;
            if let Some(max) = max_size {
                if !out.is_empty() && total + size > max {
                    break;
                }
            }
            total += size;
            out.push(entry);
        }
        Ok(out)
    }

    fn term(&self, index: u64) -> CResult<u64> {
        let meta = self
            .db
            .get(SNAPSHOT_META_KEY)
            .map_err(sled_err)?
            .map(|v| bincode::deserialize::<SnapshotMetadata>(&v))
            .transpose()
            .map_err(bincode_err)?;
        if let Some(meta) = &meta {
            if meta.index == index {
                return Ok(meta.term);
            }
        }
        let first = self.first_index.load(Ordering::SeqCst);
        let last = self.last_index.load(Ordering::SeqCst);
        if index < first {
            return Err(Error::Compacted {
                requested: index,
                floor: first,
            });
        }
        if index > last {
            return Err(Error::Unavailable(format!(
                "term requested for index {} beyond last index {}",
                index, last
            )));
        }
        self.get_entry(index)?
            .map(|e| e.term)
            .ok_or_else(|| Error::Internal(format!("missing raft log entry at {}", index)))
    }

    fn first_index(&self) -> CResult<u64> {
        Ok(self.first_index.load(Ordering::SeqCst))
    }

    fn last_index(&self) -> CResult<u64> {
        Ok(self.last_index.load(Ordering::SeqCst))
    }

    fn snapshot(&self) -> CResult<Snapshot> {
        let meta = self
            .db
            .get(SNAPSHOT_META_KEY)
            .map_err(sled_err)?
            .map(|v| bincode::deserialize::<SnapshotMetadata>(&v))
            .transpose()
            .map_err(bincode_err)?;
        let data = self
            .db
            .get(SNAPSHOT_DATA_KEY)
            .map_err(sled_err)?
            .map(|v| v.to_vec())
            .unwrap_or_default();
        Ok(match meta {
            Some(metadata) => Snapshot { metadata, data },
            None => Snapshot::empty(),
        })
    }

    fn append(&self, entries: &[Entry]) -> CResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let mut batch = sled::Batch::default();
        for entry in entries {
            batch.insert(log_key(entry.index), bincode::serialize(entry).map_err(bincode_err)?);
        }
        self.db.apply_batch(batch).map_err(sled_err)?;

        let first_new = entries[0].index;
        let last_new = entries[entries.len() - 1].index;
        // Overwriting tail: anything previously stored at or beyond
        // `first_new` that wasn't just rewritten must be dropped.
        let old_last = self.last_index.load(Ordering::SeqCst);
        if old_last > last_new {
            let mut drop_batch = sled::Batch::default();
            for index in (last_new + 1)..=old_last {
                drop_batch.remove(log_key(index));
            }
            self.db.apply_batch(drop_batch).map_err(sled_err)?;
        }
        self.last_index.store(last_new, Ordering::SeqCst);
        if self.first_index.load(Ordering::SeqCst) > first_new {
            self.first_index.store(first_new, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_hard_state(&self, hs: HardState) -> CResult<()> {
        self.db
            .insert(HARD_STATE_KEY, bincode::serialize(&hs).map_err(bincode_err)?)
            .map_err(sled_err)?;
        Ok(())
    }

    fn create_snapshot(&self, index: u64, conf_state: ConfState, data: Vec<u8>) -> CResult<()> {
        let _guard = self.write_lock.lock();
        let term = self.term(index)?;
        let metadata = SnapshotMetadata {
            index,
            term,
            conf_state: conf_state.clone(),
        };
        let mut batch = sled::Batch::default();
        batch.insert(SNAPSHOT_META_KEY, bincode::serialize(&metadata).map_err(bincode_err)?);
        batch.insert(SNAPSHOT_DATA_KEY, data);
        batch.insert(CONF_STATE_KEY, bincode::serialize(&conf_state).map_err(bincode_err)?);
        self.db.apply_batch(batch).map_err(sled_err)?;
        Ok(())
    }

    fn apply_snapshot(&self, snap: Snapshot) -> CResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = sled::Batch::default();
        for entry in self
            .db
            .scan_prefix(LOG_PREFIX.as_bytes())
            .filter_map(|r| r.ok())
            .map(|(k, _)| k)
        {
            batch.remove(entry);
        }
        batch.insert(
            SNAPSHOT_META_KEY,
            bincode::serialize(&snap.metadata).map_err(bincode_err)?,
        );
        batch.insert(SNAPSHOT_DATA_KEY, snap.data.clone());
        batch.insert(
            CONF_STATE_KEY,
            bincode::serialize(&snap.metadata.conf_state).map_err(bincode_err)?,
        );
        self.db.apply_batch(batch).map_err(sled_err)?;
        self.first_index.store(snap.metadata.index + 1, Ordering::SeqCst);
        self.last_index.store(snap.metadata.index, Ordering::SeqCst);
        Ok(())
    }

    fn compact(&self, index: Revision) -> CResult<()> {
        let _guard = self.write_lock.lock();
        let first = self.first_index.load(Ordering::SeqCst);
        if index <= first.saturating_sub(1) {
            return Err(Error::Compacted {
                requested: index,
                floor: first,
            });
        }
        let last = self.last_index.load(Ordering::SeqCst);
        if index > last {
            return Err(Error::Unavailable(format!(
                "cannot compact to index {} beyond last index {}",
                index, last
            )));
        }
        let mut batch = sled::Batch::default();
        for dropped in first..index {
            batch.remove(log_key(dropped));
        }
        self.db.apply_batch(batch).map_err(sled_err)?;
        self.first_index.store(index, Ordering::SeqCst);
        Ok(())
    }
}

fn sled_err(e: sled::Error) -> Error {
    Error::Internal(format!("sled: {}", e))
}

fn bincode_err(e: bincode::Error) -> Error {
    Error::Internal(format!("bincode: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_model::raft::EntryType;

    fn entry(index: u64, term: u64) -> Entry {
        Entry {
            term,
            index,
            entry_type: EntryType::Normal,
            data: format!("e{}", index).into_bytes(),
        }
    }

    fn open_temp() -> (LsmRaftStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (LsmRaftStorage::open(Arc::new(db)).unwrap(), dir)
    }

    #[test]
    fn append_and_read_back_entries() {
        let (store, _dir) = open_temp();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 3);
        let got = store.entries(1, 4, None).unwrap();
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn append_overwrites_conflicting_tail() {
        let (store, _dir) = open_temp();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        store.append(&[entry(2, 2)]).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.term(2).unwrap(), 2);
        assert!(store.get_entry(3).unwrap().is_none());
    }

    #[test]
    fn compact_drops_entries_below_floor() {
        let (store, _dir) = open_temp();
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();
        store.compact(3).unwrap();
        assert_eq!(store.first_index().unwrap(), 3);
        assert!(store.entries(1, 2, None).is_err());
        let got = store.entries(3, 5, None).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn reopen_recovers_state_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let store = LsmRaftStorage::open(Arc::new(db)).unwrap();
            store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
            store
                .set_hard_state(HardState {
                    term: 1,
                    vote: 1,
                    commit: 2,
                })
                .unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let store = LsmRaftStorage::open(Arc::new(db)).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        let (hs, _) = store.initial_state().unwrap();
        assert_eq!(hs.commit, 2);
    }
}
