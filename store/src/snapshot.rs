//! The full snapshot envelope (SPEC_FULL.md §6): `{current_revision,
//! compacted_revision, []Lease, []KeyValue}`. `storage::KvSnapshotEnvelope`
//! already carries the first three and the KVs; this module only adds the
//! Lease Registry's export alongside it.

use metastore_model::{CResult, Error, Lease, Revision};
use metastore_storage::KvSnapshotEnvelope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSnapshot {
    pub current_revision: Revision,
    pub compacted_revision: Revision,
    pub leases: Vec<Lease>,
    pub kvs: Vec<metastore_model::KeyValue>,
}

pub fn encode(kv_envelope: KvSnapshotEnvelope, leases: Vec<Lease>) -> CResult<Vec<u8>> {
    let full = FullSnapshot {
        current_revision: kv_envelope.current_revision,
        compacted_revision: kv_envelope.compacted_revision,
        leases,
        kvs: kv_envelope.kvs,
    };
    bincode::serialize(&full).map_err(|e| Error::Internal(format!("encode snapshot: {}", e)))
}

/// Splits a decoded full snapshot back into the KV-only envelope
/// `storage::KvStore::restore` expects plus the lease list `store` restores
/// into the Lease Registry separately.
pub fn decode(bytes: &[u8]) -> CResult<(KvSnapshotEnvelope, Vec<Lease>)> {
    let full: FullSnapshot = bincode::deserialize(bytes)
        .map_err(|e| Error::Internal(format!("decode snapshot: {}", e)))?;
    Ok((
        KvSnapshotEnvelope {
            current_revision: full.current_revision,
            compacted_revision: full.compacted_revision,
            kvs: full.kvs,
        },
        full.leases,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_model::KeyValue;

    #[test]
    fn full_snapshot_round_trips() {
        let kv_envelope = KvSnapshotEnvelope {
            current_revision: 5,
            compacted_revision: 1,
            kvs: vec![KeyValue {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                create_revision: 5,
                mod_revision: 5,
                version: 1,
                lease_id: 0,
            }],
        };
        let leases = vec![Lease::new(1, 60, 0)];
        let bytes = encode(kv_envelope.clone(), leases.clone()).unwrap();
        let (decoded_kv, decoded_leases) = decode(&bytes).unwrap();
        assert_eq!(decoded_kv.current_revision, kv_envelope.current_revision);
        assert_eq!(decoded_kv.kvs, kv_envelope.kvs);
        assert_eq!(decoded_leases.len(), leases.len());
    }
}
