//! The apply path: decode, validate, execute (SPEC_FULL.md §4.3).
//!
//! This module is the single place that turns a committed Raft entry's
//! payload bytes into a mutation against a `KvStore`. It is deliberately
//! free of any Raft or channel types — the consumer (wired up in
//! `consensus`/`store`) owns the commit stream and `apply_done` signaling;
//! this module only owns "one committed payload in, one `ApplyOutcome` out".

use metastore_model::{kv::MAX_KEY_BYTES, kv::MAX_VALUE_BYTES, CResult, Error, Op, TxnRequest};

use crate::engine::{ApplyOutcome, KvStore};

/// Apply one committed, already-decoded `Op` against `store`.
///
/// Returns `Err` only for malformed input (empty key, oversized key/value);
/// callers must log and skip rather than propagate such an error up through
/// the apply loop (SPEC_FULL.md §4.3 step 2, §7).
pub fn apply_op(store: &dyn KvStore, op: Op) -> CResult<ApplyOutcome> {
    validate_op(&op)?;
    Ok(match op {
        Op::Put {
            key,
            value,
            lease_id,
        } => store.apply_put(key, value, lease_id),
        Op::DeleteRange { key, range_end } => store.apply_delete_range(&key, &range_end),
        Op::Range { .. } => {
            return Err(Error::InvalidArgument(
                "Range is not a mutating op and cannot be applied".into(),
            ))
        }
    })
}

pub fn apply_txn(store: &dyn KvStore, txn: &TxnRequest) -> CResult<ApplyOutcome> {
    for op in txn.success.iter().chain(txn.failure.iter()) {
        validate_op(op)?;
    }
    Ok(store.apply_txn(txn))
}

fn validate_op(op: &Op) -> CResult<()> {
    match op {
        Op::Put { key, value, .. } => {
            validate_key(key)?;
            if value.len() > MAX_VALUE_BYTES {
                return Err(Error::InvalidArgument(format!(
                    "value of {} bytes exceeds the {} byte limit",
                    value.len(),
                    MAX_VALUE_BYTES
                )));
            }
            Ok(())
        }
        Op::DeleteRange { key, .. } => validate_key(key),
        Op::Range { key, .. } => validate_key(key),
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn empty_key_is_rejected_without_touching_the_store() {
        let store = MemoryStore::new();
        let op = Op::Put {
            key: vec![],
            value: b"v".to_vec(),
            lease_id: 0,
        };
        assert!(apply_op(&store, op).is_err());
        assert_eq!(store.current_revision(), 0);
    }
}
