use serde::{Deserialize, Serialize};

use crate::kv::KeyValue;
use crate::lease::LeaseId;

/// One operation nested inside a Txn's `then`/`else` branch, or proposed
/// standalone by the Store facade's Put/DeleteRange/Range calls
/// (SPEC_FULL.md §4.1, §4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Range {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        range_end: Vec<u8>,
        limit: u64,
    },
    Put {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
        lease_id: LeaseId,
    },
    DeleteRange {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        range_end: Vec<u8>,
    },
}

impl Op {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Op::Range { .. })
    }
}

/// The field a Compare predicate inspects (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Version,
    CreateRevision,
    ModRevision,
    Value,
    Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    Greater,
}

/// A single Txn precondition: compare `target` on `key` against `value`
/// (or `int_value` for the integer-valued targets) using `op`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub target: CompareTarget,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    pub op: CompareOp,
    /// Used when `target` is `Value`.
    pub value: Option<Vec<u8>>,
    /// Used when `target` is `Version`, `CreateRevision`, `ModRevision`, or `Lease`.
    pub int_value: Option<i64>,
}

impl Compare {
    pub fn evaluate(&self, kv: Option<&KeyValue>) -> bool {
        match self.target {
            CompareTarget::Value => {
                let actual = kv.map(|kv| kv.value.as_slice());
                let expected = self.value.as_deref();
                compare_ord(actual, expected, self.op)
            }
            CompareTarget::Version => {
                compare_int(kv.map(|kv| kv.version as i64), self.int_value, self.op)
            }
            CompareTarget::CreateRevision => compare_int(
                kv.map(|kv| kv.create_revision as i64),
                self.int_value,
                self.op,
            ),
            CompareTarget::ModRevision => {
                compare_int(kv.map(|kv| kv.mod_revision as i64), self.int_value, self.op)
            }
            CompareTarget::Lease => {
                compare_int(kv.map(|kv| kv.lease_id), self.int_value, self.op)
            }
        }
    }
}

fn compare_ord(actual: Option<&[u8]>, expected: Option<&[u8]>, op: CompareOp) -> bool {
    match op {
        CompareOp::Equal => actual == expected,
        CompareOp::NotEqual => actual != expected,
        CompareOp::Less => actual < expected,
        CompareOp::Greater => actual > expected,
    }
}

fn compare_int(actual: Option<i64>, expected: Option<i64>, op: CompareOp) -> bool {
    // Absent key reads as version/create_revision/mod_revision/lease == 0,
    // matching etcd's own convention for a non-existent key.
    let actual = actual.unwrap_or(0);
    let expected = expected.unwrap_or(0);
    match op {
        CompareOp::Equal => actual == expected,
        CompareOp::NotEqual => actual != expected,
        CompareOp::Less => actual < expected,
        CompareOp::Greater => actual > expected,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

/// The response to a single `Op` inside a Txn (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResponse {
    Range {
        kvs: Vec<KeyValue>,
        count: u64,
    },
    Put {
        revision: u64,
        prev_kv: Option<KeyValue>,
    },
    DeleteRange {
        deleted: u64,
        prev_kvs: Vec<KeyValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(value: &str, version: u64) -> KeyValue {
        KeyValue {
            key: b"x".to_vec(),
            value: value.as_bytes().to_vec(),
            create_revision: 1,
            mod_revision: version,
            version,
            lease_id: 0,
        }
    }

    #[test]
    fn value_equal_compare() {
        let cmp = Compare {
            target: CompareTarget::Value,
            key: b"x".to_vec(),
            op: CompareOp::Equal,
            value: Some(b"init".to_vec()),
            int_value: None,
        };
        assert!(cmp.evaluate(Some(&kv("init", 1))));
        assert!(!cmp.evaluate(Some(&kv("new", 2))));
    }

    #[test]
    fn missing_key_treated_as_zero_for_int_targets() {
        let cmp = Compare {
            target: CompareTarget::Version,
            key: b"x".to_vec(),
            op: CompareOp::Equal,
            value: None,
            int_value: Some(0),
        };
        assert!(cmp.evaluate(None));
    }
}
