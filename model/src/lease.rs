use serde::{Deserialize, Serialize};

/// Lease identifier. `0` means "no lease" wherever it appears on a `KeyValue`.
pub type LeaseId = i64;

/// A TTL-bounded token that owns a set of keys; expiry deletes them
/// (SPEC_FULL.md §3, `Lease`).
///
/// `granted_at` is stored as a duration since an arbitrary monotonic epoch
/// rather than wall-clock time, so that serialized leases in a snapshot
/// don't depend on the receiving node's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl_seconds: u64,
    pub granted_at_millis: u64,
    pub keys: Vec<Vec<u8>>,
}

impl Lease {
    pub fn new(id: LeaseId, ttl_seconds: u64, granted_at_millis: u64) -> Self {
        Lease {
            id,
            ttl_seconds,
            granted_at_millis,
            keys: Vec::new(),
        }
    }

    pub fn expires_at_millis(&self) -> u64 {
        self.granted_at_millis
            .saturating_add(self.ttl_seconds.saturating_mul(1000))
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at_millis()
    }

    pub fn remaining_seconds(&self, now_millis: u64) -> u64 {
        let expires = self.expires_at_millis();
        if now_millis >= expires {
            0
        } else {
            (expires - now_millis) / 1000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_seconds_counts_down_to_zero() {
        let lease = Lease::new(7, 10, 1_000);
        assert_eq!(lease.remaining_seconds(1_000), 10);
        assert_eq!(lease.remaining_seconds(6_000), 5);
        assert_eq!(lease.remaining_seconds(11_001), 0);
        assert!(lease.is_expired(11_001));
        assert!(!lease.is_expired(10_999));
    }
}
