use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use log::{debug, info};
use metastore_model::lease::{Lease, LeaseId};
use metastore_model::{CResult, Error};
use parking_lot::{Mutex, RwLock};

/// Internal per-lease bookkeeping. Keys are kept in a `BTreeSet` so
/// `snapshot_leases` emits them in a stable order.
struct LeaseRecord {
    ttl_seconds: u64,
    granted_at_millis: u64,
    keys: BTreeSet<Vec<u8>>,
}

impl LeaseRecord {
    fn expires_at_millis(&self) -> u64 {
        self.granted_at_millis + self.ttl_seconds * 1000
    }

    fn is_expired(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at_millis()
    }

    fn remaining_seconds(&self, now_millis: u64) -> u64 {
        let expires_at = self.expires_at_millis();
        if now_millis >= expires_at {
            0
        } else {
            (expires_at - now_millis + 999) / 1000
        }
    }

    fn to_lease(&self, id: LeaseId) -> Lease {
        Lease {
            id,
            ttl_seconds: self.ttl_seconds,
            granted_at_millis: self.granted_at_millis,
            keys: self.keys.iter().cloned().collect(),
        }
    }
}

/// TTL-bounded key ownership. Every lease is an independent `Mutex`-guarded
/// record; the outer `RwLock` only protects the id -> record map itself, so
/// a rename/grant/revoke never blocks an unrelated lease's renew.
pub struct LeaseRegistry {
    leases: RwLock<HashMap<LeaseId, Mutex<LeaseRecord>>>,
    next_auto_id: AtomicI64,
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        LeaseRegistry::new()
    }
}

impl LeaseRegistry {
    pub fn new() -> Self {
        LeaseRegistry {
            leases: RwLock::new(HashMap::new()),
            // etcd reserves 0 to mean "no lease"; start auto-assigned ids at 1.
            next_auto_id: AtomicI64::new(1),
        }
    }

    /// Grants a new lease. `id == 0` asks the registry to assign a fresh id
    /// (the caller, typically `store`, has no Raft-coordinated id source of
    /// its own); any other id is taken as given and rejected if already in
    /// use.
    pub fn grant(&self, id: LeaseId, ttl_seconds: u64, now_millis: u64) -> CResult<Lease> {
        let mut leases = self.leases.write();
        let id = if id == 0 {
            loop {
                let candidate = self.next_auto_id.fetch_add(1, Ordering::Relaxed);
                if !leases.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if leases.contains_key(&id) {
                return Err(Error::LeaseExists);
            }
            id
        };
        let record = LeaseRecord {
            ttl_seconds,
            granted_at_millis: now_millis,
            keys: BTreeSet::new(),
        };
        let lease = record.to_lease(id);
        leases.insert(id, Mutex::new(record));
        debug!("lease {} granted, ttl {}s", id, ttl_seconds);
        Ok(lease)
    }

    /// Removes a lease and returns the keys it owned, for the caller to
    /// delete from the KV engine. Errors with `LeaseNotFound` if absent.
    pub fn revoke(&self, id: LeaseId) -> CResult<Vec<Vec<u8>>> {
        let mut leases = self.leases.write();
        let record = leases.remove(&id).ok_or(Error::LeaseNotFound)?;
        let keys = record.into_inner().keys.into_iter().collect();
        info!("lease {} revoked", id);
        Ok(keys)
    }

    /// Resets a lease's TTL clock. A lease discovered to already be past
    /// expiry is evicted on the spot and reported as `LeaseNotFound` rather
    /// than silently renewed.
    pub fn renew(&self, id: LeaseId, now_millis: u64) -> CResult<u64> {
        {
            let leases = self.leases.read();
            let record = leases.get(&id).ok_or(Error::LeaseNotFound)?;
            let mut guard = record.lock();
            if guard.is_expired(now_millis) {
                return Err(Error::LeaseExpired);
            }
            guard.granted_at_millis = now_millis;
            return Ok(guard.ttl_seconds);
        }
    }

    /// Remaining TTL in seconds plus the lease's current key set. A lease
    /// found expired-but-not-yet-swept is evicted here too, so callers never
    /// observe a lease whose clock has already run out.
    pub fn time_to_live(&self, id: LeaseId, now_millis: u64) -> CResult<(u64, Vec<Vec<u8>>)> {
        let expired_keys = {
            let leases = self.leases.read();
            let record = leases.get(&id).ok_or(Error::LeaseNotFound)?;
            let guard = record.lock();
            if guard.is_expired(now_millis) {
                Some(())
            } else {
                return Ok((guard.remaining_seconds(now_millis), guard.keys.iter().cloned().collect()));
            }
        };
        if expired_keys.is_some() {
            self.revoke(id).ok();
        }
        Err(Error::LeaseNotFound)
    }

    /// Associates `key` with `id`. Called by `store` when the KV Engine's
    /// apply path reports a `LeaseDelta::Associate`.
    pub fn associate(&self, id: LeaseId, key: Vec<u8>) -> CResult<()> {
        let leases = self.leases.read();
        let record = leases.get(&id).ok_or(Error::LeaseNotFound)?;
        record.lock().keys.insert(key);
        Ok(())
    }

    /// Removes `key` from `id`'s key set, if present. Idempotent: a missing
    /// lease or a key not currently tracked is not an error, since
    /// dissociation can race with an expiry sweep or a prior revoke.
    pub fn dissociate(&self, id: LeaseId, key: &[u8]) {
        let leases = self.leases.read();
        if let Some(record) = leases.get(&id) {
            record.lock().keys.remove(key);
        }
    }

    /// Cheap existence check, used by `store` to validate a `lease_id`
    /// before proposing a Put (SPEC_FULL.md §4.1: `*LeaseNotFound*` if
    /// `lease_id != 0` and unknown).
    pub fn exists(&self, id: LeaseId) -> bool {
        self.leases.read().contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.leases.read().len()
    }

    /// Non-destructive peek at which leases are currently past expiry. The
    /// registry itself never evicts on its own: a caller that needs
    /// replicated revocation (`store`'s leader-only sweep loop, which
    /// proposes a `LeaseRevoke` command through Raft for each id) must not
    /// remove leases locally, since only the apply path may mutate state
    /// that other replicas also derive.
    pub fn expired_ids(&self, now_millis: u64) -> Vec<LeaseId> {
        self.leases
            .read()
            .iter()
            .filter_map(|(id, record)| record.lock().is_expired(now_millis).then_some(*id))
            .collect()
    }

    pub fn snapshot_leases(&self) -> Vec<Lease> {
        self.leases
            .read()
            .iter()
            .map(|(id, record)| record.lock().to_lease(*id))
            .collect()
    }

    /// Replaces the registry's contents wholesale, for `store`'s snapshot
    /// restore path. Any in-flight lease not present in `leases` is dropped.
    pub fn restore_leases(&self, leases: Vec<Lease>) {
        let mut map = HashMap::with_capacity(leases.len());
        for lease in leases {
            map.insert(
                lease.id,
                Mutex::new(LeaseRecord {
                    ttl_seconds: lease.ttl_seconds,
                    granted_at_millis: lease.granted_at_millis,
                    keys: lease.keys.into_iter().collect(),
                }),
            );
        }
        *self.leases.write() = map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_rejects_duplicate_explicit_id() {
        let registry = LeaseRegistry::new();
        registry.grant(7, 60, 0).unwrap();
        let err = registry.grant(7, 60, 0).unwrap_err();
        assert!(matches!(err, Error::LeaseExists));
    }

    #[test]
    fn grant_with_zero_id_auto_assigns() {
        let registry = LeaseRegistry::new();
        let a = registry.grant(0, 60, 0).unwrap();
        let b = registry.grant(0, 60, 0).unwrap();
        assert_ne!(a.id, 0);
        assert_ne!(b.id, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn associate_and_revoke_round_trip_keys() {
        let registry = LeaseRegistry::new();
        let lease = registry.grant(1, 60, 0).unwrap();
        registry.associate(lease.id, b"a".to_vec()).unwrap();
        registry.associate(lease.id, b"b".to_vec()).unwrap();
        let keys = registry.revoke(lease.id).unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(matches!(registry.revoke(lease.id).unwrap_err(), Error::LeaseNotFound));
    }

    #[test]
    fn dissociate_is_idempotent_for_missing_keys_and_leases() {
        let registry = LeaseRegistry::new();
        let lease = registry.grant(1, 60, 0).unwrap();
        registry.dissociate(lease.id, b"never-added");
        registry.dissociate(404, b"no-such-lease");
    }

    #[test]
    fn renew_resets_the_ttl_clock() {
        let registry = LeaseRegistry::new();
        let lease = registry.grant(1, 10, 0).unwrap();
        assert_eq!(lease.ttl_seconds, 10);
        let ttl = registry.renew(lease.id, 5_000).unwrap();
        assert_eq!(ttl, 10);
        let (remaining, _) = registry.time_to_live(lease.id, 5_000).unwrap();
        assert_eq!(remaining, 10);
    }

    #[test]
    fn renew_on_expired_lease_errors_and_time_to_live_evicts() {
        let registry = LeaseRegistry::new();
        let lease = registry.grant(1, 1, 0).unwrap();
        let err = registry.renew(lease.id, 5_000).unwrap_err();
        assert!(matches!(err, Error::LeaseExpired));
        let err = registry.time_to_live(lease.id, 5_000).unwrap_err();
        assert!(matches!(err, Error::LeaseNotFound));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn expired_ids_peeks_without_mutating_the_registry() {
        let registry = LeaseRegistry::new();
        let short = registry.grant(1, 1, 0).unwrap();
        registry.grant(2, 1_000, 0).unwrap();

        let expired = registry.expired_ids(5_000);
        assert_eq!(expired, vec![short.id]);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let registry = LeaseRegistry::new();
        let lease = registry.grant(1, 60, 100).unwrap();
        registry.associate(lease.id, b"a".to_vec()).unwrap();

        let snapshot = registry.snapshot_leases();
        let restored = LeaseRegistry::new();
        restored.restore_leases(snapshot);

        let (remaining, keys) = restored.time_to_live(lease.id, 100).unwrap();
        assert_eq!(remaining, 60);
        assert_eq!(keys, vec![b"a".to_vec()]);
    }
}
