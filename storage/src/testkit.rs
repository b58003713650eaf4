//! A shared battery of engine-contract tests run against both KV backends:
//! a plain function parameterized over a `KvStore` impl, since both
//! backends are trait objects behind the same trait already.

use metastore_model::kv::RANGE_END_OPEN;

use crate::engine::{KvStore, OpOutcome};

pub fn run_engine_contract<S: KvStore>(make: impl Fn() -> S) {
    point_put_get(&make());
    put_preserves_create_revision_across_updates(&make());
    delete_range_advances_revision_by_one_regardless_of_key_count(&make());
    delete_of_zero_keys_does_not_advance_revision(&make());
    range_respects_limit_and_order(&make());
    delete_event_kv_carries_the_delete_revision(&make());
}

fn point_put_get<S: KvStore>(store: &S) {
    let out = store.apply_put(b"a".to_vec(), b"1".to_vec(), 0);
    assert!(matches!(out.outcome, OpOutcome::Put { revision: 1, .. }));
    let (kvs, count) = store.range(b"a", b"", 0);
    assert_eq!(count, 1);
    assert_eq!(kvs[0].value, b"1");
}

fn put_preserves_create_revision_across_updates<S: KvStore>(store: &S) {
    store.apply_put(b"a".to_vec(), b"1".to_vec(), 0);
    let out = store.apply_put(b"a".to_vec(), b"2".to_vec(), 0);
    let (kvs, _) = store.range(b"a", b"", 0);
    assert_eq!(kvs[0].create_revision, 1);
    assert_eq!(kvs[0].mod_revision, 2);
    assert_eq!(kvs[0].version, 2);
    match out.outcome {
        OpOutcome::Put { prev_kv: Some(prev), .. } => assert_eq!(prev.value, b"1"),
        _ => panic!("expected a prior value"),
    }
}

fn delete_range_advances_revision_by_one_regardless_of_key_count<S: KvStore>(store: &S) {
    store.apply_put(b"b".to_vec(), b"1".to_vec(), 0);
    store.apply_put(b"c".to_vec(), b"1".to_vec(), 0);
    let before = store.current_revision();
    let out = store.apply_delete_range(b"b", b"d");
    match out.outcome {
        OpOutcome::DeleteRange { revision, deleted } => {
            assert_eq!(deleted.len(), 2);
            assert_eq!(revision, before + 1);
        }
        _ => panic!("expected a DeleteRange outcome"),
    }
    assert_eq!(store.current_revision(), before + 1);
}

fn delete_of_zero_keys_does_not_advance_revision<S: KvStore>(store: &S) {
    let before = store.current_revision();
    let out = store.apply_delete_range(b"nonexistent", b"");
    match out.outcome {
        OpOutcome::DeleteRange { deleted, .. } => assert!(deleted.is_empty()),
        _ => panic!("expected a DeleteRange outcome"),
    }
    assert_eq!(store.current_revision(), before);
}

fn range_respects_limit_and_order<S: KvStore>(store: &S) {
    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
        store.apply_put(k.as_bytes().to_vec(), v.as_bytes().to_vec(), 0);
    }
    let (kvs, _) = store.range(b"a", RANGE_END_OPEN, 2);
    assert_eq!(kvs.len(), 2);
    assert_eq!(kvs[0].key, b"a");
    assert_eq!(kvs[1].key, b"b");

    let (kvs, _) = store.range(b"b", b"d", 0);
    let keys: Vec<&[u8]> = kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, vec![b"b".as_slice(), b"c".as_slice()]);
}

// A watch stream starting between a key's last Put and its Delete must still
// see the Delete: that only works if the Delete event's kv.mod_revision is
// the delete's own revision, not the revision of whatever Put last touched
// it (WatchHub::matches filters on mod_revision >= start_revision).
fn delete_event_kv_carries_the_delete_revision<S: KvStore>(store: &S) {
    store.apply_put(b"e".to_vec(), b"1".to_vec(), 0);
    let out = store.apply_delete_range(b"e", b"");
    let delete_revision = match out.outcome {
        OpOutcome::DeleteRange { revision, .. } => revision,
        _ => panic!("expected a DeleteRange outcome"),
    };
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.events[0].kv.mod_revision, delete_revision);
    assert!(delete_revision > out.events[0].kv.create_revision);
}
