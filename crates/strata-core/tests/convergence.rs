//! Convergence of the reconciled view under event reordering.
//!
//! At-least-once transports deliver out of order and redeliver. Whatever
//! the interleaving, the reconciler must settle every key on its
//! highest-version event, with arrival order only breaking exact version
//! ties.

use std::collections::BTreeMap;

use serde_json::json;
use strata_core::db::open_memory_store;
use strata_core::event::{ChangeEvent, Operation};
use strata_core::reconcile::{EntitySnapshot, Reconciler};

fn event(key: &str, op: Operation, name: &str, version_us: i64, received_us: i64) -> ChangeEvent {
    let mut payload = BTreeMap::new();
    payload.insert("user_id".to_string(), json!(key));
    payload.insert("full_name".to_string(), json!(name));
    ChangeEvent {
        entity: "users".to_string(),
        key: key.to_string(),
        op,
        payload,
        source_ts_us: version_us,
        received_ts_us: received_us,
    }
}

/// Apply an ordering to a fresh store and return the full audit view.
fn settle(events: &[ChangeEvent]) -> Vec<EntitySnapshot> {
    let conn = open_memory_store().expect("store");
    let rec = Reconciler::new(&conn);
    for e in events {
        rec.apply(e).expect("apply");
    }
    rec.all_view("users").expect("view")
}

/// All orderings of `events`, by Heap's algorithm.
fn permutations(events: &[ChangeEvent]) -> Vec<Vec<ChangeEvent>> {
    fn heap(k: usize, arr: &mut Vec<ChangeEvent>, out: &mut Vec<Vec<ChangeEvent>>) {
        if k <= 1 {
            out.push(arr.clone());
            return;
        }
        for i in 0..k {
            heap(k - 1, arr, out);
            if k % 2 == 0 {
                arr.swap(i, k - 1);
            } else {
                arr.swap(0, k - 1);
            }
        }
    }

    let mut arr = events.to_vec();
    let mut out = Vec::new();
    heap(arr.len(), &mut arr, &mut out);
    out
}

fn assert_all_orderings_converge(events: &[ChangeEvent]) {
    let reference = settle(events);
    for (i, ordering) in permutations(events).into_iter().enumerate() {
        let settled = settle(&ordering);
        assert_eq!(
            settled, reference,
            "ordering {i} diverged from the in-order result"
        );
    }
}

#[test]
fn single_key_updates_converge_in_every_order() {
    let events = vec![
        event("u1", Operation::Insert, "alice", 100, 1),
        event("u1", Operation::Update, "alice-b", 200, 2),
        event("u1", Operation::Update, "alice-c", 300, 3),
        event("u1", Operation::Update, "alice-d", 400, 4),
    ];
    assert_all_orderings_converge(&events);

    // And the settled value is the max-version one.
    let view = settle(&events);
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].payload["full_name"], json!("alice-d"));
    assert_eq!(view[0].version_us, 400);
}

#[test]
fn delete_in_the_middle_converges() {
    let events = vec![
        event("u1", Operation::Insert, "alice", 100, 1),
        event("u1", Operation::Delete, "alice", 250, 2),
        event("u1", Operation::Update, "alice-late", 200, 3),
    ];
    assert_all_orderings_converge(&events);

    // The delete is the max version, so the key settles deleted.
    let view = settle(&events);
    assert!(view[0].deleted);
    assert_eq!(view[0].version_us, 250);
}

#[test]
fn resurrection_after_delete_converges() {
    let events = vec![
        event("u1", Operation::Insert, "alice", 100, 1),
        event("u1", Operation::Delete, "alice", 200, 2),
        event("u1", Operation::Insert, "alice-again", 300, 3),
    ];
    assert_all_orderings_converge(&events);

    let view = settle(&events);
    assert!(!view[0].deleted);
    assert_eq!(view[0].payload["full_name"], json!("alice-again"));
}

#[test]
fn version_ties_settle_on_latest_arrival() {
    let events = vec![
        event("u1", Operation::Insert, "first-writer", 100, 10),
        event("u1", Operation::Update, "second-writer", 100, 20),
    ];
    assert_all_orderings_converge(&events);

    let view = settle(&events);
    assert_eq!(view[0].payload["full_name"], json!("second-writer"));
}

#[test]
fn interleaved_keys_converge_independently() {
    let events = vec![
        event("u1", Operation::Insert, "alice", 100, 1),
        event("u2", Operation::Insert, "bob", 150, 2),
        event("u1", Operation::Update, "alice-b", 300, 3),
        event("u2", Operation::Delete, "bob", 250, 4),
    ];
    assert_all_orderings_converge(&events);

    let view = settle(&events);
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].key, "u1");
    assert!(!view[0].deleted);
    assert_eq!(view[1].key, "u2");
    assert!(view[1].deleted);
}

#[test]
fn snapshot_events_participate_in_versioning() {
    // An initial-load snapshot must lose to a later incremental change and
    // beat an earlier one, exactly like any other op.
    let events = vec![
        event("u1", Operation::Update, "stale-change", 100, 1),
        event("u1", Operation::Snapshot, "bulk-load", 200, 2),
        event("u1", Operation::Update, "fresh-change", 300, 3),
    ];
    assert_all_orderings_converge(&events);

    let view = settle(&events);
    assert_eq!(view[0].payload["full_name"], json!("fresh-change"));
}
