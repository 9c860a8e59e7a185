//! Engine-wide properties
//!
//! - Wiring depends only on the want set, never on insertion order
//! - Reconciling a converged graph changes nothing
//! - Snapshots survive every store backend unchanged
//! - An owner is never achieved while one of its children is not

mod common;

use common::{add_all, all_achieved, test_engine, wait_until};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wantgraph_engine::store::{
    FileSnapshotStore, MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore,
};
use wantgraph_engine::{
    Engine, LabelSelector, Want, WantStatus, WiringPlan, OWNER_TYPE,
};

const ROLES: [&str; 3] = ["alpha", "beta", "gamma"];

fn build_wants(layout: &[(usize, Option<usize>)]) -> Vec<Want> {
    layout
        .iter()
        .enumerate()
        .map(|(i, (role, uses))| {
            let mut want = Want::new(format!("w{}", i), "numbers").with_label("role", ROLES[*role]);
            if let Some(uses) = uses {
                want = want.using(LabelSelector::from_pairs([("role", ROLES[*uses])]));
            }
            want
        })
        .collect()
}

async fn execute(engine: &Engine) {
    tokio::time::timeout(Duration::from_secs(10), engine.execute())
        .await
        .expect("execute timed out")
        .expect("execute failed");
}

fn pipeline() -> Vec<Want> {
    vec![
        Want::new("source", "numbers")
            .with_label("role", "source")
            .with_param("count", 4),
        Want::new("sink", "collect").using(LabelSelector::from_pairs([("role", "source")])),
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
// Deterministic wiring
// ═══════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn test_wiring_is_independent_of_insertion_order(
        layout in prop::collection::vec((0..3usize, prop::option::of(0..3usize)), 1..8),
        rotation in 0..8usize,
    ) {
        let forward = build_wants(&layout);
        let mut shuffled = forward.clone();
        shuffled.reverse();
        let len = shuffled.len();
        shuffled.rotate_left(rotation % len);

        let a = WiringPlan::resolve(&forward);
        let b = WiringPlan::resolve(&shuffled);

        prop_assert_eq!(a.fingerprint(), b.fingerprint());
        prop_assert_eq!(a.start_order(), b.start_order());
        prop_assert_eq!(a.cycles(), b.cycles());
        prop_assert_eq!(a.diagnostics(), b.diagnostics());
    }
}

#[tokio::test]
async fn test_engines_fed_in_different_orders_wire_identically() {
    let first = test_engine();
    let second = test_engine();
    let wants = vec![
        Want::new("a", "numbers").with_label("role", "source"),
        Want::new("b", "numbers").with_label("role", "source"),
        Want::new("merge", "collect")
            .with_label("role", "merged")
            .using(LabelSelector::from_pairs([("role", "source")])),
        Want::new("report", "collect").using(LabelSelector::from_pairs([("role", "merged")])),
    ];
    let mut reversed = wants.clone();
    reversed.reverse();

    add_all(&first, wants).await;
    for want in reversed {
        add_all(&second, vec![want]).await;
    }
    first.reconcile_once().await;
    second.reconcile_once().await;

    assert_eq!(first.wiring_plan().fingerprint(), second.wiring_plan().fingerprint());
    assert_eq!(
        first.wiring_plan().fingerprint(),
        "a->merge;b->merge;merge->report"
    );
    assert_eq!(first.wiring_plan().start_order(), second.wiring_plan().start_order());
}

// ═══════════════════════════════════════════════════════════════════════════
// Convergence
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_reconcile_after_convergence_is_quiet() {
    let engine = test_engine();
    add_all(&engine, pipeline()).await;
    execute(&engine).await;
    assert!(all_achieved(&engine.get_all_want_states()));

    let before = engine.get_all_want_states();
    for _ in 0..3 {
        let report = engine.reconcile_once().await;
        assert!(report.is_quiet(), "unexpected work: {:?}", report);
    }
    assert_eq!(engine.get_all_want_states(), before);

    // A further execute has nothing to wait for.
    execute(&engine).await;
    assert_eq!(engine.get_all_want_states(), before);
}

// ═══════════════════════════════════════════════════════════════════════════
// Snapshot round trip
// ═══════════════════════════════════════════════════════════════════════════

async fn assert_round_trip(store: Arc<dyn SnapshotStore>) {
    let original = test_engine();
    original.set_store(Arc::clone(&store));
    add_all(&original, pipeline()).await;
    execute(&original).await;
    let saved = original.save_snapshot().await.expect("save snapshot");
    assert_eq!(saved.wants.len(), 2);

    let restored = test_engine();
    restored.set_store(store);
    let report = restored.restore(pipeline()).await.expect("restore");
    assert!(report.from_snapshot, "{} did not load", report.restored.join(","));
    assert_eq!(report.restored, vec!["source", "sink"]);
    assert!(report.added.is_empty());
    assert!(report.outcomes.iter().all(|o| o.is_accepted()));

    let before = original.get_all_want_states();
    let after = restored.get_all_want_states();
    assert_eq!(before.len(), after.len());
    for (name, want) in &before {
        let back = &after[name];
        assert_eq!(back.id(), want.id(), "{}", name);
        assert_eq!(back.status, want.status, "{}", name);
        assert_eq!(back.state, want.state, "{}", name);
        assert_eq!(back.history, want.history, "{}", name);
        assert_eq!(back.run_generation, want.run_generation, "{}", name);
        assert_eq!(back.spec, want.spec, "{}", name);
    }

    // Restored progress is not redone.
    execute(&restored).await;
    assert_eq!(
        restored.find_want("sink").map(|w| w.run_generation),
        Some(1)
    );
}

#[tokio::test]
async fn test_snapshot_round_trip_memory() {
    assert_round_trip(Arc::new(MemorySnapshotStore::new())).await;
}

#[tokio::test]
async fn test_snapshot_round_trip_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileSnapshotStore::new(dir.path().join("state").join("graph.json"))
        .expect("file store");
    assert_round_trip(Arc::new(store)).await;
}

#[tokio::test]
async fn test_snapshot_round_trip_sqlite() {
    let store = SqliteSnapshotStore::new_in_memory().expect("sqlite store");
    assert_round_trip(Arc::new(store)).await;
}

// ═══════════════════════════════════════════════════════════════════════════
// Parent invariant
// ═══════════════════════════════════════════════════════════════════════════

fn parent_violations(wants: &BTreeMap<String, Want>) -> Vec<String> {
    wants
        .values()
        .filter(|w| w.status == WantStatus::Achieved)
        .filter(|parent| {
            wants
                .values()
                .any(|child| child.is_owned_by(parent.name()) && child.status != WantStatus::Achieved)
        })
        .map(|parent| parent.name().to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_owner_never_achieved_before_children() {
    let engine = test_engine();
    add_all(
        &engine,
        vec![
            Want::new("trip", OWNER_TYPE),
            Want::new("leg", OWNER_TYPE).owned_by("trip"),
            Want::new("hotel", "leaf").owned_by("trip").with_param("value", 1),
            Want::new("train", "leaf").owned_by("leg").with_param("value", 1),
            Want::new("taxi", "leaf").owned_by("leg").with_param("value", 1),
        ],
    )
    .await;

    let stop = Arc::new(AtomicBool::new(false));
    let samples = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let engine = engine.clone();
        let stop = Arc::clone(&stop);
        let samples = Arc::clone(&samples);
        let mut changes = engine.watch_changes();
        tokio::spawn(async move {
            let mut violations = Vec::new();
            while !stop.load(Ordering::SeqCst) {
                violations.extend(parent_violations(&engine.get_all_want_states()));
                samples.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = changes.changed() => {}
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                }
            }
            violations
        })
    };

    execute(&engine).await;
    engine
        .update_parameter("leg", "value", 2)
        .expect("update parameter");
    execute(&engine).await;
    engine
        .add_wants(vec![Want::new("ferry", "leaf").owned_by("leg").with_param("value", 3)])
        .await;
    assert_eq!(engine.status_of("leg"), Some(WantStatus::Idle));
    assert_eq!(engine.status_of("trip"), Some(WantStatus::Idle));
    execute(&engine).await;

    stop.store(true, Ordering::SeqCst);
    let violations = sampler.await.expect("sampler task");
    assert!(violations.is_empty(), "achieved owners with open children: {:?}", violations);
    assert!(samples.load(Ordering::SeqCst) > 0);

    let wants = engine.get_all_want_states();
    assert!(all_achieved(&wants));
    assert_eq!(wants["leg"].state["total_children"], json!(3));
    assert_eq!(wants["trip"].state["total_children"], json!(2));
}

#[tokio::test]
async fn test_wait_until_sees_async_convergence() {
    let engine = test_engine();
    engine.start();
    let ids = engine.add_wants_async(pipeline());
    assert!(
        wait_until(&engine, Duration::from_secs(5), |_| engine.are_wants_added(&ids)).await
    );
    assert!(wait_until(&engine, Duration::from_secs(5), all_achieved).await);
    engine.stop().await;
}
