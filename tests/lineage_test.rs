//! Integration tests for the lineage engine (trace and children)

mod common;

use common::{fresh, iteration, push_fourth, scenario_store};
use ensemble_ipa::lineage::{ChildrenOutcome, LineageEnd, LineageEngine};
use ensemble_ipa::store::MemoryIterationStore;
use ensemble_ipa::Error;
use ndarray::array;

// ============================================================================
// Backward trace
// ============================================================================

#[test]
fn test_trace_concrete_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let record = engine.trace(1, 3).unwrap();
    assert_eq!(record.iterations(), vec![1, 2, 3]);
    assert_eq!(record.seg_ids(), vec![1, 0, 1]);
    assert_eq!(record.end(), LineageEnd::Origin);
    assert!(record.is_complete());
    assert_eq!(record.weights(), vec![0.4, 0.5, 0.7]);
}

#[test]
fn test_trace_snapshots_carry_labels_and_auxdata() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let record = engine.trace(1, 3).unwrap();
    let oldest = &record.walkers()[0];
    assert_eq!(oldest.pcoord, array![[8.0_f64], [1.0]]);
    // 8.0 falls in the unbound bin, 1.0 in the bound bin
    assert_eq!(oldest.bins, array![2_u32, 0]);
    assert_eq!(oldest.states, array![1_u32, 0]);
    assert_eq!(oldest.auxdata["energy"], array![110.0_f64, 111.0]);
    assert_eq!(oldest.parent_id, -1);

    let newest = record.walkers().last().unwrap();
    assert_eq!((newest.iteration, newest.seg_id), (3, 1));
    assert_eq!(newest.parent_id, 0);
}

#[test]
fn test_trace_from_first_iteration_is_single_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let record = engine.trace(0, 1).unwrap();
    assert_eq!(record.len(), 1);
    assert_eq!(record.end(), LineageEnd::Origin);
}

#[test]
fn test_trace_stops_at_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MemoryIterationStore::new();
    let pcoord = [vec![1.0, 1.0], vec![8.0, 8.0]];
    store.push(iteration(1, &[-1, -1], &[0.5, 0.5], &pcoord)).unwrap();
    store.push(iteration(2, &[0, -1], &[0.5, 0.5], &pcoord)).unwrap();
    store.push(iteration(3, &[1, 0], &[0.5, 0.5], &pcoord)).unwrap();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let record = engine.trace(0, 3).unwrap();
    assert_eq!(record.iterations(), vec![2, 3]);
    assert_eq!(record.seg_ids(), vec![1, 0]);
    assert_eq!(record.end(), LineageEnd::Truncated { iteration: 2 });
    assert!(!record.is_complete());

    // The other walker still reaches iteration 1
    assert_eq!(engine.trace(1, 3).unwrap().seg_ids(), vec![0, 0, 1]);
}

#[test]
fn test_trace_rejects_out_of_range_walker() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let err = engine.trace(2, 3).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidIndex {
            seg_id: 2,
            iteration: 3,
            n_particles: 2
        }
    ));
    assert!(matches!(
        engine.trace(0, 4),
        Err(Error::IterationOutOfRange { .. })
    ));
    assert!(matches!(
        engine.trace(0, 0),
        Err(Error::IterationOutOfRange { .. })
    ));
}

// ============================================================================
// Forward children
// ============================================================================

#[test]
fn test_children_of_scenario_walkers() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let outcome = engine.children(0, 2).unwrap();
    let record = outcome.record().unwrap();
    assert_eq!(record.seg_ids(), vec![1]);
    assert_eq!(record.children[0].iteration, 3);
    assert_eq!(record.children[0].parent_id, 0);
    assert_eq!(record.children[0].weight, 0.7);
}

#[test]
fn test_children_last_iteration_is_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    assert_eq!(engine.children(0, 3).unwrap(), ChildrenOutcome::NoNextIteration);
    assert!(matches!(
        engine.children(5, 1),
        Err(Error::InvalidIndex { seg_id: 5, .. })
    ));
}

#[test]
fn test_childless_and_multiple_children() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = scenario_store();
    push_fourth(&mut store);
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    assert_eq!(engine.children(0, 3).unwrap(), ChildrenOutcome::Childless);
    let outcome = engine.children(1, 3).unwrap();
    assert_eq!(outcome.record().unwrap().seg_ids(), vec![0, 1]);

    let all = engine.children_all(3).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0], ChildrenOutcome::Childless);
    assert_eq!(all[1], outcome);
}

#[test]
fn test_children_all_on_last_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    let all = engine.children_all(3).unwrap();
    assert_eq!(all, vec![ChildrenOutcome::NoNextIteration; 2]);
}

// ============================================================================
// Duality
// ============================================================================

#[test]
fn test_children_trace_duality() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = scenario_store();
    push_fourth(&mut store);
    let datasets = fresh(&store, dir.path(), "TEST");
    let engine = LineageEngine::new(&store, &datasets);

    for it in 1..4 {
        for x in 0..2 {
            let ChildrenOutcome::Children(record) = engine.children(x, it).unwrap() else {
                continue;
            };
            for child in &record.children {
                let trace = engine.trace(child.seg_id, it + 1).unwrap();
                assert_eq!(trace.at_iteration(it).unwrap().seg_id, x);
            }
        }
    }
}
