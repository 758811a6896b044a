//! Property-based tests for lineage reconstruction
//!
//! Random parent trees, checked against invariants that hold for any
//! ensemble:
//! - traces are chronological and end at the queried walker
//! - every snapshot's parent pointer names the previous snapshot
//! - trace and children agree with each other
//!
//! Each case runs the assignment and direct stages, so the case count is
//! kept low.

mod common;

use common::{fresh, iteration};
use ensemble_ipa::lineage::{ChildrenOutcome, LineageEnd, LineageEngine};
use ensemble_ipa::store::{IterationStore, MemoryIterationStore};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Per iteration, per walker: (parent seed, truncate flag).
fn arb_tree() -> impl Strategy<Value = Vec<Vec<(u8, bool)>>> {
    prop::collection::vec(
        prop::collection::vec((any::<u8>(), prop::bool::weighted(0.1)), 1..5),
        2..6,
    )
}

fn build_store(tree: &[Vec<(u8, bool)>]) -> MemoryIterationStore {
    let mut store = MemoryIterationStore::new();
    let mut previous = 0usize;
    for (index, walkers) in tree.iter().enumerate() {
        let it = u32::try_from(index + 1).unwrap();
        let parents: Vec<i64> = walkers
            .iter()
            .map(|&(seed, truncate)| {
                if previous == 0 || truncate {
                    -1
                } else {
                    i64::from(seed) % i64::try_from(previous).unwrap()
                }
            })
            .collect();
        let n = walkers.len();
        let weights = vec![1.0 / n as f64; n];
        let pcoord: Vec<Vec<f64>> = (0..n).map(|w| vec![8.0, (w % 2) as f64 * 8.0]).collect();
        store.push(iteration(it, &parents, &weights, &pcoord)).unwrap();
        previous = n;
    }
    store
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: traces are consecutive, oldest first, and end at the query
    #[test]
    fn prop_trace_is_chronological(tree in arb_tree()) {
        let dir = tempfile::tempdir().unwrap();
        let store = build_store(&tree);
        let datasets = fresh(&store, dir.path(), "COARSE");
        let engine = LineageEngine::new(&store, &datasets);
        let last = store.n_iterations();

        for seg in 0..store.n_particles(last).unwrap() {
            let record = engine.trace(seg, last).unwrap();
            let iterations = record.iterations();

            prop_assert_eq!(*iterations.last().unwrap(), last);
            prop_assert_eq!(*record.seg_ids().last().unwrap(), seg);
            for pair in iterations.windows(2) {
                prop_assert_eq!(pair[0] + 1, pair[1]);
            }
            match record.end() {
                LineageEnd::Origin => {
                    prop_assert_eq!(record.len(), last as usize);
                    prop_assert_eq!(iterations[0], 1);
                }
                LineageEnd::Truncated { iteration } => {
                    prop_assert_eq!(iterations[0], iteration);
                    prop_assert!(record.walkers()[0].parent_id < 0);
                }
            }
        }
    }

    /// Property: each snapshot points at the snapshot before it
    #[test]
    fn prop_trace_follows_parent_links(tree in arb_tree()) {
        let dir = tempfile::tempdir().unwrap();
        let store = build_store(&tree);
        let datasets = fresh(&store, dir.path(), "COARSE");
        let engine = LineageEngine::new(&store, &datasets);
        let last = store.n_iterations();

        for seg in 0..store.n_particles(last).unwrap() {
            let record = engine.trace(seg, last).unwrap();
            for pair in record.walkers().windows(2) {
                prop_assert_eq!(pair[1].parent_id, i64::try_from(pair[0].seg_id).unwrap());
            }
        }
    }

    /// Property: children and trace are inverse relations
    #[test]
    fn prop_children_trace_duality(tree in arb_tree()) {
        let dir = tempfile::tempdir().unwrap();
        let store = build_store(&tree);
        let datasets = fresh(&store, dir.path(), "COARSE");
        let engine = LineageEngine::new(&store, &datasets);

        for it in 1..store.n_iterations() {
            let mut claimed = vec![false; store.n_particles(it + 1).unwrap()];
            for seg in 0..store.n_particles(it).unwrap() {
                let ChildrenOutcome::Children(record) = engine.children(seg, it).unwrap() else {
                    continue;
                };
                prop_assert!(!record.children.is_empty());
                for child in &record.children {
                    let trace = engine.trace(child.seg_id, it + 1).unwrap();
                    prop_assert_eq!(trace.at_iteration(it).unwrap().seg_id, seg);
                    claimed[child.seg_id] = true;
                }
            }

            // Every walker with a parent is somebody's child
            let parents = store.read_parent_ids(it + 1).unwrap();
            for (child, &parent) in parents.iter().enumerate() {
                prop_assert_eq!(claimed[child], parent >= 0);
            }
        }
    }
}
