//! Integration tests for the analysis context

mod common;

use std::sync::Arc;

use common::{scenario_store, settings};
use ensemble_ipa::cache::{CacheOptions, PipelineCache};
use ensemble_ipa::context::{AnalysisContext, UNKNOWN_STATE_LABEL};
use ensemble_ipa::lineage::ChildrenOutcome;
use ensemble_ipa::store::SegSelection;
use ensemble_ipa::Error;

fn open(dir: &std::path::Path) -> AnalysisContext {
    let cache = PipelineCache::new(CacheOptions::default());
    AnalysisContext::open(Arc::new(scenario_store()), &settings(dir), &cache).unwrap()
}

#[test]
fn test_open_refreshes_enabled_schemes() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open(dir.path());

    assert_eq!(ctx.n_iterations(), 3);
    assert_eq!(ctx.iteration(), 1);
    assert_eq!(ctx.scheme().name(), "TEST");
    assert!(dir.path().join("TEST").join("assign.parquet").exists());
    assert!(dir.path().join("COARSE").join("direct.parquet").exists());
    assert!(!dir.path().join("COARSE").join("reweight.parquet").exists());
    assert!(!dir.path().join("OFF").exists());
}

#[test]
fn test_set_iteration_clamps() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = open(dir.path());

    assert_eq!(ctx.set_iteration(2), 2);
    assert_eq!(ctx.set_iteration(0), 1);
    assert_eq!(ctx.iteration(), 1);
    assert_eq!(ctx.set_iteration(99), 3);
    assert_eq!(ctx.current().unwrap().iteration(), 3);
}

#[test]
fn test_scheme_switching() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = open(dir.path());

    assert_eq!(
        ctx.list_schemes(),
        vec![
            ("TEST".to_string(), true),
            ("COARSE".to_string(), true),
            ("OFF".to_string(), false),
        ]
    );

    assert_eq!(ctx.set_scheme(1_usize).unwrap().name(), "COARSE");
    assert!(!ctx.current().unwrap().reweight().is_enabled());

    assert!(matches!(ctx.set_scheme("OFF"), Err(Error::SchemeDisabled(_))));
    assert!(matches!(ctx.set_scheme("MISSING"), Err(Error::SchemeNotFound(_))));
    assert!(matches!(ctx.set_scheme(7_usize), Err(Error::SchemeNotFound(_))));
    assert_eq!(ctx.scheme().name(), "COARSE");

    ctx.set_scheme("TEST").unwrap();
    assert!(ctx.current().unwrap().reweight().is_enabled());
}

#[test]
fn test_labels() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = open(dir.path());

    assert_eq!(
        ctx.state_labels().unwrap(),
        vec!["bound", "unbound", UNKNOWN_STATE_LABEL]
    );
    assert_eq!(ctx.bin_labels().unwrap().len(), 3);

    ctx.set_scheme("COARSE").unwrap();
    assert_eq!(ctx.state_labels().unwrap(), vec!["low", UNKNOWN_STATE_LABEL]);
    assert_eq!(ctx.bin_labels().unwrap().len(), 2);
}

#[test]
fn test_walker_counts() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = open(dir.path());

    assert_eq!(ctx.walkers().unwrap(), 2);
    assert_eq!(ctx.aggregate_walkers().unwrap(), 2);
    ctx.set_iteration(3);
    assert_eq!(ctx.aggregate_walkers().unwrap(), 6);
}

#[test]
fn test_queries_follow_current_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = open(dir.path());

    let future = ctx.future().unwrap();
    assert_eq!(future.len(), 2);
    assert_eq!(future[0].record().unwrap().seg_ids(), vec![1]);
    assert_eq!(future[1].record().unwrap().seg_ids(), vec![0]);

    ctx.set_iteration(3);
    assert_eq!(ctx.trace(1).unwrap().seg_ids(), vec![1, 0, 1]);
    assert_eq!(ctx.children(1).unwrap(), ChildrenOutcome::NoNextIteration);
    assert!(matches!(ctx.trace(2), Err(Error::InvalidIndex { seg_id: 2, .. })));

    let row = ctx.current_rows(&SegSelection::one(1)).unwrap();
    assert_eq!(row.len(), 1);
    assert_eq!(row.walker(0).unwrap().weight, 0.7);
}
