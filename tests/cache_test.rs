//! Integration tests for the analysis pipeline cache
//!
//! Covers idempotence, invalidation, dependency cascade, stage failure and
//! recovery from damaged files.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{push_fourth, scenario_store, scheme, settings, CountingStages};
use ensemble_ipa::binning::BinMapperDef;
use ensemble_ipa::cache::{CacheOptions, DatasetName, PipelineCache};
use ensemble_ipa::config::AnalysisSettings;
use ensemble_ipa::scheme::AnalysisScheme;
use ensemble_ipa::stages::StagePipeline;
use ensemble_ipa::storage::{self, DerivedFile, ARG_HASH_KEY, GENERATED_AT_KEY};
use ensemble_ipa::Error;
use serde_json::json;

use DatasetName::{Assign, Direct, Reweight};

fn counting_cache(stages: &Arc<CountingStages>, options: CacheOptions) -> PipelineCache {
    let stages: Arc<dyn StagePipeline> = Arc::clone(stages) as _;
    PipelineCache::with_stages(options, stages)
}

fn rebuild(dir: &Path, edit: impl FnOnce(&mut AnalysisSettings)) -> AnalysisScheme {
    let mut settings = settings(dir);
    edit(&mut settings);
    AnalysisScheme::from_settings(&settings, &settings.analysis_schemes[0]).unwrap()
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_first_call_generates_everything_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());

    let datasets = cache.ensure_fresh(&store, &scheme(dir.path(), "TEST")).unwrap();
    assert_eq!(datasets.regenerated, vec![Assign, Direct, Reweight]);
    assert_eq!(stages.calls(), vec![Assign, Direct, Reweight]);
    assert_eq!(datasets.n_iterations, 3);
    assert!(datasets.reweight.is_some());
    assert_eq!(datasets.assign.data.n_iterations(), 3);
}

#[test]
fn test_second_call_regenerates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    let first = cache.ensure_fresh(&store, &scheme).unwrap();
    stages.reset();
    let second = cache.ensure_fresh(&store, &scheme).unwrap();

    assert!(second.regenerated.is_empty());
    assert!(stages.calls().is_empty());
    assert_eq!(first.assign.arg_hash, second.assign.arg_hash);
    assert_eq!(first.direct.data, second.direct.data);
}

#[test]
fn test_stamp_is_written_to_file_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let datasets = common::fresh(&store, dir.path(), "TEST");

    let file = DerivedFile::open(&datasets.assign.path).unwrap();
    let stamped = file.attribute(ARG_HASH_KEY).unwrap();
    assert_eq!(stamped.len(), 64);
    assert!(stamped.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(stamped, datasets.assign.arg_hash);
    assert!(file.attribute(GENERATED_AT_KEY).is_some());
    assert_eq!(
        datasets.assign.path,
        dir.path().join("TEST").join("assign.parquet")
    );
}

// ============================================================================
// Invalidation and cascade
// ============================================================================

#[test]
fn test_new_iteration_regenerates_all() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    cache.ensure_fresh(&store, &scheme).unwrap();
    push_fourth(&mut store);
    let datasets = cache.ensure_fresh(&store, &scheme).unwrap();

    assert_eq!(datasets.regenerated, vec![Assign, Direct, Reweight]);
    assert_eq!(datasets.assign.data.n_iterations(), 4);
}

#[test]
fn test_assign_option_change_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());

    cache.ensure_fresh(&store, &scheme(dir.path(), "TEST")).unwrap();
    let changed = rebuild(dir.path(), |s| {
        s.w_assign.insert("extra".to_string(), json!(["serial"]));
    });
    let datasets = cache.ensure_fresh(&store, &changed).unwrap();
    assert_eq!(datasets.regenerated, vec![Assign, Direct, Reweight]);
}

#[test]
fn test_state_definition_change_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());

    cache.ensure_fresh(&store, &scheme(dir.path(), "TEST")).unwrap();
    let changed = rebuild(dir.path(), |s| {
        s.analysis_schemes[0].states[0].coords = vec![vec![1.0]];
    });
    let datasets = cache.ensure_fresh(&store, &changed).unwrap();
    assert_eq!(datasets.regenerated, vec![Assign, Direct, Reweight]);
}

#[test]
fn test_direct_option_change_only_touches_direct() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());

    cache.ensure_fresh(&store, &scheme(dir.path(), "TEST")).unwrap();
    stages.reset();
    let changed = rebuild(dir.path(), |s| {
        s.w_direct.insert("step_iter".to_string(), json!(2));
    });
    let datasets = cache.ensure_fresh(&store, &changed).unwrap();

    assert_eq!(datasets.regenerated, vec![Direct]);
    assert_eq!(stages.calls(), vec![Direct]);
    assert_eq!(datasets.direct.data.step_iter(), 2);
}

#[test]
fn test_reanalyze_forces_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let scheme = scheme(dir.path(), "TEST");
    common::fresh(&store, dir.path(), "TEST");

    let stages = CountingStages::new();
    let cache = counting_cache(
        &stages,
        CacheOptions {
            reanalyze: true,
            workers: 2,
        },
    );
    let datasets = cache.ensure_fresh(&store, &scheme).unwrap();
    assert_eq!(datasets.regenerated, vec![Assign, Direct, Reweight]);
}

#[test]
fn test_postanalysis_disabled_skips_reweight() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());

    let datasets = cache.ensure_fresh(&store, &scheme(dir.path(), "COARSE")).unwrap();
    assert!(datasets.reweight.is_none());
    assert_eq!(stages.calls(), vec![Assign, Direct]);
    assert!(!dir.path().join("COARSE").join("reweight.parquet").exists());
}

// ============================================================================
// Damaged files
// ============================================================================

#[test]
fn test_corrupt_file_is_stale_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    let first = cache.ensure_fresh(&store, &scheme).unwrap();
    std::fs::write(&first.assign.path, b"definitely not parquet").unwrap();

    let second = cache.ensure_fresh(&store, &scheme).unwrap();
    assert_eq!(second.regenerated, vec![Assign, Direct, Reweight]);
    assert_eq!(second.assign.data, first.assign.data);
}

#[test]
fn test_missing_kinetics_file_regenerates_only_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    let first = cache.ensure_fresh(&store, &scheme).unwrap();
    std::fs::remove_file(&first.reweight.as_ref().unwrap().path).unwrap();

    let second = cache.ensure_fresh(&store, &scheme).unwrap();
    assert_eq!(second.regenerated, vec![Reweight]);
}

#[test]
fn test_foreign_stamp_is_a_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    let first = cache.ensure_fresh(&store, &scheme).unwrap();
    storage::stamp_hash(&first.direct.path, "0000").unwrap();

    let second = cache.ensure_fresh(&store, &scheme).unwrap();
    assert_eq!(second.regenerated, vec![Direct]);
    assert_eq!(second.direct.arg_hash, first.direct.arg_hash);
}

// ============================================================================
// Stage failure
// ============================================================================

#[test]
fn test_stage_failure_names_dataset_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    stages.fail_on(Some(Direct));
    let err = cache.ensure_fresh(&store, &scheme).unwrap_err();
    match &err {
        Error::StageFailure { dataset, source } => {
            assert_eq!(*dataset, Direct);
            assert!(source.to_string().contains("exploded"));
        }
        other => panic!("expected StageFailure, got {other:?}"),
    }
    assert!(err.to_string().contains("direct"));
    // The partial file stays on disk, unstamped
    let partial = dir.path().join("TEST").join("direct.parquet");
    assert!(partial.exists());
    assert_eq!(stages.calls(), vec![Assign, Direct]);

    stages.fail_on(None);
    stages.reset();
    let datasets = cache.ensure_fresh(&store, &scheme).unwrap();
    assert_eq!(datasets.regenerated, vec![Direct, Reweight]);
    assert_eq!(stages.calls(), vec![Direct, Reweight]);
}

#[test]
fn test_retry_after_kinetics_failure_rebuilds_stale_reweight() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());

    let before = cache.ensure_fresh(&store, &scheme(dir.path(), "TEST")).unwrap();
    assert_eq!(before.reweight.as_ref().unwrap().data.nbins(), 3);

    let coarser = rebuild(dir.path(), |s| {
        s.analysis_schemes[0].bins = BinMapperDef::RectilinearBinMapper {
            boundaries: vec![vec![0.0, 5.0, 10000.0]],
        };
    });
    stages.fail_on(Some(Direct));
    let err = cache.ensure_fresh(&store, &coarser).unwrap_err();
    assert!(matches!(err, Error::StageFailure { dataset: Direct, .. }));

    // assign is current now, but both kinetics files predate it
    stages.fail_on(None);
    stages.reset();
    let datasets = cache.ensure_fresh(&store, &coarser).unwrap();
    assert_eq!(datasets.regenerated, vec![Direct, Reweight]);
    assert_eq!(datasets.assign.data.nbins(), 2);
    assert_eq!(datasets.reweight.as_ref().unwrap().data.nbins(), 2);
}

#[test]
fn test_failed_assign_leaves_no_valid_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let store = scenario_store();
    let stages = CountingStages::new();
    let cache = counting_cache(&stages, CacheOptions::default());
    let scheme = scheme(dir.path(), "TEST");

    cache.ensure_fresh(&store, &scheme).unwrap();
    stages.fail_on(Some(Assign));
    let err = cache.ensure_fresh(
        &store,
        &rebuild(dir.path(), |s| {
            s.w_assign.insert("extra".to_string(), json!(["serial"]));
        }),
    );
    assert!(matches!(err, Err(Error::StageFailure { dataset: Assign, .. })));

    // Retrying with the original configuration still sees an unstamped assign
    stages.fail_on(None);
    let datasets = cache.ensure_fresh(&store, &scheme).unwrap();
    assert_eq!(datasets.regenerated, vec![Assign, Direct, Reweight]);
}
