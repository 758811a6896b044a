//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ensemble_ipa::cache::{CacheOptions, DatasetName, PipelineCache, SchemeDatasets};
use ensemble_ipa::config::AnalysisSettings;
use ensemble_ipa::scheme::{AnalysisScheme, SchemeRegistry};
use ensemble_ipa::stages::{
    AssignConfig, AssignDataset, BuiltinStages, KineticsConfig, StageContext, StagePipeline,
};
use ensemble_ipa::store::{IterationData, IterationStore, MemoryIterationStore};
use ensemble_ipa::{Error, Result};
use ndarray::{Array1, Array2, Array3};

pub const SETTINGS_JSON: &str = r#"{
    "postanalysis": true,
    "kinetics": {"evolution": "cumulative", "step_iter": 1},
    "analysis_schemes": [
        {
            "name": "TEST",
            "bins": {"type": "RectilinearBinMapper", "boundaries": [[0.0, 2.8, 7.0, 10000.0]]},
            "states": [
                {"label": "bound", "coords": [[2.7]]},
                {"label": "unbound", "coords": [[7.0]]}
            ]
        },
        {
            "name": "COARSE",
            "postanalysis": false,
            "bins": {"type": "RectilinearBinMapper", "boundaries": [[0.0, 5.0, 10000.0]]},
            "states": [{"label": "low", "coords": [[1.0]]}]
        },
        {
            "name": "OFF",
            "enabled": false,
            "bins": {"type": "RectilinearBinMapper", "boundaries": [[0.0, 1.0]]}
        }
    ]
}"#;

/// Settings rooted at `dir`.
pub fn settings(dir: &Path) -> AnalysisSettings {
    let mut settings = AnalysisSettings::from_json_str(SETTINGS_JSON).unwrap();
    settings.directory = dir.to_path_buf();
    settings
}

/// Scheme `name` rooted at `dir`.
pub fn scheme(dir: &Path, name: &str) -> AnalysisScheme {
    let registry = SchemeRegistry::from_settings(&settings(dir)).unwrap();
    registry.get(name).unwrap().clone()
}

/// One iteration with 1-D pcoord `[walkers, samples]`.
pub fn iteration(
    iteration: u32,
    parents: &[i64],
    weights: &[f64],
    pcoord: &[Vec<f64>],
) -> IterationData {
    let walkers = parents.len();
    let samples = pcoord.first().map_or(0, Vec::len);
    IterationData {
        iteration,
        n_particles: walkers,
        seg_ids: (0..walkers).collect(),
        weights: Array1::from(weights.to_vec()),
        parent_ids: Array1::from(parents.to_vec()),
        pcoord: Array3::from_shape_fn((walkers, samples, 1), |(w, t, _)| pcoord[w][t]),
        auxdata: BTreeMap::from([(
            "energy".to_string(),
            Array2::from_shape_fn((walkers, samples), |(w, t)| {
                f64::from(iteration) * 100.0 + (w * 10 + t) as f64
            }),
        )]),
    }
}

/// Three iterations of two walkers:
///
/// - iteration 2 walker 0 descends from iteration 1 walker 1
/// - iteration 3 walker 1 descends from iteration 2 walker 0
///
/// so `trace(1, 3)` visits seg_ids `[1, 0, 1]`.
pub fn scenario_store() -> MemoryIterationStore {
    let mut store = MemoryIterationStore::new();
    store
        .push(iteration(1, &[-1, -1], &[0.6, 0.4], &[vec![8.0, 8.0], vec![8.0, 1.0]]))
        .unwrap();
    store
        .push(iteration(2, &[1, 0], &[0.5, 0.5], &[vec![1.0, 1.0], vec![8.0, 5.0]]))
        .unwrap();
    store
        .push(iteration(3, &[1, 0], &[0.3, 0.7], &[vec![5.0, 8.0], vec![1.0, 8.0]]))
        .unwrap();
    store
}

/// Fourth iteration continuing [`scenario_store`].
pub fn push_fourth(store: &mut MemoryIterationStore) {
    store
        .push(iteration(4, &[1, 1], &[0.5, 0.5], &[vec![8.0, 8.0], vec![8.0, 1.0]]))
        .unwrap();
}

/// Fresh datasets of scheme `name` for `store`, rooted at `dir`.
pub fn fresh(store: &dyn IterationStore, dir: &Path, name: &str) -> SchemeDatasets {
    PipelineCache::new(CacheOptions::default())
        .ensure_fresh(store, &scheme(dir, name))
        .unwrap()
}

/// Built-in stages that record every call and can be told to fail.
#[derive(Default)]
pub struct CountingStages {
    inner: BuiltinStages,
    calls: Mutex<Vec<DatasetName>>,
    fail: Mutex<Option<DatasetName>>,
}

impl CountingStages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<DatasetName> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Fail the next run of `dataset` after leaving a partial file behind.
    pub fn fail_on(&self, dataset: Option<DatasetName>) {
        *self.fail.lock().unwrap() = dataset;
    }

    fn enter(&self, dataset: DatasetName, output: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(dataset);
        if *self.fail.lock().unwrap() == Some(dataset) {
            std::fs::write(output, b"partial")?;
            return Err(Error::InvalidInput(format!("{dataset} stage exploded")));
        }
        Ok(())
    }
}

impl StagePipeline for CountingStages {
    fn assign(&self, ctx: &StageContext<'_>, config: &AssignConfig, output: &Path) -> Result<()> {
        self.enter(DatasetName::Assign, output)?;
        self.inner.assign(ctx, config, output)
    }

    fn direct(
        &self,
        ctx: &StageContext<'_>,
        assign: &AssignDataset,
        config: &KineticsConfig,
        output: &Path,
    ) -> Result<()> {
        self.enter(DatasetName::Direct, output)?;
        self.inner.direct(ctx, assign, config, output)
    }

    fn reweight(
        &self,
        ctx: &StageContext<'_>,
        assign: &AssignDataset,
        config: &KineticsConfig,
        output: &Path,
    ) -> Result<()> {
        self.enter(DatasetName::Reweight, output)?;
        self.inner.reweight(ctx, assign, config, output)
    }
}
