//! Analyze: refresh a scheme and walk a lineage
//!
//! Builds a small synthetic ensemble in a Parquet store, refreshes every
//! enabled scheme, then follows the heaviest walker of the last iteration
//! back to its origin and lists the children of its oldest ancestor.
//!
//! Run with: cargo run --example analyze
//! Set `RUST_LOG=ensemble_ipa=debug` to see cache decisions.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use ensemble_ipa::cache::{CacheOptions, PipelineCache};
use ensemble_ipa::config::AnalysisSettings;
use ensemble_ipa::context::AnalysisContext;
use ensemble_ipa::lineage::ChildrenOutcome;
use ensemble_ipa::store::{IterationData, ParquetIterationStore};
use ndarray::{Array1, Array2, Array3};
use tracing_subscriber::EnvFilter;

const SETTINGS_JSON: &str = r#"{
    "postanalysis": true,
    "kinetics": {"evolution": "cumulative", "step_iter": 2},
    "analysis_schemes": [{
        "name": "DEMO",
        "bins": {"type": "RectilinearBinMapper", "boundaries": [[0.0, 2.0, 4.0, 6.0, 8.0, 10.0]]},
        "states": [
            {"label": "bound", "coords": [[1.0]]},
            {"label": "unbound", "coords": [[9.0]]}
        ]
    }]
}"#;

const WALKERS: usize = 4;
const ITERATIONS: u32 = 12;

/// Walkers drift towards the unbound region; every walker resamples from a
/// neighbour so lineages merge over time.
#[allow(clippy::cast_precision_loss)]
fn synthetic_iteration(iteration: u32) -> IterationData {
    let drift = f64::from(iteration) * 0.6;
    let parent_ids = if iteration == 1 {
        Array1::from_elem(WALKERS, -1)
    } else {
        Array1::from_shape_fn(WALKERS, |w| ((w + iteration as usize) % WALKERS) as i64 / 2)
    };
    IterationData {
        iteration,
        n_particles: WALKERS,
        seg_ids: (0..WALKERS).collect(),
        weights: Array1::from_shape_fn(WALKERS, |w| (w + 1) as f64 / 10.0),
        parent_ids,
        pcoord: Array3::from_shape_fn((WALKERS, 3, 1), |(w, t, _)| {
            (drift + w as f64 * 0.5 + t as f64 * 0.3).min(9.9)
        }),
        auxdata: BTreeMap::from([(
            "energy".to_string(),
            Array2::from_shape_fn((WALKERS, 3), |(w, t)| -(drift * 10.0) + (w * 3 + t) as f64),
        )]),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ensemble_ipa=info")),
        )
        .init();

    println!("=== ensemble-ipa: Analyze a Weighted Ensemble ===\n");

    let workspace = tempfile::tempdir().context("creating scratch directory")?;
    let mut store = ParquetIterationStore::open(workspace.path().join("traj_segs"))?;
    for it in 1..=ITERATIONS {
        store.append(&synthetic_iteration(it))?;
    }
    println!("Wrote {ITERATIONS} iterations of {WALKERS} walkers");

    let mut settings = AnalysisSettings::from_json_str(SETTINGS_JSON)?;
    settings.directory = workspace.path().join("ANALYSIS");
    let cache = PipelineCache::new(CacheOptions::default());
    let mut ctx = AnalysisContext::open(Arc::new(store), &settings, &cache)?;

    let datasets = ctx.datasets()?;
    println!("Scheme {} refreshed: {:?}\n", datasets.scheme, datasets.regenerated);

    ctx.set_iteration(ITERATIONS);
    let view = ctx.current()?;
    println!("Iteration {} summary: {:?}", view.iteration(), view.summary());
    if let Some(rate) = view.direct().rate.as_ref().and_then(|b| b.pair(0, 1)) {
        println!(
            "  bound -> unbound rate over [{}, {}): {:.4} (CI {:.4}..{:.4})",
            rate.iter_start, rate.iter_stop, rate.expected, rate.ci_lbound, rate.ci_ubound
        );
    }

    let heaviest = view.max_weight().context("iteration has no walkers")?;
    let labels = ctx.state_labels()?;
    println!("\n=== Lineage of walker {} ===", heaviest.seg_id);
    let lineage = ctx.trace(heaviest.seg_id)?;
    for walker in lineage.walkers() {
        let state = walker
            .final_state()
            .and_then(|s| labels.get(s as usize))
            .map_or("-", String::as_str);
        println!(
            "  iter {:>3}  seg {:>2}  weight {:.2}  pcoord {:.2}  state {state}",
            walker.iteration,
            walker.seg_id,
            walker.weight,
            walker.pcoord[[walker.pcoord.nrows() - 1, 0]],
        );
    }
    println!("  ended: {:?}", lineage.end());

    if let Some(origin) = lineage.walkers().first() {
        ctx.set_iteration(origin.iteration);
        println!("\n=== Children of iteration {} walker {} ===", origin.iteration, origin.seg_id);
        match ctx.children(origin.seg_id)? {
            ChildrenOutcome::Children(record) => println!("  seg_ids {:?}", record.seg_ids()),
            ChildrenOutcome::Childless => println!("  no children"),
            ChildrenOutcome::NoNextIteration => println!("  last iteration"),
        }
    }

    Ok(())
}
