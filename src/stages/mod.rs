//! Sub-pipeline stages
//!
//! Three stages produce the derived datasets of a scheme:
//!
//! ```text
//! IterationStore ──> assign ──┬──> direct
//!                             └──> reweight   (post-analysis only)
//! ```
//!
//! Each stage takes a typed configuration and an output path and writes one
//! unstamped Parquet file. Stamping and staleness are the cache's job.
//! Stages run inside the worker pool handed to them in [`StageContext`].

mod assign;
mod estimators;
mod kinetics;

pub use assign::{AssignDataset, IterationAssignments};
pub use kinetics::{
    block_index, EvolutionBlock, EvolutionEntry, EvolutionKind, EvolutionMode, KineticsDataset,
    SparseFlux,
};

use std::path::Path;
use std::time::Instant;

use serde_json::Value;
use tracing::info;

use crate::binning::{BinMapperDef, RectilinearBinMapper, StateDef};
use crate::config::{extra_flags, StageOptions};
use crate::store::IterationStore;
use crate::{Error, Result};

/// Everything a stage may touch besides its configuration.
pub struct StageContext<'a> {
    /// Raw iteration records
    pub store: &'a dyn IterationStore,
    /// Worker pool owned by the running `ensure_fresh` call
    pub pool: &'a rayon::ThreadPool,
    /// Scheme being refreshed (for logging)
    pub scheme: &'a str,
    /// Iterations in scope (`1..=n_iterations`)
    pub n_iterations: u32,
}

/// Typed assignment configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignConfig {
    /// Bin mapper built from the scheme's definition
    pub mapper: RectilinearBinMapper,
    /// State definitions, in label order
    pub states: Vec<StateDef>,
    /// Bare flags from `extra`
    pub flags: Vec<String>,
}

impl AssignConfig {
    /// Build from merged stage options and the scheme's bins/states.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid bins, states or flags
    pub fn from_options(
        options: &StageOptions,
        bins: &BinMapperDef,
        states: &[StateDef],
    ) -> Result<Self> {
        let mapper = bins.build()?;
        // Validates that every state coordinate maps to a bin
        mapper.state_bins(states)?;
        Ok(Self {
            mapper,
            states: states.to_vec(),
            flags: extra_flags(options)?,
        })
    }
}

/// Typed kinetics configuration shared by `direct` and `reweight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KineticsConfig {
    /// Window growth mode
    pub evolution: EvolutionMode,
    /// Iterations per evolution step
    pub step_iter: u32,
    /// Bare flags from `extra`
    pub flags: Vec<String>,
}

impl Default for KineticsConfig {
    fn default() -> Self {
        Self {
            evolution: EvolutionMode::Cumulative,
            step_iter: 1,
            flags: Vec::new(),
        }
    }
}

fn parse_u32(options: &StageOptions, key: &str) -> Result<Option<u32>> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| Error::Config(format!("'{key}' must be a non-negative integer, got {value}")))
}

impl KineticsConfig {
    /// Build from merged stage options (`evolution`, `step_iter`, `extra`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown evolution mode or a zero step
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = options.get("evolution") {
            let mode = value
                .as_str()
                .ok_or_else(|| Error::Config(format!("'evolution' must be a string, got {value}")))?;
            config.evolution = mode.parse()?;
        }
        if let Some(step) = parse_u32(options, "step_iter")? {
            if step == 0 {
                return Err(Error::Config("'step_iter' must be at least 1".to_string()));
            }
            config.step_iter = step;
        }
        config.flags = extra_flags(options)?;
        Ok(config)
    }
}

/// The three stage entry points.
///
/// Implementations write the dataset to `output`; they must not stamp it.
pub trait StagePipeline: Send + Sync {
    /// Compute state/bin labels for every walker sample.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read or the file cannot be written
    fn assign(&self, ctx: &StageContext<'_>, config: &AssignConfig, output: &Path) -> Result<()>;

    /// Compute kinetics from raw color-to-color fluxes.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read or the file cannot be written
    fn direct(
        &self,
        ctx: &StageContext<'_>,
        assign: &AssignDataset,
        config: &KineticsConfig,
        output: &Path,
    ) -> Result<()>;

    /// Compute kinetics from the reweighted bin transition matrix.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read or the file cannot be written
    fn reweight(
        &self,
        ctx: &StageContext<'_>,
        assign: &AssignDataset,
        config: &KineticsConfig,
        output: &Path,
    ) -> Result<()>;
}

/// Built-in stage implementations.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinStages;

impl StagePipeline for BuiltinStages {
    fn assign(&self, ctx: &StageContext<'_>, config: &AssignConfig, output: &Path) -> Result<()> {
        let started = Instant::now();
        let dataset = AssignDataset::compute(ctx, config)?;
        dataset.write(output)?;
        info!(
            scheme = ctx.scheme,
            iterations = dataset.n_iterations(),
            elapsed_ms = started.elapsed().as_millis(),
            "assignment complete"
        );
        Ok(())
    }

    fn direct(
        &self,
        ctx: &StageContext<'_>,
        assign: &AssignDataset,
        config: &KineticsConfig,
        output: &Path,
    ) -> Result<()> {
        let started = Instant::now();
        let dataset = estimators::direct(ctx, assign, config)?;
        dataset.write(output)?;
        info!(
            scheme = ctx.scheme,
            elapsed_ms = started.elapsed().as_millis(),
            "direct kinetics complete"
        );
        Ok(())
    }

    fn reweight(
        &self,
        ctx: &StageContext<'_>,
        assign: &AssignDataset,
        config: &KineticsConfig,
        output: &Path,
    ) -> Result<()> {
        let started = Instant::now();
        let dataset = estimators::reweight(ctx, assign, config)?;
        dataset.write(output)?;
        info!(
            scheme = ctx.scheme,
            elapsed_ms = started.elapsed().as_millis(),
            "reweight kinetics complete"
        );
        Ok(())
    }
}
