//! Kinetics datasets (`direct` and `reweight`)
//!
//! Four evolution datasets, each a sequence of blocks (one per evolution
//! step):
//!
//! - 2D, `nstates x nstates` entries: `conditional_flux_evolution`, `rate_evolution`
//! - 1D, `nstates` entries: `state_pop_evolution`, `color_prob_evolution`
//!
//! 2D estimates need a reference pair of iterations, so their windows start
//! at iteration 2 while 1D windows start at iteration 1. The reweight
//! estimator also stores each iteration's instantaneous bin flux matrix.
//!
//! Stored long-form, one row per entry: `dataset` (`Utf8`), `block`,
//! `istate`, `jstate`, `iter_start`, `iter_stop`, `corrlen` (`UInt32`),
//! `expected`, `ci_lbound`, `ci_ubound`, `sterr` (`Float64`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use ndarray::Array2;

use crate::cache::DatasetName;
use crate::storage::{self, column, Attributes, DerivedFile};
use crate::{Error, Result};

const INSTANT_FLUX: &str = "instant_flux";
const ESTIMATOR_KEY: &str = "estimator";
const NSTATES_KEY: &str = "nstates";
const NBINS_KEY: &str = "nbins";
const STEP_ITER_KEY: &str = "step_iter";
const EVOLUTION_KEY: &str = "evolution";

/// How evolution windows grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolutionMode {
    /// Every window starts at the origin and grows by `step_iter`
    Cumulative,
    /// Disjoint windows of `step_iter` iterations
    Blocked,
}

impl FromStr for EvolutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cumulative" => Ok(Self::Cumulative),
            "blocked" => Ok(Self::Blocked),
            other => Err(Error::Config(format!(
                "unknown evolution mode '{other}' (expected 'cumulative' or 'blocked')"
            ))),
        }
    }
}

impl fmt::Display for EvolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cumulative => "cumulative",
            Self::Blocked => "blocked",
        })
    }
}

/// The evolution datasets of a kinetics file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EvolutionKind {
    /// Flux between colors, conditioned on the source color
    ConditionalFluxEvolution,
    /// Transition rate between states
    RateEvolution,
    /// Population of each state
    StatePopEvolution,
    /// Probability of each color (last state visited)
    ColorProbEvolution,
}

impl EvolutionKind {
    /// All kinds, 2D first.
    pub const ALL: [Self; 4] = [
        Self::ConditionalFluxEvolution,
        Self::RateEvolution,
        Self::StatePopEvolution,
        Self::ColorProbEvolution,
    ];

    /// Dataset name as stored.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConditionalFluxEvolution => "conditional_flux_evolution",
            Self::RateEvolution => "rate_evolution",
            Self::StatePopEvolution => "state_pop_evolution",
            Self::ColorProbEvolution => "color_prob_evolution",
        }
    }

    /// Whether entries are state pairs.
    #[must_use]
    pub const fn is_2d(self) -> bool {
        matches!(self, Self::ConditionalFluxEvolution | Self::RateEvolution)
    }

    /// First iteration covered by this kind's windows.
    #[must_use]
    pub const fn origin(self) -> u32 {
        if self.is_2d() {
            2
        } else {
            1
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// Block of the evolution dataset whose estimate first includes `iteration`.
///
/// 2D datasets use `(iteration - 2) / step`, 1D datasets `(iteration - 1) / step`
/// (floor division). `None` when `iteration` precedes the dataset's first
/// window, e.g. iteration 1 for a 2D dataset.
#[must_use]
pub fn block_index(kind: EvolutionKind, iteration: u32, step_iter: u32) -> Option<usize> {
    let offset = i64::from(kind.origin());
    let value = (i64::from(iteration) - offset).div_euclid(i64::from(step_iter.max(1)));
    usize::try_from(value).ok()
}

/// Evolution windows `[start, stop)` for iterations `origin..=last`.
#[must_use]
pub fn windows(origin: u32, last: u32, step_iter: u32, mode: EvolutionMode) -> Vec<(u32, u32)> {
    let step = step_iter.max(1);
    let mut out = Vec::new();
    let mut block_start = origin;
    while block_start <= last {
        let stop = block_start.saturating_add(step).min(last + 1);
        let start = match mode {
            EvolutionMode::Cumulative => origin,
            EvolutionMode::Blocked => block_start,
        };
        out.push((start, stop));
        block_start = block_start.saturating_add(step);
    }
    out
}

/// One estimate with its confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EvolutionEntry {
    /// First iteration of the window
    pub iter_start: u32,
    /// One past the last iteration of the window
    pub iter_stop: u32,
    /// Point estimate
    pub expected: f64,
    /// Lower confidence bound
    pub ci_lbound: f64,
    /// Upper confidence bound
    pub ci_ubound: f64,
    /// Standard error
    pub sterr: f64,
    /// Correlation length (iterations)
    pub corrlen: u32,
}

impl EvolutionEntry {
    /// Point estimate with a zero-width interval.
    #[must_use]
    pub const fn point(iter_start: u32, iter_stop: u32, expected: f64) -> Self {
        Self {
            iter_start,
            iter_stop,
            expected,
            ci_lbound: expected,
            ci_ubound: expected,
            sterr: 0.0,
            corrlen: 0,
        }
    }

    /// Mean of a window's per-iteration values with a 95% normal interval.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(iter_start: u32, iter_stop: u32, values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::point(iter_start, iter_stop, 0.0);
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let sterr = if values.len() < 2 {
            0.0
        } else {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            (var / n).sqrt()
        };
        Self {
            iter_start,
            iter_stop,
            expected: mean,
            ci_lbound: 1.96f64.mul_add(-sterr, mean),
            ci_ubound: 1.96f64.mul_add(sterr, mean),
            sterr,
            corrlen: 0,
        }
    }

    /// Relative half-width of the interval, `(ub - lb) / (2 * expected)`.
    #[must_use]
    pub fn error(&self) -> f64 {
        (self.ci_ubound - self.ci_lbound) / (2.0 * self.expected)
    }
}

/// One block of an evolution dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionBlock {
    /// Which dataset this came from
    pub kind: EvolutionKind,
    /// Block index within the dataset
    pub index: usize,
    nstates: usize,
    entries: Vec<EvolutionEntry>,
}

impl EvolutionBlock {
    /// Entry for a state (1D datasets).
    #[must_use]
    pub fn state(&self, i: usize) -> Option<&EvolutionEntry> {
        if self.kind.is_2d() {
            return None;
        }
        self.entries.get(i)
    }

    /// Entry for a state pair (2D datasets).
    #[must_use]
    pub fn pair(&self, i: usize, j: usize) -> Option<&EvolutionEntry> {
        if !self.kind.is_2d() || i >= self.nstates || j >= self.nstates {
            return None;
        }
        self.entries.get(i * self.nstates + j)
    }

    /// All entries (row-major for 2D).
    #[must_use]
    pub fn entries(&self) -> &[EvolutionEntry] {
        &self.entries
    }

    /// Point estimates, in entry order.
    #[must_use]
    pub fn expected(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.expected).collect()
    }

    /// Relative errors, in entry order.
    #[must_use]
    pub fn errors(&self) -> Vec<f64> {
        self.entries.iter().map(EvolutionEntry::error).collect()
    }
}

/// Sparse bin-to-bin flux matrix of one iteration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseFlux {
    /// Source bins
    pub rows: Vec<u32>,
    /// Destination bins
    pub cols: Vec<u32>,
    /// Weight moved
    pub flux: Vec<f64>,
}

impl SparseFlux {
    /// Dense `nbins x nbins` matrix (duplicate coordinates are summed).
    #[must_use]
    pub fn to_dense(&self, nbins: usize) -> Array2<f64> {
        let mut dense = Array2::zeros((nbins, nbins));
        for ((&r, &c), &f) in self.rows.iter().zip(&self.cols).zip(&self.flux) {
            let (r, c) = (r as usize, c as usize);
            if r < nbins && c < nbins {
                dense[[r, c]] += f;
            }
        }
        dense
    }

    /// Nonzero entries of a dense matrix.
    #[must_use]
    pub fn from_dense(dense: &Array2<f64>) -> Self {
        let mut sparse = Self::default();
        for ((r, c), &f) in dense.indexed_iter() {
            if f != 0.0 {
                sparse.rows.push(u32::try_from(r).unwrap_or(u32::MAX));
                sparse.cols.push(u32::try_from(c).unwrap_or(u32::MAX));
                sparse.flux.push(f);
            }
        }
        sparse
    }
}

/// Decoded kinetics dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct KineticsDataset {
    estimator: DatasetName,
    nstates: usize,
    nbins: usize,
    step_iter: u32,
    evolution: EvolutionMode,
    blocks: BTreeMap<EvolutionKind, Vec<Vec<EvolutionEntry>>>,
    instant_flux: BTreeMap<u32, SparseFlux>,
}

impl KineticsDataset {
    /// Empty dataset; estimators fill it with [`push_block`](Self::push_block).
    #[must_use]
    pub fn new(
        estimator: DatasetName,
        nstates: usize,
        nbins: usize,
        step_iter: u32,
        evolution: EvolutionMode,
    ) -> Self {
        Self {
            estimator,
            nstates,
            nbins,
            step_iter,
            evolution,
            blocks: BTreeMap::new(),
            instant_flux: BTreeMap::new(),
        }
    }

    /// Append the next block of a dataset.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the entry count does not match the kind
    pub fn push_block(&mut self, kind: EvolutionKind, entries: Vec<EvolutionEntry>) -> Result<()> {
        let expected = self.entries_per_block(kind);
        if entries.len() != expected {
            return Err(Error::InvalidInput(format!(
                "{} block needs {expected} entries, got {}",
                kind.name(),
                entries.len()
            )));
        }
        self.blocks.entry(kind).or_default().push(entries);
        Ok(())
    }

    /// Record an iteration's instantaneous bin flux matrix.
    pub fn set_instant_flux(&mut self, iteration: u32, flux: SparseFlux) {
        self.instant_flux.insert(iteration, flux);
    }

    const fn entries_per_block(&self, kind: EvolutionKind) -> usize {
        if kind.is_2d() {
            self.nstates * self.nstates
        } else {
            self.nstates
        }
    }

    /// Which estimator produced this dataset.
    #[must_use]
    pub const fn estimator(&self) -> DatasetName {
        self.estimator
    }

    /// Number of states.
    #[must_use]
    pub const fn nstates(&self) -> usize {
        self.nstates
    }

    /// Number of bins.
    #[must_use]
    pub const fn nbins(&self) -> usize {
        self.nbins
    }

    /// Evolution step recorded in the dataset.
    #[must_use]
    pub const fn step_iter(&self) -> u32 {
        self.step_iter
    }

    /// Window mode recorded in the dataset.
    #[must_use]
    pub const fn evolution(&self) -> EvolutionMode {
        self.evolution
    }

    /// Number of blocks in a dataset.
    #[must_use]
    pub fn n_blocks(&self, kind: EvolutionKind) -> usize {
        self.blocks.get(&kind).map_or(0, Vec::len)
    }

    /// One block, if it exists.
    #[must_use]
    pub fn block(&self, kind: EvolutionKind, index: usize) -> Option<EvolutionBlock> {
        self.blocks
            .get(&kind)
            .and_then(|blocks| blocks.get(index))
            .map(|entries| EvolutionBlock {
                kind,
                index,
                nstates: self.nstates,
                entries: entries.clone(),
            })
    }

    /// The block whose estimate first includes `iteration`.
    #[must_use]
    pub fn block_for_iteration(&self, kind: EvolutionKind, iteration: u32) -> Option<EvolutionBlock> {
        self.block(kind, block_index(kind, iteration, self.step_iter)?)
    }

    /// Instantaneous bin flux of an iteration (reweight only).
    #[must_use]
    pub fn instant_flux(&self, iteration: u32) -> Option<&SparseFlux> {
        self.instant_flux.get(&iteration)
    }

    /// Write the dataset (unstamped).
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut dataset = Vec::new();
        let mut block = Vec::new();
        let mut istate = Vec::new();
        let mut jstate = Vec::new();
        let mut iter_start = Vec::new();
        let mut iter_stop = Vec::new();
        let mut corrlen = Vec::new();
        let mut expected = Vec::new();
        let mut ci_lbound = Vec::new();
        let mut ci_ubound = Vec::new();
        let mut sterr = Vec::new();

        let to_u32 = |v: usize| u32::try_from(v).unwrap_or(u32::MAX);
        for (kind, blocks) in &self.blocks {
            for (b, entries) in blocks.iter().enumerate() {
                for (e, entry) in entries.iter().enumerate() {
                    let (i, j) = if kind.is_2d() {
                        (e / self.nstates, e % self.nstates)
                    } else {
                        (e, 0)
                    };
                    dataset.push(kind.name());
                    block.push(to_u32(b));
                    istate.push(to_u32(i));
                    jstate.push(to_u32(j));
                    iter_start.push(entry.iter_start);
                    iter_stop.push(entry.iter_stop);
                    corrlen.push(entry.corrlen);
                    expected.push(entry.expected);
                    ci_lbound.push(entry.ci_lbound);
                    ci_ubound.push(entry.ci_ubound);
                    sterr.push(entry.sterr);
                }
            }
        }
        for (&iteration, flux) in &self.instant_flux {
            for ((&r, &c), &f) in flux.rows.iter().zip(&flux.cols).zip(&flux.flux) {
                dataset.push(INSTANT_FLUX);
                block.push(iteration);
                istate.push(r);
                jstate.push(c);
                iter_start.push(iteration);
                iter_stop.push(iteration + 1);
                corrlen.push(0);
                expected.push(f);
                ci_lbound.push(f);
                ci_ubound.push(f);
                sterr.push(0.0);
            }
        }

        let u32_field = |name: &str| Field::new(name, DataType::UInt32, false);
        let f64_field = |name: &str| Field::new(name, DataType::Float64, false);
        let schema = Arc::new(Schema::new(vec![
            Field::new("dataset", DataType::Utf8, false),
            u32_field("block"),
            u32_field("istate"),
            u32_field("jstate"),
            u32_field("iter_start"),
            u32_field("iter_stop"),
            u32_field("corrlen"),
            f64_field("expected"),
            f64_field("ci_lbound"),
            f64_field("ci_ubound"),
            f64_field("sterr"),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(dataset)),
            Arc::new(UInt32Array::from(block)),
            Arc::new(UInt32Array::from(istate)),
            Arc::new(UInt32Array::from(jstate)),
            Arc::new(UInt32Array::from(iter_start)),
            Arc::new(UInt32Array::from(iter_stop)),
            Arc::new(UInt32Array::from(corrlen)),
            Arc::new(Float64Array::from(expected)),
            Arc::new(Float64Array::from(ci_lbound)),
            Arc::new(Float64Array::from(ci_ubound)),
            Arc::new(Float64Array::from(sterr)),
        ];
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;

        let attributes = Attributes::from([
            (ESTIMATOR_KEY.to_string(), self.estimator.to_string()),
            (NSTATES_KEY.to_string(), self.nstates.to_string()),
            (NBINS_KEY.to_string(), self.nbins.to_string()),
            (STEP_ITER_KEY.to_string(), self.step_iter.to_string()),
            (EVOLUTION_KEY.to_string(), self.evolution.to_string()),
        ]);
        storage::write_parquet(path, schema, &[batch], &attributes)
    }

    /// Decode a kinetics file.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageError` if attributes are missing or rows are malformed
    pub fn from_file(file: &DerivedFile) -> Result<Self> {
        let parse = |key: &str| -> Result<usize> {
            file.require_attribute(key)?
                .parse()
                .map_err(|e| Error::StorageError(format!("bad attribute '{key}': {e}")))
        };
        let estimator: DatasetName = file.require_attribute(ESTIMATOR_KEY)?.parse()?;
        let nstates = parse(NSTATES_KEY)?;
        let nbins = parse(NBINS_KEY)?;
        let step_iter = u32::try_from(parse(STEP_ITER_KEY)?)
            .map_err(|_| Error::StorageError("step_iter does not fit in u32".to_string()))?;
        let evolution: EvolutionMode = file.require_attribute(EVOLUTION_KEY)?.parse()?;
        let mut dataset = Self::new(estimator, nstates, nbins, step_iter, evolution);

        let batch = file.combined()?;
        let name_col = column::<StringArray>(&batch, "dataset")?;
        let block_col = column::<UInt32Array>(&batch, "block")?;
        let istate_col = column::<UInt32Array>(&batch, "istate")?;
        let jstate_col = column::<UInt32Array>(&batch, "jstate")?;
        let start_col = column::<UInt32Array>(&batch, "iter_start")?;
        let stop_col = column::<UInt32Array>(&batch, "iter_stop")?;
        let corrlen_col = column::<UInt32Array>(&batch, "corrlen")?;
        let expected_col = column::<Float64Array>(&batch, "expected")?;
        let lbound_col = column::<Float64Array>(&batch, "ci_lbound")?;
        let ubound_col = column::<Float64Array>(&batch, "ci_ubound")?;
        let sterr_col = column::<Float64Array>(&batch, "sterr")?;

        for row in 0..batch.num_rows() {
            let name = name_col.value(row);
            let (i, j) = (istate_col.value(row), jstate_col.value(row));

            if name == INSTANT_FLUX {
                let flux = dataset.instant_flux.entry(block_col.value(row)).or_default();
                flux.rows.push(i);
                flux.cols.push(j);
                flux.flux.push(expected_col.value(row));
                continue;
            }

            let kind = EvolutionKind::from_name(name).ok_or_else(|| {
                Error::StorageError(format!("unknown kinetics dataset '{name}'"))
            })?;
            let per_block = dataset.entries_per_block(kind);
            let position = if kind.is_2d() {
                i as usize * nstates + j as usize
            } else {
                i as usize
            };
            if position >= per_block {
                return Err(Error::StorageError(format!(
                    "{} entry ({i}, {j}) out of range for {nstates} states",
                    kind.name()
                )));
            }

            let b = block_col.value(row) as usize;
            let blocks = dataset.blocks.entry(kind).or_default();
            if blocks.len() <= b {
                blocks.resize(b + 1, vec![EvolutionEntry::default(); per_block]);
            }
            blocks[b][position] = EvolutionEntry {
                iter_start: start_col.value(row),
                iter_stop: stop_col.value(row),
                expected: expected_col.value(row),
                ci_lbound: lbound_col.value(row),
                ci_ubound: ubound_col.value(row),
                sterr: sterr_col.value(row),
                corrlen: corrlen_col.value(row),
            };
        }
        Ok(dataset)
    }
}
