//! Assignment dataset: bin and state label for every walker sample.
//!
//! Stored long-form, one row per `(iteration, seg_id, sample)`:
//! `iteration`, `seg_id`, `sample`, `bin`, `state` (all `UInt32`).
//! Labels and shapes live in the file attributes.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use ndarray::{s, Array2};
use rayon::prelude::*;
use tracing::debug;

use super::{AssignConfig, StageContext};
use crate::storage::{self, column, Attributes, DerivedFile};
use crate::store::SegSelection;
use crate::{Error, Result};

const STATE_LABELS_KEY: &str = "state_labels";
const BIN_LABELS_KEY: &str = "bin_labels";
const STATE_BINS_KEY: &str = "state_bins";
const N_PARTICLES_KEY: &str = "n_particles";
const N_SAMPLES_KEY: &str = "n_samples";

/// Labels of one iteration, shape `[walkers, samples]` each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationAssignments {
    /// Bin index per sample
    pub bins: Array2<u32>,
    /// State index per sample; `nstates` means "unknown"
    pub states: Array2<u32>,
}

/// Decoded assignment dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignDataset {
    state_labels: Vec<String>,
    bin_labels: Vec<String>,
    state_bins: Vec<Vec<usize>>,
    n_samples: usize,
    iterations: Vec<IterationAssignments>,
}

fn label_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidInput(format!("label {value} does not fit in u32")))
}

impl AssignDataset {
    /// Label every sample of iterations `1..=ctx.n_iterations`.
    ///
    /// Iterations are labelled in parallel on the stage pool.
    ///
    /// # Errors
    ///
    /// Returns error if a bin is claimed by two states, a sample falls
    /// outside the bin space, or the store cannot be read
    pub fn compute(ctx: &StageContext<'_>, config: &AssignConfig) -> Result<Self> {
        let mapper = &config.mapper;
        let state_bins = mapper.state_bins(&config.states)?;
        let nstates = label_u32(config.states.len())?;

        let mut state_of_bin = vec![nstates; mapper.nbins()];
        for (state, bins) in state_bins.iter().enumerate() {
            for &bin in bins {
                if state_of_bin[bin] != nstates {
                    return Err(Error::Config(format!(
                        "bin {bin} belongs to more than one state"
                    )));
                }
                state_of_bin[bin] = label_u32(state)?;
            }
        }

        let iterations: Vec<IterationAssignments> = ctx.pool.install(|| {
            (1..=ctx.n_iterations)
                .into_par_iter()
                .map(|iteration| {
                    let data = ctx.store.read_iteration(iteration, &SegSelection::All)?;
                    let (walkers, samples, _) = data.pcoord.dim();
                    let mut bins = Array2::zeros((walkers, samples));
                    let mut states = Array2::zeros((walkers, samples));
                    for w in 0..walkers {
                        for t in 0..samples {
                            let coord = data.pcoord.slice(s![w, t, ..]).to_vec();
                            let bin = mapper.assign(&coord).ok_or_else(|| {
                                Error::InvalidInput(format!(
                                    "iteration {iteration} seg_id {w} sample {t}: \
                                     pcoord {coord:?} is outside the bin space"
                                ))
                            })?;
                            bins[[w, t]] = label_u32(bin)?;
                            states[[w, t]] = state_of_bin[bin];
                        }
                    }
                    debug!(scheme = ctx.scheme, iteration, walkers, "assigned iteration");
                    Ok(IterationAssignments { bins, states })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let n_samples = iterations.first().map_or(0, |a| a.bins.ncols());
        Ok(Self {
            state_labels: config.states.iter().map(|s| s.label.clone()).collect(),
            bin_labels: mapper.labels(),
            state_bins,
            n_samples,
            iterations,
        })
    }

    /// Number of states (excluding "unknown").
    #[must_use]
    pub fn nstates(&self) -> usize {
        self.state_labels.len()
    }

    /// Number of bins.
    #[must_use]
    pub fn nbins(&self) -> usize {
        self.bin_labels.len()
    }

    /// Label used for samples outside every state.
    #[must_use]
    pub fn unknown_state(&self) -> u32 {
        u32::try_from(self.nstates()).unwrap_or(u32::MAX)
    }

    /// State labels, in state index order.
    #[must_use]
    pub fn state_labels(&self) -> &[String] {
        &self.state_labels
    }

    /// Bin labels, in bin index order.
    #[must_use]
    pub fn bin_labels(&self) -> &[String] {
        &self.bin_labels
    }

    /// Bins owned by each state.
    #[must_use]
    pub fn state_bins(&self) -> &[Vec<usize>] {
        &self.state_bins
    }

    /// Samples per segment.
    #[must_use]
    pub const fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Number of labelled iterations.
    #[must_use]
    pub fn n_iterations(&self) -> u32 {
        u32::try_from(self.iterations.len()).unwrap_or(u32::MAX)
    }

    /// Labels of one iteration (1-based).
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` if the iteration was not assigned
    pub fn iteration(&self, iteration: u32) -> Result<&IterationAssignments> {
        iteration
            .checked_sub(1)
            .and_then(|i| self.iterations.get(i as usize))
            .ok_or(Error::IterationOutOfRange {
                iteration,
                n_iterations: self.n_iterations(),
            })
    }

    /// Write the dataset (unstamped).
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn write(&self, path: &Path) -> Result<()> {
        let rows: usize = self.iterations.iter().map(|a| a.bins.len()).sum();
        let mut iteration_col = Vec::with_capacity(rows);
        let mut seg_col = Vec::with_capacity(rows);
        let mut sample_col = Vec::with_capacity(rows);
        let mut bin_col = Vec::with_capacity(rows);
        let mut state_col = Vec::with_capacity(rows);

        for (i, labels) in self.iterations.iter().enumerate() {
            let iteration = label_u32(i + 1)?;
            for ((w, t), &bin) in labels.bins.indexed_iter() {
                iteration_col.push(iteration);
                seg_col.push(label_u32(w)?);
                sample_col.push(label_u32(t)?);
                bin_col.push(bin);
                state_col.push(labels.states[[w, t]]);
            }
        }

        let schema = Arc::new(Schema::new(vec![
            Field::new("iteration", DataType::UInt32, false),
            Field::new("seg_id", DataType::UInt32, false),
            Field::new("sample", DataType::UInt32, false),
            Field::new("bin", DataType::UInt32, false),
            Field::new("state", DataType::UInt32, false),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt32Array::from(iteration_col)),
            Arc::new(UInt32Array::from(seg_col)),
            Arc::new(UInt32Array::from(sample_col)),
            Arc::new(UInt32Array::from(bin_col)),
            Arc::new(UInt32Array::from(state_col)),
        ];
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns)?;

        let n_particles: Vec<usize> = self.iterations.iter().map(|a| a.bins.nrows()).collect();
        let attributes = Attributes::from([
            (STATE_LABELS_KEY.to_string(), serde_json::to_string(&self.state_labels)?),
            (BIN_LABELS_KEY.to_string(), serde_json::to_string(&self.bin_labels)?),
            (STATE_BINS_KEY.to_string(), serde_json::to_string(&self.state_bins)?),
            (N_PARTICLES_KEY.to_string(), serde_json::to_string(&n_particles)?),
            (N_SAMPLES_KEY.to_string(), self.n_samples.to_string()),
        ]);
        storage::write_parquet(path, schema, &[batch], &attributes)
    }

    /// Decode a stamped (or unstamped) assignment file.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageError` if attributes are missing or rows are out of shape
    pub fn from_file(file: &DerivedFile) -> Result<Self> {
        let state_labels: Vec<String> = serde_json::from_str(file.require_attribute(STATE_LABELS_KEY)?)?;
        let bin_labels: Vec<String> = serde_json::from_str(file.require_attribute(BIN_LABELS_KEY)?)?;
        let state_bins: Vec<Vec<usize>> = serde_json::from_str(file.require_attribute(STATE_BINS_KEY)?)?;
        let n_particles: Vec<usize> = serde_json::from_str(file.require_attribute(N_PARTICLES_KEY)?)?;
        let n_samples: usize = file
            .require_attribute(N_SAMPLES_KEY)?
            .parse()
            .map_err(|e| Error::StorageError(format!("bad {N_SAMPLES_KEY}: {e}")))?;

        let mut iterations: Vec<IterationAssignments> = n_particles
            .iter()
            .map(|&w| IterationAssignments {
                bins: Array2::zeros((w, n_samples)),
                states: Array2::zeros((w, n_samples)),
            })
            .collect();

        let batch = file.combined()?;
        let iteration_col = column::<UInt32Array>(&batch, "iteration")?;
        let seg_col = column::<UInt32Array>(&batch, "seg_id")?;
        let sample_col = column::<UInt32Array>(&batch, "sample")?;
        let bin_col = column::<UInt32Array>(&batch, "bin")?;
        let state_col = column::<UInt32Array>(&batch, "state")?;

        for row in 0..batch.num_rows() {
            let iteration = iteration_col.value(row) as usize;
            let (w, t) = (seg_col.value(row) as usize, sample_col.value(row) as usize);
            let labels = iteration
                .checked_sub(1)
                .and_then(|i| iterations.get_mut(i))
                .filter(|a| w < a.bins.nrows() && t < n_samples)
                .ok_or_else(|| {
                    Error::StorageError(format!(
                        "{}: row ({iteration}, {w}, {t}) is out of shape",
                        file.path().display()
                    ))
                })?;
            labels.bins[[w, t]] = bin_col.value(row);
            labels.states[[w, t]] = state_col.value(row);
        }

        Ok(Self {
            state_labels,
            bin_labels,
            state_bins,
            n_samples,
            iterations,
        })
    }
}
