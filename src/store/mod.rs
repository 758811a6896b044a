//! Iteration store contract
//!
//! The simulation engine writes one record per iteration: per-walker weight,
//! parent pointer, progress-coordinate samples and optional auxiliary data.
//! The analysis core only reads through [`IterationStore`], and always asks
//! for a row subset so implementations can avoid decoding whole iterations.

mod memory;
mod parquet_store;

pub use memory::MemoryIterationStore;
pub use parquet_store::ParquetIterationStore;

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3, Axis};

use crate::{Error, Result};

/// Which walkers of an iteration to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegSelection {
    /// Every walker, in `seg_id` order
    All,
    /// The listed walkers, in the given order (repeats allowed)
    Rows(Vec<usize>),
}

impl SegSelection {
    /// Single walker.
    #[must_use]
    pub fn one(seg_id: usize) -> Self {
        Self::Rows(vec![seg_id])
    }

    /// Resolve to explicit row indices, checking bounds.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` for the first row `>= n_particles`
    pub fn resolve(&self, iteration: u32, n_particles: usize) -> Result<Vec<usize>> {
        match self {
            Self::All => Ok((0..n_particles).collect()),
            Self::Rows(rows) => {
                if let Some(&bad) = rows.iter().find(|&&r| r >= n_particles) {
                    return Err(Error::InvalidIndex {
                        seg_id: bad,
                        iteration,
                        n_particles,
                    });
                }
                Ok(rows.clone())
            }
        }
    }
}

/// Per-iteration summary record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationSummary {
    /// Walker count
    pub n_particles: usize,
    /// Total weight (1.0 under normal operation)
    pub norm: f64,
    /// Smallest walker weight
    pub min_seg_prob: f64,
    /// Largest walker weight
    pub max_seg_prob: f64,
}

impl IterationSummary {
    /// Summarize a full weight array.
    #[must_use]
    pub fn from_weights(weights: &Array1<f64>) -> Self {
        Self {
            n_particles: weights.len(),
            norm: weights.sum(),
            min_seg_prob: weights.iter().copied().fold(f64::INFINITY, f64::min),
            max_seg_prob: weights.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Raw walker arrays for (a row subset of) one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationData {
    /// Iteration index (1-based)
    pub iteration: u32,
    /// Walker count of the whole iteration, not of this subset
    pub n_particles: usize,
    /// `seg_id` of each loaded row
    pub seg_ids: Vec<usize>,
    /// Walker weights, shape `[rows]`
    pub weights: Array1<f64>,
    /// Parent index in the previous iteration; negative = no tracked predecessor
    pub parent_ids: Array1<i64>,
    /// Progress coordinate samples, shape `[rows, T, D]`
    pub pcoord: Array3<f64>,
    /// Named auxiliary arrays, shape `[rows, T]` each
    pub auxdata: BTreeMap<String, Array2<f64>>,
}

impl IterationData {
    /// Check that every array agrees on the row count.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageError` describing the mismatch
    pub fn validate(&self) -> Result<()> {
        let rows = self.seg_ids.len();
        let mismatch = |what: &str, len: usize| {
            Error::StorageError(format!(
                "iteration {}: {what} has {len} rows, expected {rows}",
                self.iteration
            ))
        };
        if self.weights.len() != rows {
            return Err(mismatch("weight", self.weights.len()));
        }
        if self.parent_ids.len() != rows {
            return Err(mismatch("parent_id", self.parent_ids.len()));
        }
        if self.pcoord.len_of(Axis(0)) != rows {
            return Err(mismatch("pcoord", self.pcoord.len_of(Axis(0))));
        }
        for (name, aux) in &self.auxdata {
            if aux.nrows() != rows {
                return Err(mismatch(&format!("auxdata '{name}'"), aux.nrows()));
            }
        }
        Ok(())
    }

    /// Number of loaded rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seg_ids.len()
    }

    /// Whether no rows were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seg_ids.is_empty()
    }

    /// Samples per segment (`T`).
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.pcoord.len_of(Axis(1))
    }

    /// Take rows (positions within this record) into a new record.
    #[must_use]
    pub fn take_rows(&self, positions: &[usize]) -> Self {
        Self {
            iteration: self.iteration,
            n_particles: self.n_particles,
            seg_ids: positions.iter().map(|&p| self.seg_ids[p]).collect(),
            weights: self.weights.select(Axis(0), positions),
            parent_ids: self.parent_ids.select(Axis(0), positions),
            pcoord: self.pcoord.select(Axis(0), positions),
            auxdata: self
                .auxdata
                .iter()
                .map(|(k, v)| (k.clone(), v.select(Axis(0), positions)))
                .collect(),
        }
    }
}

/// Read-only access to iteration records.
///
/// Implementations must be safe to share between concurrent readers.
pub trait IterationStore: Send + Sync {
    /// Number of complete iterations (valid indices are `1..=n_iterations`).
    fn n_iterations(&self) -> u32;

    /// Walker count of an iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` for unknown iterations
    fn n_particles(&self, iteration: u32) -> Result<usize>;

    /// Load the selected walkers of an iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` or `Error::InvalidIndex`
    fn read_iteration(&self, iteration: u32, selection: &SegSelection) -> Result<IterationData>;

    /// Whole-iteration parent pointer array.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` for unknown iterations
    fn read_parent_ids(&self, iteration: u32) -> Result<Array1<i64>> {
        Ok(self.read_iteration(iteration, &SegSelection::All)?.parent_ids)
    }

    /// Summary record of an iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` for unknown iterations
    fn summary(&self, iteration: u32) -> Result<IterationSummary> {
        let data = self.read_iteration(iteration, &SegSelection::All)?;
        Ok(IterationSummary::from_weights(&data.weights))
    }

    /// Fail unless `iteration` is in `1..=n_iterations`.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange`
    fn check_iteration(&self, iteration: u32) -> Result<()> {
        let n_iterations = self.n_iterations();
        if iteration == 0 || iteration > n_iterations {
            return Err(Error::IterationOutOfRange {
                iteration,
                n_iterations,
            });
        }
        Ok(())
    }
}
