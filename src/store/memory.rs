//! In-memory iteration store.
//!
//! Holds complete iteration records in a vector. Used for tests and for
//! embedding the analysis core next to a simulation that already has its
//! data in memory.

use ndarray::Array1;

use super::{IterationData, IterationStore, IterationSummary, SegSelection};
use crate::{Error, Result};

/// Iteration store backed by a `Vec` of full records.
#[derive(Debug, Default, Clone)]
pub struct MemoryIterationStore {
    iterations: Vec<IterationData>,
}

impl MemoryIterationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next iteration.
    ///
    /// The record must contain every walker in `seg_id` order and be numbered
    /// `n_iterations() + 1`.
    ///
    /// # Errors
    ///
    /// Returns error if the record is misnumbered, partial or inconsistent
    pub fn push(&mut self, data: IterationData) -> Result<()> {
        let expected = self.n_iterations() + 1;
        if data.iteration != expected {
            return Err(Error::InvalidInput(format!(
                "expected iteration {expected}, got {}",
                data.iteration
            )));
        }
        data.validate()?;
        if data.n_particles != data.len() || data.seg_ids.iter().enumerate().any(|(i, &s)| i != s)
        {
            return Err(Error::InvalidInput(format!(
                "iteration {} must contain every walker in seg_id order",
                data.iteration
            )));
        }
        self.iterations.push(data);
        Ok(())
    }

    fn get(&self, iteration: u32) -> Result<&IterationData> {
        self.check_iteration(iteration)?;
        Ok(&self.iterations[iteration as usize - 1])
    }
}

impl IterationStore for MemoryIterationStore {
    fn n_iterations(&self) -> u32 {
        u32::try_from(self.iterations.len()).unwrap_or(u32::MAX)
    }

    fn n_particles(&self, iteration: u32) -> Result<usize> {
        Ok(self.get(iteration)?.n_particles)
    }

    fn read_iteration(&self, iteration: u32, selection: &SegSelection) -> Result<IterationData> {
        let data = self.get(iteration)?;
        match selection {
            SegSelection::All => Ok(data.clone()),
            SegSelection::Rows(_) => {
                let rows = selection.resolve(iteration, data.n_particles)?;
                Ok(data.take_rows(&rows))
            }
        }
    }

    fn read_parent_ids(&self, iteration: u32) -> Result<Array1<i64>> {
        Ok(self.get(iteration)?.parent_ids.clone())
    }

    fn summary(&self, iteration: u32) -> Result<IterationSummary> {
        Ok(IterationSummary::from_weights(&self.get(iteration)?.weights))
    }
}
