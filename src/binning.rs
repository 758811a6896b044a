//! Bin mapping and state definitions used by the assignment stage.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Serializable bin mapper definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BinMapperDef {
    /// Rectilinear grid, one sorted boundary list per progress-coordinate dimension
    RectilinearBinMapper {
        /// Boundaries per dimension
        boundaries: Vec<Vec<f64>>,
    },
}

impl BinMapperDef {
    /// Build the mapper, validating boundaries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a dimension has fewer than two boundaries
    /// or boundaries are not strictly increasing
    pub fn build(&self) -> Result<RectilinearBinMapper> {
        match self {
            Self::RectilinearBinMapper { boundaries } => RectilinearBinMapper::new(boundaries.clone()),
        }
    }
}

/// A named state, owning the bins its coordinates fall in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDef {
    /// State label
    pub label: String,
    /// Representative points (one progress-coordinate vector each)
    pub coords: Vec<Vec<f64>>,
}

/// Rectilinear bin mapper over a `D`-dimensional progress coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct RectilinearBinMapper {
    boundaries: Vec<Vec<f64>>,
    strides: Vec<usize>,
    nbins: usize,
}

impl RectilinearBinMapper {
    /// Create a mapper from per-dimension boundaries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on empty or unsorted boundaries
    pub fn new(boundaries: Vec<Vec<f64>>) -> Result<Self> {
        if boundaries.is_empty() {
            return Err(Error::Config("bin mapper needs at least one dimension".to_string()));
        }
        for (dim, bounds) in boundaries.iter().enumerate() {
            if bounds.len() < 2 {
                return Err(Error::Config(format!(
                    "dimension {dim} needs at least two bin boundaries"
                )));
            }
            if bounds.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::Config(format!(
                    "bin boundaries for dimension {dim} must be strictly increasing"
                )));
            }
        }

        // Row-major: last dimension varies fastest
        let mut strides = vec![1; boundaries.len()];
        for dim in (0..boundaries.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * (boundaries[dim + 1].len() - 1);
        }
        let nbins = boundaries.iter().map(|b| b.len() - 1).product();

        Ok(Self {
            boundaries,
            strides,
            nbins,
        })
    }

    /// Number of bins.
    #[must_use]
    pub const fn nbins(&self) -> usize {
        self.nbins
    }

    /// Progress-coordinate dimensionality.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.boundaries.len()
    }

    /// Bin index of a coordinate, or `None` outside the grid or on a dimension mismatch.
    #[must_use]
    pub fn assign(&self, coord: &[f64]) -> Option<usize> {
        if coord.len() != self.boundaries.len() {
            return None;
        }
        let mut index = 0;
        for ((&x, bounds), stride) in coord.iter().zip(&self.boundaries).zip(&self.strides) {
            if x.is_nan() || x < bounds[0] || x >= bounds[bounds.len() - 1] {
                return None;
            }
            let upper = bounds.partition_point(|&b| b <= x);
            index += (upper - 1) * stride;
        }
        Some(index)
    }

    /// Human-readable label per bin, e.g. `[(0, 2.8)]`.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        (0..self.nbins)
            .map(|bin| {
                let parts: Vec<String> = self
                    .boundaries
                    .iter()
                    .zip(&self.strides)
                    .map(|(bounds, stride)| {
                        let i = (bin / stride) % (bounds.len() - 1);
                        format!("({}, {})", bounds[i], bounds[i + 1])
                    })
                    .collect();
                format!("[{}]", parts.join(", "))
            })
            .collect()
    }

    /// Bin owned by each state, resolved from the state's coordinates.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a state coordinate falls outside the grid
    pub fn state_bins(&self, states: &[StateDef]) -> Result<Vec<Vec<usize>>> {
        states
            .iter()
            .map(|state| {
                let mut bins = state
                    .coords
                    .iter()
                    .map(|coord| {
                        self.assign(coord).ok_or_else(|| {
                            Error::Config(format!(
                                "state '{}' coordinate {coord:?} is outside the bin space",
                                state.label
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                bins.sort_unstable();
                bins.dedup();
                Ok(bins)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> RectilinearBinMapper {
        RectilinearBinMapper::new(vec![vec![0.0, 2.8, 7.0, 10000.0]]).unwrap()
    }

    #[test]
    fn test_assign_one_dimension() {
        let m = mapper();
        assert_eq!(m.nbins(), 3);
        assert_eq!(m.assign(&[0.0]), Some(0));
        assert_eq!(m.assign(&[2.7]), Some(0));
        assert_eq!(m.assign(&[2.8]), Some(1));
        assert_eq!(m.assign(&[7.0]), Some(2));
        assert_eq!(m.assign(&[-1.0]), None);
        assert_eq!(m.assign(&[10000.0]), None);
    }

    #[test]
    fn test_assign_two_dimensions_row_major() {
        let m = RectilinearBinMapper::new(vec![vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0, 3.0]])
            .unwrap();
        assert_eq!(m.nbins(), 6);
        assert_eq!(m.assign(&[0.5, 0.5]), Some(0));
        assert_eq!(m.assign(&[0.5, 2.5]), Some(2));
        assert_eq!(m.assign(&[1.5, 0.5]), Some(3));
        assert_eq!(m.assign(&[1.5]), None);
    }

    #[test]
    fn test_labels_follow_bin_order() {
        let labels = mapper().labels();
        assert_eq!(labels[0], "[(0, 2.8)]");
        assert_eq!(labels[2], "[(7, 10000)]");
    }

    #[test]
    fn test_state_bins() {
        let states = vec![
            StateDef {
                label: "unbound".to_string(),
                coords: vec![vec![7.0]],
            },
            StateDef {
                label: "bound".to_string(),
                coords: vec![vec![2.7], vec![1.0]],
            },
        ];
        assert_eq!(mapper().state_bins(&states).unwrap(), vec![vec![2], vec![0]]);
    }

    #[test]
    fn test_unsorted_boundaries_rejected() {
        assert!(RectilinearBinMapper::new(vec![vec![1.0, 0.0]]).is_err());
        assert!(RectilinearBinMapper::new(vec![vec![1.0]]).is_err());
    }
}
