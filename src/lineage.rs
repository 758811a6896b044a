//! Lineage Engine - ancestry and descendants of walkers
//!
//! Iterations only record a local parent pointer, so ancestry is rebuilt by
//! walking the pointers backwards one iteration at a time. Each step loads
//! the single parent row plus the whole parent-pointer array of the
//! iteration being left. Traces are independent: nothing is cached between
//! calls, so a trace costs one row load per iteration it covers.
//!
//! ```text
//! iteration:   1      2      3
//!              w1 <── w0 <── w1      trace(1, 3) = [1, 0, 1]
//! ```

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cache::SchemeDatasets;
use crate::stages::AssignDataset;
use crate::store::{IterationStore, SegSelection};
use crate::view::WalkerView;
use crate::{Error, Result};

/// Why a trace stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageEnd {
    /// Reached iteration 1
    Origin,
    /// The walker at `iteration` has a negative parent pointer
    Truncated {
        /// Oldest iteration in the record
        iteration: u32,
    },
}

/// Chronological ancestry of one walker (oldest first).
#[derive(Debug, Clone, PartialEq)]
pub struct LineageRecord {
    walkers: Vec<WalkerView>,
    end: LineageEnd,
}

impl LineageRecord {
    /// Snapshots, oldest iteration first.
    #[must_use]
    pub fn walkers(&self) -> &[WalkerView] {
        &self.walkers
    }

    /// How the trace ended.
    #[must_use]
    pub const fn end(&self) -> LineageEnd {
        self.end
    }

    /// Whether the lineage reaches iteration 1.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.end, LineageEnd::Origin)
    }

    /// Number of iterations covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.walkers.len()
    }

    /// Whether the record is empty (never true for a successful trace).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.walkers.is_empty()
    }

    /// Iteration of each snapshot.
    #[must_use]
    pub fn iterations(&self) -> Vec<u32> {
        self.walkers.iter().map(|w| w.iteration).collect()
    }

    /// `seg_id` of each snapshot.
    #[must_use]
    pub fn seg_ids(&self) -> Vec<usize> {
        self.walkers.iter().map(|w| w.seg_id).collect()
    }

    /// Weight of each snapshot.
    #[must_use]
    pub fn weights(&self) -> Vec<f64> {
        self.walkers.iter().map(|w| w.weight).collect()
    }

    /// Snapshot at `iteration`, if covered.
    #[must_use]
    pub fn at_iteration(&self, iteration: u32) -> Option<&WalkerView> {
        self.walkers.iter().find(|w| w.iteration == iteration)
    }
}

/// Children of one walker in the next iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildrenRecord {
    /// Iteration of the parent
    pub iteration: u32,
    /// Parent walker
    pub seg_id: usize,
    /// Children in `iteration + 1`, in `seg_id` order (never empty)
    pub children: Vec<WalkerView>,
}

impl ChildrenRecord {
    /// `seg_id` of each child.
    #[must_use]
    pub fn seg_ids(&self) -> Vec<usize> {
        self.children.iter().map(|w| w.seg_id).collect()
    }
}

/// Result of a children query.
///
/// Branch on this before touching child data: a walker with no children is
/// [`ChildrenOutcome::Childless`], never an empty record.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildrenOutcome {
    /// The queried iteration is the last one
    NoNextIteration,
    /// No walker of the next iteration points at this one
    Childless,
    /// At least one child
    Children(ChildrenRecord),
}

impl ChildrenOutcome {
    /// Child record, if any.
    #[must_use]
    pub const fn record(&self) -> Option<&ChildrenRecord> {
        match self {
            Self::Children(record) => Some(record),
            Self::NoNextIteration | Self::Childless => None,
        }
    }
}

/// Trace and children queries against one scheme's labels.
///
/// Read-only; any number of engines may query the same store concurrently.
#[derive(Clone, Copy)]
pub struct LineageEngine<'a> {
    store: &'a dyn IterationStore,
    assign: &'a AssignDataset,
    n_iterations: u32,
}

impl<'a> LineageEngine<'a> {
    /// Engine over `store`, labelled with the scheme's `assign` dataset.
    ///
    /// Queries are limited to iterations covered by both.
    #[must_use]
    pub fn new(store: &'a dyn IterationStore, datasets: &'a SchemeDatasets) -> Self {
        Self {
            store,
            assign: &datasets.assign.data,
            n_iterations: store.n_iterations().min(datasets.assign.data.n_iterations()),
        }
    }

    /// Last iteration queries may touch.
    #[must_use]
    pub const fn n_iterations(&self) -> u32 {
        self.n_iterations
    }

    fn check_walker(&self, seg_id: usize, iteration: u32) -> Result<()> {
        if iteration == 0 || iteration > self.n_iterations {
            return Err(Error::IterationOutOfRange {
                iteration,
                n_iterations: self.n_iterations,
            });
        }
        let n_particles = self.store.n_particles(iteration)?;
        if seg_id >= n_particles {
            return Err(Error::InvalidIndex {
                seg_id,
                iteration,
                n_particles,
            });
        }
        Ok(())
    }

    fn load_walker(&self, seg_id: usize, iteration: u32) -> Result<WalkerView> {
        let data = self
            .store
            .read_iteration(iteration, &SegSelection::one(seg_id))?;
        WalkerView::from_rows(&data, self.assign.iteration(iteration)?, 0)
    }

    /// Ancestry of `seg_id` at `from_iteration`, oldest first.
    ///
    /// Stops at iteration 1 or at the first negative parent pointer; a
    /// truncated lineage is a normal result, reported by
    /// [`LineageRecord::end`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` if `seg_id` is not a walker of
    /// `from_iteration`, `Error::IterationOutOfRange` for a bad iteration,
    /// and `Error::StorageError` if a parent pointer leads outside the
    /// previous iteration
    pub fn trace(&self, seg_id: usize, from_iteration: u32) -> Result<LineageRecord> {
        self.check_walker(seg_id, from_iteration)?;

        let mut walkers = Vec::with_capacity(from_iteration as usize);
        let mut iteration = from_iteration;
        let mut seg = seg_id;
        let end = loop {
            walkers.push(self.load_walker(seg, iteration)?);
            if iteration == 1 {
                break LineageEnd::Origin;
            }

            let parents = self.store.read_parent_ids(iteration)?;
            let parent = *parents.get(seg).ok_or(Error::InvalidIndex {
                seg_id: seg,
                iteration,
                n_particles: parents.len(),
            })?;
            let Ok(parent) = usize::try_from(parent) else {
                break LineageEnd::Truncated { iteration };
            };

            let previous = iteration - 1;
            let n_previous = self.store.n_particles(previous)?;
            if parent >= n_previous {
                return Err(Error::StorageError(format!(
                    "iteration {iteration} seg_id {seg}: parent {parent} is outside \
                     iteration {previous} ({n_previous} walkers)"
                )));
            }
            seg = parent;
            iteration = previous;
        };

        walkers.reverse();
        debug!(
            seg_id,
            from_iteration,
            length = walkers.len(),
            end = ?end,
            "trace complete"
        );
        Ok(LineageRecord { walkers, end })
    }

    /// Walkers of `from_iteration + 1` whose parent is `seg_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` if `seg_id` is not a walker of
    /// `from_iteration`, or `Error::IterationOutOfRange` for a bad iteration
    pub fn children(&self, seg_id: usize, from_iteration: u32) -> Result<ChildrenOutcome> {
        self.check_walker(seg_id, from_iteration)?;
        if from_iteration == self.n_iterations {
            return Ok(ChildrenOutcome::NoNextIteration);
        }

        let next = from_iteration + 1;
        let parents = self.store.read_parent_ids(next)?;
        let rows: Vec<usize> = parents
            .iter()
            .enumerate()
            .filter(|&(_, &p)| usize::try_from(p).ok() == Some(seg_id))
            .map(|(i, _)| i)
            .collect();
        if rows.is_empty() {
            return Ok(ChildrenOutcome::Childless);
        }

        let data = self.store.read_iteration(next, &SegSelection::Rows(rows))?;
        let labels = self.assign.iteration(next)?;
        let children = (0..data.len())
            .map(|pos| WalkerView::from_rows(&data, labels, pos))
            .collect::<Result<Vec<_>>>()?;
        Ok(ChildrenOutcome::Children(ChildrenRecord {
            iteration: from_iteration,
            seg_id,
            children,
        }))
    }

    /// Children outcome of every walker of `from_iteration`, by `seg_id`.
    ///
    /// Reads the next iteration once instead of once per walker.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` for a bad iteration
    pub fn children_all(&self, from_iteration: u32) -> Result<Vec<ChildrenOutcome>> {
        if from_iteration == 0 || from_iteration > self.n_iterations {
            return Err(Error::IterationOutOfRange {
                iteration: from_iteration,
                n_iterations: self.n_iterations,
            });
        }
        let walkers = self.store.n_particles(from_iteration)?;
        if from_iteration == self.n_iterations {
            return Ok(vec![ChildrenOutcome::NoNextIteration; walkers]);
        }

        let next = from_iteration + 1;
        let data = self.store.read_iteration(next, &SegSelection::All)?;
        let labels = self.assign.iteration(next)?;

        let mut by_parent: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for (pos, &parent) in data.parent_ids.iter().enumerate() {
            if let Ok(parent) = usize::try_from(parent) {
                by_parent.entry(parent).or_default().push(pos);
            }
        }

        (0..walkers)
            .map(|seg_id| match by_parent.get(&seg_id) {
                None => Ok(ChildrenOutcome::Childless),
                Some(positions) => {
                    let children = positions
                        .iter()
                        .map(|&pos| WalkerView::from_rows(&data, labels, pos))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(ChildrenOutcome::Children(ChildrenRecord {
                        iteration: from_iteration,
                        seg_id,
                        children,
                    }))
                }
            })
            .collect()
    }
}
