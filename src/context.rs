//! Analysis context - current iteration and scheme as an explicit value
//!
//! An [`AnalysisContext`] refreshes every enabled scheme once when it is
//! opened, then answers view, trace and children queries for its current
//! iteration and scheme. Changing either only changes the context's own
//! fields; views are rebuilt on demand.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{PipelineCache, SchemeDatasets};
use crate::config::AnalysisSettings;
use crate::lineage::{ChildrenOutcome, LineageEngine, LineageRecord};
use crate::scheme::{AnalysisScheme, SchemeRegistry, SchemeSelector};
use crate::store::{IterationStore, SegSelection};
use crate::view::IterationView;
use crate::{Error, Result};

/// Label reported for samples outside every state.
pub const UNKNOWN_STATE_LABEL: &str = "Unknown";

/// Store, schemes and fresh datasets, plus the current iteration.
pub struct AnalysisContext {
    store: Arc<dyn IterationStore>,
    registry: SchemeRegistry,
    datasets: BTreeMap<String, SchemeDatasets>,
    n_iterations: u32,
    iteration: u32,
}

impl std::fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("scheme", &self.registry.active().name())
            .field("iteration", &self.iteration)
            .field("n_iterations", &self.n_iterations)
            .finish_non_exhaustive()
    }
}

impl AnalysisContext {
    /// Build the registry from `settings` and refresh every enabled scheme.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid settings or `Error::StageFailure`
    /// if a dataset cannot be regenerated
    pub fn open(
        store: Arc<dyn IterationStore>,
        settings: &AnalysisSettings,
        cache: &PipelineCache,
    ) -> Result<Self> {
        Self::with_registry(store, SchemeRegistry::from_settings(settings)?, cache)
    }

    /// Refresh every enabled scheme of an existing registry.
    ///
    /// # Errors
    ///
    /// Returns `Error::StageFailure` if a dataset cannot be regenerated
    pub fn with_registry(
        store: Arc<dyn IterationStore>,
        registry: SchemeRegistry,
        cache: &PipelineCache,
    ) -> Result<Self> {
        let mut datasets = BTreeMap::new();
        for scheme in registry.enabled() {
            let fresh = cache.ensure_fresh(store.as_ref(), scheme)?;
            datasets.insert(scheme.name().to_string(), fresh);
        }
        let n_iterations = datasets
            .values()
            .map(|d| d.n_iterations)
            .min()
            .unwrap_or(0)
            .min(store.n_iterations());
        info!(
            schemes = datasets.len(),
            n_iterations,
            active = registry.active().name(),
            "analysis context ready"
        );
        Ok(Self {
            store,
            registry,
            datasets,
            n_iterations,
            iteration: 1,
        })
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &dyn IterationStore {
        self.store.as_ref()
    }

    /// Number of analyzable iterations.
    #[must_use]
    pub const fn n_iterations(&self) -> u32 {
        self.n_iterations
    }

    /// Current iteration.
    #[must_use]
    pub const fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Move to another iteration, clamped to `[1, n_iterations]`.
    ///
    /// Returns the iteration actually selected.
    pub fn set_iteration(&mut self, iteration: u32) -> u32 {
        let clamped = iteration.clamp(1, self.n_iterations.max(1));
        if clamped != iteration {
            warn!(
                requested = iteration,
                selected = clamped,
                n_iterations = self.n_iterations,
                "iteration out of range, clamping"
            );
        }
        self.iteration = clamped;
        clamped
    }

    /// Active scheme.
    #[must_use]
    pub fn scheme(&self) -> &AnalysisScheme {
        self.registry.active()
    }

    /// Switch scheme by name or index.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemeNotFound` or `Error::SchemeDisabled`; the active
    /// scheme is unchanged on error
    pub fn set_scheme(&mut self, selector: impl Into<SchemeSelector>) -> Result<&AnalysisScheme> {
        self.registry.set_active(selector)
    }

    /// Every scheme with its enabled flag, in declaration order.
    #[must_use]
    pub fn list_schemes(&self) -> Vec<(String, bool)> {
        self.registry
            .list()
            .iter()
            .map(|s| (s.name().to_string(), s.is_enabled()))
            .collect()
    }

    /// Fresh datasets of the active scheme.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemeNotFound` if the active scheme was not refreshed
    pub fn datasets(&self) -> Result<&SchemeDatasets> {
        let name = self.registry.active().name();
        self.datasets
            .get(name)
            .ok_or_else(|| Error::SchemeNotFound(name.to_string()))
    }

    /// View of the whole current iteration.
    ///
    /// # Errors
    ///
    /// Returns error if the iteration cannot be loaded
    pub fn current(&self) -> Result<IterationView> {
        IterationView::load(
            self.store.as_ref(),
            self.iteration,
            self.datasets()?,
            &SegSelection::All,
        )
    }

    /// View of selected walkers of the current iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` for a walker outside the iteration
    pub fn current_rows(&self, selection: &SegSelection) -> Result<IterationView> {
        IterationView::load(self.store.as_ref(), self.iteration, self.datasets()?, selection)
    }

    fn lineage(&self) -> Result<LineageEngine<'_>> {
        Ok(LineageEngine::new(self.store.as_ref(), self.datasets()?))
    }

    /// Ancestry of a walker of the current iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` if `seg_id` is not a current walker
    pub fn trace(&self, seg_id: usize) -> Result<LineageRecord> {
        self.lineage()?.trace(seg_id, self.iteration)
    }

    /// Children of a walker of the current iteration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` if `seg_id` is not a current walker
    pub fn children(&self, seg_id: usize) -> Result<ChildrenOutcome> {
        self.lineage()?.children(seg_id, self.iteration)
    }

    /// Children outcome of every walker of the current iteration.
    ///
    /// # Errors
    ///
    /// Returns error if the next iteration cannot be loaded
    pub fn future(&self) -> Result<Vec<ChildrenOutcome>> {
        self.lineage()?.children_all(self.iteration)
    }

    /// Walker count of the current iteration.
    ///
    /// # Errors
    ///
    /// Returns error if the iteration cannot be read
    pub fn walkers(&self) -> Result<usize> {
        self.store.n_particles(self.iteration)
    }

    /// Total walker count over iterations `1..=current`.
    ///
    /// # Errors
    ///
    /// Returns error if an iteration cannot be read
    pub fn aggregate_walkers(&self) -> Result<usize> {
        (1..=self.iteration)
            .map(|it| self.store.n_particles(it))
            .sum()
    }

    /// State labels of the active scheme followed by [`UNKNOWN_STATE_LABEL`].
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemeNotFound` if the active scheme was not refreshed
    pub fn state_labels(&self) -> Result<Vec<String>> {
        let mut labels = self.datasets()?.assign.data.state_labels().to_vec();
        labels.push(UNKNOWN_STATE_LABEL.to_string());
        Ok(labels)
    }

    /// Bin labels of the active scheme.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemeNotFound` if the active scheme was not refreshed
    pub fn bin_labels(&self) -> Result<Vec<String>> {
        Ok(self.datasets()?.assign.data.bin_labels().to_vec())
    }
}
