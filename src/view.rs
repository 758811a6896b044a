//! Iteration views
//!
//! An [`IterationView`] joins one iteration's raw walker arrays with the
//! scheme's assignment labels and the kinetics blocks that cover the
//! iteration. Views are immutable snapshots: build a new one when the
//! iteration or scheme changes.
//!
//! Bulk access goes through [`ViewKey`] (a fixed key set); single walkers
//! through [`IterationView::walker`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};

use crate::cache::SchemeDatasets;
use crate::stages::{EvolutionBlock, EvolutionKind, IterationAssignments, KineticsDataset};
use crate::store::{IterationData, IterationStore, IterationSummary, SegSelection};
use crate::{Error, Result};

/// One walker of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkerView {
    /// Iteration the walker belongs to
    pub iteration: u32,
    /// Walker index within the iteration
    pub seg_id: usize,
    /// Statistical weight
    pub weight: f64,
    /// Parent in the previous iteration; negative = no tracked predecessor
    pub parent_id: i64,
    /// Progress coordinate samples, shape `[T, D]`
    pub pcoord: Array2<f64>,
    /// Auxiliary samples, shape `[T]` each
    pub auxdata: BTreeMap<String, Array1<f64>>,
    /// State label per sample
    pub states: Array1<u32>,
    /// Bin label per sample
    pub bins: Array1<u32>,
}

impl WalkerView {
    /// Walker at `position` of a loaded record, labelled from `labels`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` if `position` is not a loaded row and
    /// `Error::StorageError` if the walker has no assignment labels
    pub(crate) fn from_rows(
        data: &IterationData,
        labels: &IterationAssignments,
        position: usize,
    ) -> Result<Self> {
        let seg_id = *data.seg_ids.get(position).ok_or(Error::InvalidIndex {
            seg_id: position,
            iteration: data.iteration,
            n_particles: data.len(),
        })?;
        if seg_id >= labels.bins.nrows() {
            return Err(Error::StorageError(format!(
                "iteration {}: seg_id {seg_id} has no assignment labels",
                data.iteration
            )));
        }
        Ok(Self::assemble(
            data,
            position,
            labels.states.row(seg_id),
            labels.bins.row(seg_id),
        ))
    }

    fn assemble(
        data: &IterationData,
        position: usize,
        states: ArrayView1<'_, u32>,
        bins: ArrayView1<'_, u32>,
    ) -> Self {
        Self {
            iteration: data.iteration,
            seg_id: data.seg_ids[position],
            weight: data.weights[position],
            parent_id: data.parent_ids[position],
            pcoord: data.pcoord.slice(s![position, .., ..]).to_owned(),
            auxdata: data
                .auxdata
                .iter()
                .map(|(name, values)| (name.clone(), values.row(position).to_owned()))
                .collect(),
            states: states.to_owned(),
            bins: bins.to_owned(),
        }
    }

    /// State at the last sample.
    #[must_use]
    pub fn final_state(&self) -> Option<u32> {
        self.states.last().copied()
    }
}

/// Kinetics blocks covering one iteration.
///
/// A missing block (e.g. no 2D estimate before iteration 2) is `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KineticsIteration {
    /// `conditional_flux_evolution` block
    pub conditional_flux: Option<EvolutionBlock>,
    /// `rate_evolution` block
    pub rate: Option<EvolutionBlock>,
    /// `state_pop_evolution` block
    pub state_pop: Option<EvolutionBlock>,
    /// `color_prob_evolution` block
    pub color_prob: Option<EvolutionBlock>,
}

impl KineticsIteration {
    /// Blocks of `dataset` that contain `iteration`.
    #[must_use]
    pub fn from_dataset(dataset: &KineticsDataset, iteration: u32) -> Self {
        let block = |kind| dataset.block_for_iteration(kind, iteration);
        Self {
            conditional_flux: block(EvolutionKind::ConditionalFluxEvolution),
            rate: block(EvolutionKind::RateEvolution),
            state_pop: block(EvolutionKind::StatePopEvolution),
            color_prob: block(EvolutionKind::ColorProbEvolution),
        }
    }

    /// Block by kind.
    #[must_use]
    pub const fn get(&self, kind: EvolutionKind) -> Option<&EvolutionBlock> {
        match kind {
            EvolutionKind::ConditionalFluxEvolution => self.conditional_flux.as_ref(),
            EvolutionKind::RateEvolution => self.rate.as_ref(),
            EvolutionKind::StatePopEvolution => self.state_pop.as_ref(),
            EvolutionKind::ColorProbEvolution => self.color_prob.as_ref(),
        }
    }
}

/// Reweighting results for a view, or the marker that post-analysis is off.
#[derive(Debug, Clone, PartialEq)]
pub enum Reweighting {
    /// Scheme runs post-analysis
    Enabled {
        /// Reweighted kinetics blocks covering the iteration
        kinetics: KineticsIteration,
        /// Instantaneous bin flux, dense `[nbins, nbins]`
        instant_matrix: Array2<f64>,
    },
    /// Scheme does not run post-analysis
    NotEnabled,
}

impl Reweighting {
    /// Whether reweighting data is present.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// Fixed key set of an [`IterationView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKey {
    /// `"iteration"`
    Iteration,
    /// `"seg_id"`
    SegId,
    /// `"weights"`
    Weights,
    /// `"parents"`
    Parents,
    /// `"pcoord"`
    Pcoord,
    /// `"auxdata"`
    Auxdata,
    /// `"states"`
    States,
    /// `"bins"`
    Bins,
    /// `"summary"`
    Summary,
    /// `"walkers"`
    Walkers,
    /// `"direct"`
    Direct,
    /// `"reweight"`
    Reweight,
    /// `"instant_matrix"`
    InstantMatrix,
}

impl ViewKey {
    /// Every key, in listing order.
    pub const ALL: [Self; 13] = [
        Self::Iteration,
        Self::SegId,
        Self::Weights,
        Self::Parents,
        Self::Pcoord,
        Self::Auxdata,
        Self::States,
        Self::Bins,
        Self::Summary,
        Self::Walkers,
        Self::Direct,
        Self::Reweight,
        Self::InstantMatrix,
    ];

    /// Textual key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iteration => "iteration",
            Self::SegId => "seg_id",
            Self::Weights => "weights",
            Self::Parents => "parents",
            Self::Pcoord => "pcoord",
            Self::Auxdata => "auxdata",
            Self::States => "states",
            Self::Bins => "bins",
            Self::Summary => "summary",
            Self::Walkers => "walkers",
            Self::Direct => "direct",
            Self::Reweight => "reweight",
            Self::InstantMatrix => "instant_matrix",
        }
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown view key '{s}'")))
    }
}

/// Bulk value behind a [`ViewKey`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewField<'a> {
    /// Scalar count (`iteration`, `walkers`)
    Count(usize),
    /// `seg_id` of each loaded row
    SegIds(&'a [usize]),
    /// Weights
    Weights(&'a Array1<f64>),
    /// Parent pointers
    Parents(&'a Array1<i64>),
    /// Progress coordinates `[rows, T, D]`
    Pcoord(&'a Array3<f64>),
    /// Auxiliary arrays `[rows, T]`
    Auxdata(&'a BTreeMap<String, Array2<f64>>),
    /// State or bin labels `[rows, T]`
    Labels(&'a Array2<u32>),
    /// Iteration summary
    Summary(&'a IterationSummary),
    /// Direct kinetics blocks
    Kinetics(&'a KineticsIteration),
    /// Reweighting results or the disabled marker
    Reweighting(&'a Reweighting),
    /// Dense matrix
    Matrix(&'a Array2<f64>),
    /// Post-analysis disabled for this scheme
    NotEnabled,
}

/// One iteration joined with its scheme's derived data.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationView {
    scheme: String,
    data: IterationData,
    summary: IterationSummary,
    states: Array2<u32>,
    bins: Array2<u32>,
    direct: KineticsIteration,
    reweight: Reweighting,
}

impl IterationView {
    /// Load the selected walkers of `iteration`.
    ///
    /// # Errors
    ///
    /// Returns `Error::IterationOutOfRange` if the iteration is not covered
    /// by both the store and the datasets, `Error::InvalidIndex` for a bad
    /// selection, or a storage error from the store
    pub fn load(
        store: &dyn IterationStore,
        iteration: u32,
        datasets: &SchemeDatasets,
        selection: &SegSelection,
    ) -> Result<Self> {
        store.check_iteration(iteration)?;
        let labels = datasets.assign.data.iteration(iteration)?;
        let data = store.read_iteration(iteration, selection)?;
        data.validate()?;

        let summary = match selection {
            SegSelection::All => IterationSummary::from_weights(&data.weights),
            SegSelection::Rows(_) => store.summary(iteration)?,
        };
        if let Some(&bad) = data.seg_ids.iter().find(|&&seg| seg >= labels.bins.nrows()) {
            return Err(Error::StorageError(format!(
                "iteration {iteration}: seg_id {bad} has no assignment labels"
            )));
        }
        let states = labels.states.select(Axis(0), &data.seg_ids);
        let bins = labels.bins.select(Axis(0), &data.seg_ids);

        let reweight = match &datasets.reweight {
            Some(entry) => {
                let nbins = entry.data.nbins();
                Reweighting::Enabled {
                    kinetics: KineticsIteration::from_dataset(&entry.data, iteration),
                    instant_matrix: entry
                        .data
                        .instant_flux(iteration)
                        .map_or_else(|| Array2::zeros((nbins, nbins)), |f| f.to_dense(nbins)),
                }
            }
            None => Reweighting::NotEnabled,
        };

        Ok(Self {
            scheme: datasets.scheme.clone(),
            summary,
            states,
            bins,
            direct: KineticsIteration::from_dataset(&datasets.direct.data, iteration),
            reweight,
            data,
        })
    }

    /// Iteration index.
    #[must_use]
    pub const fn iteration(&self) -> u32 {
        self.data.iteration
    }

    /// Scheme the labels came from.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Walker count of the whole iteration.
    #[must_use]
    pub const fn walkers(&self) -> usize {
        self.data.n_particles
    }

    /// Number of loaded rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no rows were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iteration summary record.
    #[must_use]
    pub const fn summary(&self) -> &IterationSummary {
        &self.summary
    }

    /// Weights of the loaded rows.
    #[must_use]
    pub const fn weights(&self) -> &Array1<f64> {
        &self.data.weights
    }

    /// Parent pointers of the loaded rows.
    #[must_use]
    pub const fn parents(&self) -> &Array1<i64> {
        &self.data.parent_ids
    }

    /// `seg_id` of each loaded row.
    #[must_use]
    pub fn seg_ids(&self) -> &[usize] {
        &self.data.seg_ids
    }

    /// Progress coordinates `[rows, T, D]`.
    #[must_use]
    pub const fn pcoord(&self) -> &Array3<f64> {
        &self.data.pcoord
    }

    /// State labels `[rows, T]`.
    #[must_use]
    pub const fn states(&self) -> &Array2<u32> {
        &self.states
    }

    /// Bin labels `[rows, T]`.
    #[must_use]
    pub const fn bins(&self) -> &Array2<u32> {
        &self.bins
    }

    /// Direct kinetics blocks covering this iteration.
    #[must_use]
    pub const fn direct(&self) -> &KineticsIteration {
        &self.direct
    }

    /// Reweighting results, or [`Reweighting::NotEnabled`].
    #[must_use]
    pub const fn reweight(&self) -> &Reweighting {
        &self.reweight
    }

    /// The fixed key set.
    #[must_use]
    pub fn keys(&self) -> &'static [ViewKey] {
        &ViewKey::ALL
    }

    /// Bulk field by key.
    #[must_use]
    pub fn field(&self, key: ViewKey) -> ViewField<'_> {
        match key {
            ViewKey::Iteration => ViewField::Count(self.data.iteration as usize),
            ViewKey::SegId => ViewField::SegIds(&self.data.seg_ids),
            ViewKey::Weights => ViewField::Weights(&self.data.weights),
            ViewKey::Parents => ViewField::Parents(&self.data.parent_ids),
            ViewKey::Pcoord => ViewField::Pcoord(&self.data.pcoord),
            ViewKey::Auxdata => ViewField::Auxdata(&self.data.auxdata),
            ViewKey::States => ViewField::Labels(&self.states),
            ViewKey::Bins => ViewField::Labels(&self.bins),
            ViewKey::Summary => ViewField::Summary(&self.summary),
            ViewKey::Walkers => ViewField::Count(self.data.n_particles),
            ViewKey::Direct => ViewField::Kinetics(&self.direct),
            ViewKey::Reweight => ViewField::Reweighting(&self.reweight),
            ViewKey::InstantMatrix => match &self.reweight {
                Reweighting::Enabled { instant_matrix, .. } => ViewField::Matrix(instant_matrix),
                Reweighting::NotEnabled => ViewField::NotEnabled,
            },
        }
    }

    /// Bulk field by textual key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for a key outside the fixed set
    pub fn get(&self, key: &str) -> Result<ViewField<'_>> {
        Ok(self.field(key.parse()?))
    }

    /// Single walker by row position.
    ///
    /// For a full view the position is the `seg_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIndex` if `index` is not a loaded row
    pub fn walker(&self, index: usize) -> Result<WalkerView> {
        if index >= self.len() {
            return Err(Error::InvalidIndex {
                seg_id: index,
                iteration: self.data.iteration,
                n_particles: self.len(),
            });
        }
        Ok(WalkerView::assemble(
            &self.data,
            index,
            self.states.row(index),
            self.bins.row(index),
        ))
    }

    /// Heaviest walker; ties go to the lowest row. NaN weights are skipped.
    #[must_use]
    pub fn max_weight(&self) -> Option<WalkerView> {
        self.extreme_weight(|candidate, best| candidate > best)
    }

    /// Lightest walker; ties go to the lowest row. NaN weights are skipped.
    #[must_use]
    pub fn min_weight(&self) -> Option<WalkerView> {
        self.extreme_weight(|candidate, best| candidate < best)
    }

    fn extreme_weight(&self, better: impl Fn(f64, f64) -> bool) -> Option<WalkerView> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &w) in self.data.weights.iter().enumerate() {
            if w.is_nan() {
                continue;
            }
            match best {
                Some((_, current)) if !better(w, current) => {}
                _ => best = Some((i, w)),
            }
        }
        best.and_then(|(i, _)| self.walker(i).ok())
    }
}
