//! Kinetics estimators
//!
//! Both estimators work on "colors": a walker's color is the last state it
//! visited, inherited from its parent across iterations. Walkers that have
//! not visited any state yet carry the unknown color and contribute no flux.
//!
//! - `direct` averages per-iteration color-to-state fluxes, color
//!   probabilities and state populations over each evolution window.
//! - `reweight` aggregates the window's bin transitions into a Markov
//!   matrix, augments it with colors and reports its steady state.

use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use tracing::debug;

use super::kinetics::windows;
use super::{
    AssignDataset, EvolutionEntry, EvolutionKind, KineticsConfig, KineticsDataset, SparseFlux,
    StageContext,
};
use crate::cache::DatasetName;
use crate::store::SegSelection;
use crate::{Error, Result};

const MAX_POWER_STEPS: usize = 100_000;
const POWER_TOLERANCE: f64 = 1e-13;

struct IterationWeights {
    weights: Array1<f64>,
    parent_ids: Array1<i64>,
}

fn read_weights(ctx: &StageContext<'_>, assign: &AssignDataset) -> Result<Vec<IterationWeights>> {
    ctx.pool.install(|| {
        (1..=ctx.n_iterations)
            .into_par_iter()
            .map(|iteration| {
                let data = ctx.store.read_iteration(iteration, &SegSelection::All)?;
                let labels = assign.iteration(iteration)?;
                if labels.bins.nrows() != data.len() {
                    return Err(Error::InvalidInput(format!(
                        "iteration {iteration}: assignment has {} walkers, store has {}",
                        labels.bins.nrows(),
                        data.len()
                    )));
                }
                Ok(IterationWeights {
                    weights: data.weights,
                    parent_ids: data.parent_ids,
                })
            })
            .collect()
    })
}

/// Per-iteration observables of the direct estimator.
struct DirectObservables {
    /// `[nstates, nstates]`, weight arriving in state `j` while colored `i`
    flux: Array2<f64>,
    /// Weight per color at the start of the iteration
    start_color_prob: Array1<f64>,
    /// Weight per color at the end of the iteration
    end_color_prob: Array1<f64>,
    /// Weight per state at the last sample
    state_pop: Array1<f64>,
}

fn direct_observables(
    assign: &AssignDataset,
    weights: &[IterationWeights],
) -> Result<Vec<DirectObservables>> {
    let nstates = assign.nstates();
    let unknown = assign.unknown_state();
    let mut previous_colors: Vec<u32> = Vec::new();
    let mut out = Vec::with_capacity(weights.len());

    for (i, record) in weights.iter().enumerate() {
        let iteration = u32::try_from(i + 1).unwrap_or(u32::MAX);
        let labels = assign.iteration(iteration)?;
        let last = labels.states.ncols().saturating_sub(1);
        let mut obs = DirectObservables {
            flux: Array2::zeros((nstates, nstates)),
            start_color_prob: Array1::zeros(nstates),
            end_color_prob: Array1::zeros(nstates),
            state_pop: Array1::zeros(nstates),
        };
        let mut colors = Vec::with_capacity(record.weights.len());

        for (w, &weight) in record.weights.iter().enumerate() {
            let inherited = usize::try_from(record.parent_ids[w])
                .ok()
                .and_then(|p| previous_colors.get(p).copied());
            let mut color = inherited.unwrap_or(labels.states[[w, 0]]);
            if color != unknown {
                obs.start_color_prob[color as usize] += weight;
            }
            for &state in labels.states.row(w) {
                if state == unknown || state == color {
                    continue;
                }
                if color != unknown {
                    obs.flux[[color as usize, state as usize]] += weight;
                }
                color = state;
            }
            if color != unknown {
                obs.end_color_prob[color as usize] += weight;
            }
            let final_state = labels.states[[w, last]];
            if final_state != unknown {
                obs.state_pop[final_state as usize] += weight;
            }
            colors.push(color);
        }

        previous_colors = colors;
        out.push(obs);
    }
    Ok(out)
}

fn scaled(entry: EvolutionEntry, divisor: f64) -> EvolutionEntry {
    if divisor <= 0.0 {
        return EvolutionEntry::point(entry.iter_start, entry.iter_stop, 0.0);
    }
    EvolutionEntry {
        expected: entry.expected / divisor,
        ci_lbound: entry.ci_lbound / divisor,
        ci_ubound: entry.ci_ubound / divisor,
        sterr: entry.sterr / divisor,
        ..entry
    }
}

fn window_values<F>(observables: &[DirectObservables], start: u32, stop: u32, f: F) -> Vec<f64>
where
    F: Fn(&DirectObservables) -> f64,
{
    (start..stop)
        .filter_map(|it| observables.get(it as usize - 1))
        .map(f)
        .collect()
}

/// Direct estimator over iterations `1..=ctx.n_iterations`.
///
/// # Errors
///
/// Returns error if the store cannot be read or disagrees with `assign`
pub fn direct(
    ctx: &StageContext<'_>,
    assign: &AssignDataset,
    config: &KineticsConfig,
) -> Result<KineticsDataset> {
    let weights = read_weights(ctx, assign)?;
    let observables = direct_observables(assign, &weights)?;
    let nstates = assign.nstates();
    let last = ctx.n_iterations;
    let mut dataset = KineticsDataset::new(
        DatasetName::Direct,
        nstates,
        assign.nbins(),
        config.step_iter,
        config.evolution,
    );

    for (start, stop) in windows(2, last, config.step_iter, config.evolution) {
        let mut flux_entries = Vec::with_capacity(nstates * nstates);
        let mut rate_entries = Vec::with_capacity(nstates * nstates);
        for i in 0..nstates {
            let pops = window_values(&observables, start, stop, |o| o.start_color_prob[i]);
            let mean_pop = EvolutionEntry::from_samples(start, stop, &pops).expected;
            for j in 0..nstates {
                let fluxes = window_values(&observables, start, stop, |o| o.flux[[i, j]]);
                let flux = EvolutionEntry::from_samples(start, stop, &fluxes);
                flux_entries.push(flux);
                rate_entries.push(scaled(flux, mean_pop));
            }
        }
        dataset.push_block(EvolutionKind::ConditionalFluxEvolution, flux_entries)?;
        dataset.push_block(EvolutionKind::RateEvolution, rate_entries)?;
    }

    for (start, stop) in windows(1, last, config.step_iter, config.evolution) {
        let pops = (0..nstates)
            .map(|s| {
                let values = window_values(&observables, start, stop, |o| o.state_pop[s]);
                EvolutionEntry::from_samples(start, stop, &values)
            })
            .collect();
        let colors = (0..nstates)
            .map(|c| {
                let values = window_values(&observables, start, stop, |o| o.end_color_prob[c]);
                EvolutionEntry::from_samples(start, stop, &values)
            })
            .collect();
        dataset.push_block(EvolutionKind::StatePopEvolution, pops)?;
        dataset.push_block(EvolutionKind::ColorProbEvolution, colors)?;
    }

    debug!(
        scheme = ctx.scheme,
        blocks = dataset.n_blocks(EvolutionKind::StatePopEvolution),
        "direct estimator finished"
    );
    Ok(dataset)
}

/// Steady-state quantities of one reweighting window.
struct WindowSolution {
    flux: Array2<f64>,
    rate: Array2<f64>,
    state_pop: Array1<f64>,
    color_prob: Array1<f64>,
}

fn instant_matrix(assign: &AssignDataset, iteration: u32, weights: &Array1<f64>) -> Result<Array2<f64>> {
    let labels = assign.iteration(iteration)?;
    let nbins = assign.nbins();
    let last = labels.bins.ncols().saturating_sub(1);
    let mut matrix = Array2::zeros((nbins, nbins));
    for (w, &weight) in weights.iter().enumerate() {
        let from = labels.bins[[w, 0]] as usize;
        let to = labels.bins[[w, last]] as usize;
        matrix[[from, to]] += weight;
    }
    Ok(matrix)
}

fn row_normalized(counts: &Array2<f64>) -> Array2<f64> {
    let mut transition = counts.clone();
    for (b, mut row) in transition.rows_mut().into_iter().enumerate() {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        } else {
            row[b] = 1.0;
        }
    }
    transition
}

/// Stationary distribution of a row-stochastic matrix.
///
/// Iterates the lazy chain `(I + T) / 2`, which has the same stationary
/// distribution and no periodic orbits.
fn steady_state(transition: &Array2<f64>, initial: Array1<f64>) -> Array1<f64> {
    let mut p = initial;
    for _ in 0..MAX_POWER_STEPS {
        let next = (&p + &p.dot(transition)) * 0.5;
        let delta = (&next - &p).mapv(f64::abs).sum();
        p = next;
        if delta < POWER_TOLERANCE {
            break;
        }
    }
    let total = p.sum();
    if total > 0.0 {
        p /= total;
    }
    p
}

fn solve_window(assign: &AssignDataset, counts: &Array2<f64>) -> WindowSolution {
    let nstates = assign.nstates();
    let nbins = assign.nbins();
    let transition = row_normalized(counts);

    let mut state_of_bin: Vec<Option<usize>> = vec![None; nbins];
    for (s, bins) in assign.state_bins().iter().enumerate() {
        for &b in bins {
            if b < nbins {
                state_of_bin[b] = Some(s);
            }
        }
    }

    // Colored chain over (bin, color); entering a state bin recolors the walker
    let m = nbins * nstates;
    let index = |b: usize, c: usize| b * nstates + c;
    let mut colored = Array2::zeros((m, m));
    for b in 0..nbins {
        for c in 0..nstates {
            for b2 in 0..nbins {
                let t = transition[[b, b2]];
                if t != 0.0 {
                    let c2 = state_of_bin[b2].unwrap_or(c);
                    colored[[index(b, c), index(b2, c2)]] += t;
                }
            }
        }
    }

    // Start from the observed bin occupancy; unvisited bins get no mass
    let occupancy = counts.sum_axis(Axis(1));
    let observed = occupancy.sum() > 0.0;
    let mut initial = Array1::zeros(m);
    for b in 0..nbins {
        let mass = if observed { occupancy[b] } else { 1.0 };
        match state_of_bin[b] {
            Some(s) => initial[index(b, s)] = mass,
            None => {
                for c in 0..nstates {
                    initial[index(b, c)] = mass;
                }
            }
        }
    }
    let p = if m == 0 {
        initial
    } else {
        steady_state(&colored, initial)
    };

    let mut state_pop = Array1::zeros(nstates);
    let mut color_prob = Array1::zeros(nstates);
    let mut flux = Array2::zeros((nstates, nstates));
    for b in 0..nbins {
        for c in 0..nstates {
            let mass = p[index(b, c)];
            color_prob[c] += mass;
            if let Some(s) = state_of_bin[b] {
                state_pop[s] += mass;
            }
            for b2 in 0..nbins {
                if let Some(s2) = state_of_bin[b2] {
                    if s2 != c {
                        flux[[c, s2]] += mass * transition[[b, b2]];
                    }
                }
            }
        }
    }

    let mut rate = flux.clone();
    for (c, mut row) in rate.rows_mut().into_iter().enumerate() {
        if color_prob[c] > 0.0 {
            row /= color_prob[c];
        } else {
            row.fill(0.0);
        }
    }

    WindowSolution {
        flux,
        rate,
        state_pop,
        color_prob,
    }
}

fn window_counts(matrices: &[Array2<f64>], nbins: usize, start: u32, stop: u32) -> Array2<f64> {
    let mut counts = Array2::zeros((nbins, nbins));
    for it in start..stop {
        if let Some(m) = matrices.get(it as usize - 1) {
            counts += m;
        }
    }
    counts
}

fn point_entries(values: impl Iterator<Item = f64>, start: u32, stop: u32) -> Vec<EvolutionEntry> {
    values
        .map(|v| EvolutionEntry::point(start, stop, v))
        .collect()
}

/// Reweighting estimator over iterations `1..=ctx.n_iterations`.
///
/// Also records every iteration's instantaneous bin flux matrix.
///
/// # Errors
///
/// Returns error if the store cannot be read or disagrees with `assign`
pub fn reweight(
    ctx: &StageContext<'_>,
    assign: &AssignDataset,
    config: &KineticsConfig,
) -> Result<KineticsDataset> {
    let weights = read_weights(ctx, assign)?;
    let nbins = assign.nbins();
    let last = ctx.n_iterations;

    let matrices: Vec<Array2<f64>> = ctx.pool.install(|| {
        weights
            .par_iter()
            .enumerate()
            .map(|(i, record)| {
                let iteration = u32::try_from(i + 1).unwrap_or(u32::MAX);
                instant_matrix(assign, iteration, &record.weights)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut dataset = KineticsDataset::new(
        DatasetName::Reweight,
        assign.nstates(),
        nbins,
        config.step_iter,
        config.evolution,
    );
    for (i, matrix) in matrices.iter().enumerate() {
        let iteration = u32::try_from(i + 1).unwrap_or(u32::MAX);
        dataset.set_instant_flux(iteration, SparseFlux::from_dense(matrix));
    }

    let solve_all = |origin: u32| -> Vec<(u32, u32, WindowSolution)> {
        let spans = windows(origin, last, config.step_iter, config.evolution);
        ctx.pool.install(|| {
            spans
                .into_par_iter()
                .map(|(start, stop)| {
                    let counts = window_counts(&matrices, nbins, start, stop);
                    (start, stop, solve_window(assign, &counts))
                })
                .collect()
        })
    };

    for (start, stop, solution) in solve_all(2) {
        dataset.push_block(
            EvolutionKind::ConditionalFluxEvolution,
            point_entries(solution.flux.iter().copied(), start, stop),
        )?;
        dataset.push_block(
            EvolutionKind::RateEvolution,
            point_entries(solution.rate.iter().copied(), start, stop),
        )?;
    }
    for (start, stop, solution) in solve_all(1) {
        dataset.push_block(
            EvolutionKind::StatePopEvolution,
            point_entries(solution.state_pop.iter().copied(), start, stop),
        )?;
        dataset.push_block(
            EvolutionKind::ColorProbEvolution,
            point_entries(solution.color_prob.iter().copied(), start, stop),
        )?;
    }

    debug!(
        scheme = ctx.scheme,
        blocks = dataset.n_blocks(EvolutionKind::StatePopEvolution),
        "reweight estimator finished"
    );
    Ok(dataset)
}
