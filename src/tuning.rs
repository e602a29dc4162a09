//! Choosing Ewald parameters: the cheapest configuration whose predicted error meets the
//! accuracy target.
//!
//! The search is a generator of (mesh, order) candidates and a pure evaluator. For each
//! candidate, the evaluator finds the smallest real-space cutoff that meets the target,
//! with α balancing the real and reciprocal errors, and models the cost. Optionally, the
//! cheapest few are then timed on the actual system.

use std::time::{Duration, Instant};

use bincode::{Decode, Encode};
use itertools::iproduct;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    accuracy::{AccuracyModel, ErrorEstimate},
    ambient::SimBox,
    error::P3mError,
    fft::{largest_prime_factor, transform_cost_factor},
    params::{
        Differentiation, EwaldParams, MAX_MESH_DIM, MAX_MESH_POINTS, MAX_ORDER, P3mConfig,
        ParamOverrides,
    },
    particles::Particles,
    real_space::RealSpaceSolver,
    recip::ReciprocalSolver,
};

/// Smallest mesh edge the search starts from.
const MIN_MESH: usize = 4;
/// Analytic candidates timed when timing is enabled.
const TIMED_CANDIDATES: usize = 3;
/// Bisection steps for the cutoff.
const CUTOFF_BISECTION_STEPS: usize = 60;

// Relative cost weights, in units of one real-space pair interaction.
const COST_PAIR: f64 = 1.;
const COST_FFT: f64 = 0.1;
const COST_ASSIGN: f64 = 0.05;
const COST_MESH_POINT: f64 = 0.1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TunerState {
    #[default]
    Idle,
    Searching,
    Converged,
    Failed,
}

/// The outcome of a successful search. Persistable by the surrounding application with
/// `to_bytes` and `from_bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct TuningResult {
    pub params: EwaldParams,
    pub real_error: f64,
    pub recip_error: f64,
    pub total_error: f64,
    /// Modelled cost, in units of one real-space pair interaction.
    pub cost: f64,
    /// Measured wall time of one full evaluation, if timing was enabled.
    pub measured_secs: Option<f64>,
}

impl TuningResult {
    fn new(params: EwaldParams, estimate: ErrorEstimate, cost: f64) -> Self {
        Self {
            params,
            real_error: estimate.real,
            recip_error: estimate.recip,
            total_error: estimate.total,
            cost,
            measured_secs: None,
        }
    }

    pub fn estimate(&self) -> ErrorEstimate {
        ErrorEstimate::new(self.real_error, self.recip_error)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, P3mError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| P3mError::Persist(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, P3mError> {
        let (result, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| P3mError::Persist(e.to_string()))?;
        Ok(result)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub mesh: [usize; 3],
    pub order: usize,
}

/// Mesh sizes with no prime factor above 7, in `lo..=hi`.
pub fn smooth_sizes(lo: usize, hi: usize) -> Vec<usize> {
    (lo.max(1)..=hi)
        .filter(|n| largest_prime_factor(*n) <= 7)
        .collect()
}

/// The (mesh, order) pairs to evaluate. Meshes follow the box aspect ratio: each axis gets
/// the smallest fast transform size at least as fine as the longest axis' spacing.
#[derive(Clone, Debug)]
pub struct CandidateSpace {
    pub meshes: Vec<[usize; 3]>,
    pub orders: Vec<usize>,
}

impl CandidateSpace {
    pub fn new(cell: &SimBox, overrides: &ParamOverrides) -> Self {
        let orders = match overrides.order {
            Some(p) => vec![p],
            None => (1..=MAX_ORDER).collect(),
        };

        let meshes = match overrides.mesh {
            Some(m) => vec![m],
            None => {
                let sizes = smooth_sizes(1, MAX_MESH_DIM);
                let next_smooth = |target: f64| {
                    sizes
                        .iter()
                        .copied()
                        .find(|&n| n as f64 >= target - 1e-9)
                };

                let l = cell.lengths();
                let l_max = cell.max_edge();

                let mut meshes: Vec<[usize; 3]> = Vec::new();
                for &s in sizes.iter().filter(|&&s| s >= MIN_MESH) {
                    let mesh = [0, 1, 2].map(|a| next_smooth(s as f64 * l[a] / l_max));
                    let [Some(x), Some(y), Some(z)] = mesh else {
                        continue;
                    };
                    let mesh = [x, y, z];
                    if mesh.iter().product::<usize>() > MAX_MESH_POINTS {
                        break;
                    }
                    if meshes.last() != Some(&mesh) {
                        meshes.push(mesh);
                    }
                }
                meshes
            }
        };

        Self { meshes, orders }
    }

    pub fn iter(&self) -> impl Iterator<Item = Candidate> + '_ {
        iproduct!(self.meshes.iter(), self.orders.iter())
            .filter(|(mesh, order)| mesh.iter().all(|n| n >= *order))
            .map(|(mesh, order)| Candidate {
                mesh: *mesh,
                order: *order,
            })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// What evaluating one candidate gives.
#[derive(Clone, Copy, Debug)]
pub enum Evaluation {
    /// Meets the target, with the smallest cutoff that does.
    Valid(TuningResult),
    /// Can't meet the target even at the largest cutoff. Reports what that achieves.
    Invalid { params: EwaldParams, error: f64 },
}

/// Pure: maps a candidate to its parameters, predicted errors and cost.
#[derive(Clone, Copy, Debug)]
pub struct Evaluator {
    pub model: AccuracyModel,
    pub target: f64,
    pub overrides: ParamOverrides,
    pub differentiation: Differentiation,
}

impl Evaluator {
    fn params_at(&self, cand: Candidate, r_cut: f64) -> EwaldParams {
        let alpha = self
            .overrides
            .alpha
            .unwrap_or_else(|| self.model.alpha_for_cutoff(r_cut, self.target));

        EwaldParams {
            alpha,
            mesh: cand.mesh,
            order: cand.order,
            r_cut,
            differentiation: self.differentiation,
        }
    }

    pub fn evaluate(&self, cand: Candidate) -> Evaluation {
        let r_max = self.model.cell.max_cutoff();

        let (params, estimate) = match self.overrides.r_cut {
            // Nothing to resolve in real space. The largest cutoff keeps the cell grid coarse.
            None if self.model.is_trivial() => {
                let params = self.params_at(cand, r_max);
                (params, self.model.estimate(&params))
            }
            Some(r_cut) => {
                let params = self.params_at(cand, r_cut);
                (params, self.model.estimate(&params))
            }
            None => {
                let at_max = self.params_at(cand, r_max);
                let est_max = self.model.estimate(&at_max);
                if est_max.total > self.target {
                    return Evaluation::Invalid {
                        params: at_max,
                        error: est_max.total,
                    };
                }

                // The error falls as the cutoff grows; find the smallest cutoff that passes.
                let mut lo = 1e-3 * self.model.cell.min_edge();
                let mut hi = r_max;

                let at_lo = self.params_at(cand, lo);
                if self.model.estimate(&at_lo).total <= self.target {
                    hi = lo;
                } else {
                    for _ in 0..CUTOFF_BISECTION_STEPS {
                        let mid = 0.5 * (lo + hi);
                        if self.model.estimate(&self.params_at(cand, mid)).total <= self.target {
                            hi = mid;
                        } else {
                            lo = mid;
                        }
                    }
                }

                let params = self.params_at(cand, hi);
                (params, self.model.estimate(&params))
            }
        };

        if estimate.total > self.target {
            return Evaluation::Invalid {
                params,
                error: estimate.total,
            };
        }

        Evaluation::Valid(TuningResult::new(params, estimate, self.cost(&params)))
    }

    /// Modelled cost of one force evaluation: pair interactions, transforms, and charge
    /// assignment plus gathering.
    pub fn cost(&self, params: &EwaldParams) -> f64 {
        let n = self.model.summary.n_charged as f64;
        let density = n / self.model.cell.volume();

        let pairs = 0.5 * n * density * 4. / 3. * std::f64::consts::PI * params.r_cut.powi(3);

        let m = params.mesh_points() as f64;
        let transforms = 1. + params.differentiation.inverse_transforms() as f64;
        let fft_factor = params
            .mesh
            .iter()
            .map(|&n| transform_cost_factor(n))
            .sum::<f64>()
            / 3.;
        let fft = m * m.log2().max(1.) * transforms * fft_factor;

        // Spread one scalar, gather three components.
        let assign = n * (params.order as f64).powi(3) * 4.;

        COST_PAIR * pairs + COST_FFT * fft + COST_ASSIGN * assign + COST_MESH_POINT * m
    }
}

/// Runs the search. Re-entrant: each call starts from scratch, and keeps no history.
#[derive(Clone, Debug)]
pub struct Tuner {
    pub config: P3mConfig,
    state: TunerState,
    trials: usize,
}

impl Tuner {
    pub fn new(config: &P3mConfig) -> Self {
        Self {
            config: *config,
            state: TunerState::Idle,
            trials: 0,
        }
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    /// Candidate evaluations and timed runs in the most recent search.
    pub fn trials(&self) -> usize {
        self.trials
    }

    pub fn tune(&mut self, cell: &SimBox, particles: &Particles) -> Result<TuningResult, P3mError> {
        self.state = TunerState::Searching;
        self.trials = 0;

        let result = self.search(cell, particles);

        self.state = match result {
            Ok(_) => TunerState::Converged,
            Err(_) => TunerState::Failed,
        };
        result
    }

    fn check_budget(&self, start: Instant) -> Result<(), P3mError> {
        let elapsed = start.elapsed();
        let over_time = self
            .config
            .budget
            .time_limit()
            .is_some_and(|limit| elapsed > limit);

        if self.trials > self.config.budget.max_trials || over_time {
            return Err(P3mError::TuningTimeout {
                trials: self.trials,
                elapsed,
            });
        }
        Ok(())
    }

    fn search(&mut self, cell: &SimBox, particles: &Particles) -> Result<TuningResult, P3mError> {
        let config = self.config;
        config.validate()?;
        cell.validate()?;

        let overrides = config.overrides;
        if let Some(r_cut) = overrides.r_cut {
            cell.check_cutoff(r_cut)?;
        }
        if let Some(mesh) = overrides.mesh {
            EwaldParams::validate_mesh(mesh, overrides.order.unwrap_or(1))?;
        }

        let space = CandidateSpace::new(cell, &overrides);
        if space.is_empty() {
            return Err(P3mError::config(
                "no mesh and order combination is compatible with the overrides",
            ));
        }

        let evaluator = Evaluator {
            model: AccuracyModel::new(cell, particles.summary(), config.prefactor),
            target: config.accuracy,
            overrides,
            differentiation: config.differentiation,
        };

        let start = Instant::now();
        let mut valid = Vec::new();
        let mut best_invalid: Option<(f64, EwaldParams)> = None;

        for cand in space.iter() {
            self.trials += 1;
            self.check_budget(start)?;

            match evaluator.evaluate(cand) {
                Evaluation::Valid(result) => valid.push(result),
                Evaluation::Invalid { params, error } => {
                    if best_invalid.is_none_or(|(e, _)| error < e) {
                        best_invalid = Some((error, params));
                    }
                }
            }
        }

        if valid.is_empty() {
            let (best_error, best_params) = match best_invalid {
                Some((e, p)) => (e, Some(p)),
                None => (f64::INFINITY, None),
            };
            return Err(P3mError::TuningFailed {
                target: config.accuracy,
                best_error,
                best_params,
            });
        }

        valid.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        debug!(
            "Tuning: {} valid candidates of {} evaluated",
            valid.len(),
            self.trials
        );

        let mut chosen = valid[0];

        if config.timing_trials > 0 {
            let mut fastest: Option<TuningResult> = None;

            for cand in valid.iter().take(TIMED_CANDIDATES) {
                self.trials += 1;
                self.check_budget(start)?;

                let secs = time_evaluation(&cand.params, cell, particles, config)?;
                debug!(
                    "Timed mesh {:?}, order {}, r_cut {:.3}: {:.3} ms",
                    cand.params.mesh,
                    cand.params.order,
                    cand.params.r_cut,
                    secs * 1_000.
                );

                let timed = TuningResult {
                    measured_secs: Some(secs),
                    ..*cand
                };
                if fastest.is_none_or(|f| f.measured_secs.is_some_and(|t| secs < t)) {
                    fastest = Some(timed);
                }
            }

            if let Some(f) = fastest {
                chosen = f;
            }
        }

        info!(
            "Tuned P3M: α = {:.5}, mesh = {:?}, order = {}, r_cut = {:.4}, predicted error = {:.3e} \
             (real {:.3e}, reciprocal {:.3e}). Took {:.1} ms over {} trials",
            chosen.params.alpha,
            chosen.params.mesh,
            chosen.params.order,
            chosen.params.r_cut,
            chosen.total_error,
            chosen.real_error,
            chosen.recip_error,
            start.elapsed().as_secs_f64() * 1_000.,
            self.trials,
        );

        Ok(chosen)
    }
}

/// Mean wall time of a full evaluation (real space and mesh) with these parameters.
fn time_evaluation(
    params: &EwaldParams,
    cell: &SimBox,
    particles: &Particles,
    config: P3mConfig,
) -> Result<f64, P3mError> {
    let recip = ReciprocalSolver::new(params, cell)?;
    let real = RealSpaceSolver::new(params.alpha, params.r_cut, cell)?;

    let mut total = Duration::ZERO;
    for _ in 0..config.timing_trials {
        let start = Instant::now();
        real.compute(particles, config.prefactor)?;
        recip.compute(particles, config.prefactor);
        total += start.elapsed();
    }

    Ok(total.as_secs_f64() / config.timing_trials as f64)
}
