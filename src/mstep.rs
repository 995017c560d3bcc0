//! Item parameter updates (the M-step).
//!
//! Each item is fitted independently by maximizing the expected complete
//! data log-likelihood `Q = sum_q sum_k n_qk ln P_k(theta_q)` with Fisher
//! scoring. The 1PL shared slope gets its own one-dimensional ascent over
//! the summed objective of all items. A 3PL item's objective also carries
//! the Beta log-prior of its lower asymptote.

use ndarray::{Array2, ArrayView1};

use crate::config::{GuessingPrior, NewtonSettings, ParameterBounds};
use crate::error::{IrtError, IrtResult};
use crate::models::{ItemModel, ModelFamily};
use crate::quadrature::AbilityGrid;
use crate::utils::{EPSILON, clamped_ln, solve_spd};

const RIDGE: f64 = 1e-6;
/// Index of the lower asymptote in a 3PL parameter vector.
const GUESSING: usize = 2;
const PRIOR_FLOOR: f64 = 1e-6;

/// Support points with the (expected or observed) category counts at each.
#[derive(Debug, Clone)]
pub struct ItemSufficientStats {
    pub thetas: Vec<f64>,
    /// One row per support point, one column per category.
    pub counts: Array2<f64>,
}

impl ItemSufficientStats {
    /// Grid nodes paired with expected counts from the E-step.
    pub fn from_expected(grid: &AbilityGrid, counts: Array2<f64>) -> Self {
        Self {
            thetas: grid.nodes().to_vec(),
            counts,
        }
    }

    /// One-hot counts at point estimates of ability. Missing responses and
    /// respondents without a finite ability are skipped.
    pub fn from_observations(
        abilities: &[f64],
        responses: ArrayView1<'_, i32>,
        n_categories: usize,
    ) -> Self {
        let kept: Vec<(f64, usize)> = abilities
            .iter()
            .zip(responses.iter())
            .filter(|&(theta, &x)| theta.is_finite() && x >= 0 && (x as usize) < n_categories)
            .map(|(&theta, &x)| (theta, x as usize))
            .collect();
        let mut counts = Array2::zeros((kept.len(), n_categories));
        let mut thetas = Vec::with_capacity(kept.len());
        for (row, (theta, k)) in kept.into_iter().enumerate() {
            counts[[row, k]] = 1.0;
            thetas.push(theta);
        }
        Self { thetas, counts }
    }

    pub fn total(&self) -> f64 {
        self.counts.sum()
    }
}

pub fn expected_log_likelihood(
    model: &dyn ItemModel,
    stats: &ItemSufficientStats,
    params: &[f64],
) -> f64 {
    stats
        .thetas
        .iter()
        .zip(stats.counts.rows())
        .map(|(&theta, counts)| {
            let probs = model.category_probabilities(theta, params);
            counts
                .iter()
                .zip(&probs)
                .filter(|&(&n, _)| n > 0.0)
                .map(|(&n, &p)| n * clamped_ln(p))
                .sum::<f64>()
        })
        .sum()
}

/// Beta log-density of `c` up to a constant, its derivative and its
/// negative second derivative.
fn guessing_log_prior(prior: &GuessingPrior, c: f64) -> (f64, f64, f64) {
    let c = c.clamp(PRIOR_FLOOR, 1.0 - PRIOR_FLOOR);
    let (a1, b1) = (prior.alpha - 1.0, prior.beta - 1.0);
    (
        a1 * c.ln() + b1 * (1.0 - c).ln(),
        a1 / c - b1 / (1.0 - c),
        a1 / (c * c) + b1 / (1.0 - c).powi(2),
    )
}

/// Score vector and expected information over the full parameter vector.
/// The information matrix is row-major.
fn score_and_information(
    model: &dyn ItemModel,
    stats: &ItemSufficientStats,
    params: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    let n = params.len();
    let mut score = vec![0.0; n];
    let mut info = vec![0.0; n * n];
    for (&theta, counts) in stats.thetas.iter().zip(stats.counts.rows()) {
        let total = counts.sum();
        if total <= 0.0 {
            continue;
        }
        let probs = model.category_probabilities(theta, params);
        let grads = model.category_gradients(theta, params);
        for (k, &p) in probs.iter().enumerate() {
            let p = p.max(EPSILON);
            let dp = grads.row(k);
            let n_k = counts[k];
            for r in 0..n {
                score[r] += n_k * dp[r] / p;
                for c in 0..n {
                    info[r * n + c] += total * dp[r] * dp[c] / p;
                }
            }
        }
    }
    (score, info)
}

/// Restrict a score/information pair to the `free` coordinates.
fn restrict(score: &[f64], info: &[f64], free: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let n = score.len();
    let m = free.len();
    let sub_score = free.iter().map(|&i| score[i]).collect();
    let mut sub_info = vec![0.0; m * m];
    for (r, &i) in free.iter().enumerate() {
        for (c, &j) in free.iter().enumerate() {
            sub_info[r * m + c] = info[i * n + j];
        }
    }
    (sub_score, sub_info)
}

/// Outcome of one item's inner Newton loop.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub params: Vec<f64>,
    pub objective: f64,
    pub steps: usize,
    pub converged: bool,
    /// The inner iteration budget ran out before the step size fell below
    /// the inner tolerance.
    pub capped: bool,
    pub gradient_fallbacks: usize,
}

/// Damped Fisher-scoring ascent on the coordinates listed in `free`.
///
/// `derivatives` returns the score and row-major information over those
/// coordinates only.
#[allow(clippy::too_many_arguments)]
fn ascend<O, D>(
    item: usize,
    start: Vec<f64>,
    free: &[usize],
    objective: O,
    derivatives: D,
    feasible: impl Fn(&[f64]) -> bool,
    project: impl Fn(&mut [f64]),
    settings: &NewtonSettings,
) -> IrtResult<ItemUpdate>
where
    O: Fn(&[f64]) -> f64,
    D: Fn(&[f64]) -> (Vec<f64>, Vec<f64>),
{
    let mut current = start;
    project(&mut current);
    let mut value = objective(&current);
    if !value.is_finite() {
        return Err(IrtError::InternalArithmetic { item, attempts: 0 });
    }

    let m = free.len();
    let mut steps = 0;
    let mut converged = m == 0;
    let mut gradient_fallbacks = 0;

    while !converged && steps < settings.max_inner_iterations {
        steps += 1;
        let (score, mut info) = derivatives(&current);
        if score.iter().any(|g| !g.is_finite()) {
            return Err(IrtError::InternalArithmetic { item, attempts: steps });
        }
        for d in 0..m {
            info[d * m + d] += RIDGE;
        }

        let mut direction = match solve_spd(&info, &score) {
            Some(dir) => dir,
            None => {
                gradient_fallbacks += 1;
                score.clone()
            }
        };
        let longest = direction.iter().fold(0.0f64, |acc, d| acc.max(d.abs()));
        if longest > settings.max_step {
            let shrink = settings.max_step / longest;
            direction.iter_mut().for_each(|d| *d *= shrink);
        }

        let mut accepted = None;
        let mut scale = 1.0;
        for _ in 0..settings.max_damping_attempts {
            let mut candidate = current.clone();
            for (d, &i) in free.iter().enumerate() {
                candidate[i] += scale * direction[d];
            }
            project(&mut candidate);
            if feasible(&candidate) {
                let candidate_value = objective(&candidate);
                if candidate_value.is_finite() && candidate_value >= value {
                    accepted = Some((candidate, candidate_value));
                    break;
                }
            }
            scale *= 0.5;
        }

        let Some((candidate, candidate_value)) = accepted else {
            // No admissible ascent step left: current point is the optimum
            // reachable from here.
            converged = true;
            break;
        };
        let moved = free
            .iter()
            .map(|&i| (candidate[i] - current[i]).abs())
            .fold(0.0f64, f64::max);
        current = candidate;
        value = candidate_value;
        if moved < settings.inner_tolerance {
            converged = true;
        }
    }

    Ok(ItemUpdate {
        params: current,
        objective: value,
        steps,
        converged,
        capped: !converged,
        gradient_fallbacks,
    })
}

/// Maximize one item's expected log-likelihood (plus the guessing
/// log-prior for 3PL items) from `start`.
pub fn update_item(
    item: usize,
    model: &dyn ItemModel,
    stats: &ItemSufficientStats,
    start: &[f64],
    bounds: &ParameterBounds,
    prior: &GuessingPrior,
    settings: &NewtonSettings,
) -> IrtResult<ItemUpdate> {
    let penalized = model.family() == ModelFamily::ThreePl && !prior.is_flat();
    let free: Vec<usize> = model
        .free_parameters(start.len())
        .into_iter()
        .enumerate()
        .filter_map(|(i, is_free)| is_free.then_some(i))
        .collect();

    ascend(
        item,
        start.to_vec(),
        &free,
        |params| {
            let value = expected_log_likelihood(model, stats, params);
            if penalized {
                value + guessing_log_prior(prior, params[GUESSING]).0
            } else {
                value
            }
        },
        |params| {
            let (mut score, mut info) = score_and_information(model, stats, params);
            if penalized {
                let n = params.len();
                let (_, d1, d2) = guessing_log_prior(prior, params[GUESSING]);
                score[GUESSING] += d1;
                info[GUESSING * n + GUESSING] += d2;
            }
            restrict(&score, &info, &free)
        },
        |params| model.constraint_check(params, bounds),
        |params| model.project(params, bounds),
        settings,
    )
}

/// Result of the shared-slope step.
#[derive(Debug, Clone)]
pub struct SharedUpdate {
    pub discrimination: f64,
    pub objective: f64,
    pub steps: usize,
    pub capped: bool,
}

/// One-dimensional ascent on a discrimination shared by every item.
/// `items` pairs each item's sufficient statistics with its current values;
/// only index 0 of the values moves.
pub fn update_shared_discrimination(
    model: &dyn ItemModel,
    items: &[(&ItemSufficientStats, &[f64])],
    start: f64,
    bounds: &ParameterBounds,
    settings: &NewtonSettings,
) -> IrtResult<SharedUpdate> {
    let with_slope = |a: f64, values: &[f64]| {
        let mut params = values.to_vec();
        params[0] = a;
        params
    };

    let update = ascend(
        0,
        vec![start],
        &[0],
        |slope| {
            items
                .iter()
                .map(|(stats, values)| {
                    expected_log_likelihood(model, stats, &with_slope(slope[0], values))
                })
                .sum()
        },
        |slope| {
            let mut score = 0.0;
            let mut info = 0.0;
            for (stats, values) in items {
                let params = with_slope(slope[0], values);
                let (s, i) = score_and_information(model, stats, &params);
                score += s[0];
                info += i[0];
            }
            (vec![score], vec![info])
        },
        |slope| {
            let (lo, hi) = bounds.discrimination;
            slope[0].is_finite() && slope[0] >= lo && slope[0] <= hi
        },
        |slope| slope[0] = slope[0].clamp(bounds.discrimination.0, bounds.discrimination.1),
        settings,
    )?;

    Ok(SharedUpdate {
        discrimination: update.params[0],
        objective: update.objective,
        steps: update.steps,
        capped: update.capped,
    })
}
