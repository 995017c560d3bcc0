//! Ability estimation for a single response vector, given item parameters.

use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{AbilityMethod, AbilityPrior};
use crate::data::ResponseMatrix;
use crate::error::{ExtremePattern, IrtError, IrtResult};
use crate::likelihood::{LogProbabilityTable, log_probability_tables};
use crate::models::ItemParameters;
use crate::quadrature::{AbilityGrid, build_grid};
use crate::utils::{EPSILON, clamped_ln, compute_eap_with_se, normalize_log_posterior};

const DEFAULT_GRID_POINTS: usize = 41;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum AbilityStatus {
    Estimated,
    /// Maximum likelihood has no finite solution for this pattern.
    Undefined(ExtremePattern),
    NoResponses,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AbilityEstimate {
    pub theta: f64,
    pub standard_error: f64,
    pub status: AbilityStatus,
}

impl AbilityEstimate {
    pub fn is_finite(&self) -> bool {
        self.theta.is_finite()
    }
}

/// Newton controls for MLE and MAP.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub max_step: f64,
    pub max_halvings: usize,
    /// Estimates are kept inside `[-theta_limit, theta_limit]`.
    pub theta_limit: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
            max_step: 1.0,
            max_halvings: 20,
            theta_limit: 10.0,
        }
    }
}

/// Scores respondents against a fixed set of item parameters.
pub struct AbilityScorer<'a> {
    items: &'a [ItemParameters],
    grid: AbilityGrid,
    prior: AbilityPrior,
    settings: ScoringSettings,
    tables: Vec<Option<LogProbabilityTable>>,
}

/// Observed (item, category) pairs restricted to items with defined parameters.
fn observed(items: &[ItemParameters], responses: ArrayView1<'_, i32>) -> Vec<(usize, usize)> {
    debug_assert_eq!(responses.len(), items.len());
    responses
        .iter()
        .zip(items)
        .enumerate()
        .filter(|(_, (x, item))| **x >= 0 && item.is_defined())
        .map(|(j, (&x, _))| (j, x as usize))
        .collect()
}

fn extreme_pattern(items: &[ItemParameters], obs: &[(usize, usize)]) -> Option<ExtremePattern> {
    if obs.iter().all(|&(_, k)| k == 0) {
        Some(ExtremePattern::AllMinimum)
    } else if obs
        .iter()
        .all(|&(j, k)| k + 1 >= items[j].n_categories())
    {
        Some(ExtremePattern::AllMaximum)
    } else {
        None
    }
}

impl<'a> AbilityScorer<'a> {
    pub fn new(
        items: &'a [ItemParameters],
        grid: AbilityGrid,
        prior: AbilityPrior,
        settings: ScoringSettings,
    ) -> Self {
        let tables = log_probability_tables(items, &grid);
        Self {
            items,
            grid,
            prior,
            settings,
            tables,
        }
    }

    /// Standard-normal prior and default grid.
    pub fn with_defaults(items: &'a [ItemParameters]) -> Self {
        Self::new(
            items,
            build_grid(DEFAULT_GRID_POINTS),
            AbilityPrior::default(),
            ScoringSettings::default(),
        )
    }

    pub fn estimate(&self, responses: ArrayView1<'_, i32>, method: AbilityMethod) -> AbilityEstimate {
        match method {
            AbilityMethod::Mle => self.mle(responses),
            AbilityMethod::Map => self.map(responses),
            AbilityMethod::Eap => self.eap(responses),
        }
    }

    pub fn estimate_all(&self, matrix: &ResponseMatrix, method: AbilityMethod) -> Vec<AbilityEstimate> {
        (0..matrix.n_respondents())
            .into_par_iter()
            .map(|i| self.estimate(matrix.row(i), method))
            .collect()
    }

    pub fn mle(&self, responses: ArrayView1<'_, i32>) -> AbilityEstimate {
        let obs = observed(self.items, responses);
        if obs.is_empty() {
            return AbilityEstimate {
                theta: f64::NAN,
                standard_error: f64::NAN,
                status: AbilityStatus::NoResponses,
            };
        }
        if let Some(pattern) = extreme_pattern(self.items, &obs) {
            let theta = match pattern {
                ExtremePattern::AllMinimum => f64::NEG_INFINITY,
                ExtremePattern::AllMaximum => f64::INFINITY,
            };
            return AbilityEstimate {
                theta,
                standard_error: f64::INFINITY,
                status: AbilityStatus::Undefined(pattern),
            };
        }
        let (theta, info) = self.newton(&obs, None);
        AbilityEstimate {
            theta,
            standard_error: 1.0 / info.max(EPSILON).sqrt(),
            status: AbilityStatus::Estimated,
        }
    }

    pub fn map(&self, responses: ArrayView1<'_, i32>) -> AbilityEstimate {
        let obs = observed(self.items, responses);
        let (theta, info) = self.newton(&obs, Some(self.prior));
        let status = if obs.is_empty() {
            AbilityStatus::NoResponses
        } else {
            AbilityStatus::Estimated
        };
        AbilityEstimate {
            theta,
            standard_error: 1.0 / info.max(EPSILON).sqrt(),
            status,
        }
    }

    pub fn eap(&self, responses: ArrayView1<'_, i32>) -> AbilityEstimate {
        let obs = observed(self.items, responses);
        let log_weights = self.grid.log_weights();
        let log_posterior: Vec<f64> = (0..self.grid.len())
            .map(|q| {
                obs.iter()
                    .map(|&(j, k)| match &self.tables[j] {
                        Some(table) if k < table.ncols() => table[[q, k]],
                        _ => EPSILON.ln(),
                    })
                    .sum::<f64>()
                    + log_weights[q]
            })
            .collect();
        let posterior = normalize_log_posterior(&log_posterior);
        let (theta, standard_error) = compute_eap_with_se(&posterior, self.grid.nodes());
        let status = if obs.is_empty() {
            AbilityStatus::NoResponses
        } else {
            AbilityStatus::Estimated
        };
        AbilityEstimate {
            theta,
            standard_error,
            status,
        }
    }

    /// Log-likelihood (plus log-prior when given), score and test information at `theta`.
    fn derivatives(
        &self,
        obs: &[(usize, usize)],
        theta: f64,
        prior: Option<AbilityPrior>,
    ) -> (f64, f64, f64) {
        let mut log_lik = 0.0;
        let mut score = 0.0;
        let mut info = 0.0;
        for &(j, k) in obs {
            let item = &self.items[j];
            let model = item.model();
            let probs = model.category_probabilities(theta, item.values());
            let dprobs = model.ability_derivatives(theta, item.values());
            let p = probs.get(k).copied().unwrap_or(0.0);
            let dp = dprobs.get(k).copied().unwrap_or(0.0);
            log_lik += clamped_ln(p);
            score += dp / p.max(EPSILON);
            info += probs
                .iter()
                .zip(&dprobs)
                .map(|(&p, &d)| d * d / p.max(EPSILON))
                .sum::<f64>();
        }
        if let Some(prior) = prior {
            let var = prior.sd * prior.sd;
            log_lik -= 0.5 * (theta - prior.mean).powi(2) / var;
            score -= (theta - prior.mean) / var;
            info += 1.0 / var;
        }
        (log_lik, score, info)
    }

    /// Fisher scoring on theta with a bounded, halved step. Returns the
    /// estimate and the information there.
    fn newton(&self, obs: &[(usize, usize)], prior: Option<AbilityPrior>) -> (f64, f64) {
        let settings = &self.settings;
        let limit = settings.theta_limit;
        let mut theta = prior.map_or(0.0, |p| p.mean).clamp(-limit, limit);
        let (mut value, mut score, mut info) = self.derivatives(obs, theta, prior);

        for _ in 0..settings.max_iterations {
            let step = (score / info.max(EPSILON)).clamp(-settings.max_step, settings.max_step);
            if !step.is_finite() {
                break;
            }
            let mut scale = 1.0;
            let mut moved = None;
            for _ in 0..=settings.max_halvings {
                let candidate = (theta + scale * step).clamp(-limit, limit);
                let evaluated = self.derivatives(obs, candidate, prior);
                if evaluated.0.is_finite() && evaluated.0 >= value {
                    moved = Some((candidate, evaluated));
                    break;
                }
                scale *= 0.5;
            }
            let Some((candidate, evaluated)) = moved else {
                break;
            };
            let change = (candidate - theta).abs();
            theta = candidate;
            (value, score, info) = evaluated;
            if change < settings.tolerance {
                break;
            }
        }
        (theta, info)
    }
}

/// Score one response vector on a standard-normal 41-point grid.
pub fn estimate_ability(
    responses: &[i32],
    items: &[ItemParameters],
    method: AbilityMethod,
) -> IrtResult<AbilityEstimate> {
    if responses.len() != items.len() {
        return Err(IrtError::ParameterMismatch(format!(
            "{} responses for {} items",
            responses.len(),
            items.len()
        )));
    }
    Ok(AbilityScorer::with_defaults(items).estimate(ArrayView1::from(responses), method))
}
