//! Marginal likelihood over the ability grid (the E-step).

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;

use crate::data::PatternTable;
use crate::models::ItemParameters;
use crate::quadrature::AbilityGrid;
use crate::utils::{EPSILON, clamped_ln, logsumexp};

/// Clamped `ln P(X = k | theta_q)` for every node and category of one item.
pub type LogProbabilityTable = Array2<f64>;

/// One table per item; `None` for items whose parameters are undefined.
pub fn log_probability_tables(
    items: &[ItemParameters],
    grid: &AbilityGrid,
) -> Vec<Option<LogProbabilityTable>> {
    items
        .par_iter()
        .map(|item| {
            if !item.is_defined() {
                return None;
            }
            let n_cat = item.n_categories();
            let mut table = Array2::zeros((grid.len(), n_cat));
            for (q, &theta) in grid.nodes().iter().enumerate() {
                for (k, p) in item.category_probabilities(theta).into_iter().enumerate() {
                    table[[q, k]] = clamped_ln(p);
                }
            }
            Some(table)
        })
        .collect()
}

/// Sum of the item log probabilities of one response pattern at node `q`.
fn pattern_log_likelihood(
    pattern: ArrayView1<'_, i32>,
    tables: &[Option<LogProbabilityTable>],
    q: usize,
) -> f64 {
    pattern
        .iter()
        .zip(tables)
        .filter_map(|(&x, table)| {
            let table = table.as_ref()?;
            if x < 0 {
                return None;
            }
            let k = x as usize;
            Some(if k < table.ncols() {
                table[[q, k]]
            } else {
                EPSILON.ln()
            })
        })
        .sum()
}

/// Posterior ability distribution of every pattern at the current parameters.
#[derive(Debug, Clone)]
pub struct Posterior {
    weights: Array2<f64>,
    log_marginals: Vec<f64>,
    log_likelihood: f64,
}

impl Posterior {
    /// Normalized posterior weights, patterns by nodes.
    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn respondent_posterior<'a>(
        &'a self,
        respondent: usize,
        patterns: &PatternTable,
    ) -> ArrayView1<'a, f64> {
        self.weights.row(patterns.respondent_pattern[respondent])
    }

    /// `ln P(pattern)` for every distinct pattern.
    pub fn log_marginals(&self) -> &[f64] {
        &self.log_marginals
    }

    /// Marginal log-likelihood of the full sample.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }
}

pub fn e_step(patterns: &PatternTable, items: &[ItemParameters], grid: &AbilityGrid) -> Posterior {
    let tables = log_probability_tables(items, grid);
    let log_weights = grid.log_weights();
    let n_nodes = grid.len();

    let rows: Vec<(Vec<f64>, f64)> = (0..patterns.n_patterns())
        .into_par_iter()
        .map(|p| {
            let pattern = patterns.patterns.row(p);
            let log_joint: Vec<f64> = (0..n_nodes)
                .map(|q| pattern_log_likelihood(pattern, &tables, q) + log_weights[q])
                .collect();
            let log_marginal = logsumexp(&log_joint);
            let posterior = log_joint
                .iter()
                .map(|&lj| (lj - log_marginal).exp())
                .collect();
            (posterior, log_marginal)
        })
        .collect();

    let mut weights = Array2::zeros((patterns.n_patterns(), n_nodes));
    let mut log_marginals = Vec::with_capacity(rows.len());
    for (p, (posterior, log_marginal)) in rows.into_iter().enumerate() {
        for (q, w) in posterior.into_iter().enumerate() {
            weights[[p, q]] = w;
        }
        log_marginals.push(log_marginal);
    }
    let log_likelihood = log_marginals
        .iter()
        .zip(&patterns.counts)
        .map(|(lm, n)| lm * n)
        .sum();

    Posterior {
        weights,
        log_marginals,
        log_likelihood,
    }
}

/// Expected number of responses in each category at each node for one item,
/// nodes by categories.
pub fn expected_counts(
    patterns: &PatternTable,
    posterior: &Posterior,
    item: usize,
    n_categories: usize,
) -> Array2<f64> {
    let n_nodes = posterior.weights.ncols();
    let mut counts = Array2::zeros((n_nodes, n_categories));
    for (p, &freq) in patterns.counts.iter().enumerate() {
        let x = patterns.patterns[[p, item]];
        if x < 0 || x as usize >= n_categories {
            continue;
        }
        let k = x as usize;
        for (q, &w) in posterior.weights.row(p).iter().enumerate() {
            counts[[q, k]] += freq * w;
        }
    }
    counts
}

/// [`expected_counts`] for every defined item, computed in parallel.
pub fn all_expected_counts(
    patterns: &PatternTable,
    posterior: &Posterior,
    items: &[ItemParameters],
) -> Vec<Option<Array2<f64>>> {
    items
        .par_iter()
        .enumerate()
        .map(|(j, item)| {
            item.is_defined()
                .then(|| expected_counts(patterns, posterior, j, item.n_categories()))
        })
        .collect()
}
