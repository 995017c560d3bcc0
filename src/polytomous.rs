//! Polytomous model families: Graded Response and (generalized) Partial Credit.
//!
//! Both store `[a, t_1, ..., t_{K-1}]`. For the GRM the `t_k` are the
//! boundaries of the cumulative logits `P(X >= k)`; for the PCM they are
//! the step difficulties of the adjacent-category logits. Thresholds are
//! kept strictly increasing in both.

use ndarray::Array2;

use crate::config::ParameterBounds;
use crate::models::{ItemModel, ModelFamily, strictly_increasing, within};
use crate::utils::{logit, sigmoid};

const MIN_INITIAL_GAP: f64 = 0.05;
const INITIAL_LOCATION_LIMIT: f64 = 3.0;

fn polytomous_feasible(params: &[f64], bounds: &ParameterBounds) -> bool {
    params.len() >= 2
        && within(params[0], bounds.discrimination)
        && params[1..].iter().all(|&t| within(t, bounds.difficulty))
        && strictly_increasing(&params[1..])
}

fn polytomous_project(params: &mut [f64], bounds: &ParameterBounds) {
    params[0] = params[0].clamp(bounds.discrimination.0, bounds.discrimination.1);
    for t in params[1..].iter_mut() {
        *t = t.clamp(bounds.difficulty.0, bounds.difficulty.1);
    }
}

/// Push thresholds apart so that each exceeds its predecessor by `gap`.
fn enforce_gaps(thresholds: &mut [f64], gap: f64) {
    for k in 1..thresholds.len() {
        if thresholds[k] < thresholds[k - 1] + gap {
            thresholds[k] = thresholds[k - 1] + gap;
        }
    }
}

/// Samejima's graded response model.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradedResponse;

impl GradedResponse {
    /// Cumulative probabilities `P(X >= k)` for k = 0..=K, padded with 1 and 0.
    fn cumulative(theta: f64, params: &[f64]) -> Vec<f64> {
        let a = params[0];
        let n_cat = params.len();
        let mut cum = vec![0.0; n_cat + 1];
        cum[0] = 1.0;
        for k in 1..n_cat {
            cum[k] = sigmoid(a * (theta - params[k]));
        }
        cum
    }
}

impl ItemModel for GradedResponse {
    fn family(&self) -> ModelFamily {
        ModelFamily::GradedResponse
    }

    fn parameter_count(&self, n_categories: usize) -> usize {
        n_categories.max(2)
    }

    fn n_categories(&self, params: &[f64]) -> usize {
        params.len()
    }

    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let cum = Self::cumulative(theta, params);
        (0..params.len()).map(|k| cum[k] - cum[k + 1]).collect()
    }

    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64> {
        let a = params[0];
        let n_cat = params.len();
        let cum = Self::cumulative(theta, params);

        // d P(X >= k) / d a, and the logistic variance at each boundary.
        let mut d_cum_a = vec![0.0; n_cat + 1];
        let mut w = vec![0.0; n_cat + 1];
        for k in 1..n_cat {
            w[k] = cum[k] * (1.0 - cum[k]);
            d_cum_a[k] = w[k] * (theta - params[k]);
        }

        let mut grad = Array2::zeros((n_cat, n_cat));
        for k in 0..n_cat {
            grad[[k, 0]] = d_cum_a[k] - d_cum_a[k + 1];
            if k >= 1 {
                grad[[k, k]] -= a * w[k];
            }
            if k + 1 < n_cat {
                grad[[k, k + 1]] += a * w[k + 1];
            }
        }
        grad
    }

    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let a = params[0];
        let n_cat = params.len();
        let cum = Self::cumulative(theta, params);
        let w: Vec<f64> = cum.iter().map(|&p| p * (1.0 - p)).collect();
        (0..n_cat).map(|k| a * (w[k] - w[k + 1])).collect()
    }

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool {
        polytomous_feasible(params, bounds)
    }

    fn project(&self, params: &mut [f64], bounds: &ParameterBounds) {
        polytomous_project(params, bounds)
    }

    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64> {
        let n_cat = category_proportions.len().max(2);
        let mut params = vec![1.0; n_cat];
        for k in 1..n_cat {
            let at_or_above: f64 = category_proportions[k.min(category_proportions.len())..]
                .iter()
                .sum();
            params[k] = (-logit(at_or_above.clamp(0.01, 0.99)))
                .clamp(-INITIAL_LOCATION_LIMIT, INITIAL_LOCATION_LIMIT);
        }
        enforce_gaps(&mut params[1..], MIN_INITIAL_GAP);
        params
    }
}

/// Generalized partial credit model (Muraki), adjacent-category logits
/// `a * (theta - d_k)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialCredit;

impl PartialCredit {
    /// Cumulative adjacent-category logits `z_k = sum_{v <= k} a (theta - d_v)`.
    fn numerators(theta: f64, params: &[f64]) -> Vec<f64> {
        let a = params[0];
        let n_cat = params.len();
        let mut numerators = vec![0.0; n_cat];
        for k in 1..n_cat {
            numerators[k] = numerators[k - 1] + a * (theta - params[k]);
        }
        numerators
    }

    fn softmax(numerators: &[f64]) -> Vec<f64> {
        let max_num = numerators.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = numerators.iter().map(|&x| (x - max_num).exp()).collect();
        let sum: f64 = exp.iter().sum();
        exp.into_iter().map(|e| e / sum).collect()
    }
}

impl ItemModel for PartialCredit {
    fn family(&self) -> ModelFamily {
        ModelFamily::PartialCredit
    }

    fn parameter_count(&self, n_categories: usize) -> usize {
        n_categories.max(2)
    }

    fn n_categories(&self, params: &[f64]) -> usize {
        params.len()
    }

    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        Self::softmax(&Self::numerators(theta, params))
    }

    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64> {
        let a = params[0];
        let n_cat = params.len();
        let probs = self.category_probabilities(theta, params);

        // d z_k / d a = sum_{v <= k} (theta - d_v)
        let mut dz_a = vec![0.0; n_cat];
        for k in 1..n_cat {
            dz_a[k] = dz_a[k - 1] + (theta - params[k]);
        }
        let mean_dz_a: f64 = probs.iter().zip(&dz_a).map(|(p, d)| p * d).sum();

        // Tail sums T_v = P(X >= v).
        let mut tail = vec![0.0; n_cat + 1];
        for k in (0..n_cat).rev() {
            tail[k] = tail[k + 1] + probs[k];
        }

        let mut grad = Array2::zeros((n_cat, n_cat));
        for k in 0..n_cat {
            grad[[k, 0]] = probs[k] * (dz_a[k] - mean_dz_a);
            for v in 1..n_cat {
                let own = if v <= k { -a } else { 0.0 };
                grad[[k, v]] = probs[k] * (own + a * tail[v]);
            }
        }
        grad
    }

    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let a = params[0];
        let probs = self.category_probabilities(theta, params);
        let mean_score: f64 = probs.iter().enumerate().map(|(k, p)| k as f64 * p).sum();
        probs
            .iter()
            .enumerate()
            .map(|(k, p)| a * p * (k as f64 - mean_score))
            .collect()
    }

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool {
        polytomous_feasible(params, bounds)
    }

    fn project(&self, params: &mut [f64], bounds: &ParameterBounds) {
        polytomous_project(params, bounds)
    }

    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64> {
        let n_cat = category_proportions.len().max(2);
        let n_steps = n_cat - 1;
        let proportion = |k: usize| {
            category_proportions
                .get(k)
                .copied()
                .unwrap_or(0.0)
                .max(0.01)
        };

        let center = ((1..n_cat)
            .map(|k| (proportion(k - 1) / proportion(k)).ln())
            .sum::<f64>()
            / n_steps as f64)
            .clamp(-INITIAL_LOCATION_LIMIT, INITIAL_LOCATION_LIMIT);

        let mut params = vec![1.0; n_cat];
        for k in 1..n_cat {
            let spread = if n_steps > 1 {
                -1.0 + 2.0 * (k - 1) as f64 / (n_steps - 1) as f64
            } else {
                0.0
            };
            params[k] = center + spread;
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn cases() -> Vec<(&'static dyn ItemModel, Vec<f64>)> {
        vec![
            (&GradedResponse as &dyn ItemModel, vec![1.3, -1.2, 0.1, 1.4]),
            (&GradedResponse as &dyn ItemModel, vec![0.6, 0.5]),
            (&PartialCredit as &dyn ItemModel, vec![0.9, -0.8, 0.3, 0.9]),
            (&PartialCredit as &dyn ItemModel, vec![1.7, -1.5, 1.5]),
        ]
    }

    #[test]
    fn category_probabilities_sum_to_one() {
        for (model, params) in cases() {
            for step in 0..=80 {
                let theta = -8.0 + 0.2 * step as f64;
                let probs = model.category_probabilities(theta, &params);
                assert_eq!(probs.len(), params.len());
                assert_abs_diff_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
                assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
            }
        }
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let h = 1e-6;
        for (model, params) in cases() {
            for &theta in &[-1.7, 0.0, 0.6, 2.4] {
                let analytic = model.category_gradients(theta, &params);
                for j in 0..params.len() {
                    let mut up = params.clone();
                    let mut down = params.clone();
                    up[j] += h;
                    down[j] -= h;
                    let p_up = model.category_probabilities(theta, &up);
                    let p_down = model.category_probabilities(theta, &down);
                    for k in 0..params.len() {
                        let numeric = (p_up[k] - p_down[k]) / (2.0 * h);
                        assert_abs_diff_eq!(analytic[[k, j]], numeric, epsilon = 1e-6);
                    }
                }

                let dtheta = model.ability_derivatives(theta, &params);
                let p_up = model.category_probabilities(theta + h, &params);
                let p_down = model.category_probabilities(theta - h, &params);
                for k in 0..params.len() {
                    assert_abs_diff_eq!(dtheta[k], (p_up[k] - p_down[k]) / (2.0 * h), epsilon = 1e-6);
                }
                assert_abs_diff_eq!(dtheta.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn expected_score_increases_with_ability() {
        for (model, params) in cases() {
            let mut previous = -1.0;
            for step in 0..=60 {
                let theta = -6.0 + 0.2 * step as f64;
                let score: f64 = model
                    .category_probabilities(theta, &params)
                    .iter()
                    .enumerate()
                    .map(|(k, p)| k as f64 * p)
                    .sum();
                assert!(score > previous);
                previous = score;
            }
        }
    }

    #[test]
    fn two_category_grm_reduces_to_two_pl() {
        let grm = GradedResponse.category_probabilities(0.4, &[1.3, -0.2]);
        let p = sigmoid(1.3 * (0.4 + 0.2));
        assert_abs_diff_eq!(grm[1], p, epsilon = 1e-15);
    }

    #[test]
    fn threshold_order_is_a_constraint() {
        let bounds = ParameterBounds::default();
        assert!(GradedResponse.constraint_check(&[1.0, -1.0, 0.5], &bounds));
        assert!(!GradedResponse.constraint_check(&[1.0, 0.5, -1.0], &bounds));
        assert!(!PartialCredit.constraint_check(&[1.0, 0.5, 0.5], &bounds));
        assert!(!PartialCredit.constraint_check(&[0.0, -0.5, 0.5], &bounds));
    }

    #[test]
    fn initial_parameters_are_feasible() {
        let bounds = ParameterBounds::default();
        let skewed = [0.02, 0.03, 0.15, 0.8];
        for model in [&GradedResponse as &dyn ItemModel, &PartialCredit as &dyn ItemModel] {
            let params = model.initial_parameters(&skewed);
            assert_eq!(params.len(), 4);
            assert!(model.constraint_check(&params, &bounds), "{params:?}");
        }
        let grm = GradedResponse.initial_parameters(&[0.25, 0.25, 0.25, 0.25]);
        assert!(grm[1] < 0.0 && grm[3] > 0.0);
    }
}
