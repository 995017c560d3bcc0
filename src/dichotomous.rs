//! Dichotomous model families: Rasch, 1PL, 2PL and 3PL.
//!
//! Category 1 is the keyed (correct) response. All four share the logistic
//! kernel `sigmoid(a * (theta - b))`; the 3PL lifts its floor to `c`.

use ndarray::Array2;

use crate::config::ParameterBounds;
use crate::models::{ItemModel, ModelFamily, within};
use crate::utils::{logit, sigmoid};

const INITIAL_GUESSING: f64 = 0.15;
const INITIAL_DIFFICULTY_LIMIT: f64 = 4.0;

/// Difficulty whose logistic curve (slope 1) matches proportion `p` at theta = 0.
fn difficulty_from_proportion(p: f64) -> f64 {
    (-logit(p.clamp(0.01, 0.99))).clamp(-INITIAL_DIFFICULTY_LIMIT, INITIAL_DIFFICULTY_LIMIT)
}

fn proportion_correct(category_proportions: &[f64]) -> f64 {
    category_proportions.get(1).copied().unwrap_or(0.5)
}

/// Logistic kernel and its variance term `p * (1 - p)`.
#[inline]
fn logistic(theta: f64, a: f64, b: f64) -> (f64, f64) {
    let p = sigmoid(a * (theta - b));
    (p, p * (1.0 - p))
}

/// Fixed unit slope, one difficulty per item.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rasch;

impl ItemModel for Rasch {
    fn family(&self) -> ModelFamily {
        ModelFamily::Rasch
    }

    fn parameter_count(&self, _n_categories: usize) -> usize {
        1
    }

    fn n_categories(&self, _params: &[f64]) -> usize {
        2
    }

    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let (p, _) = logistic(theta, 1.0, params[0]);
        vec![1.0 - p, p]
    }

    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64> {
        let (_, w) = logistic(theta, 1.0, params[0]);
        let mut grad = Array2::zeros((2, 1));
        grad[[1, 0]] = -w;
        grad[[0, 0]] = w;
        grad
    }

    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let (_, w) = logistic(theta, 1.0, params[0]);
        vec![-w, w]
    }

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool {
        params.len() == 1 && within(params[0], bounds.difficulty)
    }

    fn project(&self, params: &mut [f64], bounds: &ParameterBounds) {
        params[0] = params[0].clamp(bounds.difficulty.0, bounds.difficulty.1);
    }

    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64> {
        vec![difficulty_from_proportion(proportion_correct(
            category_proportions,
        ))]
    }
}

fn two_parameter_probabilities(theta: f64, params: &[f64]) -> Vec<f64> {
    let (p, _) = logistic(theta, params[0], params[1]);
    vec![1.0 - p, p]
}

fn two_parameter_gradients(theta: f64, params: &[f64]) -> Array2<f64> {
    let (a, b) = (params[0], params[1]);
    let (_, w) = logistic(theta, a, b);
    let mut grad = Array2::zeros((2, 2));
    grad[[1, 0]] = w * (theta - b);
    grad[[1, 1]] = -a * w;
    grad[[0, 0]] = -grad[[1, 0]];
    grad[[0, 1]] = -grad[[1, 1]];
    grad
}

fn two_parameter_ability(theta: f64, params: &[f64]) -> Vec<f64> {
    let (a, b) = (params[0], params[1]);
    let (_, w) = logistic(theta, a, b);
    vec![-a * w, a * w]
}

fn two_parameter_feasible(params: &[f64], bounds: &ParameterBounds) -> bool {
    params.len() == 2
        && within(params[0], bounds.discrimination)
        && within(params[1], bounds.difficulty)
}

fn two_parameter_project(params: &mut [f64], bounds: &ParameterBounds) {
    params[0] = params[0].clamp(bounds.discrimination.0, bounds.discrimination.1);
    params[1] = params[1].clamp(bounds.difficulty.0, bounds.difficulty.1);
}

/// One slope shared across all items. The slope sits at index 0 of every
/// item's values but is moved only by the shared update.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnePl;

impl ItemModel for OnePl {
    fn family(&self) -> ModelFamily {
        ModelFamily::OnePl
    }

    fn parameter_count(&self, _n_categories: usize) -> usize {
        2
    }

    fn n_categories(&self, _params: &[f64]) -> usize {
        2
    }

    fn free_parameters(&self, n_params: usize) -> Vec<bool> {
        let mut free = vec![true; n_params];
        if let Some(slope) = free.first_mut() {
            *slope = false;
        }
        free
    }

    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        two_parameter_probabilities(theta, params)
    }

    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64> {
        two_parameter_gradients(theta, params)
    }

    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        two_parameter_ability(theta, params)
    }

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool {
        two_parameter_feasible(params, bounds)
    }

    fn project(&self, params: &mut [f64], bounds: &ParameterBounds) {
        two_parameter_project(params, bounds)
    }

    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64> {
        vec![
            1.0,
            difficulty_from_proportion(proportion_correct(category_proportions)),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TwoPl;

impl ItemModel for TwoPl {
    fn family(&self) -> ModelFamily {
        ModelFamily::TwoPl
    }

    fn parameter_count(&self, _n_categories: usize) -> usize {
        2
    }

    fn n_categories(&self, _params: &[f64]) -> usize {
        2
    }

    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        two_parameter_probabilities(theta, params)
    }

    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64> {
        two_parameter_gradients(theta, params)
    }

    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        two_parameter_ability(theta, params)
    }

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool {
        two_parameter_feasible(params, bounds)
    }

    fn project(&self, params: &mut [f64], bounds: &ParameterBounds) {
        two_parameter_project(params, bounds)
    }

    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64> {
        vec![
            1.0,
            difficulty_from_proportion(proportion_correct(category_proportions)),
        ]
    }
}

/// `c + (1 - c) * sigmoid(a * (theta - b))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreePl;

impl ItemModel for ThreePl {
    fn family(&self) -> ModelFamily {
        ModelFamily::ThreePl
    }

    fn parameter_count(&self, _n_categories: usize) -> usize {
        3
    }

    fn n_categories(&self, _params: &[f64]) -> usize {
        2
    }

    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let (a, b, c) = (params[0], params[1], params[2]);
        let (p_star, _) = logistic(theta, a, b);
        let p = c + (1.0 - c) * p_star;
        vec![1.0 - p, p]
    }

    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64> {
        let (a, b, c) = (params[0], params[1], params[2]);
        let (p_star, w) = logistic(theta, a, b);
        let mut grad = Array2::zeros((2, 3));
        grad[[1, 0]] = (1.0 - c) * w * (theta - b);
        grad[[1, 1]] = -(1.0 - c) * w * a;
        grad[[1, 2]] = 1.0 - p_star;
        for k in 0..3 {
            grad[[0, k]] = -grad[[1, k]];
        }
        grad
    }

    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64> {
        let (a, b, c) = (params[0], params[1], params[2]);
        let (_, w) = logistic(theta, a, b);
        let d = (1.0 - c) * a * w;
        vec![-d, d]
    }

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool {
        params.len() == 3
            && within(params[0], bounds.discrimination)
            && within(params[1], bounds.difficulty)
            && within(params[2], bounds.guessing)
    }

    fn project(&self, params: &mut [f64], bounds: &ParameterBounds) {
        params[0] = params[0].clamp(bounds.discrimination.0, bounds.discrimination.1);
        params[1] = params[1].clamp(bounds.difficulty.0, bounds.difficulty.1);
        params[2] = params[2].clamp(bounds.guessing.0, bounds.guessing.1);
    }

    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64> {
        let p = proportion_correct(category_proportions);
        let p_star = (p - INITIAL_GUESSING) / (1.0 - INITIAL_GUESSING);
        vec![1.0, difficulty_from_proportion(p_star), INITIAL_GUESSING]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn finite_difference_gradient(model: &dyn ItemModel, theta: f64, params: &[f64]) -> Array2<f64> {
        let h = 1e-6;
        let k = model.n_categories(params);
        let mut grad = Array2::zeros((k, params.len()));
        for j in 0..params.len() {
            let mut up = params.to_vec();
            let mut down = params.to_vec();
            up[j] += h;
            down[j] -= h;
            let p_up = model.category_probabilities(theta, &up);
            let p_down = model.category_probabilities(theta, &down);
            for c in 0..k {
                grad[[c, j]] = (p_up[c] - p_down[c]) / (2.0 * h);
            }
        }
        grad
    }

    fn cases() -> Vec<(&'static dyn ItemModel, Vec<f64>)> {
        vec![
            (&Rasch as &dyn ItemModel, vec![0.3]),
            (&OnePl as &dyn ItemModel, vec![1.4, -0.5]),
            (&TwoPl as &dyn ItemModel, vec![0.8, 1.1]),
            (&ThreePl as &dyn ItemModel, vec![1.7, 0.2, 0.18]),
        ]
    }

    #[test]
    fn probability_of_keyed_response_is_monotone_in_ability() {
        for (model, params) in cases() {
            let mut previous = 0.0;
            for step in 0..=120 {
                let theta = -6.0 + 0.1 * step as f64;
                let p = model.probability(theta, &params, 1);
                assert!(p >= previous, "{:?} not monotone at {theta}", model.family());
                assert!((0.0..=1.0).contains(&p));
                previous = p;
            }
        }
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        for (model, params) in cases() {
            for &theta in &[-2.0, -0.3, 0.0, 1.5] {
                let analytic = model.category_gradients(theta, &params);
                let numeric = finite_difference_gradient(model, theta, &params);
                for (a, n) in analytic.iter().zip(numeric.iter()) {
                    assert_abs_diff_eq!(*a, *n, epsilon = 1e-6);
                }
                let dtheta = model.ability_derivatives(theta, &params);
                let h = 1e-6;
                let up = model.category_probabilities(theta + h, &params);
                let down = model.category_probabilities(theta - h, &params);
                for c in 0..2 {
                    assert_abs_diff_eq!(dtheta[c], (up[c] - down[c]) / (2.0 * h), epsilon = 1e-6);
                }
            }
        }
    }

    #[test]
    fn guessing_sets_the_lower_asymptote() {
        let params = [2.0, 0.0, 0.25];
        assert!(ThreePl.probability(-30.0, &params, 1) >= 0.25);
        assert_abs_diff_eq!(ThreePl.probability(-30.0, &params, 1), 0.25, epsilon = 1e-9);
    }

    #[test]
    fn rasch_is_two_pl_with_unit_slope() {
        for &theta in &[-1.0, 0.0, 2.2] {
            assert_abs_diff_eq!(
                Rasch.probability(theta, &[0.7], 1),
                TwoPl.probability(theta, &[1.0, 0.7], 1),
                epsilon = 1e-15
            );
        }
    }

    #[test]
    fn one_pl_slope_is_not_a_per_item_parameter() {
        assert_eq!(OnePl.free_parameters(2), vec![false, true]);
        assert_eq!(TwoPl.free_parameters(2), vec![true, true]);
    }

    #[test]
    fn constraints_and_projection() {
        let bounds = ParameterBounds::default();
        assert!(!TwoPl.constraint_check(&[-0.5, 0.0], &bounds));
        let mut params = vec![-0.5, 9.0];
        TwoPl.project(&mut params, &bounds);
        assert_eq!(params, vec![bounds.discrimination.0, bounds.difficulty.1]);
        assert!(TwoPl.constraint_check(&params, &bounds));
        assert!(!ThreePl.constraint_check(&[1.0, 0.0, 0.9], &bounds));
    }

    #[test]
    fn initial_difficulty_tracks_proportion_correct() {
        let easy = TwoPl.initial_parameters(&[0.2, 0.8]);
        let hard = TwoPl.initial_parameters(&[0.8, 0.2]);
        assert!(easy[1] < 0.0 && hard[1] > 0.0);
        assert_abs_diff_eq!(easy[1], -hard[1], epsilon = 1e-12);
        let three = ThreePl.initial_parameters(&[0.4, 0.6]);
        assert_eq!(three[2], INITIAL_GUESSING);
    }
}
