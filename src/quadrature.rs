//! Discretized ability distribution used for marginalization and EAP.

use std::f64::consts::PI;

use crate::config::{AbilityPrior, QuadratureRule};

const ROOT_TOLERANCE: f64 = 3e-14;
const MAX_ROOT_ITERATIONS: usize = 100;
/// pi^(-1/4)
const PI_M4: f64 = 0.7511255444649425;

/// Ordered nodes with normalized weights. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AbilityGrid {
    nodes: Vec<f64>,
    weights: Vec<f64>,
    log_weights: Vec<f64>,
}

/// Standard-normal Gauss-Hermite grid; fewer than two points are raised to two.
pub fn build_grid(num_points: usize) -> AbilityGrid {
    AbilityGrid::gauss_hermite(num_points)
}

impl AbilityGrid {
    pub fn from_rule(rule: QuadratureRule, num_points: usize, prior: AbilityPrior) -> Self {
        let standard = match rule {
            QuadratureRule::GaussHermite => Self::gauss_hermite(num_points),
            QuadratureRule::FixedInterval { lower, upper } => {
                Self::fixed_interval(num_points, lower, upper)
            }
        };
        standard.rescaled(prior)
    }

    pub fn gauss_hermite(num_points: usize) -> Self {
        let n = num_points.max(2);
        let (roots, raw_weights) = hermite_roots(n);
        // Physicists' rule for exp(-x^2) -> standard normal.
        let mut pairs: Vec<(f64, f64)> = roots
            .iter()
            .zip(&raw_weights)
            .map(|(&x, &w)| (x * 2f64.sqrt(), w / PI.sqrt()))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self::from_pairs(pairs)
    }

    /// Gauss-Legendre nodes on `[lower, upper]` weighted by the standard
    /// normal density.
    pub fn fixed_interval(num_points: usize, lower: f64, upper: f64) -> Self {
        let n = num_points.max(2);
        let (roots, raw_weights) = legendre_roots(n);
        let half_width = 0.5 * (upper - lower);
        let center = 0.5 * (upper + lower);
        let mut pairs: Vec<(f64, f64)> = roots
            .iter()
            .zip(&raw_weights)
            .map(|(&x, &w)| {
                let z = center + half_width * x;
                (z, w * half_width * (-0.5 * z * z).exp())
            })
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self::from_pairs(pairs)
    }

    fn from_pairs(pairs: Vec<(f64, f64)>) -> Self {
        let total: f64 = pairs.iter().map(|p| p.1).sum();
        let (nodes, weights): (Vec<f64>, Vec<f64>) =
            pairs.into_iter().map(|(x, w)| (x, w / total)).unzip();
        let log_weights = weights
            .iter()
            .map(|&w| w.max(f64::MIN_POSITIVE).ln())
            .collect();
        Self {
            nodes,
            weights,
            log_weights,
        }
    }

    /// Shift and scale the nodes to `N(mean, sd^2)`; weights are unchanged.
    pub fn rescaled(mut self, prior: AbilityPrior) -> Self {
        for node in self.nodes.iter_mut() {
            *node = prior.mean + prior.sd * *node;
        }
        self
    }

    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Roots and weights of the n-point Hermite rule for weight `exp(-x^2)`,
/// via Newton iteration on the orthonormal recurrence. Roots come out in
/// decreasing order.
fn hermite_roots(n: usize) -> (Vec<f64>, Vec<f64>) {
    let nf = n as f64;
    let mut x = vec![0.0; n];
    let mut w = vec![0.0; n];
    let half = n.div_ceil(2);
    let mut z = 0.0;

    for i in 0..half {
        z = match i {
            0 => (2.0 * nf + 1.0).sqrt() - 1.85575 * (2.0 * nf + 1.0).powf(-0.16667),
            1 => z - 1.14 * nf.powf(0.426) / z,
            2 => 1.86 * z - 0.86 * x[0],
            3 => 1.91 * z - 0.91 * x[1],
            _ => 2.0 * z - x[i - 2],
        };

        let mut pp = 0.0;
        for _ in 0..MAX_ROOT_ITERATIONS {
            let mut p1 = PI_M4;
            let mut p2 = 0.0;
            for j in 1..=n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = z * (2.0 / jf).sqrt() * p2 - ((jf - 1.0) / jf).sqrt() * p3;
            }
            pp = (2.0 * nf).sqrt() * p2;
            let previous = z;
            z = previous - p1 / pp;
            if (z - previous).abs() <= ROOT_TOLERANCE {
                break;
            }
        }

        x[i] = z;
        x[n - 1 - i] = -z;
        w[i] = 2.0 / (pp * pp);
        w[n - 1 - i] = w[i];
    }
    (x, w)
}

/// Gauss-Legendre roots and weights on `[-1, 1]`.
fn legendre_roots(n: usize) -> (Vec<f64>, Vec<f64>) {
    let nf = n as f64;
    let mut x = vec![0.0; n];
    let mut w = vec![0.0; n];
    let half = n.div_ceil(2);

    for i in 0..half {
        let mut z = (PI * (i as f64 + 0.75) / (nf + 0.5)).cos();
        let mut pp = 0.0;
        for _ in 0..MAX_ROOT_ITERATIONS {
            let mut p1 = 1.0;
            let mut p2 = 0.0;
            for j in 1..=n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = ((2.0 * jf - 1.0) * z * p2 - (jf - 1.0) * p3) / jf;
            }
            pp = nf * (z * p1 - p2) / (z * z - 1.0);
            let previous = z;
            z = previous - p1 / pp;
            if (z - previous).abs() <= ROOT_TOLERANCE {
                break;
            }
        }
        x[i] = -z;
        x[n - 1 - i] = z;
        w[i] = 2.0 / ((1.0 - z * z) * pp * pp);
        w[n - 1 - i] = w[i];
    }
    (x, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn moment(grid: &AbilityGrid, power: i32) -> f64 {
        grid.nodes()
            .iter()
            .zip(grid.weights())
            .map(|(&x, &w)| w * x.powi(power))
            .sum()
    }

    #[test]
    fn gauss_hermite_matches_normal_moments() {
        for n in [5, 11, 21, 41, 61] {
            let grid = build_grid(n);
            assert_eq!(grid.len(), n);
            assert_abs_diff_eq!(grid.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(moment(&grid, 1), 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(moment(&grid, 2), 1.0, epsilon = 1e-9);
            assert_abs_diff_eq!(moment(&grid, 4), 3.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn nodes_are_sorted_and_symmetric() {
        let grid = build_grid(41);
        assert!(grid.nodes().windows(2).all(|w| w[0] < w[1]));
        for i in 0..grid.len() {
            let j = grid.len() - 1 - i;
            assert_abs_diff_eq!(grid.nodes()[i], -grid.nodes()[j], epsilon = 1e-10);
            assert_abs_diff_eq!(grid.weights()[i], grid.weights()[j], epsilon = 1e-12);
        }
        assert_abs_diff_eq!(grid.nodes()[20], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn tiny_requests_are_raised_to_two_points() {
        let grid = build_grid(0);
        assert_eq!(grid.len(), 2);
        assert_abs_diff_eq!(grid.nodes()[1], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(grid.weights()[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn fixed_interval_stays_inside_bounds() {
        let grid = AbilityGrid::fixed_interval(31, -5.0, 5.0);
        assert!(grid.nodes().iter().all(|&x| x > -5.0 && x < 5.0));
        assert_abs_diff_eq!(grid.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(moment(&grid, 2), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn prior_shifts_and_scales_nodes() {
        let prior = AbilityPrior { mean: 0.5, sd: 2.0 };
        let grid = AbilityGrid::from_rule(QuadratureRule::GaussHermite, 21, prior);
        assert_abs_diff_eq!(moment(&grid, 1), 0.5, epsilon = 1e-9);
        let variance = moment(&grid, 2) - 0.25;
        assert_abs_diff_eq!(variance, 4.0, epsilon = 1e-8);
        assert_eq!(grid.log_weights().len(), 21);
        assert!(grid.log_weights().iter().all(|w| w.is_finite()));
    }
}
