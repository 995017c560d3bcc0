//! Shared numeric helpers.

/// Probabilities are kept at least this far from 0 and 1 before taking logs.
pub const EPSILON: f64 = 1e-10;

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

/// `ln(p)` after clamping `p` into `[EPSILON, 1 - EPSILON]`.
#[inline]
pub fn clamped_ln(p: f64) -> f64 {
    p.clamp(EPSILON, 1.0 - EPSILON).ln()
}

#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

#[inline]
pub fn logsumexp(arr: &[f64]) -> f64 {
    if arr.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = arr.iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Turn unnormalized log weights into probabilities summing to one.
pub fn normalize_log_posterior(log_posterior: &[f64]) -> Vec<f64> {
    let log_norm = logsumexp(log_posterior);
    log_posterior
        .iter()
        .map(|&lp| (lp - log_norm).exp())
        .collect()
}

/// Posterior mean and standard deviation of `nodes` under `posterior`.
pub fn compute_eap_with_se(posterior: &[f64], nodes: &[f64]) -> (f64, f64) {
    let eap: f64 = posterior.iter().zip(nodes).map(|(&p, &t)| p * t).sum();
    let var: f64 = posterior
        .iter()
        .zip(nodes)
        .map(|(&p, &t)| p * (t - eap).powi(2))
        .sum();
    (eap, var.max(0.0).sqrt())
}

/// Solve `A x = b` for a small symmetric positive definite `A` stored
/// row-major. Returns `None` when the Cholesky factorization breaks down.
pub fn solve_spd(a: &[f64], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n * n {
        return None;
    }
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * y[k];
        }
        y[i] = sum / l[i * n + i];
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l[k * n + i] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }

    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sigmoid_is_symmetric_and_stable() {
        for &x in &[-800.0, -5.0, -0.3, 0.0, 0.3, 5.0, 800.0] {
            assert_abs_diff_eq!(sigmoid(x) + sigmoid(-x), 1.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
    }

    #[test]
    fn logsumexp_handles_large_offsets() {
        let values = [1000.0, 1000.0];
        assert_abs_diff_eq!(logsumexp(&values), 1000.0 + 2f64.ln(), epsilon = 1e-12);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn normalized_posterior_sums_to_one() {
        let post = normalize_log_posterior(&[-3.0, -1.0, -2.0, -700.0]);
        assert_abs_diff_eq!(post.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        let (mean, sd) = compute_eap_with_se(&[0.25, 0.5, 0.25], &[-1.0, 0.0, 1.0]);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sd, 0.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn spd_solve_matches_known_solution() {
        let a = [4.0, 1.0, 1.0, 3.0];
        let x = solve_spd(&a, &[1.0, 2.0]).unwrap();
        assert_abs_diff_eq!(x[0], 1.0 / 11.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 7.0 / 11.0, epsilon = 1e-12);
        assert!(solve_spd(&[1.0, 2.0, 2.0, 1.0], &[1.0, 1.0]).is_none());
    }
}
