//! Synthetic response generation for recovery studies.
//!
//! Every respondent draws from its own `Pcg64` stream seeded with
//! `seed + respondent`, so results are reproducible and independent of the
//! rayon thread count.

use ndarray::Array2;
use rand::prelude::*;
use rand_distr::Normal;
use rand_pcg::Pcg64;
use rayon::prelude::*;

use crate::data::{MISSING, ResponseMatrix};
use crate::error::{IrtError, IrtResult};
use crate::models::ItemParameters;

/// Inverse-CDF draw of a category from `probs`.
fn draw_category(probs: &[f64], u: f64) -> usize {
    let mut cumulative = 0.0;
    for (k, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return k;
        }
    }
    probs.len().saturating_sub(1)
}

/// Responses of every ability in `abilities` to every item.
/// Undefined items produce missing responses.
pub fn simulate_responses(items: &[ItemParameters], abilities: &[f64], seed: u64) -> ResponseMatrix {
    let n_items = items.len();
    let rows: Vec<Vec<i32>> = abilities
        .par_iter()
        .enumerate()
        .map(|(i, &theta)| {
            let mut rng = Pcg64::seed_from_u64(seed.wrapping_add(i as u64));
            items
                .iter()
                .map(|item| {
                    let u: f64 = rng.random();
                    if item.is_defined() {
                        draw_category(&item.category_probabilities(theta), u) as i32
                    } else {
                        MISSING
                    }
                })
                .collect()
        })
        .collect();

    let mut data = Array2::from_elem((abilities.len(), n_items), MISSING);
    for (i, row) in rows.iter().enumerate() {
        for (j, &x) in row.iter().enumerate() {
            data[[i, j]] = x;
        }
    }
    ResponseMatrix::new(data)
}

/// `n` draws from `N(mean, sd^2)`.
pub fn sample_abilities(n: usize, mean: f64, sd: f64, seed: u64) -> IrtResult<Vec<f64>> {
    let normal = Normal::new(mean, sd)
        .map_err(|e| IrtError::InvalidConfig(format!("ability distribution: {e}")))?;
    let mut rng = Pcg64::seed_from_u64(seed);
    Ok((0..n).map(|_| normal.sample(&mut rng)).collect())
}

/// Blank out each response independently with probability `rate`, never
/// emptying a respondent completely.
pub fn inject_missing(matrix: &ResponseMatrix, rate: f64, seed: u64) -> ResponseMatrix {
    let mut data = matrix.view().to_owned();
    let rate = rate.clamp(0.0, 1.0);
    for (i, mut row) in data.rows_mut().into_iter().enumerate() {
        let mut rng = Pcg64::seed_from_u64(seed.wrapping_add(i as u64));
        let keep = rng.random_range(0..row.len().max(1));
        for (j, x) in row.iter_mut().enumerate() {
            let u: f64 = rng.random();
            if j != keep && u < rate {
                *x = MISSING;
            }
        }
    }
    ResponseMatrix::new(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn simulation_is_reproducible() {
        let items = vec![
            ItemParameters::two_pl(1.0, 0.0),
            ItemParameters::graded(1.2, &[-0.5, 0.5]),
        ];
        let abilities = sample_abilities(50, 0.0, 1.0, 3).unwrap();
        let a = simulate_responses(&items, &abilities, 11);
        let b = simulate_responses(&items, &abilities, 11);
        assert_eq!(a, b);
        assert!(a.view().column(1).iter().all(|&x| (0..3).contains(&x)));
    }

    #[test]
    fn response_rates_follow_the_model() {
        let items = vec![ItemParameters::two_pl(1.0, 0.0)];
        let abilities = vec![1.0; 20_000];
        let matrix = simulate_responses(&items, &abilities, 5);
        let rate = matrix.view().iter().filter(|&&x| x == 1).count() as f64 / 20_000.0;
        assert_abs_diff_eq!(rate, items[0].probability(1.0, 1), epsilon = 0.015);
    }

    #[test]
    fn sampled_abilities_have_requested_moments() {
        let draws = sample_abilities(20_000, 0.5, 2.0, 9).unwrap();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert_abs_diff_eq!(mean, 0.5, epsilon = 0.06);
        assert!(sample_abilities(10, 0.0, -1.0, 1).is_err());
    }

    #[test]
    fn injected_missingness_keeps_one_response_per_row() {
        let items = vec![ItemParameters::two_pl(1.0, 0.0); 5];
        let matrix = simulate_responses(&items, &[0.0; 200], 2);
        let sparse = inject_missing(&matrix, 0.9, 4);
        for row in sparse.view().rows() {
            assert!(row.iter().any(|&x| x >= 0));
        }
        let missing = sparse.view().iter().filter(|&&x| x < 0).count();
        assert!(missing > 500);
    }
}
