//! Response matrices, input validation and pattern compression.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::{IrtError, IrtResult};
use crate::models::ModelFamily;

/// Any negative entry is treated as missing; this is the canonical marker.
pub const MISSING: i32 = -1;

/// Respondents in rows, items in columns, categories as `0..K`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMatrix {
    data: Array2<i32>,
}

/// Per-item facts established by [`ResponseMatrix::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ItemLayout {
    /// Number of categories (highest observed category + 1, at least 2).
    pub n_categories: Vec<usize>,
    /// `Some(category)` for items where every observed response is identical.
    pub degenerate: Vec<Option<i32>>,
}

impl ItemLayout {
    pub fn informative_items(&self) -> usize {
        self.degenerate.iter().filter(|d| d.is_none()).count()
    }
}

/// Distinct response patterns with multiplicities.
#[derive(Debug, Clone)]
pub struct PatternTable {
    pub patterns: Array2<i32>,
    pub counts: Vec<f64>,
    /// Index into `patterns` for every respondent of the source matrix.
    pub respondent_pattern: Vec<usize>,
}

impl PatternTable {
    pub fn n_patterns(&self) -> usize {
        self.patterns.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.patterns.ncols()
    }

    pub fn total_count(&self) -> f64 {
        self.counts.iter().sum()
    }
}

impl From<Array2<i32>> for ResponseMatrix {
    fn from(data: Array2<i32>) -> Self {
        Self { data }
    }
}

impl ResponseMatrix {
    pub fn new(data: Array2<i32>) -> Self {
        Self { data }
    }

    pub fn from_rows(rows: &[Vec<i32>]) -> IrtResult<Self> {
        let n_items = rows.first().map_or(0, |r| r.len());
        let flat: Vec<i32> = rows.iter().flatten().copied().collect();
        if rows.iter().any(|r| r.len() != n_items) {
            return Err(IrtError::ParameterMismatch(
                "every respondent row must have the same number of items".to_string(),
            ));
        }
        let data = Array2::from_shape_vec((rows.len(), n_items), flat)?;
        Ok(Self { data })
    }

    pub fn n_respondents(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.data.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, i32> {
        self.data.view()
    }

    pub fn row(&self, respondent: usize) -> ArrayView1<'_, i32> {
        self.data.row(respondent)
    }

    /// The response, or `None` when missing.
    pub fn get(&self, respondent: usize, item: usize) -> Option<usize> {
        let value = self.data[[respondent, item]];
        (value >= 0).then_some(value as usize)
    }

    pub fn into_inner(self) -> Array2<i32> {
        self.data
    }

    /// Structural checks that must pass before any estimation starts.
    ///
    /// Zero-variance items are not errors; they are reported in
    /// [`ItemLayout::degenerate`] so the caller can leave them undefined.
    pub fn validate(&self, family: ModelFamily) -> IrtResult<ItemLayout> {
        let (n_respondents, n_items) = self.data.dim();
        if n_respondents < 2 || n_items < 2 {
            return Err(IrtError::TooSmall {
                respondents: n_respondents,
                items: n_items,
            });
        }

        for (i, row) in self.data.rows().into_iter().enumerate() {
            if row.iter().all(|&x| x < 0) {
                return Err(IrtError::EmptyRespondent { respondent: i });
            }
        }

        let mut n_categories = Vec::with_capacity(n_items);
        let mut degenerate = Vec::with_capacity(n_items);
        for (j, column) in self.data.columns().into_iter().enumerate() {
            let mut observed: Vec<i32> = column.iter().copied().filter(|&x| x >= 0).collect();
            if observed.is_empty() {
                return Err(IrtError::EmptyItem { item: j });
            }
            observed.sort_unstable();
            observed.dedup();

            let max = *observed.last().unwrap_or(&0);
            if family.is_dichotomous() && max > 1 {
                return Err(IrtError::NotDichotomous {
                    item: j,
                    category: max,
                    family: family.to_string(),
                });
            }

            if observed.len() == 1 {
                degenerate.push(Some(observed[0]));
            } else {
                if observed.len() != max as usize + 1 {
                    return Err(IrtError::NonContiguousCategories {
                        item: j,
                        observed,
                        max,
                    });
                }
                degenerate.push(None);
            }
            n_categories.push((max as usize + 1).max(2));
        }

        let layout = ItemLayout {
            n_categories,
            degenerate,
        };
        let informative = layout.informative_items();
        if informative < 2 {
            return Err(IrtError::InsufficientInformativeItems { informative });
        }
        Ok(layout)
    }

    /// Observed share of each category `0..n_categories` for one item.
    pub fn category_proportions(&self, item: usize, n_categories: usize) -> Vec<f64> {
        let mut counts = vec![0.0; n_categories];
        let mut total = 0.0;
        for &x in self.data.column(item).iter() {
            if x >= 0 && (x as usize) < n_categories {
                counts[x as usize] += 1.0;
                total += 1.0;
            }
        }
        if total > 0.0 {
            counts.iter_mut().for_each(|c| *c /= total);
        }
        counts
    }

    /// Collapse identical rows. Patterns appear in first-seen order, so the
    /// table is deterministic for a given matrix.
    pub fn patterns(&self) -> PatternTable {
        let n_items = self.n_items();
        let mut index: HashMap<Vec<i32>, usize> = HashMap::new();
        let mut flat = Vec::new();
        let mut counts = Vec::new();
        let mut respondent_pattern = Vec::with_capacity(self.n_respondents());

        for row in self.data.rows() {
            // Normalize every missing code to MISSING so they collapse together.
            let key: Vec<i32> = row.iter().map(|&x| if x < 0 { MISSING } else { x }).collect();
            let next = counts.len();
            let slot = *index.entry(key.clone()).or_insert(next);
            if slot == next {
                flat.extend_from_slice(&key);
                counts.push(0.0);
            }
            counts[slot] += 1.0;
            respondent_pattern.push(slot);
        }

        let patterns = Array2::from_shape_vec((counts.len(), n_items), flat)
            .unwrap_or_else(|_| Array2::zeros((0, n_items)));
        PatternTable {
            patterns,
            counts,
            respondent_pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn patterns_collapse_duplicates_in_first_seen_order() {
        let matrix = ResponseMatrix::new(array![
            [1, 0, 1],
            [0, 0, 1],
            [1, 0, 1],
            [1, -9, 1],
            [1, MISSING, 1],
        ]);
        let table = matrix.patterns();
        assert_eq!(table.n_patterns(), 3);
        assert_eq!(table.counts, vec![2.0, 1.0, 2.0]);
        assert_eq!(table.respondent_pattern, vec![0, 1, 0, 2, 2]);
        assert_eq!(table.patterns.row(2).to_vec(), vec![1, MISSING, 1]);
        assert_eq!(table.total_count(), 5.0);
    }

    #[test]
    fn validate_reports_layout_and_degenerate_items() {
        let matrix = ResponseMatrix::new(array![[0, 2, 1, 1], [1, 1, 0, 1], [1, 0, MISSING, 1]]);
        let layout = matrix.validate(ModelFamily::GradedResponse).unwrap();
        assert_eq!(layout.n_categories, vec![2, 3, 2, 2]);
        assert_eq!(layout.degenerate, vec![None, None, None, Some(1)]);
        assert_eq!(layout.informative_items(), 3);
    }

    #[test]
    fn validate_rejects_structural_problems() {
        let too_small = ResponseMatrix::new(array![[0, 1]]);
        assert!(matches!(
            too_small.validate(ModelFamily::TwoPl),
            Err(IrtError::TooSmall { .. })
        ));

        let gap = ResponseMatrix::new(array![[0, 1], [2, 0], [0, 1]]);
        assert!(matches!(
            gap.validate(ModelFamily::GradedResponse),
            Err(IrtError::NonContiguousCategories { item: 0, .. })
        ));

        let poly = ResponseMatrix::new(array![[0, 1], [2, 0], [1, 1]]);
        assert!(matches!(
            poly.validate(ModelFamily::TwoPl),
            Err(IrtError::NotDichotomous { item: 0, category: 2, .. })
        ));

        let empty_item = ResponseMatrix::new(array![[0, MISSING, 1], [1, MISSING, 0]]);
        assert!(matches!(
            empty_item.validate(ModelFamily::TwoPl),
            Err(IrtError::EmptyItem { item: 1 })
        ));

        let empty_person = ResponseMatrix::new(array![[0, 1], [MISSING, MISSING], [1, 0]]);
        assert!(matches!(
            empty_person.validate(ModelFamily::TwoPl),
            Err(IrtError::EmptyRespondent { respondent: 1 })
        ));

        let flat = ResponseMatrix::new(array![[1, 1, 0], [1, 1, 1], [1, 1, 0]]);
        assert!(matches!(
            flat.validate(ModelFamily::TwoPl),
            Err(IrtError::InsufficientInformativeItems { informative: 1 })
        ));
    }

    #[test]
    fn category_proportions_skip_missing() {
        let matrix = ResponseMatrix::new(array![[0, 1], [2, 0], [MISSING, 1], [2, 1]]);
        let props = matrix.category_proportions(0, 3);
        assert_eq!(props, vec![1.0 / 3.0, 0.0, 2.0 / 3.0]);
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        assert!(ResponseMatrix::from_rows(&[vec![0, 1], vec![1]]).is_err());
        let matrix = ResponseMatrix::from_rows(&[vec![0, 1], vec![1, 0]]).unwrap();
        assert_eq!(matrix.get(1, 0), Some(1));
    }
}
