//! Item likelihood models.
//!
//! Every model family implements [`ItemModel`]; the marginal likelihood
//! engine, the item update step, the orchestrator and the ability
//! estimator only ever talk to that trait. Parameters travel as
//! [`ItemParameters`], a family tag plus a flat value vector whose layout
//! the family defines:
//!
//! | family            | values                      |
//! |-------------------|-----------------------------|
//! | `Rasch`           | `[b]`                       |
//! | `OnePl`, `TwoPl`  | `[a, b]`                    |
//! | `ThreePl`         | `[a, b, c]`                 |
//! | `GradedResponse`  | `[a, t_1, ..., t_{K-1}]`    |
//! | `PartialCredit`   | `[a, d_1, ..., d_{K-1}]`    |

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::ParameterBounds;
use crate::dichotomous::{OnePl, Rasch, ThreePl, TwoPl};
use crate::error::{IrtError, IrtResult};
use crate::polytomous::{GradedResponse, PartialCredit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "rasch")]
    Rasch,
    /// One slope shared by every item.
    #[serde(rename = "onepl")]
    OnePl,
    #[serde(rename = "twopl")]
    TwoPl,
    #[serde(rename = "threepl")]
    ThreePl,
    #[serde(rename = "graded_response")]
    GradedResponse,
    #[serde(rename = "partial_credit")]
    PartialCredit,
}

static RASCH: Rasch = Rasch;
static ONE_PL: OnePl = OnePl;
static TWO_PL: TwoPl = TwoPl;
static THREE_PL: ThreePl = ThreePl;
static GRADED_RESPONSE: GradedResponse = GradedResponse;
static PARTIAL_CREDIT: PartialCredit = PartialCredit;

impl ModelFamily {
    pub const ALL: [ModelFamily; 6] = [
        ModelFamily::Rasch,
        ModelFamily::OnePl,
        ModelFamily::TwoPl,
        ModelFamily::ThreePl,
        ModelFamily::GradedResponse,
        ModelFamily::PartialCredit,
    ];

    pub fn model(self) -> &'static dyn ItemModel {
        match self {
            ModelFamily::Rasch => &RASCH,
            ModelFamily::OnePl => &ONE_PL,
            ModelFamily::TwoPl => &TWO_PL,
            ModelFamily::ThreePl => &THREE_PL,
            ModelFamily::GradedResponse => &GRADED_RESPONSE,
            ModelFamily::PartialCredit => &PARTIAL_CREDIT,
        }
    }

    pub fn is_dichotomous(self) -> bool {
        matches!(
            self,
            ModelFamily::Rasch | ModelFamily::OnePl | ModelFamily::TwoPl | ModelFamily::ThreePl
        )
    }

    /// Whether the family estimates a discrimination parameter at all.
    pub fn has_free_discrimination(self) -> bool {
        !matches!(self, ModelFamily::Rasch)
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelFamily::Rasch => "rasch",
            ModelFamily::OnePl => "onepl",
            ModelFamily::TwoPl => "twopl",
            ModelFamily::ThreePl => "threepl",
            ModelFamily::GradedResponse => "graded_response",
            ModelFamily::PartialCredit => "partial_credit",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelFamily {
    type Err = IrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "rasch" => Ok(ModelFamily::Rasch),
            "onepl" | "1pl" => Ok(ModelFamily::OnePl),
            "twopl" | "2pl" => Ok(ModelFamily::TwoPl),
            "threepl" | "3pl" => Ok(ModelFamily::ThreePl),
            "graded_response" | "grm" => Ok(ModelFamily::GradedResponse),
            "partial_credit" | "pcm" | "gpcm" => Ok(ModelFamily::PartialCredit),
            _ => Err(IrtError::UnknownVariant {
                kind: "model family",
                value: s.to_string(),
            }),
        }
    }
}

/// Capability set shared by all model families.
///
/// `params` is always the flat value vector of an [`ItemParameters`] of the
/// implementing family. Gradients are taken with respect to that vector.
pub trait ItemModel: Send + Sync {
    fn family(&self) -> ModelFamily;

    /// Length of the value vector for an item with `n_categories` categories.
    fn parameter_count(&self, n_categories: usize) -> usize;

    fn n_categories(&self, params: &[f64]) -> usize;

    /// Which parameters the per-item update may move. The 1PL slope is
    /// shared and handled separately by the update step.
    fn free_parameters(&self, n_params: usize) -> Vec<bool> {
        vec![true; n_params]
    }

    /// P(X = k | theta) for every category k.
    fn category_probabilities(&self, theta: f64, params: &[f64]) -> Vec<f64>;

    /// dP(X = k | theta) / d params, one row per category.
    fn category_gradients(&self, theta: f64, params: &[f64]) -> Array2<f64>;

    /// dP(X = k | theta) / d theta for every category k.
    fn ability_derivatives(&self, theta: f64, params: &[f64]) -> Vec<f64>;

    fn constraint_check(&self, params: &[f64], bounds: &ParameterBounds) -> bool;

    /// Clamp every parameter into its box. Ordering constraints are left to
    /// [`ItemModel::constraint_check`].
    fn project(&self, params: &mut [f64], bounds: &ParameterBounds);

    /// Deterministic starting values from observed category proportions.
    fn initial_parameters(&self, category_proportions: &[f64]) -> Vec<f64>;

    fn probability(&self, theta: f64, params: &[f64], category: usize) -> f64 {
        self.category_probabilities(theta, params)
            .get(category)
            .copied()
            .unwrap_or(0.0)
    }

    fn derivative(&self, theta: f64, params: &[f64], category: usize) -> Vec<f64> {
        let gradients = self.category_gradients(theta, params);
        if category < gradients.nrows() {
            gradients.row(category).to_vec()
        } else {
            vec![0.0; params.len()]
        }
    }
}

#[inline]
pub(crate) fn within(value: f64, (lo, hi): (f64, f64)) -> bool {
    value.is_finite() && value >= lo && value <= hi
}

#[inline]
pub(crate) fn strictly_increasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[1] > w[0])
}

/// Fitted (or generating) parameters of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemParameters {
    family: ModelFamily,
    values: Vec<f64>,
}

impl ItemParameters {
    pub fn new(family: ModelFamily, values: Vec<f64>) -> IrtResult<Self> {
        let expected = match family {
            ModelFamily::Rasch => Some(1),
            ModelFamily::OnePl | ModelFamily::TwoPl => Some(2),
            ModelFamily::ThreePl => Some(3),
            ModelFamily::GradedResponse | ModelFamily::PartialCredit => None,
        };
        match expected {
            Some(n) if values.len() != n => Err(IrtError::ParameterMismatch(format!(
                "{family} items take {n} values, got {}",
                values.len()
            ))),
            None if values.len() < 2 => Err(IrtError::ParameterMismatch(format!(
                "{family} items need a discrimination and at least one threshold, got {} values",
                values.len()
            ))),
            _ => Ok(Self { family, values }),
        }
    }

    pub fn rasch(difficulty: f64) -> Self {
        Self {
            family: ModelFamily::Rasch,
            values: vec![difficulty],
        }
    }

    pub fn one_pl(discrimination: f64, difficulty: f64) -> Self {
        Self {
            family: ModelFamily::OnePl,
            values: vec![discrimination, difficulty],
        }
    }

    pub fn two_pl(discrimination: f64, difficulty: f64) -> Self {
        Self {
            family: ModelFamily::TwoPl,
            values: vec![discrimination, difficulty],
        }
    }

    pub fn three_pl(discrimination: f64, difficulty: f64, guessing: f64) -> Self {
        Self {
            family: ModelFamily::ThreePl,
            values: vec![discrimination, difficulty, guessing],
        }
    }

    pub fn graded(discrimination: f64, thresholds: &[f64]) -> Self {
        Self::polytomous(ModelFamily::GradedResponse, discrimination, thresholds)
    }

    pub fn partial_credit(discrimination: f64, steps: &[f64]) -> Self {
        Self::polytomous(ModelFamily::PartialCredit, discrimination, steps)
    }

    fn polytomous(family: ModelFamily, discrimination: f64, thresholds: &[f64]) -> Self {
        let mut values = Vec::with_capacity(thresholds.len() + 1);
        values.push(discrimination);
        values.extend_from_slice(thresholds);
        Self { family, values }
    }

    /// All-NaN sentinel for an item whose parameters are not identified.
    pub fn undefined(family: ModelFamily, n_categories: usize) -> Self {
        let n = family.model().parameter_count(n_categories);
        Self {
            family,
            values: vec![f64::NAN; n],
        }
    }

    /// Unchecked constructor for values produced by the family itself.
    pub(crate) fn from_values(family: ModelFamily, values: Vec<f64>) -> Self {
        Self { family, values }
    }

    pub(crate) fn with_values(&self, values: Vec<f64>) -> Self {
        Self {
            family: self.family,
            values,
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn model(&self) -> &'static dyn ItemModel {
        self.family.model()
    }

    /// False for the undefined sentinel; such items contribute nothing.
    pub fn is_defined(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    pub fn n_categories(&self) -> usize {
        self.model().n_categories(&self.values)
    }

    pub fn discrimination(&self) -> f64 {
        match self.family {
            ModelFamily::Rasch => 1.0,
            _ => self.values[0],
        }
    }

    /// Difficulty of a dichotomous item.
    pub fn difficulty(&self) -> Option<f64> {
        match self.family {
            ModelFamily::Rasch => Some(self.values[0]),
            ModelFamily::OnePl | ModelFamily::TwoPl | ModelFamily::ThreePl => Some(self.values[1]),
            ModelFamily::GradedResponse | ModelFamily::PartialCredit => None,
        }
    }

    pub fn guessing(&self) -> f64 {
        match self.family {
            ModelFamily::ThreePl => self.values[2],
            _ => 0.0,
        }
    }

    /// Location parameters: the difficulty for dichotomous items, the
    /// threshold (GRM) or step (PCM) vector for polytomous ones.
    pub fn thresholds(&self) -> &[f64] {
        match self.family {
            ModelFamily::Rasch => &self.values[..1],
            ModelFamily::OnePl | ModelFamily::TwoPl | ModelFamily::ThreePl => &self.values[1..2],
            ModelFamily::GradedResponse | ModelFamily::PartialCredit => &self.values[1..],
        }
    }

    pub fn probability(&self, theta: f64, category: usize) -> f64 {
        self.model().probability(theta, &self.values, category)
    }

    pub fn category_probabilities(&self, theta: f64) -> Vec<f64> {
        self.model().category_probabilities(theta, &self.values)
    }
}
