//! Error taxonomy and non-fatal diagnostics.
//!
//! [`IrtError`] aborts a call: structural problems with the input or the
//! configuration, and per-item arithmetic failures that the orchestrator
//! isolates. Everything that should not stop a run is reported as a
//! [`Diagnostic`] inside the convergence report instead.

use serde::Serialize;
use thiserror::Error;

pub type IrtResult<T> = Result<T, IrtError>;

#[derive(Error, Debug)]
pub enum IrtError {
    #[error(
        "response matrix needs at least two respondents and two items, got {respondents} x {items}"
    )]
    TooSmall { respondents: usize, items: usize },

    #[error("item {item} has no observed responses")]
    EmptyItem { item: usize },

    #[error("respondent {respondent} has no observed responses")]
    EmptyRespondent { respondent: usize },

    #[error("item {item} has non-contiguous categories {observed:?}; expected 0..={max}")]
    NonContiguousCategories {
        item: usize,
        observed: Vec<i32>,
        max: i32,
    },

    #[error("item {item} uses category {category}, but the {family} model is dichotomous")]
    NotDichotomous {
        item: usize,
        category: i32,
        family: String,
    },

    #[error("only {informative} item(s) vary across respondents; at least two are required")]
    InsufficientInformativeItems { informative: usize },

    #[error("parameter set does not match the data: {0}")]
    ParameterMismatch(String),

    #[error("response matrix has an invalid shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("item {item}: objective stayed non-finite after {attempts} recovery attempts")]
    InternalArithmetic { item: usize, attempts: usize },
}

impl IrtError {
    /// True for errors describing malformed input rather than numerics.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, IrtError::InternalArithmetic { .. })
    }
}

/// Direction of an extreme response pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremePattern {
    /// Every observed response sits in the lowest category.
    AllMinimum,
    /// Every observed response sits in the highest category of its item.
    AllMaximum,
}

/// Non-fatal, per-entity findings collected during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Every respondent chose the same category; the item is left undefined.
    ZeroVarianceItem { item: usize, category: i32 },
    /// Unregularized maximum likelihood has no finite ability for this respondent.
    ExtremeRespondent {
        respondent: usize,
        pattern: ExtremePattern,
    },
    /// The iteration budget ran out before the tolerance was met.
    IterationBudgetExhausted {
        max_iterations: usize,
        last_change: f64,
    },
    /// The item update failed numerically; its previous parameters were kept.
    ArithmeticFailure { item: usize, iteration: usize },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::ZeroVarianceItem { item, category } => {
                write!(f, "item {item} has zero variance (every response is {category})")
            }
            Diagnostic::ExtremeRespondent {
                respondent,
                pattern,
            } => {
                write!(f, "respondent {respondent} has an extreme pattern ({pattern:?}); MLE is undefined")
            }
            Diagnostic::IterationBudgetExhausted {
                max_iterations,
                last_change,
            } => {
                write!(
                    f,
                    "no convergence within {max_iterations} iterations (last relative change {last_change:.3e})"
                )
            }
            Diagnostic::ArithmeticFailure { item, iteration } => {
                write!(f, "item {item} update failed at iteration {iteration}; kept previous parameters")
            }
        }
    }
}
