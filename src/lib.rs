//! Item response theory calibration.
//!
//! This crate estimates item parameters and respondent abilities from
//! categorical response data:
//! - Dichotomous models (Rasch, 1PL, 2PL, 3PL) and polytomous models
//!   (graded response, generalized partial credit) behind one trait
//! - Gauss-Hermite and fixed-interval quadrature grids
//! - Marginal maximum likelihood via EM and joint maximum likelihood
//! - Ability scoring by MLE, MAP and EAP
//! - Response simulation for recovery studies
//!
//! Python bindings are available behind the `python` feature.

pub mod utils;

pub mod config;
pub mod data;
pub mod dichotomous;
pub mod error;
pub mod estimation;
pub mod likelihood;
pub mod models;
pub mod mstep;
pub mod polytomous;
pub mod quadrature;
pub mod scoring;
pub mod simulation;

#[cfg(feature = "python")]
pub mod python;

pub use config::{
    AbilityMethod, AbilityPrior, EstimationConfig, EstimationMethod, GuessingPrior,
    NewtonSettings, ParameterBounds, QuadratureRule,
};
pub use data::{MISSING, ResponseMatrix};
pub use error::{Diagnostic, ExtremePattern, IrtError, IrtResult};
pub use estimation::{ConvergenceReport, EstimationState, FitResult, Phase, fit, fit_from};
pub use models::{ItemModel, ItemParameters, ModelFamily};
pub use quadrature::{AbilityGrid, build_grid};
pub use scoring::{AbilityEstimate, AbilityScorer, AbilityStatus, estimate_ability};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module for irtfit
#[cfg(feature = "python")]
#[pymodule]
fn irtfit(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}
