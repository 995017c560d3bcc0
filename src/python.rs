//! Python bindings.
//!
//! Item parameters cross the boundary as a matrix with one row per item in
//! the family's value layout, padded on the right with NaN. A row that
//! starts with NaN is an undefined item.

use ndarray::{Array2, ArrayView2};
use numpy::{PyArray2, PyReadonlyArray1, PyReadonlyArray2, ToPyArray};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::{AbilityMethod, EstimationConfig};
use crate::data::ResponseMatrix;
use crate::error::{IrtError, IrtResult};
use crate::models::{ItemParameters, ModelFamily};
use crate::scoring::{AbilityEstimate, AbilityScorer};

impl From<IrtError> for PyErr {
    fn from(err: IrtError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

fn parameter_matrix(items: &[ItemParameters]) -> Array2<f64> {
    let width = items.iter().map(|item| item.values().len()).max().unwrap_or(0);
    let mut out = Array2::from_elem((items.len(), width), f64::NAN);
    for (j, item) in items.iter().enumerate() {
        for (v, &value) in item.values().iter().enumerate() {
            out[[j, v]] = value;
        }
    }
    out
}

fn items_from_matrix(params: ArrayView2<'_, f64>, family: ModelFamily) -> IrtResult<Vec<ItemParameters>> {
    params
        .rows()
        .into_iter()
        .map(|row| {
            let values: Vec<f64> = row.iter().copied().take_while(|v| !v.is_nan()).collect();
            if values.is_empty() {
                return Ok(ItemParameters::undefined(family, row.len().max(2)));
            }
            ItemParameters::new(family, values)
        })
        .collect()
}

fn ability_matrix(estimates: &[AbilityEstimate]) -> Array2<f64> {
    let mut out = Array2::zeros((estimates.len(), 2));
    for (i, estimate) in estimates.iter().enumerate() {
        out[[i, 0]] = estimate.theta;
        out[[i, 1]] = estimate.standard_error;
    }
    out
}

/// Fit an item bank; returns (parameters, abilities, log-likelihood,
/// iterations, converged).
#[pyfunction]
#[pyo3(signature = (responses, model="twopl", method="marginal", ability_method="eap", quadrature_points=41, max_iterations=200, tol=1e-4))]
#[allow(clippy::too_many_arguments, clippy::type_complexity)]
pub fn fit_items<'py>(
    py: Python<'py>,
    responses: PyReadonlyArray2<i32>,
    model: &str,
    method: &str,
    ability_method: &str,
    quadrature_points: usize,
    max_iterations: usize,
    tol: f64,
) -> PyResult<(
    Bound<'py, PyArray2<f64>>,
    Bound<'py, PyArray2<f64>>,
    f64,
    usize,
    bool,
)> {
    let config = EstimationConfig {
        model_family: model.parse()?,
        estimation_method: method.parse()?,
        ability_method: ability_method.parse()?,
        quadrature_points,
        max_iterations,
        convergence_tolerance: tol,
        ..EstimationConfig::default()
    };
    let matrix = ResponseMatrix::new(responses.as_array().to_owned());

    let result = py.detach(|| crate::estimation::fit(&matrix, &config))?;
    let params = parameter_matrix(&result.items);
    let abilities = ability_matrix(result.abilities.as_deref().unwrap_or(&[]));

    Ok((
        params.to_pyarray(py),
        abilities.to_pyarray(py),
        result.report.final_log_likelihood,
        result.report.iterations,
        result.report.converged,
    ))
}

/// Score respondents against fixed parameters; returns (theta, se) rows.
#[pyfunction]
#[pyo3(signature = (responses, params, model="twopl", method="eap"))]
pub fn score_abilities<'py>(
    py: Python<'py>,
    responses: PyReadonlyArray2<i32>,
    params: PyReadonlyArray2<f64>,
    model: &str,
    method: &str,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let family: ModelFamily = model.parse()?;
    let method: AbilityMethod = method.parse()?;
    let items = items_from_matrix(params.as_array(), family)?;
    let matrix = ResponseMatrix::new(responses.as_array().to_owned());
    if matrix.n_items() != items.len() {
        return Err(IrtError::ParameterMismatch(format!(
            "{} parameter rows for {} response columns",
            items.len(),
            matrix.n_items()
        ))
        .into());
    }

    let estimates = py.detach(|| AbilityScorer::with_defaults(&items).estimate_all(&matrix, method));
    Ok(ability_matrix(&estimates).to_pyarray(py))
}

#[pyfunction]
#[pyo3(signature = (params, abilities, model="twopl", seed=42))]
pub fn simulate_responses<'py>(
    py: Python<'py>,
    params: PyReadonlyArray2<f64>,
    abilities: PyReadonlyArray1<f64>,
    model: &str,
    seed: u64,
) -> PyResult<Bound<'py, PyArray2<i32>>> {
    let family: ModelFamily = model.parse()?;
    let items = items_from_matrix(params.as_array(), family)?;
    let abilities = abilities.as_array().to_vec();
    let matrix =
        py.detach(|| crate::simulation::simulate_responses(&items, &abilities, seed));
    Ok(matrix.into_inner().to_pyarray(py))
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(fit_items, m)?)?;
    m.add_function(wrap_pyfunction!(score_abilities, m)?)?;
    m.add_function(wrap_pyfunction!(simulate_responses, m)?)?;
    Ok(())
}
