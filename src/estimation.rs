//! Estimation orchestrator.
//!
//! A run walks an explicit phase machine
//! `Initializing -> EStep -> MStep -> ConvergenceCheck -> (EStep | Converged | MaxIterationsReached)`
//! and records an immutable [`EstimationState`] after every completed
//! iteration. Marginal maximum likelihood integrates ability out over the
//! quadrature grid; joint maximum likelihood alternates item updates with
//! per-respondent ability MLEs.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{AbilityMethod, EstimationConfig, EstimationMethod, NewtonSettings};
use crate::data::{ItemLayout, PatternTable, ResponseMatrix};
use crate::error::{Diagnostic, IrtError, IrtResult};
use crate::likelihood::{Posterior, all_expected_counts, e_step};
use crate::models::{ItemParameters, ModelFamily};
use crate::mstep::{ItemSufficientStats, update_item, update_shared_discrimination};
use crate::quadrature::AbilityGrid;
use crate::scoring::{AbilityEstimate, AbilityScorer, AbilityStatus, ScoringSettings};
use crate::utils::clamped_ln;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    EStep,
    MStep,
    ConvergenceCheck,
    Converged,
    MaxIterationsReached,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Converged | Phase::MaxIterationsReached)
    }
}

/// Snapshot of a run after an iteration. Never mutated; each iteration
/// derives a new one.
#[derive(Debug, Clone)]
pub struct EstimationState {
    items: Vec<ItemParameters>,
    log_likelihood: f64,
    iteration: usize,
    converged: bool,
}

impl EstimationState {
    fn initial(items: Vec<ItemParameters>) -> Self {
        Self {
            items,
            log_likelihood: f64::NEG_INFINITY,
            iteration: 0,
            converged: false,
        }
    }

    fn with_log_likelihood(&self, log_likelihood: f64) -> Self {
        Self {
            log_likelihood,
            ..self.clone()
        }
    }

    fn advance(&self, items: Vec<ItemParameters>, log_likelihood: f64, converged: bool) -> Self {
        Self {
            items,
            log_likelihood,
            iteration: self.iteration + 1,
            converged,
        }
    }

    pub fn items(&self) -> &[ItemParameters] {
        &self.items
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn converged(&self) -> bool {
        self.converged
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub iterations: usize,
    pub final_log_likelihood: f64,
    pub converged: bool,
    pub outcome: Phase,
    /// Log-likelihood at the start and after every iteration.
    pub log_likelihood_trace: Vec<f64>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    pub family: ModelFamily,
    pub items: Vec<ItemParameters>,
    pub abilities: Option<Vec<AbilityEstimate>>,
    pub report: ConvergenceReport,
}

/// Phase plus whatever the next phase consumes.
enum Step<E> {
    Initializing,
    EStep(Option<E>),
    MStep(Vec<Option<ItemSufficientStats>>),
    ConvergenceCheck(Vec<ItemParameters>),
    Done(Phase),
}

impl<E> Step<E> {
    fn phase(&self) -> Phase {
        match self {
            Step::Initializing => Phase::Initializing,
            Step::EStep(_) => Phase::EStep,
            Step::MStep(_) => Phase::MStep,
            Step::ConvergenceCheck(_) => Phase::ConvergenceCheck,
            Step::Done(phase) => *phase,
        }
    }
}

/// Shared inputs of one run.
struct Run<'a> {
    responses: &'a ResponseMatrix,
    config: &'a EstimationConfig,
    layout: &'a ItemLayout,
    grid: &'a AbilityGrid,
}

/// Loop outcome before abilities are attached.
struct Fitted {
    items: Vec<ItemParameters>,
    report: ConvergenceReport,
}

/// Fit item parameters from deterministic starting values.
pub fn fit(responses: &ResponseMatrix, config: &EstimationConfig) -> IrtResult<FitResult> {
    config.validate()?;
    let layout = responses.validate(config.model_family)?;
    let initial = initial_items(responses, config.model_family, &layout);
    fit_validated(responses, config, layout, initial)
}

/// Fit item parameters starting from `initial`.
pub fn fit_from(
    responses: &ResponseMatrix,
    config: &EstimationConfig,
    initial: &[ItemParameters],
) -> IrtResult<FitResult> {
    config.validate()?;
    let layout = responses.validate(config.model_family)?;
    let initial = check_initial(initial, config, &layout)?;
    fit_validated(responses, config, layout, initial)
}

fn fit_validated(
    responses: &ResponseMatrix,
    config: &EstimationConfig,
    layout: ItemLayout,
    initial: Vec<ItemParameters>,
) -> IrtResult<FitResult> {
    let grid = AbilityGrid::from_rule(
        config.quadrature_rule,
        config.quadrature_points,
        config.ability_prior,
    );
    info!(
        "fitting {} model by {:?} estimation: {} respondents, {} items, {} quadrature points",
        config.model_family,
        config.estimation_method,
        responses.n_respondents(),
        responses.n_items(),
        grid.len()
    );

    let mut diagnostics = Vec::new();
    for (item, degenerate) in layout.degenerate.iter().enumerate() {
        if let Some(category) = *degenerate {
            record(&mut diagnostics, Diagnostic::ZeroVarianceItem { item, category });
        }
    }

    let run = Run {
        responses,
        config,
        layout: &layout,
        grid: &grid,
    };
    let Fitted { items, mut report } = match config.estimation_method {
        EstimationMethod::Marginal => run_marginal(&run, initial, diagnostics)?,
        EstimationMethod::Joint => run_joint(&run, initial, diagnostics)?,
    };

    let abilities = if config.score_respondents {
        let scorer = AbilityScorer::new(
            &items,
            grid.clone(),
            config.ability_prior,
            ScoringSettings::default(),
        );
        let estimates = scorer.estimate_all(responses, config.ability_method);
        for (respondent, estimate) in estimates.iter().enumerate() {
            if let AbilityStatus::Undefined(pattern) = estimate.status {
                let diagnostic = Diagnostic::ExtremeRespondent {
                    respondent,
                    pattern,
                };
                if !report.diagnostics.contains(&diagnostic) {
                    record(&mut report.diagnostics, diagnostic);
                }
            }
        }
        Some(estimates)
    } else {
        None
    };

    info!(
        "finished after {} iteration(s): {:?}, log-likelihood {:.4}",
        report.iterations, report.outcome, report.final_log_likelihood
    );
    Ok(FitResult {
        family: config.model_family,
        items,
        abilities,
        report,
    })
}

fn record(diagnostics: &mut Vec<Diagnostic>, diagnostic: Diagnostic) {
    warn!("{diagnostic}");
    diagnostics.push(diagnostic);
}

fn log_transition(iteration: usize, from: Phase, to: Phase) {
    debug!("iteration {iteration}: {from:?} -> {to:?}");
}

fn initial_items(
    responses: &ResponseMatrix,
    family: ModelFamily,
    layout: &ItemLayout,
) -> Vec<ItemParameters> {
    let model = family.model();
    layout
        .n_categories
        .iter()
        .zip(&layout.degenerate)
        .enumerate()
        .map(|(j, (&n_cat, degenerate))| {
            if degenerate.is_some() {
                ItemParameters::undefined(family, n_cat)
            } else {
                let proportions = responses.category_proportions(j, n_cat);
                ItemParameters::from_values(family, model.initial_parameters(&proportions))
            }
        })
        .collect()
}

fn check_initial(
    initial: &[ItemParameters],
    config: &EstimationConfig,
    layout: &ItemLayout,
) -> IrtResult<Vec<ItemParameters>> {
    let family = config.model_family;
    if initial.len() != layout.n_categories.len() {
        return Err(IrtError::ParameterMismatch(format!(
            "{} starting items for {} columns",
            initial.len(),
            layout.n_categories.len()
        )));
    }
    initial
        .iter()
        .zip(layout.n_categories.iter().zip(&layout.degenerate))
        .enumerate()
        .map(|(j, (item, (&n_cat, degenerate)))| {
            if item.family() != family {
                return Err(IrtError::ParameterMismatch(format!(
                    "item {j} is a {} item, expected {family}",
                    item.family()
                )));
            }
            if degenerate.is_some() {
                return Ok(ItemParameters::undefined(family, n_cat));
            }
            if item.n_categories() < n_cat {
                return Err(IrtError::ParameterMismatch(format!(
                    "item {j} has {} categories but category {} was observed",
                    item.n_categories(),
                    n_cat - 1
                )));
            }
            if !item.model().constraint_check(item.values(), &config.bounds) {
                return Err(IrtError::ParameterMismatch(format!(
                    "item {j} starts outside the feasible region: {:?}",
                    item.values()
                )));
            }
            Ok(item.clone())
        })
        .collect()
}

/// Update every item against its sufficient statistics, then the shared
/// slope for the 1PL. Arithmetic failures keep the item's previous values.
fn m_step(
    run: &Run<'_>,
    items: &[ItemParameters],
    stats: &[Option<ItemSufficientStats>],
    newton: &NewtonSettings,
    iteration: usize,
    diagnostics: &mut Vec<Diagnostic>,
) -> IrtResult<Vec<ItemParameters>> {
    let config = run.config;
    let model = config.model_family.model();

    let updates: Vec<Option<_>> = items
        .par_iter()
        .zip(stats)
        .enumerate()
        .map(|(j, (item, stat))| {
            stat.as_ref().map(|stat| {
                update_item(
                    j,
                    model,
                    stat,
                    item.values(),
                    &config.bounds,
                    &config.guessing_prior,
                    newton,
                )
            })
        })
        .collect();

    let mut next = Vec::with_capacity(items.len());
    for (j, (item, update)) in items.iter().zip(updates).enumerate() {
        match update {
            None => next.push(item.clone()),
            Some(Ok(update)) => {
                if update.capped && newton.max_inner_iterations > 1 {
                    debug!(
                        "item {j}: inner loop stopped at {} steps without reaching tolerance",
                        update.steps
                    );
                }
                if update.gradient_fallbacks > 0 {
                    debug!("item {j}: {} gradient fallback step(s)", update.gradient_fallbacks);
                }
                next.push(item.with_values(update.params));
            }
            Some(Err(IrtError::InternalArithmetic { item: failed, .. })) => {
                record(
                    diagnostics,
                    Diagnostic::ArithmeticFailure {
                        item: failed,
                        iteration,
                    },
                );
                next.push(item.clone());
            }
            Some(Err(other)) => return Err(other),
        }
    }

    if config.model_family == ModelFamily::OnePl {
        next = update_shared_slope(run, next, stats, newton)?;
    }
    Ok(next)
}

fn update_shared_slope(
    run: &Run<'_>,
    items: Vec<ItemParameters>,
    stats: &[Option<ItemSufficientStats>],
    newton: &NewtonSettings,
) -> IrtResult<Vec<ItemParameters>> {
    let config = run.config;
    let pairs: Vec<(&ItemSufficientStats, &[f64])> = items
        .iter()
        .zip(stats)
        .filter(|(item, _)| item.is_defined())
        .filter_map(|(item, stat)| stat.as_ref().map(|s| (s, item.values())))
        .collect();
    let Some(&(_, first)) = pairs.first() else {
        return Ok(items);
    };

    match update_shared_discrimination(
        config.model_family.model(),
        &pairs,
        first[0],
        &config.bounds,
        newton,
    ) {
        Ok(shared) => {
            if shared.capped {
                debug!("shared slope: inner loop stopped at {} steps", shared.steps);
            }
            Ok(items
                .iter()
                .map(|item| {
                    if item.is_defined() {
                        let mut values = item.values().to_vec();
                        values[0] = shared.discrimination;
                        item.with_values(values)
                    } else {
                        item.clone()
                    }
                })
                .collect())
        }
        Err(IrtError::InternalArithmetic { .. }) => {
            warn!("shared slope update failed numerically; keeping {:.4}", first[0]);
            Ok(items)
        }
        Err(other) => Err(other),
    }
}

fn finish(
    state: &EstimationState,
    outcome: Phase,
    last_change: f64,
    max_iterations: usize,
    trace: Vec<f64>,
    mut diagnostics: Vec<Diagnostic>,
) -> ConvergenceReport {
    if outcome == Phase::MaxIterationsReached {
        record(
            &mut diagnostics,
            Diagnostic::IterationBudgetExhausted {
                max_iterations,
                last_change,
            },
        );
    }
    ConvergenceReport {
        iterations: state.iteration(),
        final_log_likelihood: state.log_likelihood(),
        converged: state.converged(),
        outcome,
        log_likelihood_trace: trace,
        diagnostics,
    }
}

/// Relative change in log-likelihood between iterations.
fn relative_change(previous: f64, current: f64) -> f64 {
    (current - previous).abs() / previous.abs().max(1.0)
}

/// EM over the quadrature grid.
fn run_marginal(
    run: &Run<'_>,
    initial: Vec<ItemParameters>,
    mut diagnostics: Vec<Diagnostic>,
) -> IrtResult<Fitted> {
    let config = run.config;
    let patterns: PatternTable = run.responses.patterns();
    debug!(
        "{} distinct response patterns among {} respondents",
        patterns.n_patterns(),
        run.responses.n_respondents()
    );

    let mut state = EstimationState::initial(initial);
    let mut trace = Vec::new();
    let mut last_change = f64::INFINITY;
    let mut step: Step<Posterior> = Step::Initializing;

    let outcome = loop {
        let from = step.phase();
        step = match step {
            Step::Done(phase) => break phase,
            Step::Initializing => Step::EStep(None),
            Step::EStep(cached) => {
                // The posterior of the accepted parameters is computed by the
                // convergence check and reused here.
                let posterior =
                    cached.unwrap_or_else(|| e_step(&patterns, state.items(), run.grid));
                if trace.is_empty() {
                    state = state.with_log_likelihood(posterior.log_likelihood());
                    trace.push(posterior.log_likelihood());
                }
                let stats = all_expected_counts(&patterns, &posterior, state.items())
                    .into_iter()
                    .map(|counts| counts.map(|c| ItemSufficientStats::from_expected(run.grid, c)))
                    .collect();
                Step::MStep(stats)
            }
            Step::MStep(stats) => Step::ConvergenceCheck(m_step(
                run,
                state.items(),
                &stats,
                &config.newton,
                state.iteration() + 1,
                &mut diagnostics,
            )?),
            Step::ConvergenceCheck(proposed) => {
                let posterior = e_step(&patterns, &proposed, run.grid);
                let log_likelihood = posterior.log_likelihood();
                last_change = relative_change(state.log_likelihood(), log_likelihood);
                let moved = parameter_change(state.items(), &proposed);
                let converged = last_change < config.convergence_tolerance
                    && moved < config.parameter_tolerance;
                state = state.advance(proposed, log_likelihood, converged);
                trace.push(log_likelihood);
                debug!(
                    "iteration {}: log-likelihood {:.6}, relative change {:.3e}, parameter change {:.3e}",
                    state.iteration(),
                    log_likelihood,
                    last_change,
                    moved
                );
                if converged {
                    Step::Done(Phase::Converged)
                } else if state.iteration() >= config.max_iterations {
                    Step::Done(Phase::MaxIterationsReached)
                } else {
                    Step::EStep(Some(posterior))
                }
            }
        };
        log_transition(state.iteration(), from, step.phase());
    };

    let report = finish(
        &state,
        outcome,
        last_change,
        config.max_iterations,
        trace,
        diagnostics,
    );
    Ok(Fitted {
        items: state.items,
        report,
    })
}

/// Sum of `ln P(x_ij | theta_i)` over respondents with a finite ability.
fn joint_log_likelihood(
    responses: &ResponseMatrix,
    items: &[ItemParameters],
    abilities: &[f64],
) -> f64 {
    (0..responses.n_respondents())
        .into_par_iter()
        .filter(|&i| abilities[i].is_finite())
        .map(|i| {
            items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_defined())
                .filter_map(|(j, item)| {
                    responses
                        .get(i, j)
                        .map(|k| clamped_ln(item.probability(abilities[i], k)))
                })
                .sum::<f64>()
        })
        .sum()
}

/// Center finite abilities at zero and, when the slope is free, scale them
/// to unit variance.
fn identify_scale(abilities: &mut [f64], family: ModelFamily) {
    let finite: Vec<f64> = abilities.iter().copied().filter(|t| t.is_finite()).collect();
    if finite.is_empty() {
        return;
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let sd = (finite.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n).sqrt();
    let scale = if family.has_free_discrimination() && sd > 1e-8 {
        sd
    } else {
        1.0
    };
    for theta in abilities.iter_mut().filter(|t| t.is_finite()) {
        *theta = (*theta - mean) / scale;
    }
}

/// Largest parameter change relative to the largest parameter magnitude.
fn parameter_change(previous: &[ItemParameters], next: &[ItemParameters]) -> f64 {
    let mut largest_change = 0.0f64;
    let mut largest_value = 1.0f64;
    for (old, new) in previous.iter().zip(next) {
        if !(old.is_defined() && new.is_defined()) {
            continue;
        }
        for (a, b) in old.values().iter().zip(new.values()) {
            largest_change = largest_change.max((a - b).abs());
            largest_value = largest_value.max(b.abs());
        }
    }
    largest_change / largest_value
}

/// Finite joint abilities are held inside `[-limit, limit]`.
const JOINT_ABILITY_LIMIT: f64 = 4.0;

/// Alternating item updates and per-respondent ability MLEs.
fn run_joint(
    run: &Run<'_>,
    initial: Vec<ItemParameters>,
    mut diagnostics: Vec<Diagnostic>,
) -> IrtResult<Fitted> {
    let config = run.config;
    let responses = run.responses;
    let family = config.model_family;

    let mut state = EstimationState::initial(initial);
    let mut trace = Vec::new();
    let mut last_change = f64::INFINITY;
    let mut abilities: Vec<f64> = Vec::new();
    let mut extreme: Vec<Diagnostic> = Vec::new();
    let mut step: Step<()> = Step::Initializing;
    // One damped scoring step per item per cycle; abilities move in between.
    let joint_newton = NewtonSettings {
        max_inner_iterations: 1,
        ..config.newton
    };
    let ability_settings = ScoringSettings {
        theta_limit: JOINT_ABILITY_LIMIT,
        ..ScoringSettings::default()
    };

    let outcome = loop {
        let from = step.phase();
        step = match step {
            Step::Done(phase) => break phase,
            Step::Initializing => Step::EStep(None),
            Step::EStep(_) => {
                let scorer = AbilityScorer::new(
                    state.items(),
                    run.grid.clone(),
                    config.ability_prior,
                    ability_settings,
                );
                let estimates = scorer.estimate_all(responses, AbilityMethod::Mle);
                extreme = estimates
                    .iter()
                    .enumerate()
                    .filter_map(|(respondent, e)| match e.status {
                        AbilityStatus::Undefined(pattern) => Some(Diagnostic::ExtremeRespondent {
                            respondent,
                            pattern,
                        }),
                        _ => None,
                    })
                    .collect();
                abilities = estimates.iter().map(|e| e.theta).collect();
                identify_scale(&mut abilities, family);
                for theta in abilities.iter_mut().filter(|t| t.is_finite()) {
                    *theta = (*theta).clamp(-JOINT_ABILITY_LIMIT, JOINT_ABILITY_LIMIT);
                }
                debug!(
                    "{} of {} respondents excluded from calibration",
                    extreme.len(),
                    responses.n_respondents()
                );

                if trace.is_empty() {
                    let log_likelihood =
                        joint_log_likelihood(responses, state.items(), &abilities);
                    state = state.with_log_likelihood(log_likelihood);
                    trace.push(log_likelihood);
                }

                let view = responses.view();
                let stats = state
                    .items()
                    .par_iter()
                    .enumerate()
                    .map(|(j, item)| {
                        item.is_defined().then(|| {
                            ItemSufficientStats::from_observations(
                                &abilities,
                                view.column(j),
                                run.layout.n_categories[j].max(item.n_categories()),
                            )
                        })
                    })
                    .collect();
                Step::MStep(stats)
            }
            Step::MStep(stats) => Step::ConvergenceCheck(m_step(
                run,
                state.items(),
                &stats,
                &joint_newton,
                state.iteration() + 1,
                &mut diagnostics,
            )?),
            Step::ConvergenceCheck(proposed) => {
                last_change = parameter_change(state.items(), &proposed);
                let converged = last_change < config.convergence_tolerance;
                let log_likelihood = joint_log_likelihood(responses, &proposed, &abilities);
                state = state.advance(proposed, log_likelihood, converged);
                trace.push(log_likelihood);
                debug!(
                    "iteration {}: joint log-likelihood {:.6}, parameter change {:.3e}",
                    state.iteration(),
                    log_likelihood,
                    last_change
                );
                if converged {
                    Step::Done(Phase::Converged)
                } else if state.iteration() >= config.max_iterations {
                    Step::Done(Phase::MaxIterationsReached)
                } else {
                    Step::EStep(None)
                }
            }
        };
        log_transition(state.iteration(), from, step.phase());
    };

    for diagnostic in extreme {
        record(&mut diagnostics, diagnostic);
    }
    let report = finish(
        &state,
        outcome,
        last_change,
        config.max_iterations,
        trace,
        diagnostics,
    );
    Ok(Fitted {
        items: state.items,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quadrature::build_grid;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn small_matrix() -> ResponseMatrix {
        ResponseMatrix::new(array![
            [1, 1, 0, 0],
            [1, 0, 1, 0],
            [1, 1, 1, 0],
            [0, 0, 0, 1],
            [1, 1, 1, 1],
            [0, 1, 0, 0],
            [1, 0, 0, 0],
            [1, 1, 0, 1],
        ])
    }

    #[test]
    fn phases_report_terminal_states() {
        assert!(Phase::Converged.is_terminal());
        assert!(Phase::MaxIterationsReached.is_terminal());
        assert!(!Phase::EStep.is_terminal());
    }

    #[test]
    fn state_snapshots_advance_without_mutation() {
        let start = EstimationState::initial(vec![ItemParameters::rasch(0.0)]);
        let next = start.advance(vec![ItemParameters::rasch(0.5)], -10.0, false);
        assert_eq!(start.iteration(), 0);
        assert_eq!(start.items()[0].values(), &[0.0]);
        assert_eq!(next.iteration(), 1);
        assert_eq!(next.log_likelihood(), -10.0);
    }

    #[test]
    fn marginal_fit_reports_a_non_decreasing_trace() {
        let config = EstimationConfig::for_family(ModelFamily::Rasch);
        let result = fit(&small_matrix(), &config).unwrap();
        let trace = &result.report.log_likelihood_trace;
        assert_eq!(trace.len(), result.report.iterations + 1);
        for pair in trace.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-9, "{trace:?}");
        }
        assert_eq!(result.abilities.as_ref().map(Vec::len), Some(8));
    }

    #[test]
    fn budget_exhaustion_is_a_diagnostic() {
        let mut config = EstimationConfig::for_family(ModelFamily::TwoPl);
        config.max_iterations = 1;
        config.convergence_tolerance = 1e-14;
        let result = fit(&small_matrix(), &config).unwrap();
        assert_eq!(result.report.outcome, Phase::MaxIterationsReached);
        assert!(!result.report.converged);
        assert!(result.report.diagnostics.iter().any(|d| matches!(
            d,
            Diagnostic::IterationBudgetExhausted {
                max_iterations: 1,
                ..
            }
        )));
    }

    #[test]
    fn zero_variance_items_stay_undefined() {
        let matrix = ResponseMatrix::new(array![
            [1, 1, 0, 1],
            [1, 0, 1, 1],
            [0, 1, 1, 1],
            [0, 0, 0, 1],
            [1, 1, 1, 1],
        ]);
        let result = fit(&matrix, &EstimationConfig::default()).unwrap();
        assert!(!result.items[3].is_defined());
        assert!(result.items[..3].iter().all(ItemParameters::is_defined));
        assert!(result.report.diagnostics.contains(&Diagnostic::ZeroVarianceItem {
            item: 3,
            category: 1
        }));
    }

    #[test]
    fn joint_fit_flags_extreme_respondents() {
        let mut config = EstimationConfig::for_family(ModelFamily::Rasch);
        config.estimation_method = EstimationMethod::Joint;
        config.ability_method = AbilityMethod::Mle;
        let result = fit(&small_matrix(), &config).unwrap();
        assert!(result.report.diagnostics.iter().any(|d| matches!(
            d,
            Diagnostic::ExtremeRespondent { respondent: 4, .. }
        )));
        let abilities = result.abilities.unwrap();
        assert_eq!(abilities[4].theta, f64::INFINITY);
    }

    #[test]
    fn fit_from_rejects_mismatched_starts() {
        let config = EstimationConfig::default();
        let wrong_len = vec![ItemParameters::two_pl(1.0, 0.0); 3];
        assert!(matches!(
            fit_from(&small_matrix(), &config, &wrong_len),
            Err(IrtError::ParameterMismatch(_))
        ));
        let wrong_family = vec![ItemParameters::rasch(0.0); 4];
        assert!(matches!(
            fit_from(&small_matrix(), &config, &wrong_family),
            Err(IrtError::ParameterMismatch(_))
        ));
    }

    #[test]
    fn identification_centers_and_scales() {
        let mut abilities = vec![1.0, 3.0, f64::INFINITY, 5.0];
        identify_scale(&mut abilities, ModelFamily::TwoPl);
        assert_abs_diff_eq!(abilities[0] + abilities[1] + abilities[3], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(abilities[3], 1.5f64.sqrt(), epsilon = 1e-12);
        assert_eq!(abilities[2], f64::INFINITY);

        let mut rasch = vec![1.0, 3.0];
        identify_scale(&mut rasch, ModelFamily::Rasch);
        assert_eq!(rasch, vec![-1.0, 1.0]);
    }

    #[test]
    fn arithmetic_failure_keeps_the_item_and_updates_the_rest() {
        let matrix = small_matrix();
        let config = EstimationConfig::default();
        let layout = matrix.validate(config.model_family).unwrap();
        let grid = build_grid(21);
        let run = Run {
            responses: &matrix,
            config: &config,
            layout: &layout,
            grid: &grid,
        };

        let truth = ItemParameters::two_pl(1.3, 0.5);
        let mut counts = Array2::zeros((grid.len(), 2));
        for (q, (&theta, &w)) in grid.nodes().iter().zip(grid.weights()).enumerate() {
            for k in 0..2 {
                counts[[q, k]] = 300.0 * w * truth.probability(theta, k);
            }
        }
        let stats = ItemSufficientStats::from_expected(&grid, counts);
        let broken = ItemParameters::from_values(ModelFamily::TwoPl, vec![1.0, f64::NAN]);
        let healthy = ItemParameters::two_pl(1.0, 0.0);

        let mut diagnostics = Vec::new();
        let next = m_step(
            &run,
            &[broken, healthy],
            &[Some(stats.clone()), Some(stats)],
            &config.newton,
            3,
            &mut diagnostics,
        )
        .unwrap();

        assert_eq!(
            diagnostics,
            vec![Diagnostic::ArithmeticFailure {
                item: 0,
                iteration: 3
            }]
        );
        assert_eq!(next[0].values()[0], 1.0);
        assert!(next[0].values()[1].is_nan());
        assert_abs_diff_eq!(next[1].discrimination(), 1.3, epsilon = 1e-3);
        assert_abs_diff_eq!(next[1].values()[1], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn single_step_settings_move_each_item_once() {
        let matrix = small_matrix();
        let config = EstimationConfig::default();
        let layout = matrix.validate(config.model_family).unwrap();
        let grid = build_grid(21);
        let run = Run {
            responses: &matrix,
            config: &config,
            layout: &layout,
            grid: &grid,
        };
        let abilities = [-1.5, -0.5, 0.0, 0.5, 1.5, -1.0, 1.0, 0.2];
        let column = array![0, 0, 1, 0, 1, 0, 1, 1];
        let stats = ItemSufficientStats::from_observations(&abilities, column.view(), 2);
        let start = ItemParameters::two_pl(1.0, 0.0);
        let single = NewtonSettings {
            max_inner_iterations: 1,
            ..config.newton
        };

        let mut diagnostics = Vec::new();
        let once = m_step(
            &run,
            std::slice::from_ref(&start),
            &[Some(stats.clone())],
            &single,
            1,
            &mut diagnostics,
        )
        .unwrap();
        let full = m_step(
            &run,
            std::slice::from_ref(&start),
            &[Some(stats)],
            &config.newton,
            1,
            &mut diagnostics,
        )
        .unwrap();

        assert!(diagnostics.is_empty());
        assert_ne!(once[0].values(), start.values());
        assert_ne!(once[0].values(), full[0].values());
    }
}
