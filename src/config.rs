//! Estimation configuration.
//!
//! Everything tunable about a run lives in [`EstimationConfig`], which is
//! passed explicitly through the orchestrator. Nothing here is global, so
//! several runs (for example cross-validation folds) can proceed side by
//! side with different settings.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IrtError, IrtResult};
use crate::models::ModelFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Alternate item updates with per-respondent ability MLEs.
    Joint,
    /// EM over a quadrature grid, ability integrated out.
    #[default]
    Marginal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbilityMethod {
    Mle,
    Map,
    #[default]
    Eap,
}

impl FromStr for EstimationMethod {
    type Err = IrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "joint" | "jml" => Ok(EstimationMethod::Joint),
            "marginal" | "mml" => Ok(EstimationMethod::Marginal),
            _ => Err(IrtError::UnknownVariant {
                kind: "estimation method",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for AbilityMethod {
    type Err = IrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mle" => Ok(AbilityMethod::Mle),
            "map" => Ok(AbilityMethod::Map),
            "eap" => Ok(AbilityMethod::Eap),
            _ => Err(IrtError::UnknownVariant {
                kind: "ability method",
                value: s.to_string(),
            }),
        }
    }
}

/// Node placement for the ability grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuadratureRule {
    #[default]
    GaussHermite,
    /// Gauss-Legendre nodes on `[lower, upper]` (in prior SD units),
    /// weighted by the normal density.
    FixedInterval { lower: f64, upper: f64 },
}

/// Normal ability distribution used as the quadrature prior and for MAP.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AbilityPrior {
    pub mean: f64,
    pub sd: f64,
}

impl Default for AbilityPrior {
    fn default() -> Self {
        Self { mean: 0.0, sd: 1.0 }
    }
}

/// Box constraints applied to every item update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterBounds {
    pub discrimination: (f64, f64),
    pub difficulty: (f64, f64),
    pub guessing: (f64, f64),
}

impl Default for ParameterBounds {
    fn default() -> Self {
        Self {
            discrimination: (0.1, 6.0),
            difficulty: (-6.0, 6.0),
            guessing: (0.0, 0.5),
        }
    }
}

/// Beta prior on the 3PL lower asymptote. `alpha = beta = 1` is flat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuessingPrior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for GuessingPrior {
    /// Mode 0.2, weighted like twenty pseudo-responses.
    fn default() -> Self {
        Self {
            alpha: 5.0,
            beta: 17.0,
        }
    }
}

impl GuessingPrior {
    pub fn is_flat(&self) -> bool {
        self.alpha == 1.0 && self.beta == 1.0
    }
}

/// Inner Newton-Raphson loop controls for a single item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NewtonSettings {
    pub max_inner_iterations: usize,
    pub max_damping_attempts: usize,
    pub inner_tolerance: f64,
    /// Longest step (max-norm) taken before damping.
    pub max_step: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_inner_iterations: 50,
            max_damping_attempts: 5,
            inner_tolerance: 1e-6,
            max_step: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimationConfig {
    pub quadrature_points: usize,
    pub quadrature_rule: QuadratureRule,
    pub convergence_tolerance: f64,
    /// Largest relative item parameter change still counted as converged
    /// in marginal estimation.
    pub parameter_tolerance: f64,
    pub max_iterations: usize,
    pub estimation_method: EstimationMethod,
    pub ability_method: AbilityMethod,
    pub model_family: ModelFamily,
    /// Score every respondent with `ability_method` once items are fitted.
    pub score_respondents: bool,
    pub ability_prior: AbilityPrior,
    pub bounds: ParameterBounds,
    pub guessing_prior: GuessingPrior,
    pub newton: NewtonSettings,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            quadrature_points: 41,
            quadrature_rule: QuadratureRule::default(),
            convergence_tolerance: 1e-4,
            parameter_tolerance: 1e-3,
            max_iterations: 200,
            estimation_method: EstimationMethod::default(),
            ability_method: AbilityMethod::default(),
            model_family: ModelFamily::TwoPl,
            score_respondents: true,
            ability_prior: AbilityPrior::default(),
            bounds: ParameterBounds::default(),
            guessing_prior: GuessingPrior::default(),
            newton: NewtonSettings::default(),
        }
    }
}

impl EstimationConfig {
    pub fn for_family(model_family: ModelFamily) -> Self {
        Self {
            model_family,
            ..Self::default()
        }
    }

    /// Parse a TOML document; unspecified keys keep their defaults.
    pub fn from_toml_str(text: &str) -> IrtResult<Self> {
        let config: EstimationConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IrtResult<()> {
        let invalid = |msg: String| Err(IrtError::InvalidConfig(msg));

        if self.quadrature_points < 2 {
            return invalid(format!(
                "quadrature_points must be at least 2, got {}",
                self.quadrature_points
            ));
        }
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance > 0.0) {
            return invalid(format!(
                "convergence_tolerance must be positive and finite, got {}",
                self.convergence_tolerance
            ));
        }
        if !(self.parameter_tolerance.is_finite() && self.parameter_tolerance > 0.0) {
            return invalid(format!(
                "parameter_tolerance must be positive and finite, got {}",
                self.parameter_tolerance
            ));
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".to_string());
        }
        if let QuadratureRule::FixedInterval { lower, upper } = self.quadrature_rule {
            if !(lower.is_finite() && upper.is_finite() && lower < upper) {
                return invalid(format!(
                    "fixed_interval bounds must satisfy lower < upper, got ({lower}, {upper})"
                ));
            }
        }
        if !(self.ability_prior.mean.is_finite()
            && self.ability_prior.sd.is_finite()
            && self.ability_prior.sd > 0.0)
        {
            return invalid(format!(
                "ability_prior needs a finite mean and positive sd, got {:?}",
                self.ability_prior
            ));
        }

        let ordered = |(lo, hi): (f64, f64)| lo.is_finite() && hi.is_finite() && lo < hi;
        let bounds = &self.bounds;
        if !ordered(bounds.discrimination) || bounds.discrimination.0 <= 0.0 {
            return invalid(format!(
                "discrimination bounds must be positive and ordered, got {:?}",
                bounds.discrimination
            ));
        }
        if !ordered(bounds.difficulty) {
            return invalid(format!(
                "difficulty bounds must be ordered, got {:?}",
                bounds.difficulty
            ));
        }
        if !ordered(bounds.guessing) || bounds.guessing.0 < 0.0 || bounds.guessing.1 >= 1.0 {
            return invalid(format!(
                "guessing bounds must lie in [0, 1), got {:?}",
                bounds.guessing
            ));
        }

        let prior = self.guessing_prior;
        if !(prior.alpha.is_finite()
            && prior.beta.is_finite()
            && prior.alpha >= 1.0
            && prior.beta >= 1.0)
        {
            return invalid(format!("guessing_prior needs alpha >= 1 and beta >= 1, got {prior:?}"));
        }

        let newton = &self.newton;
        if newton.max_inner_iterations == 0 || newton.max_damping_attempts == 0 {
            return invalid("newton iteration and damping budgets must be at least 1".to_string());
        }
        if !(newton.inner_tolerance > 0.0 && newton.max_step > 0.0) {
            return invalid("newton inner_tolerance and max_step must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EstimationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.quadrature_points, 41);
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.estimation_method, EstimationMethod::Marginal);
        assert_eq!(config.ability_method, AbilityMethod::Eap);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let text = r#"
            quadrature_points = 21
            convergence_tolerance = 1e-6
            estimation_method = "joint"
            ability_method = "map"
            model_family = "graded_response"

            [quadrature_rule]
            kind = "fixed_interval"
            lower = -5.0
            upper = 5.0

            [bounds]
            guessing = [0.0, 0.3]
        "#;
        let config = EstimationConfig::from_toml_str(text).unwrap();
        assert_eq!(config.quadrature_points, 21);
        assert_eq!(config.estimation_method, EstimationMethod::Joint);
        assert_eq!(config.ability_method, AbilityMethod::Map);
        assert_eq!(config.model_family, ModelFamily::GradedResponse);
        assert_eq!(
            config.quadrature_rule,
            QuadratureRule::FixedInterval {
                lower: -5.0,
                upper: 5.0
            }
        );
        assert_eq!(config.bounds.guessing, (0.0, 0.3));
        assert_eq!(config.bounds.difficulty, (-6.0, 6.0));
        assert_eq!(config.max_iterations, 200);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            EstimationConfig::from_toml_str("quadrature_pts = 3"),
            Err(IrtError::ConfigParse(_))
        ));
        assert!(matches!(
            EstimationConfig::from_toml_str("quadrature_points = 1"),
            Err(IrtError::InvalidConfig(_))
        ));
        assert!(matches!(
            EstimationConfig::from_toml_str("convergence_tolerance = -1.0"),
            Err(IrtError::InvalidConfig(_))
        ));
        let mut config = EstimationConfig::default();
        config.bounds.discrimination = (0.0, 4.0);
        assert!(config.validate().is_err());
        assert!(matches!(
            EstimationConfig::from_toml_str("[guessing_prior]\nalpha = 0.5"),
            Err(IrtError::InvalidConfig(_))
        ));
        assert!(matches!(
            EstimationConfig::from_toml_str("parameter_tolerance = 0.0"),
            Err(IrtError::InvalidConfig(_))
        ));
    }

    #[test]
    fn guessing_prior_defaults_to_mode_one_fifth() {
        let prior = GuessingPrior::default();
        let mode = (prior.alpha - 1.0) / (prior.alpha + prior.beta - 2.0);
        assert!((mode - 0.2).abs() < 1e-12);
        assert!(!prior.is_flat());
        let flat = EstimationConfig::from_toml_str("[guessing_prior]\nalpha = 1.0\nbeta = 1.0")
            .unwrap();
        assert!(flat.guessing_prior.is_flat());
    }

    #[test]
    fn enum_options_parse_from_strings() {
        assert_eq!("MML".parse::<EstimationMethod>().unwrap(), EstimationMethod::Marginal);
        assert_eq!("map".parse::<AbilityMethod>().unwrap(), AbilityMethod::Map);
        assert!("bayes".parse::<AbilityMethod>().is_err());
    }
}
