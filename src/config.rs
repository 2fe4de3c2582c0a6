//! Run configuration and setup-time validation.
//!
//! Every knob of the generative model and of the Monte Carlo procedures
//! lives here so that a run is fully described by one `RunConfig` value plus
//! a seed. Invalid configurations are rejected before any simulation work
//! starts; downstream code may assume a validated configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a configuration fails validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("population size must be a positive even number, got {0}")]
    InvalidPopulationSize(usize),
    #[error("trial arm size must be positive, got {0}")]
    InvalidArmSize(usize),
    #[error("number of covariate levels must be at least 1, got {0}")]
    InvalidCovariateLevels(usize),
    #[error("{name} must be a probability in [0, 1], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },
    #[error("{name} must be finite, got {value}")]
    NonFiniteCoefficient { name: &'static str, value: f64 },
    #[error("{1} must be positive, got {0}")]
    InvalidDrawCount(usize, &'static str),
}

/// Coefficients and sizes of the generative model shared by the Population
/// Simulator and the Trial Sampler.
///
/// The covariate `X` is uniform on `1..=covariate_levels`. The potential
/// anti-drug-antibody indicator under treatment follows
/// `P(S1 = 1 | X) = sigmoid(antibody_intercept + antibody_slope * X)`.
/// Latent event times are exponential with log-rate
/// `baseline_log_rate + covariate_log_hr * X` under control, plus
/// `treatment_log_hr + antibody_log_hr * S1` under treatment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub population_size: usize,
    /// Subjects per arm in the trial-scale dataset.
    pub trial_arm_size: usize,
    pub covariate_levels: usize,
    pub antibody_intercept: f64,
    pub antibody_slope: f64,
    pub baseline_log_rate: f64,
    pub covariate_log_hr: f64,
    pub treatment_log_hr: f64,
    pub antibody_log_hr: f64,
    /// Probability that a population-scale observation is right-censored.
    pub population_censoring: f64,
    /// Probability that a trial-scale observation is right-censored.
    pub trial_censoring: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            population_size: 500_000,
            trial_arm_size: 450,
            covariate_levels: 4,
            antibody_intercept: -1.0,
            antibody_slope: 0.5,
            baseline_log_rate: -2.0,
            covariate_log_hr: 0.3,
            treatment_log_hr: -0.5,
            antibody_log_hr: 0.4,
            population_censoring: 0.1,
            trial_censoring: 0.2,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size == 0 || self.population_size % 2 != 0 {
            return Err(ConfigError::InvalidPopulationSize(self.population_size));
        }
        if self.trial_arm_size == 0 {
            return Err(ConfigError::InvalidArmSize(self.trial_arm_size));
        }
        if self.covariate_levels < 1 {
            return Err(ConfigError::InvalidCovariateLevels(self.covariate_levels));
        }
        for (name, value) in [
            ("population_censoring", self.population_censoring),
            ("trial_censoring", self.trial_censoring),
        ] {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }
        for (name, value) in [
            ("antibody_intercept", self.antibody_intercept),
            ("antibody_slope", self.antibody_slope),
            ("baseline_log_rate", self.baseline_log_rate),
            ("covariate_log_hr", self.covariate_log_hr),
            ("treatment_log_hr", self.treatment_log_hr),
            ("antibody_log_hr", self.antibody_log_hr),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteCoefficient { name, value });
            }
        }
        Ok(())
    }
}

/// Monte Carlo draw counts and the master seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub imputation_draws: usize,
    pub sensitivity_draws: usize,
    pub seed: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            imputation_draws: 200,
            sensitivity_draws: 500,
            seed: 1,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.imputation_draws == 0 {
            return Err(ConfigError::InvalidDrawCount(
                self.imputation_draws,
                "imputation_draws",
            ));
        }
        if self.sensitivity_draws == 0 {
            return Err(ConfigError::InvalidDrawCount(
                self.sensitivity_draws,
                "sensitivity_draws",
            ));
        }
        Ok(())
    }
}

/// Complete description of one analysis run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub simulation: SimulationConfig,
    pub analysis: AnalysisConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.simulation.validate()?;
        self.analysis.validate()
    }
}
