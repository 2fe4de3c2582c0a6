//! # Data Simulation Module
//!
//! Generates the two synthetic cohorts the rest of the crate analyzes:
//!
//! - a population-scale cohort that retains the potential anti-drug-antibody
//!   indicator on both arms, used only to fit ground-truth reference models;
//! - a trial-scale cohort in which the indicator is structurally masked on
//!   the control arm, mimicking what a real two-arm trial can observe.
//!
//! Both share one generative process. Treatment is assigned by an exact
//! balanced random permutation, never by independent coin flips, so the
//! arms are identical in size by construction. All randomness flows through
//! an explicitly passed `StdRng`; there is no implicit global generator.

use crate::config::SimulationConfig;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use thiserror::Error;

/// Errors raised while generating a cohort.
#[derive(Error, Debug)]
pub enum SimulateError {
    #[error("exponential rate must be positive and finite, got {0}")]
    InvalidRate(f64),
}

/// Population-scale cohort with full potential outcomes, for benchmarking.
///
/// `antibody` holds the potential indicator under treatment for every
/// subject, including controls; a real trial could never observe the
/// control-arm half of this column.
#[derive(Debug, Clone)]
pub struct PopulationData {
    /// Ordered covariate level, `1.0..=levels`.
    pub covariate: Array1<f64>,
    /// Arm indicator, 1 = treated.
    pub treatment: Array1<u8>,
    /// Latent event time under control.
    pub y0: Array1<f64>,
    /// Latent event time under treatment.
    pub y1: Array1<f64>,
    /// Potential anti-drug-antibody indicator under treatment.
    pub antibody: Array1<u8>,
    /// Observed (possibly censored) time on the assigned arm.
    pub time: Array1<f64>,
    /// 1 if `time` is an event, 0 if censored.
    pub event: Array1<u8>,
}

/// Trial-scale cohort as downstream estimators are allowed to see it.
///
/// The antibody indicator is `Some` for every treated subject and `None`
/// for every control subject. It is recorded as missing, not as zero: the
/// generative model fixes it at zero under control, but a trial cannot
/// observe what would have happened under treatment.
#[derive(Debug, Clone)]
pub struct TrialData {
    pub covariate: Array1<f64>,
    pub treatment: Array1<u8>,
    pub time: Array1<f64>,
    pub event: Array1<u8>,
    pub antibody: Vec<Option<u8>>,
}

impl TrialData {
    pub fn n(&self) -> usize {
        self.time.len()
    }

    /// Indices of control-arm subjects, in record order.
    pub fn control_indices(&self) -> Vec<usize> {
        (0..self.n()).filter(|&i| self.treatment[i] == 0).collect()
    }

    /// Indices of treated-arm subjects, in record order.
    pub fn treated_indices(&self) -> Vec<usize> {
        (0..self.n()).filter(|&i| self.treatment[i] == 1).collect()
    }
}

pub(crate) fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// One cohort before any masking, shared by both simulators.
struct RawCohort {
    covariate: Array1<f64>,
    treatment: Array1<u8>,
    y0: Array1<f64>,
    y1: Array1<f64>,
    antibody: Array1<u8>,
    time: Array1<f64>,
    event: Array1<u8>,
}

fn draw_exponential(rng: &mut StdRng, log_rate: f64) -> Result<f64, SimulateError> {
    let rate = log_rate.exp();
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SimulateError::InvalidRate(rate));
    }
    let dist = Exp::new(rate).map_err(|_| SimulateError::InvalidRate(rate))?;
    Ok(dist.sample(rng))
}

/// Generates `n` subjects under the shared causal model, applying
/// independent right-censoring at probability `censoring`.
fn draw_cohort(
    n: usize,
    config: &SimulationConfig,
    censoring: f64,
    rng: &mut StdRng,
) -> Result<RawCohort, SimulateError> {
    // Exact balance: a shuffled half-and-half assignment vector.
    let mut assignment: Vec<u8> = vec![1; n / 2];
    assignment.extend(std::iter::repeat(0).take(n - n / 2));
    assignment.shuffle(rng);

    let mut covariate = Array1::zeros(n);
    let mut y0 = Array1::zeros(n);
    let mut y1 = Array1::zeros(n);
    let mut antibody = Array1::zeros(n);
    let mut time = Array1::zeros(n);
    let mut event = Array1::zeros(n);

    for i in 0..n {
        let x = rng.gen_range(1..=config.covariate_levels) as f64;
        covariate[i] = x;

        let p_antibody = sigmoid(config.antibody_intercept + config.antibody_slope * x);
        let s1 = u8::from(rng.gen_bool(p_antibody));
        antibody[i] = s1;

        let control_log_rate = config.baseline_log_rate + config.covariate_log_hr * x;
        y0[i] = draw_exponential(rng, control_log_rate)?;
        y1[i] = draw_exponential(
            rng,
            control_log_rate + config.treatment_log_hr + config.antibody_log_hr * f64::from(s1),
        )?;

        let latent = if assignment[i] == 1 { y1[i] } else { y0[i] };
        let observed_event = rng.gen_bool(1.0 - censoring);
        if observed_event {
            time[i] = latent;
            event[i] = 1;
        } else {
            time[i] = rng.gen_range(0.0..latent);
            event[i] = 0;
        }
    }

    Ok(RawCohort {
        covariate,
        treatment: Array1::from_vec(assignment),
        y0,
        y1,
        antibody,
        time,
        event,
    })
}

/// Population Simulator: large-N cohort retaining the true antibody
/// indicator on both arms for ground-truth benchmarking.
pub fn simulate_population(
    config: &SimulationConfig,
    rng: &mut StdRng,
) -> Result<PopulationData, SimulateError> {
    let cohort = draw_cohort(
        config.population_size,
        config,
        config.population_censoring,
        rng,
    )?;
    Ok(PopulationData {
        covariate: cohort.covariate,
        treatment: cohort.treatment,
        y0: cohort.y0,
        y1: cohort.y1,
        antibody: cohort.antibody,
        time: cohort.time,
        event: cohort.event,
    })
}

/// Trial Sampler: realistic-scale cohort with the antibody indicator masked
/// on every control record.
pub fn simulate_trial(
    config: &SimulationConfig,
    rng: &mut StdRng,
) -> Result<TrialData, SimulateError> {
    let n = config.trial_arm_size * 2;
    let cohort = draw_cohort(n, config, config.trial_censoring, rng)?;

    let antibody = (0..n)
        .map(|i| {
            if cohort.treatment[i] == 1 {
                Some(cohort.antibody[i])
            } else {
                None
            }
        })
        .collect();

    Ok(TrialData {
        covariate: cohort.covariate,
        treatment: cohort.treatment,
        time: cohort.time,
        event: cohort.event,
        antibody,
    })
}
