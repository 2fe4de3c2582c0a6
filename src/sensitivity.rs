//! # Sensitivity Analysis Engine
//!
//! The stratum-specific effect is only identified under principal
//! ignorability, which no dataset can verify. This engine maps out how the
//! estimate moves as that assumption is varied: it repeatedly allocates the
//! masked control-arm antibody indicator under many plausible schemes, from
//! uniform at random to allocations concentrated on the longest or shortest
//! survivors, and refits the stratum effects for each.
//!
//! Each draw records the association between the imputed indicator and the
//! control-arm outcome (the unverifiable-assumption axis) together with the
//! two stratum treatment effects, giving the coordinates of one point in
//! the sensitivity scatter. No decision rule is applied to the cloud; it is
//! numeric output for an external plotting layer.

use crate::cox::{fit_cox, CoxOptions, FitError};
use crate::estimators::stratum_treatment_fits;
use crate::simulate::TrialData;
use log::warn;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::index::sample_weighted;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Jeffreys-like shape offset added to both Beta posterior parameters.
const PREVALENCE_PRIOR_SHAPE: f64 = 1.0 / 3.0;
/// Upper bound of the random rank-concentration exponent.
const MAX_RANK_EXPONENT: f64 = 5.0;

#[derive(Error, Debug)]
pub enum SensitivityError {
    #[error("trial has no treated subjects with an observed antibody indicator")]
    NoObservedIndicator,
    #[error("trial has no control subjects to allocate")]
    NoControls,
    #[error("prevalence posterior is degenerate: {0}")]
    DegeneratePosterior(String),
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// One Monte Carlo draw of the sensitivity sweep.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SensitivityDraw {
    /// Log hazard ratio of the imputed indicator on control-arm outcomes:
    /// the unverifiable-assumption axis of the scatter.
    pub control_association: f64,
    pub antibody_positive_log_hr: f64,
    pub antibody_negative_log_hr: f64,
}

/// The full point cloud plus bookkeeping for skipped draws.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensitivityResult {
    pub draws: Vec<SensitivityDraw>,
    pub skipped: usize,
}

/// Unnormalized selection weights from normalized time ranks.
///
/// `exponent` zero makes every weight one regardless of rank, degenerating
/// into uniform unweighted sampling; large exponents concentrate the
/// allocation on the longest (or, with `favor_long` false, shortest)
/// observed times.
pub fn selection_weights(ranks: &[f64], favor_long: bool, exponent: f64) -> Vec<f64> {
    ranks
        .iter()
        .map(|&rank| {
            let base = if favor_long { rank } else { 1.0 - rank };
            base.powf(exponent)
        })
        .collect()
}

/// Normalized ranks of the control-arm observed times, `rank / (n + 1)`,
/// strictly inside (0, 1).
fn normalized_ranks(times: &[f64]) -> Vec<f64> {
    let n = times.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));
    let mut ranks = vec![0.0; n];
    for (position, &index) in order.iter().enumerate() {
        ranks[index] = (position + 1) as f64 / (n + 1) as f64;
    }
    ranks
}

/// Runs the Monte Carlo sensitivity sweep.
///
/// Draws whose proportional-hazards refits fail (for instance an allocation
/// that empties a stratum) are skipped and counted; the sweep errors only
/// when every draw fails.
pub fn run_sensitivity(
    trial: &TrialData,
    draws: usize,
    rng: &mut StdRng,
) -> Result<SensitivityResult, SensitivityError> {
    let controls = trial.control_indices();
    if controls.is_empty() {
        return Err(SensitivityError::NoControls);
    }
    let observed_positive = trial
        .antibody
        .iter()
        .filter(|s| **s == Some(1))
        .count();
    let observed_total = trial.antibody.iter().filter(|s| s.is_some()).count();
    if observed_total == 0 {
        return Err(SensitivityError::NoObservedIndicator);
    }

    // Beta posterior for the control-arm prevalence under a Jeffreys-like
    // prior combined with the treated-arm counts.
    let alpha = observed_positive as f64 + PREVALENCE_PRIOR_SHAPE;
    let beta_shape = (observed_total - observed_positive) as f64 + PREVALENCE_PRIOR_SHAPE;
    let prevalence_posterior = Beta::new(alpha, beta_shape)
        .map_err(|e| SensitivityError::DegeneratePosterior(e.to_string()))?;

    let control_times: Vec<f64> = controls.iter().map(|&i| trial.time[i]).collect();
    let ranks = normalized_ranks(&control_times);

    let mut result = SensitivityResult {
        draws: Vec::with_capacity(draws),
        skipped: 0,
    };
    let mut indicator = vec![0u8; trial.n()];

    for draw in 0..draws {
        let prevalence = prevalence_posterior.sample(rng);
        let favor_long = rng.gen_bool(0.5);
        let exponent = rng.gen_range(0.0..=MAX_RANK_EXPONENT);
        let weights = selection_weights(&ranks, favor_long, exponent);
        let allocated = (prevalence * controls.len() as f64).round() as usize;

        match impute_and_fit(trial, &controls, &weights, allocated, &mut indicator, rng) {
            Ok(point) => result.draws.push(point),
            Err(err) => {
                result.skipped += 1;
                warn!("sensitivity draw {draw} skipped: {err}");
            }
        }
    }

    if result.draws.is_empty() {
        return Err(SensitivityError::Fit(FitError::AllDrawsFailed { draws }));
    }
    Ok(result)
}

/// Allocates `allocated` controls to the antibody-positive stratum by
/// weighted sampling without replacement, then refits the assumption axis
/// and both stratum treatment effects.
fn impute_and_fit(
    trial: &TrialData,
    controls: &[usize],
    weights: &[f64],
    allocated: usize,
    indicator: &mut [u8],
    rng: &mut StdRng,
) -> Result<SensitivityDraw, FitError> {
    let selected = sample_weighted(rng, controls.len(), |i| weights[i], allocated)
        .map_err(|_| FitError::InvalidWeight)?;

    for i in 0..trial.n() {
        indicator[i] = trial.antibody[i].unwrap_or(0);
    }
    for position in selected.into_vec() {
        indicator[controls[position]] = 1;
    }

    // Assumption axis: imputed indicator against control-arm outcomes only.
    let control_time = Array1::from_shape_fn(controls.len(), |row| trial.time[controls[row]]);
    let control_event = Array1::from_shape_fn(controls.len(), |row| trial.event[controls[row]]);
    let control_indicator = Array2::from_shape_fn((controls.len(), 1), |(row, _)| {
        f64::from(indicator[controls[row]])
    });
    let axis_fit = fit_cox(
        control_time.view(),
        control_event.view(),
        control_indicator.view(),
        None,
        &CoxOptions::default(),
    )?;

    let (positive, negative) = stratum_treatment_fits(trial, indicator)?;
    Ok(SensitivityDraw {
        control_association: axis_fit.coefficients[0],
        antibody_positive_log_hr: positive.coefficients[0],
        antibody_negative_log_hr: negative.coefficients[0],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::simulate::simulate_trial;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn zero_exponent_gives_uniform_weights() {
        let ranks = vec![0.1, 0.25, 0.5, 0.75, 0.9];
        for favor_long in [true, false] {
            let weights = selection_weights(&ranks, favor_long, 0.0);
            for w in weights {
                assert_abs_diff_eq!(w, 1.0, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn large_exponent_concentrates_on_extreme_ranks() {
        let ranks = vec![0.2, 0.5, 0.8];
        let long = selection_weights(&ranks, true, 5.0);
        assert!(long[2] > long[1] && long[1] > long[0]);
        let short = selection_weights(&ranks, false, 5.0);
        assert!(short[0] > short[1] && short[1] > short[2]);
    }

    #[test]
    fn normalized_ranks_are_strictly_inside_unit_interval() {
        let times = vec![3.0, 1.0, 2.0, 5.0, 4.0];
        let ranks = normalized_ranks(&times);
        for &r in &ranks {
            assert!(r > 0.0 && r < 1.0);
        }
        // Rank order follows time order.
        assert_abs_diff_eq!(ranks[1], 1.0 / 6.0, epsilon = 1e-15);
        assert_abs_diff_eq!(ranks[3], 5.0 / 6.0, epsilon = 1e-15);
    }

    #[test]
    fn sweep_accounts_for_every_draw() {
        let config = SimulationConfig {
            trial_arm_size: 250,
            ..SimulationConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(101);
        let trial = simulate_trial(&config, &mut rng).unwrap();
        let requested = 40;
        let result = run_sensitivity(&trial, requested, &mut rng).unwrap();
        assert_eq!(result.draws.len() + result.skipped, requested);
        for point in &result.draws {
            assert!(point.control_association.is_finite());
            assert!(point.antibody_positive_log_hr.is_finite());
            assert!(point.antibody_negative_log_hr.is_finite());
        }
    }

    #[test]
    fn sweep_is_reproducible_for_a_fixed_seed() {
        let config = SimulationConfig {
            trial_arm_size: 200,
            ..SimulationConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(55);
        let trial = simulate_trial(&config, &mut rng).unwrap();

        let mut rng_a = StdRng::seed_from_u64(56);
        let mut rng_b = StdRng::seed_from_u64(56);
        let a = run_sensitivity(&trial, 15, &mut rng_a).unwrap();
        let b = run_sensitivity(&trial, 15, &mut rng_b).unwrap();
        assert_eq!(a.draws.len(), b.draws.len());
        for (x, y) in a.draws.iter().zip(&b.draws) {
            assert_eq!(x.control_association, y.control_association);
            assert_eq!(x.antibody_positive_log_hr, y.antibody_positive_log_hr);
            assert_eq!(x.antibody_negative_log_hr, y.antibody_negative_log_hr);
        }
    }
}
