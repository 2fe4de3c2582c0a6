//! # Proportional-Hazards Fitting Primitive
//!
//! One reusable Newton–Raphson solver for the weighted Cox partial
//! likelihood (Breslow tie handling), shared by every estimator and by the
//! sensitivity sweep. A fit takes `(times, event indicators, covariates,
//! optional weights)` and returns coefficients, their covariance, and a
//! convergence status; anything degenerate (empty input, no events, a
//! singular information matrix, divergence under separation) surfaces as an
//! explicit [`FitError`] rather than NaN coefficients.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::{Inverse, Solve};
use thiserror::Error;

const MAX_STEP_HALVINGS: usize = 20;

/// Errors surfaced while validating inputs or fitting the model.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("cannot fit a model on an empty dataset")]
    EmptyData,
    #[error("dataset contains no events, the partial likelihood is undefined")]
    NoEvents,
    #[error("times must be positive and finite")]
    InvalidTime,
    #[error("event indicators must be 0 or 1")]
    InvalidEventFlag,
    #[error("weights must be finite and non-negative")]
    InvalidWeight,
    #[error("covariate rows ({rows}) do not match the number of subjects ({subjects})")]
    DimensionMismatch { rows: usize, subjects: usize },
    #[error("covariate values must be finite")]
    NonFiniteCovariate,
    #[error(
        "linear system solve failed, the information matrix may be singular \
         (constant covariate or empty risk set): {0}"
    )]
    SingularInformation(ndarray_linalg::error::LinalgError),
    #[error("log partial likelihood became non-finite, likely complete separation")]
    Diverged,
    #[error("Newton iterations did not converge within {max_iterations} steps")]
    DidNotConverge { max_iterations: usize },
    #[error("every one of the {draws} Monte Carlo draws failed to fit")]
    AllDrawsFailed { draws: usize },
}

/// Convergence status of a successful fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    /// Converged within tolerance.
    Converged,
    /// The final Newton step was fully rejected by step halving but the
    /// gradient is already negligible; the point is a valid maximum.
    StalledAtMaximum,
}

/// Options for the Newton solver.
#[derive(Clone, Copy, Debug)]
pub struct CoxOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for CoxOptions {
    fn default() -> Self {
        Self {
            max_iterations: 60,
            tolerance: 1e-9,
        }
    }
}

/// A converged proportional-hazards fit.
#[derive(Clone, Debug)]
pub struct CoxFit {
    pub coefficients: Array1<f64>,
    /// Inverse of the observed information at the optimum.
    pub covariance: Array2<f64>,
    pub log_likelihood: f64,
    pub status: FitStatus,
    pub iterations: usize,
}

impl CoxFit {
    /// Wald standard error of coefficient `index`.
    pub fn standard_error(&self, index: usize) -> f64 {
        self.covariance[[index, index]].sqrt()
    }
}

/// Log partial likelihood with its gradient and observed information,
/// evaluated at one coefficient vector.
struct Evaluation {
    log_likelihood: f64,
    gradient: Array1<f64>,
    information: Array2<f64>,
}

/// Single sweep over the risk sets in descending time order.
///
/// `order` must hold subject indices sorted by descending observed time so
/// that the risk-set sums `S0`, `S1`, `S2` can be accumulated incrementally.
fn evaluate(
    order: &[usize],
    time: ArrayView1<f64>,
    event: ArrayView1<u8>,
    covariates: ArrayView2<f64>,
    weights: Option<ArrayView1<f64>>,
    beta: &Array1<f64>,
) -> Result<Evaluation, FitError> {
    let n = order.len();
    let p = covariates.ncols();
    let weight_of = |i: usize| weights.map_or(1.0, |w| w[i]);

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));

    let mut log_likelihood = 0.0;
    let mut gradient = Array1::<f64>::zeros(p);
    let mut information = Array2::<f64>::zeros((p, p));

    let mut i = 0;
    while i < n {
        let t = time[order[i]];
        // Enter every subject tied at this time into the risk set first.
        let mut j = i;
        while j < n && time[order[j]] == t {
            let idx = order[j];
            let w = weight_of(idx);
            let x = covariates.row(idx);
            let eta = x.dot(beta);
            let r = w * eta.exp();
            if !r.is_finite() {
                return Err(FitError::Diverged);
            }
            s0 += r;
            for a in 0..p {
                s1[a] += r * x[a];
                for b in 0..p {
                    s2[[a, b]] += r * x[a] * x[b];
                }
            }
            j += 1;
        }

        // Breslow: tied events share the same risk-set denominator.
        let mut tied_event_weight = 0.0;
        for &idx in &order[i..j] {
            if event[idx] == 1 {
                let w = weight_of(idx);
                let x = covariates.row(idx);
                tied_event_weight += w;
                log_likelihood += w * x.dot(beta);
                for a in 0..p {
                    gradient[a] += w * x[a];
                }
            }
        }
        if tied_event_weight > 0.0 {
            if s0 <= 0.0 {
                return Err(FitError::Diverged);
            }
            log_likelihood -= tied_event_weight * s0.ln();
            for a in 0..p {
                let mean_a = s1[a] / s0;
                gradient[a] -= tied_event_weight * mean_a;
                for b in 0..p {
                    information[[a, b]] +=
                        tied_event_weight * (s2[[a, b]] / s0 - mean_a * s1[b] / s0);
                }
            }
        }
        i = j;
    }

    if !log_likelihood.is_finite() {
        return Err(FitError::Diverged);
    }
    Ok(Evaluation {
        log_likelihood,
        gradient,
        information,
    })
}

fn validate_inputs(
    time: ArrayView1<f64>,
    event: ArrayView1<u8>,
    covariates: ArrayView2<f64>,
    weights: Option<ArrayView1<f64>>,
) -> Result<(), FitError> {
    let n = time.len();
    if n == 0 {
        return Err(FitError::EmptyData);
    }
    if covariates.nrows() != n || event.len() != n {
        return Err(FitError::DimensionMismatch {
            rows: covariates.nrows().min(event.len()),
            subjects: n,
        });
    }
    if time.iter().any(|t| !t.is_finite() || *t <= 0.0) {
        return Err(FitError::InvalidTime);
    }
    if event.iter().any(|e| *e > 1) {
        return Err(FitError::InvalidEventFlag);
    }
    if covariates.iter().any(|x| !x.is_finite()) {
        return Err(FitError::NonFiniteCovariate);
    }
    if let Some(w) = weights {
        if w.len() != n {
            return Err(FitError::DimensionMismatch {
                rows: w.len(),
                subjects: n,
            });
        }
        if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(FitError::InvalidWeight);
        }
    }
    // Weighted event mass must be positive for the likelihood to exist.
    let has_event = (0..n).any(|i| event[i] == 1 && weights.map_or(1.0, |w| w[i]) > 0.0);
    if !has_event {
        return Err(FitError::NoEvents);
    }
    Ok(())
}

/// Fits a weighted Cox proportional-hazards model by Newton–Raphson with
/// step halving, starting from the zero coefficient vector.
pub fn fit_cox(
    time: ArrayView1<f64>,
    event: ArrayView1<u8>,
    covariates: ArrayView2<f64>,
    weights: Option<ArrayView1<f64>>,
    options: &CoxOptions,
) -> Result<CoxFit, FitError> {
    validate_inputs(time, event, covariates, weights)?;
    let n = time.len();
    let p = covariates.ncols();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| time[b].total_cmp(&time[a]));

    let mut beta = Array1::<f64>::zeros(p);
    let mut current = evaluate(&order, time, event, covariates, weights, &beta)?;

    for iteration in 1..=options.max_iterations {
        let delta = current
            .information
            .solve(&current.gradient)
            .map_err(FitError::SingularInformation)?;

        // Step halving keeps the likelihood monotone under overshoot.
        let mut step = 1.0;
        let mut halvings = 0;
        let (next_beta, next_eval) = loop {
            let candidate = &beta + &(&delta * step);
            match evaluate(&order, time, event, covariates, weights, &candidate) {
                Ok(eval) if eval.log_likelihood >= current.log_likelihood => {
                    break (candidate, eval);
                }
                Ok(_) | Err(FitError::Diverged) if halvings < MAX_STEP_HALVINGS => {
                    step *= 0.5;
                    halvings += 1;
                }
                Ok(_) => {
                    // No ascent direction left; accept the stall if the
                    // gradient says we are already at the maximum.
                    let gradient_norm =
                        current.gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
                    if gradient_norm < options.tolerance.sqrt() {
                        let covariance = current
                            .information
                            .inv()
                            .map_err(FitError::SingularInformation)?;
                        return Ok(CoxFit {
                            coefficients: beta,
                            covariance,
                            log_likelihood: current.log_likelihood,
                            status: FitStatus::StalledAtMaximum,
                            iterations: iteration,
                        });
                    }
                    return Err(FitError::DidNotConverge {
                        max_iterations: options.max_iterations,
                    });
                }
                Err(err) => return Err(err),
            }
        };

        let improvement = next_eval.log_likelihood - current.log_likelihood;
        beta = next_beta;
        current = next_eval;
        debug!(
            "cox iteration {iteration}: log-likelihood {:.6}, improvement {improvement:.3e}",
            current.log_likelihood
        );

        if improvement.abs() < options.tolerance * (current.log_likelihood.abs() + 1.0) {
            let covariance = current
                .information
                .inv()
                .map_err(FitError::SingularInformation)?;
            return Ok(CoxFit {
                coefficients: beta,
                covariance,
                log_likelihood: current.log_likelihood,
                status: FitStatus::Converged,
                iterations: iteration,
            });
        }
    }

    Err(FitError::DidNotConverge {
        max_iterations: options.max_iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Exp};

    fn two_group_sample(
        n_per_group: usize,
        log_hr: f64,
        seed: u64,
    ) -> (Array1<f64>, Array1<u8>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = 2 * n_per_group;
        let mut time = Array1::zeros(n);
        let mut covariates = Array2::zeros((n, 1));
        let baseline = Exp::new(1.0).unwrap();
        let exposed = Exp::new(log_hr.exp()).unwrap();
        for i in 0..n {
            let group = (i >= n_per_group) as usize;
            covariates[[i, 0]] = group as f64;
            time[i] = if group == 1 {
                exposed.sample(&mut rng)
            } else {
                baseline.sample(&mut rng)
            };
        }
        (time, Array1::ones(n), covariates)
    }

    #[test]
    fn recovers_two_group_log_hazard_ratio() {
        let true_log_hr = 0.7;
        let (time, event, covariates) = two_group_sample(1500, true_log_hr, 42);
        let fit = fit_cox(
            time.view(),
            event.view(),
            covariates.view(),
            None,
            &CoxOptions::default(),
        )
        .unwrap();
        assert_eq!(fit.status, FitStatus::Converged);
        let se = fit.standard_error(0);
        assert!(
            (fit.coefficients[0] - true_log_hr).abs() < 3.0 * se,
            "estimate {} too far from {true_log_hr} (se {se})",
            fit.coefficients[0]
        );
    }

    #[test]
    fn unit_weights_match_unweighted_fit() {
        let (time, event, covariates) = two_group_sample(400, 0.5, 9);
        let unweighted = fit_cox(
            time.view(),
            event.view(),
            covariates.view(),
            None,
            &CoxOptions::default(),
        )
        .unwrap();
        let weights = Array1::<f64>::ones(time.len());
        let weighted = fit_cox(
            time.view(),
            event.view(),
            covariates.view(),
            Some(weights.view()),
            &CoxOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(
            unweighted.coefficients[0],
            weighted.coefficients[0],
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(
            unweighted.covariance[[0, 0]],
            weighted.covariance[[0, 0]],
            epsilon = 1e-10
        );
    }

    #[test]
    fn identical_groups_give_near_zero_coefficient() {
        // Both groups drawn from the same exponential: the true log HR is 0.
        let (time, event, covariates) = two_group_sample(1500, 0.0, 17);
        let fit = fit_cox(
            time.view(),
            event.view(),
            covariates.view(),
            None,
            &CoxOptions::default(),
        )
        .unwrap();
        assert!(fit.coefficients[0].abs() < 3.0 * fit.standard_error(0));
    }

    #[test]
    fn rejects_empty_input() {
        let time = Array1::<f64>::zeros(0);
        let event = Array1::<u8>::zeros(0);
        let covariates = Array2::<f64>::zeros((0, 1));
        assert!(matches!(
            fit_cox(
                time.view(),
                event.view(),
                covariates.view(),
                None,
                &CoxOptions::default()
            ),
            Err(FitError::EmptyData)
        ));
    }

    #[test]
    fn rejects_event_free_input() {
        let time = Array1::from_vec(vec![1.0, 2.0, 3.0]);
        let event = Array1::<u8>::zeros(3);
        let covariates = Array2::<f64>::zeros((3, 1));
        assert!(matches!(
            fit_cox(
                time.view(),
                event.view(),
                covariates.view(),
                None,
                &CoxOptions::default()
            ),
            Err(FitError::NoEvents)
        ));
    }

    #[test]
    fn constant_covariate_is_singular() {
        let time = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let event = Array1::from_vec(vec![1u8, 1, 0, 1]);
        let covariates = Array2::<f64>::ones((4, 1));
        assert!(matches!(
            fit_cox(
                time.view(),
                event.view(),
                covariates.view(),
                None,
                &CoxOptions::default()
            ),
            Err(FitError::SingularInformation(_))
        ));
    }

    #[test]
    fn rejects_nonpositive_times() {
        let time = Array1::from_vec(vec![1.0, 0.0]);
        let event = Array1::from_vec(vec![1u8, 1]);
        let covariates = Array2::<f64>::zeros((2, 1));
        assert!(matches!(
            fit_cox(
                time.view(),
                event.view(),
                covariates.view(),
                None,
                &CoxOptions::default()
            ),
            Err(FitError::InvalidTime)
        ));
    }
}
