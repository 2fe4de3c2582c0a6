//! IRLS logistic regression.
//!
//! Backs the propensity model of antibody occurrence given the covariate.
//! Same Newton machinery as the Cox solver, with the binomial working
//! weights; the covariance is the inverse Fisher information at
//! convergence. Separation shows up as an unbounded linear predictor and is
//! reported as a [`FitError`] instead of a garbage fit.

use crate::cox::FitError;
use crate::simulate::sigmoid;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::{Inverse, Solve};

const MAX_ABS_ETA: f64 = 30.0;

/// Options for the IRLS loop.
#[derive(Clone, Copy, Debug)]
pub struct LogisticOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LogisticOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }
}

/// A converged logistic fit.
#[derive(Clone, Debug)]
pub struct LogisticFit {
    pub coefficients: Array1<f64>,
    /// Inverse Fisher information at the optimum.
    pub covariance: Array2<f64>,
    pub iterations: usize,
}

/// Fits `response ~ design` by iteratively reweighted least squares.
///
/// `response` entries must be 0 or 1; `design` carries the intercept column
/// explicitly.
pub fn fit_logistic(
    design: ArrayView2<f64>,
    response: ArrayView1<f64>,
    options: &LogisticOptions,
) -> Result<LogisticFit, FitError> {
    let n = design.nrows();
    let p = design.ncols();
    if n == 0 {
        return Err(FitError::EmptyData);
    }
    if response.len() != n {
        return Err(FitError::DimensionMismatch {
            rows: response.len(),
            subjects: n,
        });
    }
    if design.iter().any(|x| !x.is_finite()) {
        return Err(FitError::NonFiniteCovariate);
    }
    if response.iter().any(|y| *y != 0.0 && *y != 1.0) {
        return Err(FitError::InvalidEventFlag);
    }

    let mut beta = Array1::<f64>::zeros(p);
    for iteration in 1..=options.max_iterations {
        let eta = design.dot(&beta);
        if eta.iter().any(|e| e.abs() > MAX_ABS_ETA) {
            return Err(FitError::Diverged);
        }
        let mu = eta.mapv(sigmoid);

        // Score and Fisher information for the canonical logit link.
        let mut score = Array1::<f64>::zeros(p);
        let mut information = Array2::<f64>::zeros((p, p));
        for i in 0..n {
            let x = design.row(i);
            let residual = response[i] - mu[i];
            let w = mu[i] * (1.0 - mu[i]);
            for a in 0..p {
                score[a] += residual * x[a];
                for b in 0..p {
                    information[[a, b]] += w * x[a] * x[b];
                }
            }
        }

        let delta = information
            .solve(&score)
            .map_err(FitError::SingularInformation)?;
        let step_norm = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
        beta += &delta;

        if step_norm < options.tolerance * (1.0 + beta.iter().map(|b| b * b).sum::<f64>().sqrt()) {
            let covariance = information.inv().map_err(FitError::SingularInformation)?;
            return Ok(LogisticFit {
                coefficients: beta,
                covariance,
                iterations: iteration,
            });
        }
    }

    Err(FitError::DidNotConverge {
        max_iterations: options.max_iterations,
    })
}
