//! Kaplan–Meier product-limit curves as plain numeric step functions.
//!
//! The crate exposes the `(time, survival)` pairs only; rendering them is a
//! presentation concern outside the statistical core.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KmError {
    #[error("cannot estimate a survival curve from an empty dataset")]
    EmptyData,
    #[error("times must be positive and finite")]
    InvalidTime,
    #[error("event indicators must be 0 or 1")]
    InvalidEventFlag,
}

/// One step of the survival curve.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SurvivalPoint {
    pub time: f64,
    pub survival: f64,
}

/// Product-limit estimator. Returns the step points starting at
/// `(0, 1)`, with one point per distinct event time.
pub fn kaplan_meier(
    time: ArrayView1<f64>,
    event: ArrayView1<u8>,
) -> Result<Vec<SurvivalPoint>, KmError> {
    let n = time.len();
    if n == 0 {
        return Err(KmError::EmptyData);
    }
    if event.len() != n || event.iter().any(|e| *e > 1) {
        return Err(KmError::InvalidEventFlag);
    }
    if time.iter().any(|t| !t.is_finite() || *t <= 0.0) {
        return Err(KmError::InvalidTime);
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

    let mut curve = vec![SurvivalPoint {
        time: 0.0,
        survival: 1.0,
    }];
    let mut at_risk = n as f64;
    let mut survival = 1.0;

    let mut i = 0;
    while i < n {
        let t = time[order[i]];
        let mut deaths = 0.0;
        let mut leaving = 0.0;
        while i < n && time[order[i]] == t {
            deaths += f64::from(event[order[i]]);
            leaving += 1.0;
            i += 1;
        }
        if deaths > 0.0 {
            survival *= 1.0 - deaths / at_risk;
            curve.push(SurvivalPoint { time: t, survival });
        }
        at_risk -= leaving;
    }

    Ok(curve)
}
