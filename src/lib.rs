//! # stratum
//!
//! Simulation and estimation of treatment effects within a principal
//! stratum defined by an intercurrent event (anti-drug-antibody
//! occurrence) in a time-to-event clinical trial.
//!
//! The crate simulates a population-scale cohort with full potential
//! outcomes, samples a trial-scale dataset in which the antibody indicator
//! is structurally unobservable on the control arm, estimates the
//! stratum-specific treatment effect four ways under principal
//! ignorability, and sweeps an unidentifiable nuisance parameter to show
//! how the conclusion depends on that assumption. Everything downstream of
//! the numbers (tables, plots) is out of scope; the library exposes the
//! numeric series only.

#![deny(unused_imports)]

pub mod config;
pub mod cox;
pub mod estimators;
pub mod km;
pub mod logistic;
pub mod pipeline;
pub mod sensitivity;
pub mod simulate;

pub use config::{AnalysisConfig, RunConfig, SimulationConfig};
pub use pipeline::{run_pipeline, AnalysisReport};
