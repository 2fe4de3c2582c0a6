//! End-to-end checks of the full vignette: confounding bias is present and
//! correctable on the trial-scale data, estimates agree with the
//! population benchmark to within sampling error, and a fixed seed
//! reproduces every number exactly.

use stratum::{run_pipeline, AnalysisConfig, RunConfig, SimulationConfig};

fn scenario() -> RunConfig {
    RunConfig {
        simulation: SimulationConfig {
            population_size: 100_000,
            trial_arm_size: 450,
            covariate_levels: 4,
            trial_censoring: 0.2,
            ..SimulationConfig::default()
        },
        analysis: AnalysisConfig {
            imputation_draws: 100,
            sensitivity_draws: 200,
            seed: 42,
        },
    }
}

#[test]
fn naive_bias_is_present_and_correctable() {
    let report = run_pipeline(&scenario()).unwrap();

    // The naive comparison ignores that controls are not restricted to the
    // antibody-positive stratum; adjusting for the covariate moves the
    // estimate by more than numerical noise.
    let gap = (report.naive.log_hazard_ratio - report.adjusted.log_hazard_ratio).abs();
    assert!(gap > 1e-3, "naive and adjusted estimates coincide (gap {gap})");

    // Sanity, not equality: both stay within three standard errors of the
    // population benchmark for the antibody-positive stratum.
    let truth = report.benchmark.antibody_positive.log_hazard_ratio;
    for estimate in [&report.naive, &report.adjusted] {
        let distance = (estimate.log_hazard_ratio - truth).abs();
        assert!(
            distance < 3.0 * estimate.standard_error,
            "estimate {} is {distance} from benchmark {truth}, se {}",
            estimate.log_hazard_ratio,
            estimate.standard_error
        );
    }
}

#[test]
fn principal_stratum_estimators_track_the_benchmark() {
    let report = run_pipeline(&scenario()).unwrap();
    let truth = report.benchmark.antibody_positive.log_hazard_ratio;

    for estimate in [
        &report.weighted.antibody_positive,
        &report.imputation.antibody_positive,
    ] {
        let distance = (estimate.log_hazard_ratio - truth).abs();
        assert!(
            distance < 3.0 * estimate.standard_error,
            "stratum estimate {} is {distance} from benchmark {truth}",
            estimate.log_hazard_ratio
        );
    }
}

#[test]
fn identical_seeds_reproduce_the_run_exactly() {
    let first = run_pipeline(&scenario()).unwrap();
    let second = run_pipeline(&scenario()).unwrap();

    assert_eq!(
        first.naive.log_hazard_ratio,
        second.naive.log_hazard_ratio
    );
    assert_eq!(
        first.adjusted.log_hazard_ratio,
        second.adjusted.log_hazard_ratio
    );
    assert_eq!(
        first.weighted.antibody_positive.log_hazard_ratio,
        second.weighted.antibody_positive.log_hazard_ratio
    );
    assert_eq!(
        first.imputation.antibody_positive.log_hazard_ratio,
        second.imputation.antibody_positive.log_hazard_ratio
    );
    assert_eq!(
        first.imputation.antibody_positive.standard_error,
        second.imputation.antibody_positive.standard_error
    );
    assert_eq!(
        first.benchmark.antibody_positive.log_hazard_ratio,
        second.benchmark.antibody_positive.log_hazard_ratio
    );
    assert_eq!(first.curves.treated.len(), second.curves.treated.len());
    assert_eq!(first.sensitivity.draws.len(), second.sensitivity.draws.len());
    for (a, b) in first
        .sensitivity
        .draws
        .iter()
        .zip(&second.sensitivity.draws)
    {
        assert_eq!(a.control_association, b.control_association);
        assert_eq!(a.antibody_positive_log_hr, b.antibody_positive_log_hr);
        assert_eq!(a.antibody_negative_log_hr, b.antibody_negative_log_hr);
    }
}

#[test]
fn report_serializes_cleanly() {
    let mut config = scenario();
    config.simulation.population_size = 20_000;
    config.simulation.trial_arm_size = 200;
    config.analysis.imputation_draws = 20;
    config.analysis.sensitivity_draws = 30;
    let report = run_pipeline(&config).unwrap();

    // The report is the crate's entire external surface; it must round-trip
    // through serde without loss of the headline numbers.
    let encoded = serde_json::to_string(&report).unwrap();
    let decoded: stratum::AnalysisReport = serde_json::from_str(&encoded).unwrap();
    assert_eq!(
        report.naive.log_hazard_ratio,
        decoded.naive.log_hazard_ratio
    );
    assert_eq!(report.sensitivity.draws.len(), decoded.sensitivity.draws.len());
}
