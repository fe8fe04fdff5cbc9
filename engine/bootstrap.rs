//! # Bootstrap Inference
//!
//! Point estimates come from models fitted on the observed cohort. Each
//! bootstrap replicate resamples subjects with replacement, refits through
//! the caller's [`ModelFitter`], and re-simulates every intervention.
//! Replicates that fail are logged and left out of the summaries.
//!
//! Seeds are derived from one master seed: the first derived value seeds
//! the point-estimate simulations, the rest seed one replicate each, so a
//! run is reproducible end to end.

use crate::history::{self, HistoryError};
use crate::intervention::Intervention;
use crate::model::{FittedModels, ModelError};
use crate::pool::{Pool, PoolError};
use crate::risk::{risk_difference, risk_ratio};
use crate::simulate::{SimulationError, SimulationOutcome, Simulator};
use crate::spec::{ConfigError, SimulationSpec};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::io::IsTerminal;
use thiserror::Error;

/// Exclusive upper bound of derived seeds.
const SEED_RANGE: usize = 1 << 30;

pub const DEFAULT_SEED: u64 = 1234;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Fitting models failed: {0}")]
    Fit(#[source] ModelError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("Reference intervention index {index} is out of range for {count} interventions.")]
    ReferenceOutOfRange { index: usize, count: usize },
    #[error("Confidence level {0} must lie strictly between 0 and 1.")]
    InvalidConfidence(f64),
    #[error("No interventions were given.")]
    NoInterventions,
}

/// Fits every model the simulator needs from a (possibly resampled) cohort.
pub trait ModelFitter: Send + Sync {
    fn fit(&self, cohort: &Pool) -> Result<FittedModels, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CiMethod {
    /// Empirical quantiles of the replicate estimates.
    #[default]
    Percentile,
    /// Point estimate plus or minus a normal quantile times the bootstrap
    /// standard error.
    Normal,
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub replicates: usize,
    pub seed: u64,
    pub ci_method: CiMethod,
    pub confidence: f64,
    /// Index of the intervention that ratios and differences compare against.
    pub reference: usize,
    pub parallel: bool,
    pub show_progress: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            replicates: 0,
            seed: DEFAULT_SEED,
            ci_method: CiMethod::Percentile,
            confidence: 0.95,
            reference: 0,
            parallel: true,
            show_progress: true,
        }
    }
}

/// Seeds derived from a master seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    pub simulation: u64,
    pub replicates: Vec<u64>,
}

/// Draws `replicates + 1` distinct seeds in `[0, 2^30)`.
pub fn plan_seeds(master: u64, replicates: usize) -> SeedPlan {
    let mut rng = StdRng::seed_from_u64(master);
    let mut seeds = index::sample(&mut rng, SEED_RANGE, replicates + 1)
        .into_iter()
        .map(|seed| seed as u64);
    let simulation = seeds.next().unwrap_or(master);
    SeedPlan {
        simulation,
        replicates: seeds.collect(),
    }
}

/// Point estimates with bootstrap standard errors and confidence limits,
/// one value per time point (or a single value for end-of-follow-up
/// outcomes).
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub estimate: Vec<f64>,
    pub std_error: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterventionSummary {
    pub name: String,
    pub risk: Interval,
    pub ratio: Interval,
    pub difference: Interval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateFailure {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub outcomes: Vec<SimulationOutcome>,
    pub summaries: Vec<InterventionSummary>,
    pub successful: usize,
    pub failures: Vec<ReplicateFailure>,
}

fn progress_bar(len: u64, enabled: bool) -> ProgressBar {
    let draw_target = if enabled && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} replicates ({eta})",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb
}

/// Resamples, refits and re-simulates one replicate. Returns the estimate
/// series of each intervention.
fn replicate(
    cohort: &Pool,
    spec: &SimulationSpec,
    fitter: &dyn ModelFitter,
    interventions: &[Intervention],
    seed: u64,
) -> Result<Vec<Vec<f64>>, BootstrapError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sample = cohort.resample_subjects(cohort.n_subjects(), &mut rng)?;
    history::prepare_observed(&mut sample, spec)?;
    let models = fitter.fit(&sample).map_err(BootstrapError::Fit)?;
    let simulator = Simulator::new(spec.clone(), models)?;
    let mut series = Vec::with_capacity(interventions.len());
    for intervention in interventions {
        series.push(simulator.run(&sample, intervention, seed)?.estimate.values());
    }
    Ok(series)
}

/// Linear-interpolation percentile of sorted values, `q` in `[0, 1]`.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = q * (n - 1) as f64;
            let below = position.floor() as usize;
            let above = (below + 1).min(n - 1);
            let fraction = position - below as f64;
            sorted[below] + (sorted[above] - sorted[below]) * fraction
        }
    }
}

/// Standard errors and confidence limits from a replicates-by-time matrix.
fn interval(
    estimate: Vec<f64>,
    draws: &Array2<f64>,
    method: CiMethod,
    confidence: f64,
    z: f64,
) -> Interval {
    let width = estimate.len();
    if draws.nrows() < 2 {
        return Interval {
            estimate,
            std_error: vec![f64::NAN; width],
            lower: vec![f64::NAN; width],
            upper: vec![f64::NAN; width],
        };
    }
    let std_error = draws.std_axis(Axis(0), 1.0).to_vec();
    let (lower, upper): (Vec<f64>, Vec<f64>) = match method {
        CiMethod::Percentile => {
            let alpha = (1.0 - confidence) / 2.0;
            draws
                .axis_iter(Axis(1))
                .map(|column| {
                    if column.iter().any(|v| v.is_nan()) {
                        return (f64::NAN, f64::NAN);
                    }
                    let mut sorted = column.to_vec();
                    sorted.sort_by(f64::total_cmp);
                    (percentile(&sorted, alpha), percentile(&sorted, 1.0 - alpha))
                })
                .unzip()
        }
        CiMethod::Normal => estimate
            .iter()
            .zip(&std_error)
            .map(|(center, se)| (center - z * se, center + z * se))
            .unzip(),
    };
    Interval {
        estimate,
        std_error,
        lower,
        upper,
    }
}

fn constant_interval(value: f64, width: usize) -> Interval {
    Interval {
        estimate: vec![value; width],
        std_error: vec![0.0; width],
        lower: vec![value; width],
        upper: vec![value; width],
    }
}

fn stack(rows: impl Iterator<Item = Vec<f64>>, width: usize) -> Array2<f64> {
    let flat: Vec<f64> = rows.flatten().collect();
    let n = if width == 0 { 0 } else { flat.len() / width };
    Array2::from_shape_vec((n, width), flat).unwrap_or_else(|_| Array2::zeros((0, width)))
}

/// Summarizes point estimates against successful replicates. `points[j]` is
/// the estimate series of intervention `j`; `draws[b][j]` the same for
/// replicate `b`.
pub fn summarize(
    names: &[String],
    points: &[Vec<f64>],
    draws: &[Vec<Vec<f64>>],
    options: &BootstrapOptions,
) -> Result<Vec<InterventionSummary>, BootstrapError> {
    if !(options.confidence > 0.0 && options.confidence < 1.0) {
        return Err(BootstrapError::InvalidConfidence(options.confidence));
    }
    let reference = options.reference;
    let reference_point = points.get(reference).ok_or(BootstrapError::ReferenceOutOfRange {
        index: reference,
        count: points.len(),
    })?;
    let standard = Normal::new(0.0, 1.0).map_err(|e| SimulationError::Custom(e.to_string()))?;
    let z = standard.inverse_cdf(0.5 + options.confidence / 2.0);

    let summaries = names
        .iter()
        .zip(points)
        .enumerate()
        .map(|(j, (name, point))| {
            let width = point.len();
            let risk_draws = stack(draws.iter().map(|b| b[j].clone()), width);
            let risk = interval(point.clone(), &risk_draws, options.ci_method, options.confidence, z);
            let (ratio, difference) = if j == reference {
                (constant_interval(1.0, width), constant_interval(0.0, width))
            } else {
                let ratio_draws = stack(draws.iter().map(|b| risk_ratio(&b[j], &b[reference])), width);
                let difference_draws =
                    stack(draws.iter().map(|b| risk_difference(&b[j], &b[reference])), width);
                (
                    interval(
                        risk_ratio(point, reference_point),
                        &ratio_draws,
                        options.ci_method,
                        options.confidence,
                        z,
                    ),
                    interval(
                        risk_difference(point, reference_point),
                        &difference_draws,
                        options.ci_method,
                        options.confidence,
                        z,
                    ),
                )
            };
            InterventionSummary {
                name: name.clone(),
                risk,
                ratio,
                difference,
            }
        })
        .collect();
    Ok(summaries)
}

/// Fits, simulates every intervention, and bootstraps the estimates.
pub fn run_bootstrap(
    cohort: &Pool,
    spec: &SimulationSpec,
    fitter: &dyn ModelFitter,
    interventions: &[Intervention],
    options: &BootstrapOptions,
) -> Result<BootstrapReport, BootstrapError> {
    if interventions.is_empty() {
        return Err(BootstrapError::NoInterventions);
    }
    if options.reference >= interventions.len() {
        return Err(BootstrapError::ReferenceOutOfRange {
            index: options.reference,
            count: interventions.len(),
        });
    }
    let seeds = plan_seeds(options.seed, options.replicates);
    info!(
        "Point estimates use seed {}; {} bootstrap replicate(s) requested.",
        seeds.simulation, options.replicates
    );

    let models = fitter.fit(cohort).map_err(BootstrapError::Fit)?;
    let simulator = Simulator::new(spec.clone(), models)?;
    let outcomes = simulator.run_all(cohort, interventions, seeds.simulation, options.parallel)?;

    let pb = progress_bar(options.replicates as u64, options.show_progress);
    let run_one = |(index, seed): (usize, &u64)| {
        let result = replicate(cohort, spec, fitter, interventions, *seed);
        pb.inc(1);
        (index, result)
    };
    let results: Vec<(usize, Result<Vec<Vec<f64>>, BootstrapError>)> = if options.parallel {
        seeds.replicates.par_iter().enumerate().map(run_one).collect()
    } else {
        seeds.replicates.iter().enumerate().map(run_one).collect()
    };
    pb.finish_and_clear();

    let mut draws = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (index, result) in results {
        match result {
            Ok(series) => draws.push(series),
            Err(error) => {
                let message = error.to_string();
                warn!("Bootstrap replicate {index} failed and is excluded: {message}");
                failures.push(ReplicateFailure { index, message });
            }
        }
    }
    info!(
        "{} of {} bootstrap replicate(s) succeeded.",
        draws.len(),
        options.replicates
    );

    let names: Vec<String> = outcomes.iter().map(|o| o.intervention.clone()).collect();
    let points: Vec<Vec<f64>> = outcomes.iter().map(|o| o.estimate.values()).collect();
    let summaries = summarize(&names, &points, &draws, options)?;
    Ok(BootstrapReport {
        outcomes,
        summaries,
        successful: draws.len(),
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_seed_plan_is_reproducible_and_distinct() {
        let plan = plan_seeds(DEFAULT_SEED, 20);
        assert_eq!(plan, plan_seeds(DEFAULT_SEED, 20));
        assert_eq!(plan.replicates.len(), 20);
        let mut all: Vec<u64> = plan.replicates.clone();
        all.push(plan.simulation);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 21);
        assert!(all.iter().all(|&seed| seed < SEED_RANGE as u64));
        assert_ne!(plan, plan_seeds(DEFAULT_SEED + 1, 20));
    }

    #[test]
    fn test_percentile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(percentile(&sorted, 0.5), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 0.025), 1.1, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 0.975), 4.9, epsilon = 1e-12);
    }

    fn draws() -> Vec<Vec<Vec<f64>>> {
        vec![
            vec![vec![0.1], vec![0.2]],
            vec![vec![0.2], vec![0.2]],
            vec![vec![0.3], vec![0.5]],
        ]
    }

    #[test]
    fn test_summary_standard_error_uses_sample_variance() {
        let names = vec!["a".to_string(), "b".to_string()];
        let points = vec![vec![0.2], vec![0.3]];
        let summaries = summarize(&names, &points, &draws(), &BootstrapOptions::default()).unwrap();
        assert_abs_diff_eq!(summaries[0].risk.std_error[0], 0.1, epsilon = 1e-12);
        assert_eq!(summaries[0].ratio, constant_interval(1.0, 1));
        assert_eq!(summaries[0].difference, constant_interval(0.0, 1));
        assert_abs_diff_eq!(summaries[1].ratio.estimate[0], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(summaries[1].difference.estimate[0], 0.1, epsilon = 1e-12);
        assert!(summaries[1].risk.lower[0] <= summaries[1].risk.upper[0]);
    }

    #[test]
    fn test_normal_interval_is_centered_on_point_estimate() {
        let names = vec!["a".to_string(), "b".to_string()];
        let points = vec![vec![0.25], vec![0.3]];
        let options = BootstrapOptions {
            ci_method: CiMethod::Normal,
            ..BootstrapOptions::default()
        };
        let summaries = summarize(&names, &points, &draws(), &options).unwrap();
        let risk = &summaries[0].risk;
        assert_abs_diff_eq!(risk.lower[0] + risk.upper[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(risk.upper[0] - 0.25, 1.959963984540054 * 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_replicates_give_missing_intervals() {
        let names = vec!["a".to_string()];
        let summaries =
            summarize(&names, &[vec![0.2, 0.3]], &[], &BootstrapOptions::default()).unwrap();
        assert_eq!(summaries[0].risk.estimate, vec![0.2, 0.3]);
        assert!(summaries[0].risk.std_error.iter().all(|se| se.is_nan()));
    }

    #[test]
    fn test_reference_out_of_range_is_rejected() {
        let options = BootstrapOptions {
            reference: 3,
            ..BootstrapOptions::default()
        };
        assert!(matches!(
            summarize(&["a".to_string()], &[vec![0.1]], &[], &options),
            Err(BootstrapError::ReferenceOutOfRange { .. })
        ));
    }

    struct Unfittable;

    impl ModelFitter for Unfittable {
        fn fit(&self, cohort: &Pool) -> Result<FittedModels, ModelError> {
            Err(ModelError::Custom(format!("cannot fit {} rows", cohort.len())))
        }
    }

    #[test]
    fn test_replicate_of_empty_cohort_fails_before_fitting() {
        use crate::spec::{OutcomeSpec, OutcomeType};
        let cohort = Pool::from_columns("id", "t0", vec![], vec![], vec![]).unwrap();
        let spec = SimulationSpec::new(2, OutcomeSpec::new("Y", OutcomeType::Survival));
        let result = replicate(&cohort, &spec, &Unfittable, &[Intervention::natural_course()], 5);
        assert!(matches!(result, Err(BootstrapError::Pool(PoolError::NoSubjects))));
    }
}
