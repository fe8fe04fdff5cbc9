//! # Risk Aggregation
//!
//! Turns a finished simulated pool into population estimates: a cumulative
//! risk curve for survival outcomes, or the mean of the predicted outcome at
//! the final time point for end-of-follow-up outcomes.
//!
//! For a subject with per-interval event probability `h_t` and competing
//! event probability `d_t` (zero without a competing event),
//!
//! ```text
//! risk_t = sum_{s <= t} h_s (1 - d_s) prod_{u < s} (1 - h_u)(1 - d_u)
//! ```
//!
//! and the population risk at `t` is the mean of `risk_t` over subjects.
//!
//! The same module computes what the natural course is checked against:
//! the observed risk and covariate trajectories, weighted by the inverse
//! probability of remaining uncensored when a censoring model is given.

use crate::bootstrap::percentile;
use crate::model::{FittedModel, FittedModels, ModelError};
use crate::pool::{Pool, PoolError};
use crate::simulate::Estimate;
use crate::spec::{CensoringSpec, CovariateKind, OutcomeSpec, OutcomeType, SimulationSpec};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComparisonError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Prediction for '{name}' failed: {source}")]
    Prediction {
        name: String,
        #[source]
        source: ModelError,
    },
    #[error("Probability {value} for '{name}' must lie in [0, 1) to be inverted.")]
    InvalidProbability { name: String, value: f64 },
    #[error("'{0}' has no fitted model to weight by.")]
    MissingModel(String),
}

/// Column holding the (possibly restricted) per-interval event probability.
pub const EVENT_PROBABILITY: &str = "prob1";
/// Column holding one minus [`EVENT_PROBABILITY`].
pub const EVENT_FREE_PROBABILITY: &str = "prob0";
/// Column holding the per-interval competing event probability.
pub const COMPETING_PROBABILITY: &str = "prob_D";
/// Predicted outcome probability at the final time point (binary outcomes).
pub const PREDICTED_PROBABILITY: &str = "Py";
/// Predicted outcome mean at the final time point (continuous outcomes).
pub const PREDICTED_MEAN: &str = "Ey";

fn mean_skipping_missing(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|value| !value.is_nan())
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// `sum(w * v) / sum(w)` over rows where both are present.
fn weighted_mean(rows: &[usize], value: impl Fn(usize) -> f64, weight: impl Fn(usize) -> f64) -> f64 {
    let (sum, total) = rows.iter().fold((0.0, 0.0), |(sum, total), &row| {
        let (v, w) = (value(row), weight(row));
        if v.is_nan() || w.is_nan() {
            (sum, total)
        } else {
            (sum + w * v, total + w)
        }
    });
    if total == 0.0 { f64::NAN } else { sum / total }
}

fn check_weights(cohort: &Pool, weights: Option<&[f64]>) -> Result<(), PoolError> {
    match weights {
        Some(weights) if weights.len() != cohort.len() => Err(PoolError::LengthMismatch {
            column: "weights".to_string(),
            expected: cohort.len(),
            found: weights.len(),
        }),
        _ => Ok(()),
    }
}

/// Population cumulative risk at each time point `0..time_points`.
pub fn cumulative_risk(
    pool: &Pool,
    competing: bool,
    time_points: usize,
) -> Result<Vec<f64>, PoolError> {
    let hazard = pool.column(EVENT_PROBABILITY)?;
    let competing_hazard = if competing {
        Some(pool.column(COMPETING_PROBABILITY)?)
    } else {
        None
    };

    let mut sums = vec![0.0; time_points];
    let mut counts = vec![0usize; time_points];
    for subject in 0..pool.n_subjects() {
        let (mut risk, mut event_free) = (0.0, 1.0);
        for &row in pool.subject_rows(subject) {
            let t = pool.time(row);
            if t < 0 {
                continue;
            }
            let h = hazard[row];
            let d = competing_hazard.map_or(0.0, |column| column[row]);
            risk += h * (1.0 - d) * event_free;
            event_free *= (1.0 - h) * (1.0 - d);
            if let Some(slot) = usize::try_from(t).ok().filter(|&t| t < time_points) {
                sums[slot] += risk;
                counts[slot] += 1;
            }
        }
    }

    Ok(sums
        .into_iter()
        .zip(counts)
        .map(|(sum, count)| if count == 0 { f64::NAN } else { sum / count as f64 })
        .collect())
}

/// Mean of `column` over rows at `time`, skipping missing values.
pub fn mean_at_time(pool: &Pool, column: &str, time: i64) -> Result<f64, PoolError> {
    let values = pool.column(column)?;
    Ok(mean_skipping_missing(
        pool.slice(time).into_iter().map(|row| values[row]),
    ))
}

/// The estimate a simulation run reports for its outcome type.
pub fn aggregate(
    pool: &Pool,
    outcome: &OutcomeSpec,
    competing: bool,
    time_points: usize,
) -> Result<Estimate, PoolError> {
    let last = time_points as i64 - 1;
    Ok(match outcome.kind {
        OutcomeType::Survival => Estimate::Risk(cumulative_risk(pool, competing, time_points)?),
        OutcomeType::BinaryEof => Estimate::Mean(mean_at_time(pool, PREDICTED_PROBABILITY, last)?),
        OutcomeType::ContinuousEof => Estimate::Mean(mean_at_time(pool, PREDICTED_MEAN, last)?),
    })
}

/// Nonparametric estimate from observed data: the product-limit cumulative
/// incidence for survival outcomes (subjects leave the risk set after an
/// event, a competing event or censoring), or the observed mean at the final
/// time point otherwise.
///
/// With `weights` (one per cohort row) every per-time rate is a weighted
/// mean, and the event rate among those free of the competing event uses
/// the weight times one minus the competing indicator.
pub fn observed_estimate(
    cohort: &Pool,
    outcome: &OutcomeSpec,
    competing: Option<&str>,
    time_points: usize,
    weights: Option<&[f64]>,
) -> Result<Estimate, PoolError> {
    check_weights(cohort, weights)?;
    let weight = |row: usize| weights.map_or(1.0, |w| w[row]);
    let events = cohort.column(&outcome.name)?;
    let last = time_points as i64 - 1;
    if outcome.kind != OutcomeType::Survival {
        let rows = cohort.slice(last);
        return Ok(Estimate::Mean(weighted_mean(&rows, |row| events[row], weight)));
    }
    let competing_events = match competing {
        Some(name) => Some(cohort.column(name)?),
        None => None,
    };

    let (mut risk, mut event_free) = (0.0, 1.0);
    let mut curve = Vec::with_capacity(time_points);
    for t in 0..time_points as i64 {
        let rows = cohort.slice(t);
        let (h, d) = match competing_events {
            Some(column) => {
                let free_of_competing = |row: usize| match weights {
                    Some(w) => w[row] * (1.0 - column[row]),
                    None => 1.0,
                };
                (
                    weighted_mean(&rows, |row| events[row], free_of_competing),
                    weighted_mean(&rows, |row| column[row], weight),
                )
            }
            None => (weighted_mean(&rows, |row| events[row], weight), 0.0),
        };
        let h = if h.is_nan() { 0.0 } else { h };
        let d = if d.is_nan() { 0.0 } else { d };
        risk += h * (1.0 - d) * event_free;
        event_free *= (1.0 - h) * (1.0 - d);
        curve.push(risk);
    }
    Ok(Estimate::Risk(curve))
}


/// A covariate to summarize over time. Categorical covariates carry the
/// levels whose shares are reported.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryColumn {
    pub name: String,
    pub levels: Option<Vec<f64>>,
}

/// Per-time summary of one covariate.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateTrajectory {
    /// Mean at each time point.
    Mean(Vec<f64>),
    /// Share of each level at each time point.
    Levels(Vec<(f64, Vec<f64>)>),
}

/// The modeled covariates of `spec`, with categorical levels taken from
/// the observed cohort.
pub fn summary_columns(spec: &SimulationSpec, cohort: &Pool) -> Result<Vec<SummaryColumn>, PoolError> {
    spec.covariates
        .iter()
        .filter(|c| !c.kind.is_time_feature())
        .map(|c| -> Result<SummaryColumn, PoolError> {
            let levels = match c.kind {
                CovariateKind::Categorical => Some(cohort.levels(&c.name)?),
                _ => None,
            };
            Ok(SummaryColumn {
                name: c.name.clone(),
                levels,
            })
        })
        .collect()
}

fn trajectory(
    pool: &Pool,
    column: &SummaryColumn,
    weights: &[f64],
    time_points: usize,
) -> Result<CovariateTrajectory, PoolError> {
    let values = pool.column(&column.name)?;
    let slices: Vec<Vec<usize>> = (0..time_points as i64).map(|t| pool.slice(t)).collect();
    let series = |transform: &dyn Fn(f64) -> f64| -> Vec<f64> {
        slices
            .iter()
            .map(|rows| {
                weighted_mean(
                    rows,
                    |row| {
                        let value = values[row];
                        if value.is_nan() { value } else { transform(value) }
                    },
                    |row| weights[row],
                )
            })
            .collect()
    };
    Ok(match &column.levels {
        Some(levels) => CovariateTrajectory::Levels(
            levels
                .iter()
                .map(|&level| (level, series(&|value| f64::from(u8::from(value == level)))))
                .collect(),
        ),
        None => CovariateTrajectory::Mean(series(&|value| value)),
    })
}

/// Trajectory of each covariate in a simulated natural-course pool. For
/// survival outcomes each row is weighted by the probability that the
/// subject is still event-free (and free of the competing event) when
/// entering the interval.
pub fn covariate_means(
    pool: &Pool,
    covariates: &[SummaryColumn],
    outcome: &OutcomeSpec,
    competing: bool,
    time_points: usize,
) -> Result<Vec<(String, CovariateTrajectory)>, PoolError> {
    let mut weights = vec![1.0; pool.len()];
    if outcome.kind == OutcomeType::Survival {
        let hazard = pool.column(EVENT_PROBABILITY)?;
        let competing_hazard = if competing {
            Some(pool.column(COMPETING_PROBABILITY)?)
        } else {
            None
        };
        for subject in 0..pool.n_subjects() {
            let mut event_free = 1.0;
            for &row in pool.subject_rows(subject) {
                weights[row] = event_free;
                let d = competing_hazard.map_or(0.0, |column| column[row]);
                event_free *= (1.0 - hazard[row]) * (1.0 - d);
            }
        }
    }
    covariates
        .iter()
        .map(|column| -> Result<(String, CovariateTrajectory), PoolError> {
            Ok((column.name.clone(), trajectory(pool, column, &weights, time_points)?))
        })
        .collect()
}

/// Trajectory of each covariate in the observed cohort. With weights, a
/// row after the first time point carries the weight of the subject's
/// previous row.
pub fn observed_covariate_means(
    cohort: &Pool,
    covariates: &[SummaryColumn],
    time_points: usize,
    weights: Option<&[f64]>,
) -> Result<Vec<(String, CovariateTrajectory)>, PoolError> {
    check_weights(cohort, weights)?;
    let mut shifted = vec![1.0; cohort.len()];
    if let Some(weights) = weights {
        for subject in 0..cohort.n_subjects() {
            for pair in cohort.subject_rows(subject).windows(2) {
                if cohort.time(pair[1]) > 0 {
                    shifted[pair[1]] = weights[pair[0]];
                }
            }
        }
    }
    covariates
        .iter()
        .map(|column| -> Result<(String, CovariateTrajectory), PoolError> {
            Ok((column.name.clone(), trajectory(cohort, column, &shifted, time_points)?))
        })
        .collect()
}

/// Per row, the product over the subject's rows so far of
/// `1 / (1 - p)`, with `p` the model's predicted probability. Rows with a
/// missing prediction stay missing and do not enter the product.
fn inverse_cumulative_survival(
    cohort: &Pool,
    model: &dyn FittedModel,
    name: &str,
) -> Result<Vec<f64>, ComparisonError> {
    let rows: Vec<usize> = (0..cohort.len()).collect();
    let prediction_error = |source| ComparisonError::Prediction {
        name: name.to_string(),
        source,
    };
    let predicted = model.predict(cohort, &rows).map_err(prediction_error)?;
    if predicted.len() != rows.len() {
        return Err(prediction_error(ModelError::PredictionLength {
            expected: rows.len(),
            found: predicted.len(),
        }));
    }

    let mut cumulative = vec![f64::NAN; cohort.len()];
    for subject in 0..cohort.n_subjects() {
        let mut product = 1.0;
        for &row in cohort.subject_rows(subject) {
            let p = predicted[row];
            if p.is_nan() {
                continue;
            }
            if !(0.0..1.0).contains(&p) {
                return Err(ComparisonError::InvalidProbability {
                    name: name.to_string(),
                    value: p,
                });
            }
            product /= 1.0 - p;
            cumulative[row] = product;
        }
    }
    Ok(cumulative)
}

fn cap(weights: &mut [f64], limit: f64) {
    for weight in weights.iter_mut().filter(|w| **w > limit) {
        *weight = limit;
    }
}

/// Inverse probability of censoring weights, one per cohort row.
///
/// A row's weight is the inverse cumulative probability of remaining
/// uncensored up to and including it, and zero once censored. When
/// `competing` names an event handled as censoring, the weight is further
/// multiplied by the inverse cumulative probability of remaining free of
/// it, and is zero on rows where it occurred or is missing. A quantile
/// cutoff caps weights at that quantile of the censoring part alone; a
/// value cutoff caps them at the value.
pub fn censoring_weights(
    cohort: &Pool,
    censoring: &CensoringSpec,
    models: &FittedModels,
    competing: Option<&str>,
) -> Result<Vec<f64>, ComparisonError> {
    let model = models
        .censoring
        .as_deref()
        .ok_or_else(|| ComparisonError::MissingModel(censoring.name.clone()))?;
    let censored = cohort.column(&censoring.name)?;
    let uncensored: Vec<f64> = inverse_cumulative_survival(cohort, model, &censoring.name)?
        .into_iter()
        .zip(censored)
        .map(|(weight, &c)| weight * (1.0 - c))
        .collect();

    let mut weights = uncensored.clone();
    if let Some(name) = competing {
        let model = models
            .competing
            .as_deref()
            .ok_or_else(|| ComparisonError::MissingModel(name.to_string()))?;
        let events = cohort.column(name)?;
        let survival = inverse_cumulative_survival(cohort, model, name)?;
        for (row, weight) in weights.iter_mut().enumerate() {
            let event = events[row];
            *weight *= if event.is_nan() || event == 1.0 { 0.0 } else { survival[row] };
        }
    }

    if let Some(quantile) = censoring.cutoff_quantile {
        let mut sorted: Vec<f64> = uncensored.into_iter().filter(|w| !w.is_nan()).collect();
        sorted.sort_by(f64::total_cmp);
        if !sorted.is_empty() {
            cap(&mut weights, percentile(&sorted, quantile));
        }
    }
    if let Some(limit) = censoring.cutoff_value {
        cap(&mut weights, limit);
    }
    Ok(weights)
}

/// What the simulated natural course is compared against.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedSummary {
    pub estimate: Estimate,
    pub covariates: Vec<(String, CovariateTrajectory)>,
    /// Censoring weights per cohort row, when a censoring model is given.
    pub weights: Option<Vec<f64>>,
}

/// Observed estimate and covariate trajectories for `spec`. A competing
/// event handled as censoring leaves the risk set like censoring does, and
/// enters the weights when a censoring model is given.
pub fn observed_summary(
    cohort: &Pool,
    spec: &SimulationSpec,
    models: &FittedModels,
    covariates: &[SummaryColumn],
) -> Result<ObservedSummary, ComparisonError> {
    let censored_competing = spec
        .competing
        .as_ref()
        .filter(|c| c.as_censoring)
        .map(|c| c.name.as_str());
    let weights = match &spec.censoring {
        Some(censoring) => Some(censoring_weights(cohort, censoring, models, censored_competing)?),
        None => None,
    };
    let estimate = observed_estimate(
        cohort,
        &spec.outcome,
        spec.simulated_competing().map(|c| c.name.as_str()),
        spec.time_points,
        weights.as_deref(),
    )?;
    let covariates = observed_covariate_means(cohort, covariates, spec.time_points, weights.as_deref())?;
    Ok(ObservedSummary {
        estimate,
        covariates,
        weights,
    })
}

/// `estimate / reference`, elementwise.
pub fn risk_ratio(estimate: &[f64], reference: &[f64]) -> Vec<f64> {
    estimate.iter().zip(reference).map(|(a, b)| a / b).collect()
}

/// `estimate - reference`, elementwise.
pub fn risk_difference(estimate: &[f64], reference: &[f64]) -> Vec<f64> {
    estimate.iter().zip(reference).map(|(a, b)| a - b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinearModel, LinkFunction, Term};
    use crate::spec::CompetingEventSpec;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn mean_column(name: &str) -> SummaryColumn {
        SummaryColumn {
            name: name.to_string(),
            levels: None,
        }
    }

    fn constant(p: f64) -> Arc<LinearModel> {
        Arc::new(LinearModel::new(LinkFunction::Identity, p))
    }

    fn risk_curve(estimate: Estimate) -> Vec<f64> {
        match estimate {
            Estimate::Risk(curve) => curve,
            other => panic!("expected a risk curve, got {other:?}"),
        }
    }

    fn survival_pool(hazards: &[[f64; 2]], competing: Option<&[[f64; 2]]>) -> Pool {
        let n = hazards.len();
        let ids = (0..n as i64).flat_map(|id| [id, id]).collect();
        let times = (0..n).flat_map(|_| [0, 1]).collect();
        let mut columns = vec![(
            EVENT_PROBABILITY.to_string(),
            hazards.iter().flatten().copied().collect(),
        )];
        if let Some(competing) = competing {
            columns.push((
                COMPETING_PROBABILITY.to_string(),
                competing.iter().flatten().copied().collect(),
            ));
        }
        Pool::from_columns("id", "t0", ids, times, columns).unwrap()
    }

    #[test]
    fn test_cumulative_risk_without_competing_event() {
        let pool = survival_pool(&[[0.1, 0.1], [0.2, 0.5]], None);
        let risk = cumulative_risk(&pool, false, 2).unwrap();
        assert_abs_diff_eq!(risk[0], 0.15, epsilon = 1e-12);
        let second = (0.1 + 0.9 * 0.1 + 0.2 + 0.8 * 0.5) / 2.0;
        assert_abs_diff_eq!(risk[1], second, epsilon = 1e-12);
    }

    #[test]
    fn test_cumulative_risk_with_competing_event() {
        let pool = survival_pool(&[[0.1, 0.2]], Some(&[[0.5, 0.25]]));
        let risk = cumulative_risk(&pool, true, 2).unwrap();
        assert_abs_diff_eq!(risk[0], 0.05, epsilon = 1e-12);
        let event_free = 0.9 * 0.5;
        assert_abs_diff_eq!(risk[1], 0.05 + 0.2 * 0.75 * event_free, epsilon = 1e-12);
    }

    #[test]
    fn test_risk_is_non_decreasing() {
        let pool = survival_pool(&[[0.3, 0.0], [0.05, 0.9], [0.0, 0.0]], None);
        let risk = cumulative_risk(&pool, false, 2).unwrap();
        assert!(risk.windows(2).all(|w| w[1] >= w[0]));
        assert!(risk.iter().all(|r| (0.0..=1.0).contains(r)));
    }

    #[test]
    fn test_end_of_follow_up_mean_uses_final_time() {
        let pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 1, 2, 2],
            vec![0, 1, 0, 1],
            vec![(
                PREDICTED_PROBABILITY.to_string(),
                vec![f64::NAN, 0.2, f64::NAN, 0.6],
            )],
        )
        .unwrap();
        let outcome = OutcomeSpec::new("Y", OutcomeType::BinaryEof);
        let estimate = aggregate(&pool, &outcome, false, 2).unwrap();
        match estimate {
            Estimate::Mean(mean) => assert_abs_diff_eq!(mean, 0.4, epsilon = 1e-12),
            other => panic!("unexpected estimate {other:?}"),
        }
    }

    #[test]
    fn test_observed_risk_uses_interval_event_rates() {
        let cohort = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 2, 3, 3, 4, 4],
            vec![0, 0, 1, 0, 1, 0, 1],
            vec![("Y".to_string(), vec![1.0, 0.0, 1.0, 0.0, 0.0, 0.0, f64::NAN])],
        )
        .unwrap();
        let outcome = OutcomeSpec::new("Y", OutcomeType::Survival);
        let Estimate::Risk(curve) = observed_estimate(&cohort, &outcome, None, 2, None).unwrap() else {
            panic!("expected a risk curve");
        };
        assert_abs_diff_eq!(curve[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(curve[1], 0.25 + 0.75 * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_covariate_means_weight_by_event_free_probability() {
        let pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 1, 2, 2],
            vec![0, 1, 0, 1],
            vec![
                (EVENT_PROBABILITY.to_string(), vec![0.5, 0.5, 0.0, 0.0]),
                ("L".to_string(), vec![1.0, 1.0, 0.0, 0.0]),
            ],
        )
        .unwrap();
        let outcome = OutcomeSpec::new("Y", OutcomeType::Survival);
        let means = covariate_means(&pool, &[mean_column("L")], &outcome, false, 2).unwrap();
        assert_eq!(means[0].0, "L");
        let CovariateTrajectory::Mean(series) = &means[0].1 else {
            panic!("expected a mean trajectory");
        };
        assert_abs_diff_eq!(series[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(series[1], 0.5 / 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_ratio_and_difference() {
        assert_eq!(risk_ratio(&[0.2, 0.3], &[0.4, 0.3]), vec![0.5, 1.0]);
        let difference = risk_difference(&[0.2, 0.3], &[0.4, 0.3]);
        assert_abs_diff_eq!(difference[0], -0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(difference[1], 0.0, epsilon = 1e-12);
    }

    /// Four subjects at one time point; the first has the competing event.
    fn competing_cohort() -> Pool {
        Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3, 4],
            vec![0, 0, 0, 0],
            vec![
                ("Y".to_string(), vec![f64::NAN, 1.0, 0.0, 0.0]),
                ("D".to_string(), vec![1.0, 0.0, 0.0, 0.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_observed_risk_depends_on_competing_event_handling() {
        let cohort = competing_cohort();
        let outcome = OutcomeSpec::new("Y", OutcomeType::Survival);
        let competing = risk_curve(observed_estimate(&cohort, &outcome, Some("D"), 1, None).unwrap());
        assert_abs_diff_eq!(competing[0], 0.25, epsilon = 1e-12);
        let censored = risk_curve(observed_estimate(&cohort, &outcome, None, 1, None).unwrap());
        assert_abs_diff_eq!(censored[0], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_observed_summary_treats_censored_competing_event_as_censoring() {
        let cohort = competing_cohort();
        let mut spec = SimulationSpec::new(1, OutcomeSpec::new("Y", OutcomeType::Survival));
        spec.competing = Some(CompetingEventSpec {
            as_censoring: true,
            ..CompetingEventSpec::new("D")
        });
        let models = FittedModels::new(constant(0.1));
        let summary = observed_summary(&cohort, &spec, &models, &[]).unwrap();
        assert_abs_diff_eq!(risk_curve(summary.estimate)[0], 1.0 / 3.0, epsilon = 1e-12);
        assert!(summary.weights.is_none());

        if let Some(competing) = spec.competing.as_mut() {
            competing.as_censoring = false;
        }
        let summary = observed_summary(&cohort, &spec, &models, &[]).unwrap();
        assert_abs_diff_eq!(risk_curve(summary.estimate)[0], 0.25, epsilon = 1e-12);
    }

    fn censored_cohort() -> Pool {
        Pool::from_columns(
            "id",
            "t0",
            vec![1, 1, 2, 2, 2],
            vec![0, 1, 0, 1, 2],
            vec![("C".to_string(), vec![0.0, 1.0, 0.0, 0.0, 0.0])],
        )
        .unwrap()
    }

    #[test]
    fn test_censoring_weights_accumulate_inverse_probabilities() {
        let models = FittedModels::new(constant(0.1)).with_censoring(constant(0.2));
        let weights =
            censoring_weights(&censored_cohort(), &CensoringSpec::new("C"), &models, None).unwrap();
        let expected = [1.25, 0.0, 1.25, 1.5625, 1.953125];
        for (weight, expected) in weights.iter().zip(expected) {
            assert_abs_diff_eq!(*weight, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_censoring_weights_are_capped() {
        let models = FittedModels::new(constant(0.1)).with_censoring(constant(0.2));
        let by_quantile = CensoringSpec {
            cutoff_quantile: Some(0.5),
            ..CensoringSpec::new("C")
        };
        let weights = censoring_weights(&censored_cohort(), &by_quantile, &models, None).unwrap();
        // Median of [0, 1.25, 1.25, 1.5625, 1.953125].
        let expected = [1.25, 0.0, 1.25, 1.25, 1.25];
        for (weight, expected) in weights.iter().zip(expected) {
            assert_abs_diff_eq!(*weight, expected, epsilon = 1e-12);
        }

        let by_value = CensoringSpec {
            cutoff_value: Some(1.5),
            ..CensoringSpec::new("C")
        };
        let weights = censoring_weights(&censored_cohort(), &by_value, &models, None).unwrap();
        let expected = [1.25, 0.0, 1.25, 1.5, 1.5];
        for (weight, expected) in weights.iter().zip(expected) {
            assert_abs_diff_eq!(*weight, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_censored_competing_event_zeroes_weights() {
        let cohort = Pool::from_columns(
            "id",
            "t0",
            vec![1, 1],
            vec![0, 1],
            vec![
                ("C".to_string(), vec![0.0, 0.0]),
                ("D".to_string(), vec![0.0, 1.0]),
            ],
        )
        .unwrap();
        let models = FittedModels::new(constant(0.1))
            .with_censoring(constant(0.0))
            .with_competing(constant(0.5));
        let weights = censoring_weights(&cohort, &CensoringSpec::new("C"), &models, Some("D")).unwrap();
        assert_abs_diff_eq!(weights[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weights[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_certain_censoring_cannot_be_inverted() {
        let models = FittedModels::new(constant(0.1)).with_censoring(constant(1.0));
        assert!(matches!(
            censoring_weights(&censored_cohort(), &CensoringSpec::new("C"), &models, None),
            Err(ComparisonError::InvalidProbability { .. })
        ));
    }

    /// Subject 1 has censoring probability 0.5 per interval and an event at
    /// time 1; subject 2 is never at risk of censoring; subject 3 is
    /// censored at time 0.
    fn weighted_cohort() -> (Pool, FittedModels) {
        let cohort = Pool::from_columns(
            "id",
            "t0",
            vec![1, 1, 2, 2, 3],
            vec![0, 1, 0, 1, 0],
            vec![
                ("X".to_string(), vec![0.5, 0.5, 0.0, 0.0, 0.0]),
                ("C".to_string(), vec![0.0, 0.0, 0.0, 0.0, 1.0]),
                ("Y".to_string(), vec![0.0, 1.0, 0.0, 0.0, f64::NAN]),
            ],
        )
        .unwrap();
        let censoring = LinearModel::new(LinkFunction::Identity, 0.0).with_term(Term::new("X", 1.0));
        let models = FittedModels::new(constant(0.1)).with_censoring(Arc::new(censoring));
        (cohort, models)
    }

    #[test]
    fn test_weighted_observed_risk() {
        let (cohort, models) = weighted_cohort();
        let weights = censoring_weights(&cohort, &CensoringSpec::new("C"), &models, None).unwrap();
        assert_eq!(weights, vec![2.0, 4.0, 1.0, 1.0, 0.0]);

        let outcome = OutcomeSpec::new("Y", OutcomeType::Survival);
        let weighted = risk_curve(observed_estimate(&cohort, &outcome, None, 2, Some(&weights)).unwrap());
        assert_abs_diff_eq!(weighted[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(weighted[1], 0.8, epsilon = 1e-12);
        let unweighted = risk_curve(observed_estimate(&cohort, &outcome, None, 2, None).unwrap());
        assert_abs_diff_eq!(unweighted[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_weighted_observed_covariate_means_use_previous_weight() {
        let (cohort, models) = weighted_cohort();
        let mut spec = SimulationSpec::new(2, OutcomeSpec::new("Y", OutcomeType::Survival));
        spec.censoring = Some(CensoringSpec::new("C"));
        let summary = observed_summary(&cohort, &spec, &models, &[mean_column("X")]).unwrap();
        let CovariateTrajectory::Mean(series) = &summary.covariates[0].1 else {
            panic!("expected a mean trajectory");
        };
        assert_abs_diff_eq!(series[0], 0.5 / 3.0, epsilon = 1e-12);
        // Rows at time 1 carry weights 2 and 1 from time 0.
        assert_abs_diff_eq!(series[1], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_categorical_trajectories_report_level_shares() {
        let pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3, 4],
            vec![0, 0, 0, 0],
            vec![("K".to_string(), vec![1.0, 2.0, 2.0, f64::NAN])],
        )
        .unwrap();
        let column = SummaryColumn {
            name: "K".to_string(),
            levels: Some(vec![1.0, 2.0, 3.0]),
        };
        let observed = observed_covariate_means(&pool, std::slice::from_ref(&column), 1, None).unwrap();
        let expected = CovariateTrajectory::Levels(vec![
            (1.0, vec![1.0 / 3.0]),
            (2.0, vec![2.0 / 3.0]),
            (3.0, vec![0.0]),
        ]);
        assert_eq!(observed[0].1, expected);

        let outcome = OutcomeSpec::new("Y", OutcomeType::BinaryEof);
        let simulated = covariate_means(&pool, &[column], &outcome, false, 1).unwrap();
        assert_eq!(simulated[0].1, expected);
    }

    #[test]
    fn test_summary_columns_take_levels_from_cohort() {
        use crate::spec::CovariateSpec;
        let pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2],
            vec![0, 0],
            vec![
                ("K".to_string(), vec![3.0, 1.0]),
                ("L".to_string(), vec![0.5, 0.7]),
            ],
        )
        .unwrap();
        let spec = SimulationSpec::new(1, OutcomeSpec::new("Y", OutcomeType::Survival))
            .with_covariate(CovariateSpec::new("K", CovariateKind::Categorical))
            .with_covariate(CovariateSpec::new("L", CovariateKind::Normal))
            .with_covariate(CovariateSpec::new("t2", CovariateKind::SquareTime));
        let columns = summary_columns(&spec, &pool).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].levels, Some(vec![1.0, 3.0]));
        assert_eq!(columns[1], mean_column("L"));
    }
}
