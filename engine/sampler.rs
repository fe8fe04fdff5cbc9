//! # Covariate Sampler
//!
//! Draws realized covariate values for the rows of the current time slice
//! from fitted model predictions, according to the covariate's type.
//! All randomness comes from the run's seeded generator, so identical
//! inputs reproduce identical draws.

use crate::history::lag_name;
use crate::model::{CovariateFit, FittedModel, FittedModels, ModelError};
use crate::pool::Pool;
use crate::simulate::SimulationError;
use crate::spec::{CovariateKind, CovariateSpec, SimulationSpec, TruncationDirection};
use ahash::AHashMap;
use ndarray::Array1;
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use statrs::distribution::{ContinuousCDF, Normal};

/// Inputs shared by every draw of one simulation run.
pub struct SamplingContext<'a> {
    pub spec: &'a SimulationSpec,
    pub models: &'a FittedModels,
    /// Sorted observed levels of each categorical covariate.
    pub levels: &'a AHashMap<String, Vec<f64>>,
    standard: Normal,
}

impl<'a> SamplingContext<'a> {
    pub fn new(
        spec: &'a SimulationSpec,
        models: &'a FittedModels,
        levels: &'a AHashMap<String, Vec<f64>>,
    ) -> Result<Self, SimulationError> {
        let standard =
            Normal::new(0.0, 1.0).map_err(|e| SimulationError::Custom(e.to_string()))?;
        Ok(Self {
            spec,
            models,
            levels,
            standard,
        })
    }
}

/// A 0/1 draw with the given probability. Probabilities outside `[0, 1]`
/// (or missing) are an error rather than silently clamped.
pub fn bernoulli(rng: &mut StdRng, probability: f64, column: &str) -> Result<f64, SimulationError> {
    if !(0.0..=1.0).contains(&probability) {
        return Err(SimulationError::InvalidProbability {
            column: column.to_string(),
            value: probability,
        });
    }
    Ok(if rng.r#gen::<f64>() < probability { 1.0 } else { 0.0 })
}

fn predict(
    model: &dyn FittedModel,
    pool: &Pool,
    rows: &[usize],
    name: &str,
) -> Result<Array1<f64>, SimulationError> {
    let predictions = model
        .predict(pool, rows)
        .map_err(|source| SimulationError::Prediction {
            name: name.to_string(),
            source,
        })?;
    if predictions.len() != rows.len() {
        return Err(SimulationError::Prediction {
            name: name.to_string(),
            source: ModelError::PredictionLength {
                expected: rows.len(),
                found: predictions.len(),
            },
        });
    }
    Ok(predictions)
}

/// Predicted probabilities of a binary target, one per row.
pub fn predict_probability(
    model: &dyn FittedModel,
    pool: &Pool,
    rows: &[usize],
    name: &str,
) -> Result<Vec<f64>, SimulationError> {
    Ok(predict(model, pool, rows, name)?.to_vec())
}

fn normal_draw(rng: &mut StdRng, mean: f64, sd: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    mean + sd * z
}

fn truncated_normal_draw(
    rng: &mut StdRng,
    standard: &Normal,
    mean: f64,
    sd: f64,
    lower: f64,
    upper: f64,
) -> f64 {
    if sd <= 0.0 || !mean.is_finite() {
        return mean.clamp(lower, upper);
    }
    let lo = standard.cdf((lower - mean) / sd);
    let hi = standard.cdf((upper - mean) / sd);
    if hi <= lo {
        return if mean < lower { lower } else { upper };
    }
    let u = lo + (hi - lo) * rng.r#gen::<f64>();
    (mean + sd * standard.inverse_cdf(u)).clamp(lower, upper)
}

fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (index, value) in values.enumerate() {
        if value > best.1 {
            best = (index, value);
        }
    }
    best.0
}

/// Draws `covariate` for `rows` (all at time `t`) and writes it to the pool.
pub fn sample_covariate(
    pool: &mut Pool,
    rows: &[usize],
    covariate: &CovariateSpec,
    ctx: &SamplingContext<'_>,
    t: i64,
    rng: &mut StdRng,
) -> Result<(), SimulationError> {
    let name = covariate.name.as_str();
    let fit = ctx
        .models
        .covariates
        .get(name)
        .ok_or_else(|| SimulationError::MissingModel(name.to_string()))?;
    let rmse = ctx.models.rmses.get(name).copied().unwrap_or(0.0);
    let bounds = ctx.models.bounds.get(name).copied();
    let clamp = |value: f64| match bounds {
        Some((lower, upper)) => value.clamp(lower, upper),
        None => value,
    };

    let mut values: Vec<f64> = match (&covariate.kind, fit) {
        (CovariateKind::Binary, CovariateFit::Mean(model)) => {
            if let Some(visit) = ctx.spec.visit_by_indicator(name) {
                let counter = pool.gather(&lag_name(&visit.counter_name(), 1), rows)?;
                let probabilities = predict_probability(model.as_ref(), pool, rows, name)?;
                let limit = f64::from(visit.max_missed);
                let mut drawn = Vec::with_capacity(rows.len());
                for (p, missed) in probabilities.into_iter().zip(counter) {
                    drawn.push(if missed < limit {
                        bernoulli(rng, p, name)?
                    } else {
                        1.0
                    });
                }
                let counts: Vec<f64> = pool
                    .gather(&visit.counter_name(), rows)?
                    .into_iter()
                    .zip(&drawn)
                    .map(|(count, &visited)| if visited == 0.0 { count + 1.0 } else { 0.0 })
                    .collect();
                pool.write(&visit.counter_name(), rows, &counts)?;
                drawn
            } else {
                predict_probability(model.as_ref(), pool, rows, name)?
                    .into_iter()
                    .map(|p| bernoulli(rng, p, name))
                    .collect::<Result<_, _>>()?
            }
        }
        (CovariateKind::Absorbing, CovariateFit::Mean(model)) => {
            let probabilities = predict_probability(model.as_ref(), pool, rows, name)?;
            let column = pool.column_index(name)?;
            let mut drawn = Vec::with_capacity(rows.len());
            for (&row, p) in rows.iter().zip(probabilities) {
                let previous = pool
                    .lookup(pool.subject_of(row), t - 1)
                    .map_or(0.0, |prev| pool.value(column, prev));
                drawn.push(if previous == 0.0 {
                    bernoulli(rng, p, name)?
                } else {
                    1.0
                });
            }
            drawn
        }
        (CovariateKind::Normal, CovariateFit::Mean(model)) => {
            let truncate = ctx.spec.truncate_to_observed_range;
            predict(model.as_ref(), pool, rows, name)?
                .iter()
                .map(|&mean| {
                    let draw = normal_draw(rng, mean, rmse);
                    if truncate { clamp(draw) } else { draw }
                })
                .collect()
        }
        (CovariateKind::BoundedNormal, CovariateFit::Mean(model)) => {
            let (lower, upper) = bounds.ok_or_else(|| SimulationError::MissingBounds(name.to_string()))?;
            predict(model.as_ref(), pool, rows, name)?
                .iter()
                .map(|&mean| {
                    let unit = normal_draw(rng, mean, rmse);
                    (unit * (upper - lower) + lower).clamp(lower, upper)
                })
                .collect()
        }
        (
            CovariateKind::ZeroInflatedNormal,
            CovariateFit::ZeroInflated {
                indicator,
                log_mean,
            },
        ) => {
            let probabilities = predict_probability(indicator.as_ref(), pool, rows, name)?;
            let means = predict(log_mean.as_ref(), pool, rows, name)?;
            let mut drawn = Vec::with_capacity(rows.len());
            for (p, &mean) in probabilities.into_iter().zip(means.iter()) {
                let positive = bernoulli(rng, p, name)?;
                let magnitude = normal_draw(rng, mean, rmse).exp();
                drawn.push(if positive == 1.0 { clamp(magnitude) } else { 0.0 });
            }
            drawn
        }
        (CovariateKind::TruncatedNormal { point, direction }, CovariateFit::Mean(model)) => {
            let (lower, upper) = match direction {
                TruncationDirection::Left => (*point, f64::INFINITY),
                TruncationDirection::Right => (f64::NEG_INFINITY, *point),
            };
            predict(model.as_ref(), pool, rows, name)?
                .iter()
                .map(|&mean| {
                    clamp(truncated_normal_draw(
                        rng,
                        &ctx.standard,
                        mean,
                        rmse,
                        lower,
                        upper,
                    ))
                })
                .collect()
        }
        (CovariateKind::Categorical, CovariateFit::Categorical(model)) => {
            let levels = ctx
                .levels
                .get(name)
                .ok_or_else(|| SimulationError::MissingLevels(name.to_string()))?;
            let probabilities = model.predict_probabilities(pool, rows).map_err(|source| {
                SimulationError::Prediction {
                    name: name.to_string(),
                    source,
                }
            })?;
            if probabilities.ncols() != levels.len() || probabilities.nrows() != rows.len() {
                return Err(SimulationError::ClassCountMismatch {
                    column: name.to_string(),
                    expected: levels.len(),
                    found: probabilities.ncols(),
                });
            }
            probabilities
                .rows()
                .into_iter()
                .map(|row| levels[argmax(row.iter().copied())])
                .collect()
        }
        (CovariateKind::Custom, CovariateFit::Custom(predictor)) => {
            let drawn = predictor.realize(pool, rows, t, rng).map_err(|source| {
                SimulationError::Prediction {
                    name: name.to_string(),
                    source,
                }
            })?;
            if drawn.len() != rows.len() {
                return Err(SimulationError::Prediction {
                    name: name.to_string(),
                    source: ModelError::PredictionLength {
                        expected: rows.len(),
                        found: drawn.len(),
                    },
                });
            }
            drawn
        }
        (kind, fit) => {
            return Err(SimulationError::UnsupportedModel {
                column: name.to_string(),
                kind: kind.label(),
                fit: fit.label(),
            });
        }
    };

    if let Some(visit) = ctx.spec.visit_for(name) {
        let visited = pool.gather(&visit.indicator, rows)?;
        let carried = pool.gather(&lag_name(name, 1), rows)?;
        for ((value, visited), carried) in values.iter_mut().zip(visited).zip(carried) {
            if visited == 0.0 {
                *value = carried;
            }
        }
    }

    pool.write(name, rows, &values)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassPredictor, LinearModel, LinkFunction, MultinomialModel, Term};
    use crate::spec::{OutcomeSpec, OutcomeType, VisitProcess};
    use rand::SeedableRng;
    use std::sync::Arc;

    fn constant(value: f64) -> Arc<LinearModel> {
        Arc::new(LinearModel::new(LinkFunction::Identity, value))
    }

    fn slice(n: usize, columns: Vec<(&str, f64)>) -> Pool {
        let columns = columns
            .into_iter()
            .map(|(name, value)| (name.to_string(), vec![value; n]))
            .collect();
        Pool::from_columns("id", "t0", (0..n as i64).collect(), vec![0; n], columns).unwrap()
    }

    fn draw(
        pool: &mut Pool,
        spec: &SimulationSpec,
        models: &FittedModels,
        name: &str,
        seed: u64,
    ) -> Vec<f64> {
        let levels = AHashMap::new();
        let ctx = SamplingContext::new(spec, models, &levels).unwrap();
        let rows = pool.slice(0);
        let covariate = spec.covariate(name).unwrap().clone();
        let mut rng = StdRng::seed_from_u64(seed);
        sample_covariate(pool, &rows, &covariate, &ctx, 0, &mut rng).unwrap();
        pool.column(name).unwrap().to_vec()
    }

    fn spec_with(covariate: CovariateSpec) -> SimulationSpec {
        SimulationSpec::new(1, OutcomeSpec::new("Y", OutcomeType::Survival)).with_covariate(covariate)
    }

    #[test]
    fn test_binary_draws_are_zero_or_one() {
        let spec = spec_with(CovariateSpec::new("L", CovariateKind::Binary));
        let models = FittedModels::new(constant(0.1)).with_covariate("L", CovariateFit::Mean(constant(0.4)));
        let mut pool = slice(2000, vec![("L", 0.0)]);
        let values = draw(&mut pool, &spec, &models, "L", 3);
        assert!(values.iter().all(|&v| v == 0.0 || v == 1.0));
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!((mean - 0.4).abs() < 0.05);
    }

    #[test]
    fn test_invalid_probability_is_an_error() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            bernoulli(&mut rng, 1.5, "L"),
            Err(SimulationError::InvalidProbability { .. })
        ));
        assert!(bernoulli(&mut rng, f64::NAN, "L").is_err());
    }

    #[test]
    fn test_normal_draws_stay_within_observed_bounds() {
        let spec = spec_with(CovariateSpec::new("X", CovariateKind::Normal));
        let models = FittedModels::new(constant(0.1))
            .with_covariate("X", CovariateFit::Mean(constant(0.0)))
            .with_rmse("X", 5.0)
            .with_bounds("X", (-1.0, 1.0));
        let mut pool = slice(500, vec![("X", 0.0)]);
        let values = draw(&mut pool, &spec, &models, "X", 5);
        assert!(values.iter().all(|&v| (-1.0..=1.0).contains(&v)));
        assert!(values.iter().any(|&v| v == 1.0));
    }

    #[test]
    fn test_same_seed_reproduces_draws() {
        let spec = spec_with(CovariateSpec::new("X", CovariateKind::Normal));
        let models = FittedModels::new(constant(0.1))
            .with_covariate("X", CovariateFit::Mean(constant(2.0)))
            .with_rmse("X", 1.0)
            .with_bounds("X", (-10.0, 10.0));
        let first = draw(&mut slice(50, vec![("X", 0.0)]), &spec, &models, "X", 9);
        let second = draw(&mut slice(50, vec![("X", 0.0)]), &spec, &models, "X", 9);
        assert_eq!(first, second);
    }

    #[test]
    fn test_bounded_normal_rescales_unit_interval() {
        let spec = spec_with(CovariateSpec::new("B", CovariateKind::BoundedNormal));
        let models = FittedModels::new(constant(0.1))
            .with_covariate("B", CovariateFit::Mean(constant(0.5)))
            .with_rmse("B", 0.0)
            .with_bounds("B", (10.0, 20.0));
        let values = draw(&mut slice(5, vec![("B", 0.0)]), &spec, &models, "B", 1);
        assert!(values.iter().all(|&v| v == 15.0));
    }

    #[test]
    fn test_zero_inflated_draws() {
        let spec = spec_with(CovariateSpec::new("Z", CovariateKind::ZeroInflatedNormal));
        let models = FittedModels::new(constant(0.1))
            .with_covariate(
                "Z",
                CovariateFit::ZeroInflated {
                    indicator: constant(0.5),
                    log_mean: constant(0.0),
                },
            )
            .with_rmse("Z", 0.0)
            .with_bounds("Z", (0.0, 0.5));
        let values = draw(&mut slice(400, vec![("Z", 0.0)]), &spec, &models, "Z", 2);
        assert!(values.iter().all(|&v| v == 0.0 || v == 0.5));
        assert!(values.contains(&0.0) && values.contains(&0.5));
    }

    #[test]
    fn test_truncated_normal_respects_direction() {
        let kind = CovariateKind::TruncatedNormal {
            point: 1.0,
            direction: TruncationDirection::Left,
        };
        let spec = spec_with(CovariateSpec::new("T", kind));
        let models = FittedModels::new(constant(0.1))
            .with_covariate("T", CovariateFit::Mean(constant(0.0)))
            .with_rmse("T", 1.0)
            .with_bounds("T", (-5.0, 5.0));
        let values = draw(&mut slice(300, vec![("T", 0.0)]), &spec, &models, "T", 4);
        assert!(values.iter().all(|&v| (1.0..=5.0).contains(&v)));
    }

    #[test]
    fn test_categorical_takes_most_probable_level() {
        let spec = spec_with(CovariateSpec::new("C", CovariateKind::Categorical));
        let model = MultinomialModel {
            classes: vec![
                ClassPredictor {
                    intercept: -1.0,
                    terms: vec![Term::new("S", 3.0)],
                },
                ClassPredictor {
                    intercept: 0.5,
                    terms: vec![],
                },
            ],
        };
        let models = FittedModels::new(constant(0.1)).with_covariate("C", CovariateFit::Categorical(Arc::new(model)));
        let mut pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2],
            vec![0, 0],
            vec![
                ("C".to_string(), vec![0.0, 0.0]),
                ("S".to_string(), vec![0.0, 1.0]),
            ],
        )
        .unwrap();
        let levels = AHashMap::from_iter([("C".to_string(), vec![2.0, 4.0, 8.0])]);
        let ctx = SamplingContext::new(&spec, &models, &levels).unwrap();
        let covariate = spec.covariate("C").unwrap().clone();
        let mut rng = StdRng::seed_from_u64(0);
        sample_covariate(&mut pool, &[0, 1], &covariate, &ctx, 0, &mut rng).unwrap();
        assert_eq!(pool.column("C").unwrap(), &[8.0, 4.0]);
    }

    #[test]
    fn test_absorbing_stays_at_one() {
        let spec = spec_with(CovariateSpec::new("H", CovariateKind::Absorbing));
        let models = FittedModels::new(constant(0.1)).with_covariate("H", CovariateFit::Mean(constant(0.0)));
        let mut pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 1, 2, 2],
            vec![0, 1, 0, 1],
            vec![("H".to_string(), vec![1.0, 0.0, 0.0, 0.0])],
        )
        .unwrap();
        let levels = AHashMap::new();
        let ctx = SamplingContext::new(&spec, &models, &levels).unwrap();
        let rows = pool.slice(1);
        let covariate = spec.covariate("H").unwrap().clone();
        let mut rng = StdRng::seed_from_u64(0);
        sample_covariate(&mut pool, &rows, &covariate, &ctx, 1, &mut rng).unwrap();
        assert_eq!(pool.gather("H", &rows).unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_visit_process_forces_visit_and_carries_value() {
        let mut spec = spec_with(CovariateSpec::new("visit", CovariateKind::Binary))
            .with_covariate(CovariateSpec::new("X", CovariateKind::Normal));
        spec.truncate_to_observed_range = false;
        spec.visits.push(VisitProcess::new("visit", "X", 2));
        let models = FittedModels::new(constant(0.1))
            .with_covariate("visit", CovariateFit::Mean(constant(0.0)))
            .with_covariate("X", CovariateFit::Mean(constant(100.0)))
            .with_rmse("X", 0.0);
        let mut pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2],
            vec![0, 0],
            vec![
                ("visit".to_string(), vec![0.0, 0.0]),
                ("X".to_string(), vec![0.0, 0.0]),
                ("ts_X".to_string(), vec![2.0, 1.0]),
                ("lag1_ts_X".to_string(), vec![2.0, 1.0]),
                ("lag1_X".to_string(), vec![7.0, 9.0]),
            ],
        )
        .unwrap();
        let levels = AHashMap::new();
        let ctx = SamplingContext::new(&spec, &models, &levels).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for name in ["visit", "X"] {
            let covariate = spec.covariate(name).unwrap().clone();
            sample_covariate(&mut pool, &[0, 1], &covariate, &ctx, 0, &mut rng).unwrap();
        }
        assert_eq!(pool.column("visit").unwrap(), &[1.0, 0.0]);
        assert_eq!(pool.column("ts_X").unwrap(), &[0.0, 2.0]);
        assert_eq!(pool.column("X").unwrap(), &[100.0, 9.0]);
    }
}
