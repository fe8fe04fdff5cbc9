//! # Simulation Driver
//!
//! Runs the Monte Carlo loop of the parametric g-formula for one
//! intervention: starting from the baseline rows of the cohort, it advances
//! a simulated pool one time point at a time, drawing covariates in their
//! declared order, applying the intervention, and drawing the competing
//! event and the outcome.
//!
//! Per time point `t > 0` the order is fixed:
//! 1. copy the slice at `t - 1` to `t` and refresh derived time features;
//! 2. refresh history columns;
//! 3. draw each covariate, then apply its restrictions and refresh its
//!    cumulative average and custom history;
//! 4. apply the intervention and refresh history again;
//! 5. draw the competing event, then the outcome.
//!
//! At `t = 0` observed covariates are kept: only the intervention, history
//! and step 5 run.

use crate::history::{self, HistoryError, HistorySpec};
use crate::intervention::Intervention;
use crate::model::{FittedModels, ModelError};
use crate::pool::{Pool, PoolError};
use crate::risk::{
    self, COMPETING_PROBABILITY, EVENT_FREE_PROBABILITY, EVENT_PROBABILITY, PREDICTED_MEAN,
    PREDICTED_PROBABILITY,
};
use crate::sampler::{self, SamplingContext, bernoulli};
use crate::spec::{ConfigError, CovariateKind, OutcomeType, SimulationSpec};
use ahash::AHashMap;
use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("Prediction for '{name}' failed: {source}")]
    Prediction {
        name: String,
        #[source]
        source: ModelError,
    },
    #[error("Probability {value} for '{column}' is not within [0, 1].")]
    InvalidProbability { column: String, value: f64 },
    #[error("Covariate '{0}' has no fitted model.")]
    MissingModel(String),
    #[error("Covariate '{0}' has no observed bounds.")]
    MissingBounds(String),
    #[error("Categorical covariate '{0}' has no observed levels.")]
    MissingLevels(String),
    #[error("Categorical covariate '{column}' has {expected} observed levels but the model predicts {found} classes.")]
    ClassCountMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Covariate '{column}' of type {kind} cannot be drawn from a {fit} model.")]
    UnsupportedModel {
        column: String,
        kind: &'static str,
        fit: &'static str,
    },
    #[error("Static intervention on '{treatment}' has no value for time {t}.")]
    StaticValueMissing { treatment: String, t: i64 },
    #[error("The cohort has no rows at time 0.")]
    NoBaselineRows,
    #[error("{0}")]
    Custom(String),
}

/// The population estimate of one simulation run.
#[derive(Debug, Clone, PartialEq)]
pub enum Estimate {
    /// Cumulative risk at each time point.
    Risk(Vec<f64>),
    /// Mean predicted outcome at the final time point.
    Mean(f64),
}

impl Estimate {
    /// The estimate as a series: the risk curve, or a single mean.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Estimate::Risk(curve) => curve.clone(),
            Estimate::Mean(mean) => vec![*mean],
        }
    }

    /// Risk at the last time point, or the mean.
    pub fn final_value(&self) -> f64 {
        match self {
            Estimate::Risk(curve) => curve.last().copied().unwrap_or(f64::NAN),
            Estimate::Mean(mean) => *mean,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub intervention: String,
    pub estimate: Estimate,
    /// Simulated rows at times `0..time_points`.
    pub pool: Pool,
}

/// A validated specification paired with its fitted models.
#[derive(Debug, Clone)]
pub struct Simulator {
    spec: Arc<SimulationSpec>,
    models: Arc<FittedModels>,
}

impl Simulator {
    pub fn new(spec: SimulationSpec, models: FittedModels) -> Result<Self, ConfigError> {
        spec.validate(&models)?;
        Ok(Self {
            spec: Arc::new(spec),
            models: Arc::new(models),
        })
    }

    pub fn spec(&self) -> &SimulationSpec {
        &self.spec
    }

    pub fn models(&self) -> &FittedModels {
        &self.models
    }

    /// Simulates `cohort` under `intervention`. The same seed, cohort and
    /// intervention always produce the same outcome.
    pub fn run(
        &self,
        cohort: &Pool,
        intervention: &Intervention,
        seed: u64,
    ) -> Result<SimulationOutcome, SimulationError> {
        intervention.validate(&self.spec)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let levels = categorical_levels(&self.spec, cohort)?;
        let pool = baseline_pool(&self.spec, cohort, &mut rng)?;
        let history = HistorySpec {
            pre_baseline: pool.min_time().is_some_and(|t| t < 0),
            ..self.spec.history.clone()
        };
        let ctx = SamplingContext::new(&self.spec, &self.models, &levels)?;

        let mut run = Run {
            spec: &self.spec,
            models: &self.models,
            history,
            intervention,
            ctx,
            rng,
            pool,
        };
        for t in 0..self.spec.time_points as i64 {
            run.step(t)?;
        }

        let pool = run.pool.filter_time(|t| t >= 0)?;
        let competing = self.spec.simulated_competing().is_some();
        let estimate = risk::aggregate(&pool, &self.spec.outcome, competing, self.spec.time_points)?;
        debug!(
            "Intervention '{}': final estimate {:.6}",
            intervention.name,
            estimate.final_value()
        );
        Ok(SimulationOutcome {
            intervention: intervention.name.clone(),
            estimate,
            pool,
        })
    }

    /// Simulates every intervention with the same seed, optionally in
    /// parallel. Results keep the order of `interventions`.
    pub fn run_all(
        &self,
        cohort: &Pool,
        interventions: &[Intervention],
        seed: u64,
        parallel: bool,
    ) -> Result<Vec<SimulationOutcome>, SimulationError> {
        info!(
            "Simulating {} intervention(s) over {} time points.",
            interventions.len(),
            self.spec.time_points
        );
        if parallel {
            interventions
                .par_iter()
                .map(|intervention| self.run(cohort, intervention, seed))
                .collect()
        } else {
            interventions
                .iter()
                .map(|intervention| self.run(cohort, intervention, seed))
                .collect()
        }
    }
}

/// Validates `spec` against `models` and simulates one intervention.
pub fn simulate(
    seed: u64,
    cohort: &Pool,
    spec: SimulationSpec,
    models: FittedModels,
    intervention: &Intervention,
) -> Result<SimulationOutcome, SimulationError> {
    Simulator::new(spec, models)?.run(cohort, intervention, seed)
}

fn categorical_levels(
    spec: &SimulationSpec,
    cohort: &Pool,
) -> Result<AHashMap<String, Vec<f64>>, SimulationError> {
    let mut levels = AHashMap::new();
    for covariate in &spec.covariates {
        if covariate.kind == CovariateKind::Categorical {
            levels.insert(covariate.name.clone(), cohort.levels(&covariate.name)?);
        }
    }
    Ok(levels)
}

/// The rows at or before time zero that seed the simulation, with derived
/// time features and visit counters in place.
fn baseline_pool(
    spec: &SimulationSpec,
    cohort: &Pool,
    rng: &mut StdRng,
) -> Result<Pool, SimulationError> {
    let resampled;
    let source = match spec.n_simul {
        Some(n) if n != cohort.n_subjects() => {
            resampled = cohort.resample_subjects(n, rng)?;
            &resampled
        }
        _ => cohort,
    };

    let mut columns = spec.input_columns();
    for visit in &spec.visits {
        let counter = visit.counter_name();
        if source.has_column(&counter) && !columns.contains(&counter) {
            columns.push(counter);
        }
    }
    let names: Vec<&str> = columns.iter().map(String::as_str).collect();
    let mut pool = source.filter_time(|t| t <= 0)?.select(&names)?;
    if pool.slice(0).is_empty() {
        return Err(SimulationError::NoBaselineRows);
    }

    for visit in &spec.visits {
        if !pool.has_column(&visit.counter_name()) {
            history::visit_counter(&mut pool, visit)?;
        }
    }
    let rows: Vec<usize> = (0..pool.len()).collect();
    history::write_time_features(&mut pool, &rows, &spec.covariates)?;
    Ok(pool)
}

/// State of one simulation run.
struct Run<'a> {
    spec: &'a SimulationSpec,
    models: &'a FittedModels,
    history: HistorySpec,
    intervention: &'a Intervention,
    ctx: SamplingContext<'a>,
    rng: StdRng,
    pool: Pool,
}

impl Run<'_> {
    fn step(&mut self, t: i64) -> Result<(), SimulationError> {
        let rows = if t == 0 {
            let rows = self.pool.slice(0);
            self.intervention.apply(&mut self.pool, &rows, t, &mut self.rng)?;
            self.refresh_history(t)?;
            rows
        } else {
            let rows = self.pool.append_slice(t - 1, t)?;
            history::write_time_features(&mut self.pool, &rows, &self.spec.covariates)?;
            self.refresh_history(t)?;
            self.draw_covariates(&rows, t)?;
            self.intervention.apply(&mut self.pool, &rows, t, &mut self.rng)?;
            self.refresh_history(t)?;
            rows
        };
        debug!("Simulated {} rows at time {t}.", rows.len());
        self.draw_competing_event(&rows, t)?;
        self.draw_outcome(&rows, t)
    }

    fn refresh_history(&mut self, t: i64) -> Result<(), SimulationError> {
        history::update_history(&mut self.pool, &self.history)?;
        for (covariate, custom) in &self.spec.custom_histories {
            custom.update(&mut self.pool, covariate, t)?;
        }
        Ok(())
    }

    fn draw_covariates(&mut self, rows: &[usize], t: i64) -> Result<(), SimulationError> {
        for covariate in &self.spec.covariates {
            if covariate.modeled && !covariate.kind.is_time_feature() {
                sampler::sample_covariate(
                    &mut self.pool,
                    rows,
                    covariate,
                    &self.ctx,
                    t,
                    &mut self.rng,
                )?;
            }
            for (name, restriction) in &self.spec.restrictions {
                if name == &covariate.name {
                    restriction.apply(&mut self.pool, rows, name, t)?;
                }
            }
            if self.history.has_cumavg(&covariate.name) {
                history::update_history(&mut self.pool, &self.history)?;
            }
            for (name, custom) in &self.spec.custom_histories {
                if name == &covariate.name {
                    custom.update(&mut self.pool, name, t)?;
                }
            }
        }
        Ok(())
    }

    fn draw_competing_event(&mut self, rows: &[usize], t: i64) -> Result<(), SimulationError> {
        let Some(competing) = self.spec.simulated_competing() else {
            return Ok(());
        };
        let Some(model) = &self.models.competing else {
            return Err(ConfigError::MissingCompetingModel(competing.name.clone()).into());
        };
        let probabilities = sampler::predict_probability(model.as_ref(), &self.pool, rows, &competing.name)?;
        self.pool.write(COMPETING_PROBABILITY, rows, &probabilities)?;
        for restriction in &self.spec.competing_restrictions {
            restriction.apply(&mut self.pool, rows, COMPETING_PROBABILITY, t)?;
        }

        let probabilities = self.pool.gather(COMPETING_PROBABILITY, rows)?;
        let previous = self.pool.ensure_column(&competing.name, f64::NAN)?;
        let mut events = Vec::with_capacity(rows.len());
        for (&row, p) in rows.iter().zip(probabilities) {
            let already = t > 0
                && self
                    .pool
                    .lookup(self.pool.subject_of(row), t - 1)
                    .is_some_and(|prev| self.pool.value(previous, prev) == 1.0);
            events.push(if already {
                1.0
            } else {
                bernoulli(&mut self.rng, p, &competing.name)?
            });
        }
        self.pool.write(&competing.name, rows, &events)?;
        Ok(())
    }

    fn draw_outcome(&mut self, rows: &[usize], t: i64) -> Result<(), SimulationError> {
        let outcome = &self.spec.outcome;
        let last = self.spec.time_points as i64 - 1;
        match outcome.kind {
            OutcomeType::Survival => {
                let predicted =
                    sampler::predict_probability(self.models.outcome.as_ref(), &self.pool, rows, &outcome.name)?;
                self.pool.write(EVENT_PROBABILITY, rows, &predicted)?;
                for restriction in &self.spec.outcome_restrictions {
                    restriction.apply(&mut self.pool, rows, EVENT_PROBABILITY, t)?;
                }
                let hazards = self.pool.gather(EVENT_PROBABILITY, rows)?;
                let complements: Vec<f64> = hazards.iter().map(|h| 1.0 - h).collect();
                self.pool.write(EVENT_FREE_PROBABILITY, rows, &complements)?;
                let events = hazards
                    .into_iter()
                    .map(|h| bernoulli(&mut self.rng, h, &outcome.name))
                    .collect::<Result<Vec<_>, _>>()?;
                self.pool.write(&outcome.name, rows, &events)?;
            }
            OutcomeType::BinaryEof | OutcomeType::ContinuousEof => {
                let column = if outcome.kind == OutcomeType::BinaryEof {
                    PREDICTED_PROBABILITY
                } else {
                    PREDICTED_MEAN
                };
                let predicted = if t == last {
                    sampler::predict_probability(self.models.outcome.as_ref(), &self.pool, rows, &outcome.name)?
                } else {
                    vec![f64::NAN; rows.len()]
                };
                self.pool.write(column, rows, &predicted)?;
            }
        }

        if let Some(competing) = self.spec.simulated_competing() {
            if self.pool.has_column(&outcome.name) {
                let events = self.pool.gather(&competing.name, rows)?;
                let outcome_column = self.pool.column_index(&outcome.name)?;
                for (&row, event) in rows.iter().zip(events) {
                    if event == 1.0 {
                        self.pool.set_value(outcome_column, row, f64::NAN);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervention::{InterventionRule, TreatmentRule};
    use crate::model::{CovariateFit, LinearModel, LinkFunction};
    use crate::spec::{CovariateSpec, OutcomeSpec};
    use approx::assert_abs_diff_eq;

    fn constant(value: f64) -> Arc<LinearModel> {
        Arc::new(LinearModel::new(LinkFunction::Identity, value))
    }

    fn cohort() -> Pool {
        Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3],
            vec![0, 0, 0],
            vec![
                ("L".to_string(), vec![0.0, 1.0, 0.0]),
                ("A".to_string(), vec![1.0, 0.0, 1.0]),
                ("Y".to_string(), vec![0.0, 0.0, 0.0]),
            ],
        )
        .unwrap()
    }

    fn simulator(outcome: OutcomeSpec) -> Simulator {
        let spec = SimulationSpec::new(2, outcome)
            .with_covariate(CovariateSpec::new("L", CovariateKind::Binary))
            .with_covariate(CovariateSpec::new("A", CovariateKind::Binary));
        let models = FittedModels::new(constant(0.1))
            .with_covariate("L", CovariateFit::Mean(constant(0.3)))
            .with_covariate("A", CovariateFit::Mean(constant(0.5)));
        Simulator::new(spec, models).unwrap()
    }

    #[test]
    fn test_constant_hazard_gives_closed_form_risk() {
        let simulator = simulator(OutcomeSpec::new("Y", OutcomeType::Survival));
        let never = Intervention::new("never")
            .with_rule(TreatmentRule::new("A", InterventionRule::Static { values: vec![0.0] }));
        let outcome = simulator.run(&cohort(), &never, 1).unwrap();
        let Estimate::Risk(curve) = outcome.estimate else {
            panic!("expected a risk curve");
        };
        assert_abs_diff_eq!(curve[0], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(curve[1], 0.19, epsilon = 1e-12);
        assert_eq!(outcome.pool.len(), 6);
        assert!(outcome.pool.column("A").unwrap().iter().all(|&a| a == 0.0));
    }

    #[test]
    fn test_same_seed_reproduces_pool() {
        let simulator = simulator(OutcomeSpec::new("Y", OutcomeType::Survival));
        let natural = Intervention::natural_course();
        let first = simulator.run(&cohort(), &natural, 42).unwrap();
        let second = simulator.run(&cohort(), &natural, 42).unwrap();
        for name in ["L", "A", "Y"] {
            let a = first.pool.column(name).unwrap();
            let b = second.pool.column(name).unwrap();
            assert!(a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn test_baseline_covariates_are_kept_at_time_zero() {
        let simulator = simulator(OutcomeSpec::new("Y", OutcomeType::Survival));
        let outcome = simulator.run(&cohort(), &Intervention::natural_course(), 3).unwrap();
        let baseline = outcome.pool.slice(0);
        assert_eq!(outcome.pool.gather("L", &baseline).unwrap(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_end_of_follow_up_outcome_predicted_only_at_last_time() {
        let simulator = simulator(OutcomeSpec::new("Y", OutcomeType::BinaryEof));
        let outcome = simulator.run(&cohort(), &Intervention::natural_course(), 3).unwrap();
        let Estimate::Mean(mean) = outcome.estimate else {
            panic!("expected a mean");
        };
        assert_abs_diff_eq!(mean, 0.1, epsilon = 1e-12);
        let predicted = outcome.pool.column(PREDICTED_PROBABILITY).unwrap();
        let first = outcome.pool.slice(0);
        assert!(first.iter().all(|&row| predicted[row].is_nan()));
    }

    #[test]
    fn test_missing_baseline_rows_is_an_error() {
        let simulator = simulator(OutcomeSpec::new("Y", OutcomeType::Survival));
        let late = Pool::from_columns(
            "id",
            "t0",
            vec![1],
            vec![1],
            vec![
                ("L".to_string(), vec![0.0]),
                ("A".to_string(), vec![0.0]),
            ],
        )
        .unwrap();
        assert!(matches!(
            simulator.run(&late, &Intervention::natural_course(), 0),
            Err(SimulationError::NoBaselineRows)
        ));
    }

    #[test]
    fn test_unknown_treatment_is_rejected_before_simulating() {
        let simulator = simulator(OutcomeSpec::new("Y", OutcomeType::Survival));
        let bad = Intervention::new("bad")
            .with_rule(TreatmentRule::new("Q", InterventionRule::Static { values: vec![0.0] }));
        assert!(matches!(
            simulator.run(&cohort(), &bad, 0),
            Err(SimulationError::Config(ConfigError::InvalidIntervention { .. }))
        ));
    }
}
