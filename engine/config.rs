//! # Scenario Configuration
//!
//! A scenario file is TOML. It names the id and time columns, the ordered
//! covariates with their types and fitted linear predictors, the outcome,
//! an optional competing event, visit processes, restrictions and the
//! interventions to compare. [`ScenarioConfig::build`] turns it into the
//! typed specification, the fitted-model bundle and the intervention list.
//! Residual standard deviations left out of the file are estimated from the
//! cohort, as are bounds.
//!
//! ```toml
//! time_points = 5
//!
//! [outcome]
//! name = "Y"
//! type = "survival"
//! model = { intercept = -2.0, terms = [{ column = "A", coefficient = 0.4 }] }
//!
//! [[covariates]]
//! name = "A"
//! type = "binary"
//! model = { intercept = 0.0, terms = [{ column = "lag1_A", coefficient = 2.0 }] }
//!
//! [[interventions]]
//! name = "Always treat"
//! rules = [{ treatment = "A", kind = "static", values = [1.0] }]
//! ```

use crate::history::{AverageOfLastThree, CustomHistory, HistoryError, HistorySpec, prepare_observed};
use crate::intervention::{Intervention, InterventionRule, TreatmentRule};
use crate::model::{
    ClassPredictor, CovariateFit, FittedModel, FittedModels, LinearModel, ModelError,
    MultinomialModel, observed_bounds, root_mean_squared_error,
};
use crate::pool::{Pool, PoolError};
use crate::restriction::{Comparison, Condition, ConditionSet, Restriction};
use crate::spec::{
    CensoringSpec, CompetingEventSpec, ConfigError, CovariateKind, CovariateSpec, OutcomeSpec,
    OutcomeType, SimulationSpec, TruncationDirection, VisitProcess,
};
use ndarray::Array1;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse scenario file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

fn default_id() -> String {
    "id".to_string()
}

fn default_time() -> String {
    "t0".to_string()
}

fn default_seed() -> u64 {
    crate::bootstrap::DEFAULT_SEED
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_time")]
    pub time: String,
    pub time_points: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Fill lags before the first time point with the subject's first value.
    #[serde(default)]
    pub baselags: bool,
    #[serde(default = "enabled")]
    pub truncate_to_observed_range: bool,
    #[serde(default)]
    pub n_simul: Option<usize>,
    #[serde(default)]
    pub baseline_covariates: Vec<String>,
    /// Index into the intervention list, natural course first.
    #[serde(default)]
    pub reference: usize,
    #[serde(default = "enabled")]
    pub parallel: bool,
    pub outcome: OutcomeConfig,
    #[serde(default)]
    pub competing: Option<CompetingConfig>,
    /// Censoring indicator whose model weights the observed estimates.
    #[serde(default)]
    pub censoring: Option<CensoringConfig>,
    #[serde(default)]
    pub covariates: Vec<CovariateConfig>,
    /// Covariates that get an `ave_last3_<covariate>` column.
    #[serde(default)]
    pub average_last_three: Vec<String>,
    #[serde(default)]
    pub visits: Vec<VisitConfig>,
    #[serde(default)]
    pub restrictions: Vec<RestrictionConfig>,
    #[serde(default)]
    pub outcome_restrictions: Vec<RestrictionConfig>,
    #[serde(default)]
    pub competing_restrictions: Vec<RestrictionConfig>,
    #[serde(default)]
    pub interventions: Vec<InterventionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OutcomeType,
    pub model: LinearModel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompetingConfig {
    pub name: String,
    #[serde(default)]
    pub as_censoring: bool,
    #[serde(default)]
    pub model: Option<LinearModel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CensoringConfig {
    pub name: String,
    pub model: LinearModel,
    #[serde(default)]
    pub cutoff_quantile: Option<f64>,
    #[serde(default)]
    pub cutoff_value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CovariateConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub model: Option<LinearModel>,
    /// Probability of a non-zero value, for zero-inflated covariates.
    #[serde(default)]
    pub indicator_model: Option<LinearModel>,
    #[serde(default)]
    pub classes: Option<Vec<ClassPredictor>>,
    #[serde(default)]
    pub rmse: Option<f64>,
    #[serde(default)]
    pub bounds: Option<[f64; 2]>,
    #[serde(default)]
    pub point: Option<f64>,
    #[serde(default)]
    pub direction: Option<TruncationDirection>,
    #[serde(default)]
    pub thresholds: Option<Vec<i64>>,
    #[serde(default = "enabled")]
    pub modeled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VisitConfig {
    pub indicator: String,
    pub covariate: String,
    pub max_missed: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub column: String,
    pub op: Comparison,
    pub value: f64,
}

impl ConditionConfig {
    fn build(&self) -> Condition {
        Condition::compare(self.column.clone(), self.op, self.value)
    }
}

/// Overrides the target with `value` wherever some condition fails.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestrictionConfig {
    /// Target covariate; unused for outcome and competing restrictions.
    #[serde(default)]
    pub covariate: Option<String>,
    pub value: f64,
    pub conditions: Vec<ConditionConfig>,
}

impl RestrictionConfig {
    fn build(&self) -> Restriction {
        Restriction::new(self.conditions.iter().map(ConditionConfig::build).collect(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Static,
    Threshold,
    NaturalGracePeriod,
    UniformGracePeriod,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub treatment: String,
    pub kind: RuleKind,
    #[serde(default)]
    pub values: Option<Vec<f64>>,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub periods: Option<usize>,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub times: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterventionConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Everything a simulation run needs besides the cohort.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub time: String,
    pub spec: SimulationSpec,
    pub models: FittedModels,
    /// The natural course first, then the configured interventions.
    pub interventions: Vec<Intervention>,
    pub seed: u64,
    pub reference: usize,
    pub parallel: bool,
}

fn parse_kind(config: &CovariateConfig) -> Result<CovariateKind, ConfigError> {
    let missing = |parameter: &'static str| ConfigError::MissingParameter {
        name: config.name.clone(),
        parameter,
    };
    let normalized = config.kind.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    let kind = match normalized.as_str() {
        "binary" => CovariateKind::Binary,
        "normal" => CovariateKind::Normal,
        "bounded_normal" => CovariateKind::BoundedNormal,
        "zero_inflated_normal" => CovariateKind::ZeroInflatedNormal,
        "truncated_normal" => CovariateKind::TruncatedNormal {
            point: config.point.ok_or_else(|| missing("point"))?,
            direction: config.direction.ok_or_else(|| missing("direction"))?,
        },
        "categorical" => CovariateKind::Categorical,
        "absorbing" => CovariateKind::Absorbing,
        "categorical_time" => CovariateKind::CategoricalTime {
            thresholds: config.thresholds.clone().ok_or_else(|| missing("thresholds"))?,
        },
        "square_time" => CovariateKind::SquareTime,
        _ => return Err(ConfigError::UnknownType(config.kind.clone())),
    };
    Ok(kind)
}

fn covariate_fit(config: &CovariateConfig, kind: &CovariateKind) -> Result<CovariateFit, ConfigError> {
    let missing = |parameter: &'static str| ConfigError::MissingParameter {
        name: config.name.clone(),
        parameter,
    };
    let model = || {
        config
            .model
            .clone()
            .map(Arc::new)
            .ok_or_else(|| missing("model"))
    };
    let fit = match kind {
        CovariateKind::ZeroInflatedNormal => CovariateFit::ZeroInflated {
            indicator: Arc::new(
                config
                    .indicator_model
                    .clone()
                    .ok_or_else(|| missing("indicator_model"))?,
            ),
            log_mean: model()?,
        },
        CovariateKind::Categorical => CovariateFit::Categorical(Arc::new(MultinomialModel {
            classes: config.classes.clone().ok_or_else(|| missing("classes"))?,
        })),
        _ => CovariateFit::Mean(model()?),
    };
    Ok(fit)
}

/// Observed range of a continuous covariate; zero-inflated covariates use
/// their non-zero values only.
fn cohort_bounds(
    cohort: &Pool,
    name: &str,
    kind: &CovariateKind,
) -> Result<Option<(f64, f64)>, PoolError> {
    if *kind != CovariateKind::ZeroInflatedNormal {
        return observed_bounds(cohort, name);
    }
    Ok(cohort
        .column(name)?
        .iter()
        .copied()
        .filter(|value| !value.is_nan() && *value != 0.0)
        .fold(None, |acc: Option<(f64, f64)>, value| match acc {
            None => Some((value, value)),
            Some((lo, hi)) => Some((lo.min(value), hi.max(value))),
        }))
}

/// Root mean squared residual of a continuous covariate model on the
/// observed rows after the first time point, on the scale the model
/// predicts: rescaled to the unit interval for bounded normals and the log
/// of non-zero values for zero-inflated normals. Only rows with a visit
/// count for visit-dependent covariates.
fn residual_error(
    cohort: &Pool,
    spec: &SimulationSpec,
    models: &FittedModels,
    name: &str,
) -> Result<Option<f64>, ScenarioError> {
    let (Some(covariate), Some(fit)) = (spec.covariate(name), models.covariates.get(name)) else {
        return Ok(None);
    };
    let values = cohort.column(name)?;
    let visits = match spec.visit_for(name) {
        Some(visit) => Some(cohort.column(&visit.indicator)?),
        None => None,
    };
    let mut rows: Vec<usize> = (0..cohort.len())
        .filter(|&row| cohort.time(row) > 0 && !values[row].is_nan())
        .filter(|&row| visits.is_none_or(|visit| visit[row] == 1.0))
        .collect();

    let (model, targets): (&dyn FittedModel, Vec<f64>) = match (&covariate.kind, fit) {
        (CovariateKind::ZeroInflatedNormal, CovariateFit::ZeroInflated { log_mean, .. }) => {
            rows.retain(|&row| values[row] > 0.0);
            (log_mean.as_ref(), rows.iter().map(|&row| values[row].ln()).collect())
        }
        (CovariateKind::BoundedNormal, CovariateFit::Mean(model)) => {
            let Some(&(lower, upper)) = models.bounds.get(name) else {
                return Ok(None);
            };
            let scaled: Vec<f64> = rows.iter().map(|&row| (values[row] - lower) / (upper - lower)).collect();
            (model.as_ref(), scaled)
        }
        (_, CovariateFit::Mean(model)) => (model.as_ref(), rows.iter().map(|&row| values[row]).collect()),
        _ => return Ok(None),
    };
    if rows.is_empty() {
        return Ok(None);
    }
    let predicted = model.predict(cohort, &rows)?;
    let rmse = root_mean_squared_error(Array1::from(targets).view(), predicted.view());
    Ok(Some(rmse).filter(|rmse| rmse.is_finite()))
}

fn is_continuous(kind: &CovariateKind) -> bool {
    matches!(
        kind,
        CovariateKind::Normal
            | CovariateKind::BoundedNormal
            | CovariateKind::ZeroInflatedNormal
            | CovariateKind::TruncatedNormal { .. }
    )
}

impl RuleConfig {
    fn build(&self, intervention: &str) -> Result<TreatmentRule, ConfigError> {
        let missing = |parameter: &str| ConfigError::InvalidIntervention {
            intervention: intervention.to_string(),
            reason: format!(
                "{:?} rule on '{}' needs '{parameter}'",
                self.kind, self.treatment
            ),
        };
        let conditions = || ConditionSet::new(self.conditions.iter().map(ConditionConfig::build).collect());
        let rule = match self.kind {
            RuleKind::Static => InterventionRule::Static {
                values: self.values.clone().ok_or_else(|| missing("values"))?,
            },
            RuleKind::Threshold => InterventionRule::Threshold {
                lower: self.lower.unwrap_or(f64::NEG_INFINITY),
                upper: self.upper.unwrap_or(f64::INFINITY),
            },
            RuleKind::NaturalGracePeriod => InterventionRule::NaturalGracePeriod {
                periods: self.periods.ok_or_else(|| missing("periods"))?,
                conditions: conditions(),
            },
            RuleKind::UniformGracePeriod => InterventionRule::UniformGracePeriod {
                periods: self.periods.ok_or_else(|| missing("periods"))?,
                conditions: conditions(),
            },
        };
        let rule = TreatmentRule::new(self.treatment.clone(), rule);
        Ok(match &self.times {
            Some(times) => rule.at_times(times.iter().copied()),
            None => rule,
        })
    }
}

impl ScenarioConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Every column any configured model, condition or restriction reads.
    /// History terms among them determine the history plan.
    fn referenced_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let mut models: Vec<&LinearModel> = vec![&self.outcome.model];
        if let Some(model) = self.competing.as_ref().and_then(|c| c.model.as_ref()) {
            models.push(model);
        }
        if let Some(censoring) = &self.censoring {
            models.push(&censoring.model);
        }
        for covariate in &self.covariates {
            models.extend(covariate.model.iter());
            models.extend(covariate.indicator_model.iter());
            if let Some(classes) = &covariate.classes {
                let multinomial = MultinomialModel {
                    classes: classes.clone(),
                };
                columns.extend(multinomial.columns().map(str::to_string));
            }
        }
        for model in models {
            columns.extend(model.columns().map(str::to_string));
        }
        let restrictions = self
            .restrictions
            .iter()
            .chain(&self.outcome_restrictions)
            .chain(&self.competing_restrictions);
        for restriction in restrictions {
            columns.extend(restriction.conditions.iter().map(|c| c.column.clone()));
        }
        for intervention in &self.interventions {
            for rule in &intervention.rules {
                columns.extend(rule.conditions.iter().map(|c| c.column.clone()));
            }
        }
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    /// Builds the typed scenario. Bounds that the file leaves out are taken
    /// from `cohort` when one is given.
    pub fn build(&self, cohort: Option<&Pool>) -> Result<Scenario, ScenarioError> {
        let mut models = FittedModels::new(Arc::new(self.outcome.model.clone()));
        let mut spec = SimulationSpec::new(
            self.time_points,
            OutcomeSpec::new(self.outcome.name.clone(), self.outcome.kind),
        );
        spec.baseline_covariates = self.baseline_covariates.clone();
        spec.truncate_to_observed_range = self.truncate_to_observed_range;
        spec.n_simul = self.n_simul;

        let mut unknown_rmse = Vec::new();
        for config in &self.covariates {
            let kind = parse_kind(config)?;
            let mut covariate = CovariateSpec::new(config.name.clone(), kind.clone());
            if !config.modeled {
                covariate = covariate.unmodeled();
            }
            if covariate.is_sampled() {
                models = models.with_covariate(config.name.clone(), covariate_fit(config, &kind)?);
            }
            match config.rmse {
                Some(rmse) => models = models.with_rmse(config.name.clone(), rmse),
                None if covariate.is_sampled() && kind.needs_rmse() => {
                    unknown_rmse.push(config.name.clone());
                }
                None => {}
            }
            let bounds = match (config.bounds, cohort) {
                (Some([lower, upper]), _) => Some((lower, upper)),
                (None, Some(cohort)) if is_continuous(&kind) && cohort.has_column(&config.name) => {
                    cohort_bounds(cohort, &config.name, &kind)?
                }
                _ => None,
            };
            if let Some(bounds) = bounds {
                models = models.with_bounds(config.name.clone(), bounds);
            }
            spec = spec.with_covariate(covariate);
        }

        if let Some(competing) = &self.competing {
            spec.competing = Some(CompetingEventSpec {
                as_censoring: competing.as_censoring,
                ..CompetingEventSpec::new(competing.name.clone())
            });
            if let Some(model) = &competing.model {
                models = models.with_competing(Arc::new(model.clone()));
            }
        }

        if let Some(censoring) = &self.censoring {
            spec.censoring = Some(CensoringSpec {
                cutoff_quantile: censoring.cutoff_quantile,
                cutoff_value: censoring.cutoff_value,
                ..CensoringSpec::new(censoring.name.clone())
            });
            models = models.with_censoring(Arc::new(censoring.model.clone()));
        }

        spec.visits = self
            .visits
            .iter()
            .map(|v| VisitProcess::new(v.indicator.clone(), v.covariate.clone(), v.max_missed))
            .collect();

        for restriction in &self.restrictions {
            let target = restriction
                .covariate
                .clone()
                .ok_or_else(|| ConfigError::MissingParameter {
                    name: "restrictions".to_string(),
                    parameter: "covariate",
                })?;
            spec.restrictions.push((target, restriction.build()));
        }
        spec.outcome_restrictions = self.outcome_restrictions.iter().map(RestrictionConfig::build).collect();
        spec.competing_restrictions = self
            .competing_restrictions
            .iter()
            .map(RestrictionConfig::build)
            .collect();
        spec.custom_histories = self
            .average_last_three
            .iter()
            .map(|name| (name.clone(), Arc::new(AverageOfLastThree) as Arc<dyn CustomHistory>))
            .collect();

        let columns = self.referenced_columns();
        spec.history = HistorySpec::derive(
            &spec.covariates,
            &spec.visits,
            columns.iter().map(String::as_str),
            self.baselags,
        )?;

        if let (Some(cohort), false) = (cohort, unknown_rmse.is_empty()) {
            let mut prepared = cohort.clone();
            prepare_observed(&mut prepared, &spec)?;
            for name in unknown_rmse {
                if let Some(rmse) = residual_error(&prepared, &spec, &models, &name)? {
                    models = models.with_rmse(name, rmse);
                }
            }
        }

        let mut interventions = vec![Intervention::natural_course()];
        for config in &self.interventions {
            let mut intervention = Intervention::new(config.name.clone());
            for rule in &config.rules {
                intervention = intervention.with_rule(rule.build(&config.name)?);
            }
            intervention.validate(&spec)?;
            interventions.push(intervention);
        }

        spec.validate(&models)?;
        if self.reference >= interventions.len() {
            return Err(ConfigError::InvalidIntervention {
                intervention: format!("#{}", self.reference),
                reason: format!(
                    "reference index is out of range for {} interventions",
                    interventions.len()
                ),
            }
            .into());
        }

        Ok(Scenario {
            id: self.id.clone(),
            time: self.time.clone(),
            spec,
            models,
            interventions,
            seed: self.seed,
            reference: self.reference,
            parallel: self.parallel,
        })
    }
}
