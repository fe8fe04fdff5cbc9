//! # Simulation Specification
//!
//! Declares what is simulated: the ordered covariates and their types, the
//! outcome, an optional competing event, visit processes, restrictions and
//! the history plan. Validation runs once, before any simulation, so a
//! misconfigured run fails before drawing a single value.

use crate::history::{CustomHistory, HistorySpec};
use crate::model::{CovariateFit, FittedModels};
use crate::restriction::Restriction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("The number of time points must be positive.")]
    NoTimePoints,
    #[error("Name '{0}' is declared more than once.")]
    DuplicateName(String),
    #[error("Covariate '{0}' has no fitted model.")]
    MissingModel(String),
    #[error("Covariate '{name}' is of type {kind} but its fitted model is {fit}.")]
    ModelKindMismatch {
        name: String,
        kind: &'static str,
        fit: &'static str,
    },
    #[error("Covariate '{0}' needs a residual standard deviation (rmse).")]
    MissingRmse(String),
    #[error("Residual standard deviation of '{name}' must be finite and non-negative, got {value}.")]
    InvalidRmse { name: String, value: f64 },
    #[error("Covariate '{0}' needs observed bounds.")]
    MissingBounds(String),
    #[error("Bounds of '{name}' are inverted: [{lower}, {upper}].")]
    InvertedBounds { name: String, lower: f64, upper: f64 },
    #[error("Covariate '{name}' is missing required parameter '{parameter}'.")]
    MissingParameter { name: String, parameter: &'static str },
    #[error("Categorical time thresholds of '{0}' must be non-empty and increasing.")]
    InvalidThresholds(String),
    #[error("'{0}' is not a declared covariate.")]
    UnknownCovariate(String),
    #[error("Visit indicator '{0}' must be a binary covariate.")]
    VisitNotBinary(String),
    #[error("A competing event is only supported for survival outcomes.")]
    CompetingWithEndOfFollowUp,
    #[error("Competing event '{0}' is simulated but has no fitted model.")]
    MissingCompetingModel(String),
    #[error("Censoring indicator '{0}' has no fitted model.")]
    MissingCensoringModel(String),
    #[error("Competing event '{0}' is treated as censoring in weighted estimates but has no fitted model.")]
    MissingCompetingWeightModel(String),
    #[error("Weight cutoff {name} must be {expected}, got {value}.")]
    InvalidWeightCutoff {
        name: &'static str,
        expected: &'static str,
        value: f64,
    },
    #[error("Intervention '{intervention}': {reason}")]
    InvalidIntervention { intervention: String, reason: String },
    #[error("Unknown covariate type '{0}'.")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationDirection {
    /// Keep values at or above the truncation point.
    Left,
    /// Keep values at or below the truncation point.
    Right,
}

/// How a covariate is generated at each simulated time point.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateKind {
    Binary,
    Normal,
    /// Normal on a rescaled unit interval, mapped back onto observed bounds.
    BoundedNormal,
    ZeroInflatedNormal,
    TruncatedNormal {
        point: f64,
        direction: TruncationDirection,
    },
    Categorical,
    /// Once 1, stays 1.
    Absorbing,
    /// Time binned by thresholds; derived, never modeled.
    CategoricalTime { thresholds: Vec<i64> },
    /// Squared time; derived, never modeled.
    SquareTime,
    Custom,
}

impl CovariateKind {
    pub fn label(&self) -> &'static str {
        match self {
            CovariateKind::Binary => "binary",
            CovariateKind::Normal => "normal",
            CovariateKind::BoundedNormal => "bounded normal",
            CovariateKind::ZeroInflatedNormal => "zero-inflated normal",
            CovariateKind::TruncatedNormal { .. } => "truncated normal",
            CovariateKind::Categorical => "categorical",
            CovariateKind::Absorbing => "absorbing",
            CovariateKind::CategoricalTime { .. } => "categorical time",
            CovariateKind::SquareTime => "square time",
            CovariateKind::Custom => "custom",
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(
            self,
            CovariateKind::Categorical | CovariateKind::CategoricalTime { .. }
        )
    }

    pub fn is_time_feature(&self) -> bool {
        matches!(
            self,
            CovariateKind::CategoricalTime { .. } | CovariateKind::SquareTime
        )
    }

    pub(crate) fn needs_rmse(&self) -> bool {
        matches!(
            self,
            CovariateKind::Normal
                | CovariateKind::BoundedNormal
                | CovariateKind::ZeroInflatedNormal
                | CovariateKind::TruncatedNormal { .. }
        )
    }

    fn needs_bounds(&self, truncate_to_observed_range: bool) -> bool {
        match self {
            CovariateKind::Normal => truncate_to_observed_range,
            CovariateKind::BoundedNormal
            | CovariateKind::ZeroInflatedNormal
            | CovariateKind::TruncatedNormal { .. } => true,
            _ => false,
        }
    }

    fn accepts(&self, fit: &CovariateFit) -> bool {
        match (self, fit) {
            (CovariateKind::Categorical, CovariateFit::Categorical(_)) => true,
            (CovariateKind::ZeroInflatedNormal, CovariateFit::ZeroInflated { .. }) => true,
            (CovariateKind::Custom, CovariateFit::Custom(_)) => true,
            (
                CovariateKind::Binary
                | CovariateKind::Normal
                | CovariateKind::BoundedNormal
                | CovariateKind::TruncatedNormal { .. }
                | CovariateKind::Absorbing,
                CovariateFit::Mean(_),
            ) => true,
            _ => false,
        }
    }
}

/// A time-varying covariate. `modeled` is false for covariates that are
/// carried forward unchanged (restrictions still apply to them).
#[derive(Debug, Clone, PartialEq)]
pub struct CovariateSpec {
    pub name: String,
    pub kind: CovariateKind,
    pub modeled: bool,
}

impl CovariateSpec {
    pub fn new(name: impl Into<String>, kind: CovariateKind) -> Self {
        let modeled = !kind.is_time_feature();
        Self {
            name: name.into(),
            kind,
            modeled,
        }
    }

    pub fn unmodeled(mut self) -> Self {
        self.modeled = false;
        self
    }

    /// Drawn from a fitted model at every simulated time point.
    pub fn is_sampled(&self) -> bool {
        self.modeled && !self.kind.is_time_feature()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    /// Per-interval event hazard; the estimate is a cumulative risk curve.
    Survival,
    /// Binary outcome at the final time point; the estimate is its mean.
    BinaryEof,
    /// Continuous outcome at the final time point; the estimate is its mean.
    ContinuousEof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeSpec {
    pub name: String,
    pub kind: OutcomeType,
}

impl OutcomeSpec {
    pub fn new(name: impl Into<String>, kind: OutcomeType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompetingEventSpec {
    pub name: String,
    /// Treat the event as censoring: it is then not simulated at all.
    pub as_censoring: bool,
}

impl CompetingEventSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            as_censoring: false,
        }
    }
}

/// A visit process: a binary visit indicator and a dependent covariate that
/// is only refreshed at visits, with at most `max_missed` consecutive
/// missed visits.
#[derive(Debug, Clone, PartialEq)]
pub struct VisitProcess {
    pub indicator: String,
    pub covariate: String,
    pub max_missed: u32,
}

impl VisitProcess {
    pub fn new(indicator: impl Into<String>, covariate: impl Into<String>, max_missed: u32) -> Self {
        Self {
            indicator: indicator.into(),
            covariate: covariate.into(),
            max_missed,
        }
    }

    /// Column counting time points since the last visit.
    pub fn counter_name(&self) -> String {
        format!("ts_{}", self.covariate)
    }
}

/// A censoring indicator in the observed data. Estimates computed from the
/// observed cohort are weighted by the inverse probability of remaining
/// uncensored, optionally capped.
#[derive(Debug, Clone, PartialEq)]
pub struct CensoringSpec {
    pub name: String,
    /// Cap weights at this quantile (in `[0, 1]`) of the censoring weights.
    pub cutoff_quantile: Option<f64>,
    /// Cap weights at this value.
    pub cutoff_value: Option<f64>,
}

impl CensoringSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cutoff_quantile: None,
            cutoff_value: None,
        }
    }
}

/// Everything the simulator needs besides fitted models and the cohort.
#[derive(Debug, Clone)]
pub struct SimulationSpec {
    pub time_points: usize,
    /// Covariates in generation order.
    pub covariates: Vec<CovariateSpec>,
    pub baseline_covariates: Vec<String>,
    pub outcome: OutcomeSpec,
    pub competing: Option<CompetingEventSpec>,
    pub censoring: Option<CensoringSpec>,
    pub history: HistorySpec,
    pub custom_histories: Vec<(String, Arc<dyn CustomHistory>)>,
    pub visits: Vec<VisitProcess>,
    pub restrictions: Vec<(String, Restriction)>,
    pub outcome_restrictions: Vec<Restriction>,
    pub competing_restrictions: Vec<Restriction>,
    /// Clamp normal draws into the observed range of the covariate.
    pub truncate_to_observed_range: bool,
    /// Number of simulated subjects; defaults to the cohort size.
    pub n_simul: Option<usize>,
}

impl SimulationSpec {
    pub fn new(time_points: usize, outcome: OutcomeSpec) -> Self {
        Self {
            time_points,
            covariates: Vec::new(),
            baseline_covariates: Vec::new(),
            outcome,
            competing: None,
            censoring: None,
            history: HistorySpec::default(),
            custom_histories: Vec::new(),
            visits: Vec::new(),
            restrictions: Vec::new(),
            outcome_restrictions: Vec::new(),
            competing_restrictions: Vec::new(),
            truncate_to_observed_range: true,
            n_simul: None,
        }
    }

    pub fn with_covariate(mut self, covariate: CovariateSpec) -> Self {
        self.covariates.push(covariate);
        self
    }

    pub fn covariate(&self, name: &str) -> Option<&CovariateSpec> {
        self.covariates.iter().find(|c| c.name == name)
    }

    /// The competing event when it is simulated rather than censored.
    pub fn simulated_competing(&self) -> Option<&CompetingEventSpec> {
        self.competing.as_ref().filter(|c| !c.as_censoring)
    }

    pub fn visit_for(&self, covariate: &str) -> Option<&VisitProcess> {
        self.visits.iter().find(|v| v.covariate == covariate)
    }

    pub fn visit_by_indicator(&self, indicator: &str) -> Option<&VisitProcess> {
        self.visits.iter().find(|v| v.indicator == indicator)
    }

    /// Columns the simulation reads from the cohort.
    pub fn input_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .covariates
            .iter()
            .filter(|c| !c.kind.is_time_feature())
            .map(|c| c.name.clone())
            .collect();
        for name in &self.baseline_covariates {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        columns
    }

    /// Checks that the specification and the fitted models agree.
    pub fn validate(&self, models: &FittedModels) -> Result<(), ConfigError> {
        if self.time_points == 0 {
            return Err(ConfigError::NoTimePoints);
        }

        let mut seen: Vec<&str> = Vec::new();
        let reserved = std::iter::once(self.outcome.name.as_str())
            .chain(self.competing.as_ref().map(|c| c.name.as_str()))
            .chain(self.censoring.as_ref().map(|c| c.name.as_str()));
        for name in self.covariates.iter().map(|c| c.name.as_str()).chain(reserved) {
            if seen.contains(&name) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }
            seen.push(name);
        }

        for covariate in &self.covariates {
            let name = &covariate.name;
            if let CovariateKind::CategoricalTime { thresholds } = &covariate.kind {
                if thresholds.is_empty() || thresholds.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(ConfigError::InvalidThresholds(name.clone()));
                }
            }
            if !covariate.is_sampled() {
                continue;
            }
            let fit = models
                .covariates
                .get(name)
                .ok_or_else(|| ConfigError::MissingModel(name.clone()))?;
            if !covariate.kind.accepts(fit) {
                return Err(ConfigError::ModelKindMismatch {
                    name: name.clone(),
                    kind: covariate.kind.label(),
                    fit: fit.label(),
                });
            }
            if covariate.kind.needs_rmse() {
                let rmse = *models
                    .rmses
                    .get(name)
                    .ok_or_else(|| ConfigError::MissingRmse(name.clone()))?;
                if !rmse.is_finite() || rmse < 0.0 {
                    return Err(ConfigError::InvalidRmse {
                        name: name.clone(),
                        value: rmse,
                    });
                }
            }
            if covariate.kind.needs_bounds(self.truncate_to_observed_range) {
                let (lower, upper) = *models
                    .bounds
                    .get(name)
                    .ok_or_else(|| ConfigError::MissingBounds(name.clone()))?;
                if lower > upper {
                    return Err(ConfigError::InvertedBounds {
                        name: name.clone(),
                        lower,
                        upper,
                    });
                }
            }
        }

        for visit in &self.visits {
            let indicator = self
                .covariate(&visit.indicator)
                .ok_or_else(|| ConfigError::UnknownCovariate(visit.indicator.clone()))?;
            if indicator.kind != CovariateKind::Binary {
                return Err(ConfigError::VisitNotBinary(visit.indicator.clone()));
            }
            if self.covariate(&visit.covariate).is_none() {
                return Err(ConfigError::UnknownCovariate(visit.covariate.clone()));
            }
        }

        let targets = self
            .restrictions
            .iter()
            .map(|(name, _)| name)
            .chain(self.custom_histories.iter().map(|(name, _)| name));
        for name in targets {
            if self.covariate(name).is_none() {
                return Err(ConfigError::UnknownCovariate(name.clone()));
            }
        }

        if let Some(competing) = &self.competing {
            if self.outcome.kind != OutcomeType::Survival {
                return Err(ConfigError::CompetingWithEndOfFollowUp);
            }
            if !competing.as_censoring && models.competing.is_none() {
                return Err(ConfigError::MissingCompetingModel(competing.name.clone()));
            }
        }

        if let Some(censoring) = &self.censoring {
            if models.censoring.is_none() {
                return Err(ConfigError::MissingCensoringModel(censoring.name.clone()));
            }
            if let Some(competing) = self.competing.as_ref().filter(|c| c.as_censoring) {
                if models.competing.is_none() {
                    return Err(ConfigError::MissingCompetingWeightModel(competing.name.clone()));
                }
            }
            if let Some(quantile) = censoring.cutoff_quantile {
                if !(0.0..=1.0).contains(&quantile) {
                    return Err(ConfigError::InvalidWeightCutoff {
                        name: "quantile",
                        expected: "within [0, 1]",
                        value: quantile,
                    });
                }
            }
            if let Some(value) = censoring.cutoff_value {
                if value.is_nan() || value <= 0.0 {
                    return Err(ConfigError::InvalidWeightCutoff {
                        name: "value",
                        expected: "positive",
                        value,
                    });
                }
            }
        }

        Ok(())
    }
}
