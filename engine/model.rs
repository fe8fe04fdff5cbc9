use crate::pool::{Pool, PoolError};
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

// --- Prediction Interfaces ---
// The simulator never fits anything. It only asks already-fitted models for
// per-row predictions on the current pool slice.

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Model produced {found} predictions for {expected} rows.")]
    PredictionLength { expected: usize, found: usize },
    #[error("Multinomial model has no classes.")]
    NoClasses,
    #[error("Failed to parse model file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize model: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Custom(String),
}

/// A model that predicts one value per row: a probability for binary
/// targets, or a conditional mean for continuous ones.
pub trait FittedModel: Send + Sync + Debug {
    fn predict(&self, pool: &Pool, rows: &[usize]) -> Result<Array1<f64>, ModelError>;
}

/// A model that predicts one probability per class and row. Columns follow
/// the sorted order of the covariate's observed levels.
pub trait CategoricalModel: Send + Sync + Debug {
    fn predict_probabilities(&self, pool: &Pool, rows: &[usize]) -> Result<Array2<f64>, ModelError>;
}

/// Produces realized covariate values directly, drawing any randomness from
/// the simulation's generator.
pub trait CustomPredictor: Send + Sync + Debug {
    fn realize(
        &self,
        pool: &Pool,
        rows: &[usize],
        t: i64,
        rng: &mut StdRng,
    ) -> Result<Vec<f64>, ModelError>;
}

// --- Serializable Linear Models ---

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    /// Logistic regression; predictions are probabilities.
    #[default]
    Logit,
    /// Gaussian regression.
    Identity,
    /// Log-linear mean.
    Log,
}

impl LinkFunction {
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => 1.0 / (1.0 + (-eta).exp()),
            LinkFunction::Identity => eta,
            LinkFunction::Log => eta.exp(),
        }
    }
}

/// One additive term: `coefficient * factor(column) [* interaction]`,
/// where the factor is the column value, or an indicator of
/// `column == level` when a level is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub column: String,
    pub coefficient: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction: Option<String>,
}

impl Term {
    pub fn new(column: impl Into<String>, coefficient: f64) -> Self {
        Self {
            column: column.into(),
            coefficient,
            level: None,
            interaction: None,
        }
    }

    pub fn at_level(mut self, level: f64) -> Self {
        self.level = Some(level);
        self
    }

    pub fn times(mut self, column: impl Into<String>) -> Self {
        self.interaction = Some(column.into());
        self
    }

    fn add_to(&self, pool: &Pool, rows: &[usize], eta: &mut Array1<f64>) -> Result<(), ModelError> {
        let values = pool.column(&self.column)?;
        let interaction = match &self.interaction {
            Some(name) => Some(pool.column(name)?),
            None => None,
        };
        for (i, &row) in rows.iter().enumerate() {
            let mut factor = match self.level {
                Some(level) => f64::from(u8::from(values[row] == level)),
                None => values[row],
            };
            if let Some(other) = interaction {
                factor *= other[row];
            }
            eta[i] += self.coefficient * factor;
        }
        Ok(())
    }
}

fn linear_predictor(
    intercept: f64,
    terms: &[Term],
    pool: &Pool,
    rows: &[usize],
) -> Result<Array1<f64>, ModelError> {
    let mut eta = Array1::from_elem(rows.len(), intercept);
    for term in terms {
        term.add_to(pool, rows, &mut eta)?;
    }
    Ok(eta)
}

/// A generalized linear model stored as plain coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    #[serde(default)]
    pub link: LinkFunction,
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub terms: Vec<Term>,
}

impl LinearModel {
    pub fn new(link: LinkFunction, intercept: f64) -> Self {
        Self {
            link,
            intercept,
            terms: Vec::new(),
        }
    }

    pub fn with_term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// Every column the model reads.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().flat_map(|term| {
            std::iter::once(term.column.as_str()).chain(term.interaction.as_deref())
        })
    }

    pub fn load(path: &str) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl FittedModel for LinearModel {
    fn predict(&self, pool: &Pool, rows: &[usize]) -> Result<Array1<f64>, ModelError> {
        let eta = linear_predictor(self.intercept, &self.terms, pool, rows)?;
        Ok(eta.mapv(|value| self.link.inverse(value)))
    }
}

/// Linear predictor of one non-reference class of a multinomial model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPredictor {
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub terms: Vec<Term>,
}

/// Multinomial logistic model. The first class is the reference with a
/// linear predictor of zero; `classes` hold the remaining ones in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultinomialModel {
    pub classes: Vec<ClassPredictor>,
}

impl MultinomialModel {
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().flat_map(|class| {
            class.terms.iter().flat_map(|term| {
                std::iter::once(term.column.as_str()).chain(term.interaction.as_deref())
            })
        })
    }
}

impl CategoricalModel for MultinomialModel {
    fn predict_probabilities(&self, pool: &Pool, rows: &[usize]) -> Result<Array2<f64>, ModelError> {
        if self.classes.is_empty() {
            return Err(ModelError::NoClasses);
        }
        let mut probabilities = Array2::zeros((rows.len(), self.classes.len() + 1));
        for (k, class) in self.classes.iter().enumerate() {
            let eta = linear_predictor(class.intercept, &class.terms, pool, rows)?;
            probabilities.column_mut(k + 1).assign(&eta);
        }
        for mut row in probabilities.rows_mut() {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            row.mapv_inplace(|eta| (eta - max).exp());
            let total = row.sum();
            row.mapv_inplace(|weight| weight / total);
        }
        Ok(probabilities)
    }
}

// --- Fitted Model Bundle ---

/// How a covariate's values are predicted.
#[derive(Debug, Clone)]
pub enum CovariateFit {
    /// One prediction per row: a probability or a conditional mean.
    Mean(Arc<dyn FittedModel>),
    /// Zero-inflated normal: a probability of a non-zero value and the mean
    /// of its logarithm.
    ZeroInflated {
        indicator: Arc<dyn FittedModel>,
        log_mean: Arc<dyn FittedModel>,
    },
    Categorical(Arc<dyn CategoricalModel>),
    Custom(Arc<dyn CustomPredictor>),
}

impl CovariateFit {
    pub fn label(&self) -> &'static str {
        match self {
            CovariateFit::Mean(_) => "mean",
            CovariateFit::ZeroInflated { .. } => "zero-inflated",
            CovariateFit::Categorical(_) => "categorical",
            CovariateFit::Custom(_) => "custom",
        }
    }
}

/// Every fitted artifact the simulator consumes.
#[derive(Debug, Clone)]
pub struct FittedModels {
    pub covariates: AHashMap<String, CovariateFit>,
    /// Residual standard deviation of each continuous covariate model.
    pub rmses: AHashMap<String, f64>,
    /// Observed (min, max) of each continuous covariate.
    pub bounds: AHashMap<String, (f64, f64)>,
    pub outcome: Arc<dyn FittedModel>,
    pub competing: Option<Arc<dyn FittedModel>>,
    /// Probability of being censored in an interval. Only used to weight
    /// estimates computed from the observed data.
    pub censoring: Option<Arc<dyn FittedModel>>,
}

impl FittedModels {
    pub fn new(outcome: Arc<dyn FittedModel>) -> Self {
        Self {
            covariates: AHashMap::new(),
            rmses: AHashMap::new(),
            bounds: AHashMap::new(),
            outcome,
            competing: None,
            censoring: None,
        }
    }

    pub fn with_covariate(mut self, name: impl Into<String>, fit: CovariateFit) -> Self {
        self.covariates.insert(name.into(), fit);
        self
    }

    pub fn with_rmse(mut self, name: impl Into<String>, rmse: f64) -> Self {
        self.rmses.insert(name.into(), rmse);
        self
    }

    pub fn with_bounds(mut self, name: impl Into<String>, bounds: (f64, f64)) -> Self {
        self.bounds.insert(name.into(), bounds);
        self
    }

    pub fn with_competing(mut self, model: Arc<dyn FittedModel>) -> Self {
        self.competing = Some(model);
        self
    }

    pub fn with_censoring(mut self, model: Arc<dyn FittedModel>) -> Self {
        self.censoring = Some(model);
        self
    }
}

/// Observed (min, max) of a column, ignoring missing values. For bounded
/// and truncated covariates the simulator clamps draws into this range.
pub fn observed_bounds(pool: &Pool, column: &str) -> Result<Option<(f64, f64)>, PoolError> {
    let bounds = pool
        .column(column)?
        .iter()
        .copied()
        .filter(|value| !value.is_nan())
        .fold(None, |acc: Option<(f64, f64)>, value| match acc {
            None => Some((value, value)),
            Some((lo, hi)) => Some((lo.min(value), hi.max(value))),
        });
    Ok(bounds)
}

/// Root mean squared error between observed values and predictions,
/// skipping pairs with a missing observation.
pub fn root_mean_squared_error(observed: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    let (sum, count) = observed
        .iter()
        .zip(predicted.iter())
        .filter(|(y, _)| !y.is_nan())
        .fold((0.0, 0usize), |(sum, count), (y, mu)| (sum + (y - mu).powi(2), count + 1));
    if count == 0 {
        f64::NAN
    } else {
        (sum / count as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn pool() -> Pool {
        Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3],
            vec![0, 0, 0],
            vec![
                ("A".to_string(), vec![0.0, 1.0, 1.0]),
                ("C".to_string(), vec![1.0, 2.0, 3.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_logit_prediction() {
        let model = LinearModel::new(LinkFunction::Logit, 0.0).with_term(Term::new("A", 2.0));
        let predictions = model.predict(&pool(), &[0, 1]).unwrap();
        assert_abs_diff_eq!(predictions[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(predictions[1], 1.0 / (1.0 + (-2.0f64).exp()), epsilon = 1e-12);
    }

    #[test]
    fn test_level_indicator_and_interaction() {
        let model = LinearModel::new(LinkFunction::Identity, 1.0)
            .with_term(Term::new("C", 10.0).at_level(2.0))
            .with_term(Term::new("A", 0.5).times("C"));
        let predictions = model.predict(&pool(), &[0, 1, 2]).unwrap();
        assert_eq!(predictions, array![1.0, 12.0, 2.5]);
        assert_eq!(model.columns().collect::<Vec<_>>(), vec!["C", "A", "C"]);
    }

    #[test]
    fn test_multinomial_rows_sum_to_one() {
        let model = MultinomialModel {
            classes: vec![
                ClassPredictor {
                    intercept: 1.0,
                    terms: vec![Term::new("A", -1.0)],
                },
                ClassPredictor {
                    intercept: -1.0,
                    terms: vec![],
                },
            ],
        };
        let probabilities = model.predict_probabilities(&pool(), &[0, 1, 2]).unwrap();
        assert_eq!(probabilities.ncols(), 3);
        for row in probabilities.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert!(probabilities[[0, 1]] > probabilities[[0, 0]]);
    }

    #[test]
    fn test_model_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let path = path.to_str().unwrap();
        let model = LinearModel::new(LinkFunction::Log, -0.3).with_term(Term::new("L", 0.2));
        model.save(path).unwrap();
        assert_eq!(LinearModel::load(path).unwrap(), model);
    }

    #[test]
    fn test_observed_bounds_skip_missing() {
        let pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3],
            vec![0, 0, 0],
            vec![("L".to_string(), vec![f64::NAN, 4.0, -1.0])],
        )
        .unwrap();
        assert_eq!(observed_bounds(&pool, "L").unwrap(), Some((-1.0, 4.0)));
    }

    #[test]
    fn test_rmse_ignores_missing_observations() {
        let observed = array![1.0, f64::NAN, 3.0];
        let predicted = array![2.0, 0.0, 2.0];
        assert_abs_diff_eq!(
            root_mean_squared_error(observed.view(), predicted.view()),
            1.0,
            epsilon = 1e-12
        );
    }
}
