//! # History Engine
//!
//! Derives lagged, cumulative-average and lagged cumulative-average columns
//! for time-varying covariates. Every call recomputes the requested columns
//! from the current pool, so running it twice in a row yields identical
//! values.
//!
//! Column naming is fixed: `lag{k}_{cov}`, `cumavg_{cov}` and
//! `lag_cumavg{k}_{cov}`. Fitted models reference these names directly.

use crate::pool::{Pool, PoolError};
use crate::spec::{CovariateKind, CovariateSpec, SimulationSpec, VisitProcess};
use itertools::Itertools;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Cumulative averages are undefined for categorical covariate '{0}'.")]
    CategoricalAverage(String),
    #[error("History term '{term}' refers to '{covariate}', which is not a declared covariate.")]
    UnknownCovariate { term: String, covariate: String },
    #[error("Custom history for '{covariate}' failed: {message}")]
    Custom { covariate: String, message: String },
}

pub fn lag_name(covariate: &str, k: usize) -> String {
    format!("lag{k}_{covariate}")
}

pub fn cumavg_name(covariate: &str) -> String {
    format!("cumavg_{covariate}")
}

pub fn lag_cumavg_name(covariate: &str, k: usize) -> String {
    format!("lag_cumavg{k}_{covariate}")
}

/// A history term parsed from a model term name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryTerm {
    Lag(usize),
    CumulativeAverage,
    LaggedCumulativeAverage(usize),
}

/// Splits a column name such as `lag2_L1` into its history term and the
/// covariate it summarizes. Names that are not history terms yield `None`.
pub fn parse_history_term(name: &str) -> Option<(HistoryTerm, &str)> {
    fn lagged(rest: &str) -> Option<(usize, &str)> {
        let (digits, covariate) = rest.split_once('_')?;
        if digits.is_empty() || covariate.is_empty() {
            return None;
        }
        let k = digits.parse::<usize>().ok()?;
        (k > 0).then_some((k, covariate))
    }

    if let Some(rest) = name.strip_prefix("lag_cumavg") {
        let (k, covariate) = lagged(rest)?;
        return Some((HistoryTerm::LaggedCumulativeAverage(k), covariate));
    }
    if let Some(covariate) = name.strip_prefix("cumavg_") {
        return (!covariate.is_empty()).then_some((HistoryTerm::CumulativeAverage, covariate));
    }
    if let Some(rest) = name.strip_prefix("lag") {
        let (k, covariate) = lagged(rest)?;
        return Some((HistoryTerm::Lag(k), covariate));
    }
    None
}

/// The history columns maintained for one covariate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CovariateHistory {
    pub covariate: String,
    pub categorical: bool,
    pub lags: Vec<usize>,
    pub cumavg: bool,
    pub lag_cumavg: Vec<usize>,
}

impl CovariateHistory {
    pub fn new(covariate: impl Into<String>) -> Self {
        Self {
            covariate: covariate.into(),
            ..Self::default()
        }
    }

    pub fn with_lags(mut self, lags: impl IntoIterator<Item = usize>) -> Self {
        self.lags.extend(lags);
        self.lags = self.lags.iter().copied().sorted().dedup().collect();
        self
    }

    pub fn with_cumavg(mut self) -> Self {
        self.cumavg = true;
        self
    }

    pub fn with_lag_cumavg(mut self, lags: impl IntoIterator<Item = usize>) -> Self {
        self.lag_cumavg.extend(lags);
        self.lag_cumavg = self.lag_cumavg.iter().copied().sorted().dedup().collect();
        self
    }

    pub fn categorical(mut self) -> Self {
        self.categorical = true;
        self
    }

    fn needs_average(&self) -> bool {
        self.cumavg || !self.lag_cumavg.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.lags.is_empty() && !self.needs_average()
    }
}

/// Which history columns exist, and how lags reaching before the first
/// observation are filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySpec {
    pub entries: Vec<CovariateHistory>,
    /// Fill unavailable lags with the subject's first value instead of zero.
    pub baselags: bool,
    /// The data carries rows before time zero; lags are then plain shifts.
    pub pre_baseline: bool,
}

impl HistorySpec {
    pub fn entry(&self, covariate: &str) -> Option<&CovariateHistory> {
        self.entries.iter().find(|entry| entry.covariate == covariate)
    }

    /// True when `covariate` has a cumulative average that must be refreshed
    /// right after the covariate is drawn.
    pub fn has_cumavg(&self, covariate: &str) -> bool {
        self.entry(covariate).is_some_and(|entry| entry.cumavg)
    }

    fn entry_mut(&mut self, covariate: &str, categorical: bool) -> &mut CovariateHistory {
        match self.entries.iter().position(|e| e.covariate == covariate) {
            Some(position) => &mut self.entries[position],
            None => {
                let mut entry = CovariateHistory::new(covariate);
                entry.categorical = categorical;
                self.entries.push(entry);
                let last = self.entries.len() - 1;
                &mut self.entries[last]
            }
        }
    }

    /// Builds the history plan from the column names that fitted models
    /// reference. Visit processes always contribute a first lag of their
    /// missed-visit counter and of the covariate they gate, and absorbing
    /// covariates a first lag of themselves.
    pub fn derive<'a>(
        covariates: &[CovariateSpec],
        visits: &[VisitProcess],
        terms: impl IntoIterator<Item = &'a str>,
        baselags: bool,
    ) -> Result<Self, HistoryError> {
        let mut spec = HistorySpec {
            baselags,
            ..HistorySpec::default()
        };
        for term in terms {
            let Some((kind, covariate)) = parse_history_term(term) else {
                continue;
            };
            let counter = visits.iter().any(|visit| visit.counter_name() == covariate);
            let declared = covariates.iter().find(|c| c.name == covariate);
            let categorical = match (declared, counter) {
                (Some(declared), _) => declared.kind.is_categorical(),
                (None, true) => false,
                (None, false) => {
                    return Err(HistoryError::UnknownCovariate {
                        term: term.to_string(),
                        covariate: covariate.to_string(),
                    });
                }
            };
            let entry = spec.entry_mut(covariate, categorical);
            match kind {
                HistoryTerm::Lag(k) => {
                    if !entry.lags.contains(&k) {
                        entry.lags.push(k);
                    }
                }
                HistoryTerm::CumulativeAverage => entry.cumavg = true,
                HistoryTerm::LaggedCumulativeAverage(k) => {
                    if !entry.lag_cumavg.contains(&k) {
                        entry.lag_cumavg.push(k);
                    }
                }
            }
        }
        let carried = covariates
            .iter()
            .filter(|c| c.kind == CovariateKind::Absorbing)
            .map(|c| (c.name.clone(), false))
            .chain(visits.iter().flat_map(|visit| {
                let categorical = covariates
                    .iter()
                    .any(|c| c.name == visit.covariate && c.kind.is_categorical());
                [
                    (visit.counter_name(), false),
                    (visit.covariate.clone(), categorical),
                ]
            }));
        for (name, categorical) in carried {
            let entry = spec.entry_mut(&name, categorical);
            if !entry.lags.contains(&1) {
                entry.lags.push(1);
            }
        }
        for entry in &mut spec.entries {
            entry.lags.sort_unstable();
            entry.lag_cumavg.sort_unstable();
            if entry.categorical && entry.needs_average() {
                return Err(HistoryError::CategoricalAverage(entry.covariate.clone()));
            }
        }
        spec.entries.retain(|entry| !entry.is_empty());
        Ok(spec)
    }
}

/// How a lag reaching before a subject's first observation is filled.
#[derive(Debug, Clone, Copy)]
enum Fallback {
    /// Plain positional shift; the value is missing.
    Missing,
    /// The subject's first observed value of the covariate.
    FirstValue,
    /// A fixed value (zero, or the reference level of a categorical).
    Constant(f64),
}

fn shift(pool: &Pool, source: &[f64], first: &[f64], k: usize, fallback: Fallback) -> Vec<f64> {
    let mut shifted = vec![f64::NAN; pool.len()];
    for subject in 0..pool.n_subjects() {
        let rows = pool.subject_rows(subject);
        for (position, &row) in rows.iter().enumerate() {
            let earlier = position.checked_sub(k).map(|p| source[rows[p]]);
            shifted[row] = match fallback {
                Fallback::Missing => earlier.unwrap_or(f64::NAN),
                Fallback::FirstValue if pool.time(row) < k as i64 => first[rows[0]],
                Fallback::Constant(value) if pool.time(row) < k as i64 => value,
                _ => earlier.unwrap_or(f64::NAN),
            };
        }
    }
    shifted
}

fn expanding_mean(pool: &Pool, source: &[f64]) -> Vec<f64> {
    let mut averages = vec![f64::NAN; pool.len()];
    for subject in 0..pool.n_subjects() {
        let (mut sum, mut count) = (0.0, 0usize);
        for &row in pool.subject_rows(subject) {
            let value = source[row];
            if !value.is_nan() {
                sum += value;
                count += 1;
            }
            averages[row] = if count == 0 { f64::NAN } else { sum / count as f64 };
        }
    }
    averages
}

/// Recomputes every history column named in `spec` from the covariate
/// values currently in the pool.
pub fn update_history(pool: &mut Pool, spec: &HistorySpec) -> Result<(), HistoryError> {
    for entry in &spec.entries {
        if entry.categorical && entry.needs_average() {
            return Err(HistoryError::CategoricalAverage(entry.covariate.clone()));
        }
        let values = pool.column(&entry.covariate)?.to_vec();
        let fallback = if spec.pre_baseline {
            Fallback::Missing
        } else if spec.baselags {
            Fallback::FirstValue
        } else if entry.categorical {
            let reference = pool.levels(&entry.covariate)?.first().copied().unwrap_or(0.0);
            Fallback::Constant(reference)
        } else {
            Fallback::Constant(0.0)
        };

        for &k in &entry.lags {
            let lagged = shift(pool, &values, &values, k, fallback);
            pool.set_column(&lag_name(&entry.covariate, k), lagged)?;
        }

        if entry.needs_average() {
            let averages = expanding_mean(pool, &values);
            for &k in &entry.lag_cumavg {
                let lagged = shift(pool, &averages, &values, k, fallback);
                pool.set_column(&lag_cumavg_name(&entry.covariate, k), lagged)?;
            }
            pool.set_column(&cumavg_name(&entry.covariate), averages)?;
        }
    }
    Ok(())
}

/// A user-supplied history function, run for one covariate after the
/// standard history columns are refreshed.
pub trait CustomHistory: Send + Sync + Debug {
    /// Writes the history column for rows at time `t`.
    fn update(&self, pool: &mut Pool, covariate: &str, t: i64) -> Result<(), HistoryError>;
}

/// Mean of the covariate over the current and two previous time points
/// (fewer near baseline), written to `ave_last3_{cov}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageOfLastThree;

impl AverageOfLastThree {
    pub fn column_name(covariate: &str) -> String {
        format!("ave_last3_{covariate}")
    }
}

impl CustomHistory for AverageOfLastThree {
    fn update(&self, pool: &mut Pool, covariate: &str, t: i64) -> Result<(), HistoryError> {
        let values = pool.column(covariate)?.to_vec();
        let target = pool.ensure_column(&Self::column_name(covariate), f64::NAN)?;
        let start = (t - 2).max(0);
        for subject in 0..pool.n_subjects() {
            let Some(row) = pool.lookup(subject, t) else {
                continue;
            };
            let window: Vec<f64> = (start..=t)
                .filter_map(|time| pool.lookup(subject, time))
                .map(|r| values[r])
                .filter(|value| !value.is_nan())
                .collect();
            let mean = if window.is_empty() {
                f64::NAN
            } else {
                window.iter().sum::<f64>() / window.len() as f64
            };
            pool.set_value(target, row, mean);
        }
        Ok(())
    }
}

/// Builds the missed-visit counter `ts_{cov}` for observed data: zero at or
/// before baseline and at every visit, otherwise one more than the previous
/// time point.
pub fn visit_counter(pool: &mut Pool, visit: &VisitProcess) -> Result<(), HistoryError> {
    let indicator = pool.column(&visit.indicator)?.to_vec();
    let mut counter = vec![0.0; pool.len()];
    for subject in 0..pool.n_subjects() {
        let mut previous = 0.0;
        for &row in pool.subject_rows(subject) {
            let value = if pool.time(row) <= 0 || indicator[row] == 1.0 {
                0.0
            } else {
                previous + 1.0
            };
            counter[row] = value;
            previous = value;
        }
    }
    pool.set_column(&visit.counter_name(), counter)?;
    Ok(())
}

/// Index of the first threshold at or above `t`, or the number of
/// thresholds when `t` exceeds them all.
pub fn categorical_time(t: i64, thresholds: &[i64]) -> f64 {
    thresholds
        .iter()
        .position(|&threshold| t <= threshold)
        .unwrap_or(thresholds.len()) as f64
}

/// Writes derived time-feature covariates (categorical time bins and
/// squared time) at the given rows.
pub fn write_time_features(
    pool: &mut Pool,
    rows: &[usize],
    covariates: &[CovariateSpec],
) -> Result<(), HistoryError> {
    for covariate in covariates {
        let feature: Box<dyn Fn(i64) -> f64> = match &covariate.kind {
            CovariateKind::CategoricalTime { thresholds } => {
                let thresholds = thresholds.clone();
                Box::new(move |t| categorical_time(t, &thresholds))
            }
            CovariateKind::SquareTime => Box::new(|t| (t * t) as f64),
            _ => continue,
        };
        let values: Vec<f64> = rows.iter().map(|&row| feature(pool.time(row))).collect();
        pool.write(&covariate.name, rows, &values)?;
    }
    Ok(())
}

/// Brings observed data into the shape fitted models expect: missed-visit
/// counters, derived time features and every history column.
pub fn prepare_observed(pool: &mut Pool, spec: &SimulationSpec) -> Result<(), HistoryError> {
    for visit in &spec.visits {
        visit_counter(pool, visit)?;
    }
    let rows: Vec<usize> = (0..pool.len()).collect();
    write_time_features(pool, &rows, &spec.covariates)?;
    let history = HistorySpec {
        pre_baseline: pool.min_time().is_some_and(|t| t < 0),
        ..spec.history.clone()
    };
    update_history(pool, &history)
}
