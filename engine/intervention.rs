//! # Intervention Engine
//!
//! Rewrites treatment columns of the current time slice according to an
//! intervention's rules. Rules for several treatments are applied in their
//! declared order, and a rule restricted to a set of time points leaves the
//! slice untouched elsewhere.
//!
//! Grace-period rules read the treatment and condition columns at earlier
//! time points, so they must run after those rows have been finalized.

use crate::pool::Pool;
use crate::restriction::ConditionSet;
use crate::sampler::bernoulli;
use crate::simulate::SimulationError;
use crate::spec::{ConfigError, SimulationSpec};
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

/// A user-defined treatment rule. It receives the slice rows at time `t`
/// and writes the treatment column itself.
pub trait CustomIntervention: Send + Sync + Debug {
    fn apply(
        &self,
        pool: &mut Pool,
        rows: &[usize],
        treatment: &str,
        t: i64,
        rng: &mut StdRng,
    ) -> Result<(), SimulationError>;
}

#[derive(Debug, Clone)]
pub enum InterventionRule {
    /// Treatment fixed at `values[t]`, or at `values[0]` for every `t` when a
    /// single value is given.
    Static { values: Vec<f64> },
    /// Treatment clamped into `[lower, upper]`.
    Threshold { lower: f64, upper: f64 },
    /// Initiate within `periods` time points of the condition first holding,
    /// following the natural course until the deadline.
    NaturalGracePeriod {
        periods: usize,
        conditions: ConditionSet,
    },
    /// Initiate within `periods` time points of the condition first holding,
    /// with initiation spread uniformly over the remaining grace period.
    UniformGracePeriod {
        periods: usize,
        conditions: ConditionSet,
    },
    Custom(Arc<dyn CustomIntervention>),
}

#[derive(Debug, Clone)]
pub struct TreatmentRule {
    pub treatment: String,
    pub rule: InterventionRule,
    /// Time points at which the rule is enforced; every time point if `None`.
    pub times: Option<BTreeSet<i64>>,
}

impl TreatmentRule {
    pub fn new(treatment: impl Into<String>, rule: InterventionRule) -> Self {
        Self {
            treatment: treatment.into(),
            rule,
            times: None,
        }
    }

    pub fn at_times(mut self, times: impl IntoIterator<Item = i64>) -> Self {
        self.times = Some(times.into_iter().collect());
        self
    }

    fn applies_at(&self, t: i64) -> bool {
        self.times.as_ref().is_none_or(|times| times.contains(&t))
    }
}

/// Column tracking time since the grace period started under a uniform
/// grace-period rule.
pub fn grace_count_name(treatment: &str) -> String {
    format!("grace_count_{treatment}")
}

/// A named set of treatment rules. No rules means the natural course.
#[derive(Debug, Clone)]
pub struct Intervention {
    pub name: String,
    pub rules: Vec<TreatmentRule>,
}

impl Intervention {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn natural_course() -> Self {
        Self::new("Natural course")
    }

    pub fn with_rule(mut self, rule: TreatmentRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn is_natural_course(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn validate(&self, spec: &SimulationSpec) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidIntervention {
            intervention: self.name.clone(),
            reason,
        };
        for rule in &self.rules {
            if spec.covariate(&rule.treatment).is_none() {
                return Err(invalid(format!(
                    "treatment '{}' is not a declared covariate",
                    rule.treatment
                )));
            }
            match &rule.rule {
                InterventionRule::Static { values } => {
                    if values.is_empty() {
                        return Err(invalid("static rule has no values".to_string()));
                    }
                    if values.len() > 1 && values.len() < spec.time_points {
                        return Err(invalid(format!(
                            "static rule gives {} values for {} time points",
                            values.len(),
                            spec.time_points
                        )));
                    }
                }
                InterventionRule::Threshold { lower, upper } => {
                    if lower > upper {
                        return Err(invalid(format!(
                            "threshold bounds are inverted: [{lower}, {upper}]"
                        )));
                    }
                }
                InterventionRule::NaturalGracePeriod { conditions, .. }
                | InterventionRule::UniformGracePeriod { conditions, .. } => {
                    if conditions.is_empty() {
                        return Err(invalid(
                            "grace-period rule needs at least one condition".to_string(),
                        ));
                    }
                }
                InterventionRule::Custom(_) => {}
            }
        }
        Ok(())
    }

    /// Applies every rule to the slice `rows`, all of which are at time `t`.
    pub fn apply(
        &self,
        pool: &mut Pool,
        rows: &[usize],
        t: i64,
        rng: &mut StdRng,
    ) -> Result<(), SimulationError> {
        for rule in &self.rules {
            if !rule.applies_at(t) {
                continue;
            }
            let treatment = rule.treatment.as_str();
            match &rule.rule {
                InterventionRule::Static { values } => {
                    let value = match values.as_slice() {
                        [single] => *single,
                        _ => values
                            .get(t as usize)
                            .copied()
                            .ok_or_else(|| SimulationError::StaticValueMissing {
                                treatment: treatment.to_string(),
                                t,
                            })?,
                    };
                    pool.overwrite(treatment, rows, &vec![value; rows.len()])?;
                }
                InterventionRule::Threshold { lower, upper } => {
                    let clamped: Vec<f64> = pool
                        .gather(treatment, rows)?
                        .into_iter()
                        .map(|value| value.clamp(*lower, *upper))
                        .collect();
                    pool.overwrite(treatment, rows, &clamped)?;
                }
                InterventionRule::NaturalGracePeriod {
                    periods,
                    conditions,
                } => natural_grace_period(pool, rows, treatment, *periods, conditions, t)?,
                InterventionRule::UniformGracePeriod {
                    periods,
                    conditions,
                } => uniform_grace_period(pool, rows, treatment, *periods, conditions, t, rng)?,
                InterventionRule::Custom(custom) => custom.apply(pool, rows, treatment, t, rng)?,
            }
        }
        Ok(())
    }
}

fn previous_treated(pool: &Pool, treatment: usize, row: usize, t: i64) -> bool {
    t > 0
        && pool
            .lookup(pool.subject_of(row), t - 1)
            .is_some_and(|prev| pool.value(treatment, prev) == 1.0)
}

fn condition_held_at(
    pool: &Pool,
    conditions: &ConditionSet,
    row: usize,
    time: i64,
) -> Result<bool, SimulationError> {
    match pool.lookup(pool.subject_of(row), time) {
        Some(past) => Ok(conditions.holds(pool, past)?),
        None => Ok(false),
    }
}

fn natural_grace_period(
    pool: &mut Pool,
    rows: &[usize],
    treatment: &str,
    periods: usize,
    conditions: &ConditionSet,
    t: i64,
) -> Result<(), SimulationError> {
    let eligible = conditions.mask(pool, rows)?;
    let column = pool.column_index(treatment)?;
    let deadline = periods as i64;
    let mut assigned = Vec::with_capacity(rows.len());
    for (&row, &eligible) in rows.iter().zip(&eligible) {
        let mut value = if eligible { pool.value(column, row) } else { 0.0 };
        if t >= deadline && condition_held_at(pool, conditions, row, t - deadline)? {
            value = 1.0;
        }
        if previous_treated(pool, column, row, t) {
            value = 1.0;
        }
        assigned.push(value);
    }
    pool.overwrite(treatment, rows, &assigned)?;
    Ok(())
}

fn uniform_grace_period(
    pool: &mut Pool,
    rows: &[usize],
    treatment: &str,
    periods: usize,
    conditions: &ConditionSet,
    t: i64,
    rng: &mut StdRng,
) -> Result<(), SimulationError> {
    let eligible = conditions.mask(pool, rows)?;
    let column = pool.column_index(treatment)?;
    let counts = pool.ensure_column(&grace_count_name(treatment), 0.0)?;
    let deadline = periods as i64;
    let span = periods as f64 + 1.0;

    let mut assigned = Vec::with_capacity(rows.len());
    let mut counted = Vec::with_capacity(rows.len());
    for (&row, &eligible) in rows.iter().zip(&eligible) {
        let previous = if t == 0 {
            0.0
        } else {
            pool.lookup(pool.subject_of(row), t - 1)
                .map_or(0.0, |prev| pool.value(counts, prev))
        };
        let in_grace = previous > 0.0 || eligible;
        let mut value = if in_grace {
            bernoulli(rng, 1.0 / (span - previous), treatment)?
        } else {
            0.0
        };
        if t > 0 {
            if t >= deadline && condition_held_at(pool, conditions, row, t - deadline)? {
                value = 1.0;
            }
            if previous_treated(pool, column, row, t) {
                value = 1.0;
            }
        }
        let count = if in_grace && value == 0.0 {
            previous + 1.0
        } else {
            0.0
        };
        assigned.push(value);
        counted.push(count);
    }
    pool.overwrite(treatment, rows, &assigned)?;
    pool.overwrite(&grace_count_name(treatment), rows, &counted)?;
    Ok(())
}
