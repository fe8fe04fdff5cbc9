//! Conditions over pool columns, and restrictions that override a column
//! wherever their conditions do not all hold.

use crate::pool::{Pool, PoolError};
use crate::simulate::SimulationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Comparison operator used by declarative conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
        }
    }
}

type Predicate = Arc<dyn Fn(f64) -> bool + Send + Sync>;

/// A predicate on the value of a single column.
#[derive(Clone)]
pub struct Condition {
    pub column: String,
    predicate: Predicate,
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("column", &self.column)
            .finish_non_exhaustive()
    }
}

impl Condition {
    pub fn new(
        column: impl Into<String>,
        predicate: impl Fn(f64) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            column: column.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn compare(column: impl Into<String>, op: Comparison, value: f64) -> Self {
        Self::new(column, move |x| op.holds(x, value))
    }

    pub fn holds(&self, value: f64) -> bool {
        (self.predicate)(value)
    }
}

/// Conjunction of conditions. An empty set holds everywhere.
#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
}

impl ConditionSet {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn push(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|c| c.column.as_str())
    }

    /// Whether every condition holds, per row.
    pub fn mask(&self, pool: &Pool, rows: &[usize]) -> Result<Vec<bool>, PoolError> {
        let mut mask = vec![true; rows.len()];
        for condition in &self.conditions {
            let column = pool.column(&condition.column)?;
            for (keep, &row) in mask.iter_mut().zip(rows) {
                *keep = *keep && condition.holds(column[row]);
            }
        }
        Ok(mask)
    }

    pub fn holds(&self, pool: &Pool, row: usize) -> Result<bool, PoolError> {
        for condition in &self.conditions {
            if !condition.holds(pool.get(&condition.column, row)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Computes replacement values for a restricted column. The returned vector
/// is aligned with `rows`; only entries where the restriction applies are
/// used.
pub trait OverrideValues: Send + Sync + fmt::Debug {
    fn values(&self, pool: &Pool, rows: &[usize], t: i64) -> Result<Vec<f64>, SimulationError>;
}

#[derive(Clone, Debug)]
pub enum OverrideValue {
    Constant(f64),
    Computed(Arc<dyn OverrideValues>),
}

/// Overrides a column with `value` on every row where `conditions` do not
/// all hold.
#[derive(Clone, Debug)]
pub struct Restriction {
    pub conditions: ConditionSet,
    pub value: OverrideValue,
}

impl Restriction {
    pub fn new(conditions: Vec<Condition>, value: f64) -> Self {
        Self {
            conditions: ConditionSet::new(conditions),
            value: OverrideValue::Constant(value),
        }
    }

    pub fn computed(conditions: Vec<Condition>, values: Arc<dyn OverrideValues>) -> Self {
        Self {
            conditions: ConditionSet::new(conditions),
            value: OverrideValue::Computed(values),
        }
    }

    /// Applies the override to `column` at `rows` and returns how many rows
    /// were overridden.
    pub fn apply(
        &self,
        pool: &mut Pool,
        rows: &[usize],
        column: &str,
        t: i64,
    ) -> Result<usize, SimulationError> {
        let mask = self.conditions.mask(pool, rows)?;
        let restricted: Vec<usize> = rows
            .iter()
            .zip(&mask)
            .filter(|(_, keep)| !**keep)
            .map(|(&row, _)| row)
            .collect();
        if restricted.is_empty() {
            return Ok(0);
        }
        let replacements = match &self.value {
            OverrideValue::Constant(value) => vec![*value; restricted.len()],
            OverrideValue::Computed(values) => {
                let computed = values.values(pool, rows, t)?;
                if computed.len() != rows.len() {
                    return Err(PoolError::LengthMismatch {
                        column: column.to_string(),
                        expected: rows.len(),
                        found: computed.len(),
                    }
                    .into());
                }
                computed
                    .into_iter()
                    .zip(&mask)
                    .filter(|(_, keep)| !**keep)
                    .map(|(value, _)| value)
                    .collect()
            }
        };
        pool.overwrite(column, &restricted, &replacements)?;
        Ok(restricted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct HalfOfLag;

    impl OverrideValues for HalfOfLag {
        fn values(&self, pool: &Pool, rows: &[usize], _: i64) -> Result<Vec<f64>, SimulationError> {
            Ok(pool.gather("lag1_L", rows)?.iter().map(|v| v / 2.0).collect())
        }
    }

    fn pool() -> Pool {
        Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3],
            vec![0, 0, 0],
            vec![
                ("A".to_string(), vec![1.0, 0.0, 1.0]),
                ("L".to_string(), vec![5.0, 6.0, 7.0]),
                ("lag1_L".to_string(), vec![2.0, 4.0, 8.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_condition_set_is_conjunction() {
        let pool = pool();
        let set = ConditionSet::new(vec![
            Condition::compare("A", Comparison::Eq, 1.0),
            Condition::new("L", |v| v > 5.5),
        ]);
        assert_eq!(set.mask(&pool, &[0, 1, 2]).unwrap(), vec![false, false, true]);
        assert!(ConditionSet::default().holds(&pool, 0).unwrap());
    }

    #[test]
    fn test_constant_override_where_conditions_fail() {
        let mut pool = pool();
        let restriction = Restriction::new(vec![Condition::compare("A", Comparison::Eq, 1.0)], 0.0);
        let changed = restriction.apply(&mut pool, &[0, 1, 2], "L", 0).unwrap();
        assert_eq!(changed, 1);
        assert_eq!(pool.column("L").unwrap(), &[5.0, 0.0, 7.0]);
    }

    #[test]
    fn test_computed_override_is_row_aligned() {
        let mut pool = pool();
        let restriction = Restriction::computed(
            vec![Condition::compare("A", Comparison::Eq, 0.0)],
            Arc::new(HalfOfLag),
        );
        restriction.apply(&mut pool, &[0, 1, 2], "L", 0).unwrap();
        assert_eq!(pool.column("L").unwrap(), &[1.0, 6.0, 4.0]);
    }
}
