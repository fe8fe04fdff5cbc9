//! # Simulation Pool
//!
//! The long-format table that holds one row per (subject, time) pair. The
//! Monte Carlo driver grows it one time slice at a time, and every other
//! component reads and writes columns of it by name.
//!
//! - Storage is columnar: every column is a dense `Vec<f64>` and a missing
//!   value is represented by `NaN`.
//! - The time index is mirrored as an ordinary numeric column so fitted
//!   models can use it as a predictor; it is read-only through this API.
//! - Rows are addressed by physical index. Per-subject row lists are kept
//!   sorted by time so lagged lookups are a binary search.

use ahash::AHashMap;
use rand::Rng;
use thiserror::Error;

pub type SubjectId = i64;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Column '{0}' was not found in the table.")]
    ColumnNotFound(String),
    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),
    #[error("Column '{0}' holds the subject identifier or time index and cannot be written.")]
    ReservedColumn(String),
    #[error("Column '{column}' has {found} values but {expected} were expected.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Subject {id} has more than one row at time {time}.")]
    DuplicateTime { id: SubjectId, time: i64 },
    #[error("The table has no subjects to resample.")]
    NoSubjects,
}

#[derive(Debug, Clone)]
struct Subject {
    id: SubjectId,
    rows: Vec<usize>,
}

/// Long-format table of subjects followed over discrete time.
#[derive(Debug, Clone)]
pub struct Pool {
    id_name: String,
    time_name: String,
    ids: Vec<SubjectId>,
    times: Vec<i64>,
    subject_of: Vec<usize>,
    names: Vec<String>,
    values: Vec<Vec<f64>>,
    index: AHashMap<String, usize>,
    subjects: Vec<Subject>,
}

impl Pool {
    /// Builds a table from raw columns. Rows are reordered by (subject, time);
    /// a subject may not have two rows at the same time.
    pub fn from_columns(
        id_name: impl Into<String>,
        time_name: impl Into<String>,
        ids: Vec<SubjectId>,
        times: Vec<i64>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self, PoolError> {
        let id_name = id_name.into();
        let time_name = time_name.into();
        let n = ids.len();
        if times.len() != n {
            return Err(PoolError::LengthMismatch {
                column: time_name,
                expected: n,
                found: times.len(),
            });
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&row| (ids[row], times[row]));
        for pair in order.windows(2) {
            if ids[pair[0]] == ids[pair[1]] && times[pair[0]] == times[pair[1]] {
                return Err(PoolError::DuplicateTime {
                    id: ids[pair[0]],
                    time: times[pair[0]],
                });
            }
        }

        let sorted_ids: Vec<SubjectId> = order.iter().map(|&row| ids[row]).collect();
        let sorted_times: Vec<i64> = order.iter().map(|&row| times[row]).collect();

        let mut pool = Pool {
            names: vec![time_name.clone()],
            values: vec![sorted_times.iter().map(|&t| t as f64).collect()],
            index: AHashMap::from_iter([(time_name.clone(), 0)]),
            id_name,
            time_name,
            ids: sorted_ids,
            times: sorted_times,
            subject_of: Vec::with_capacity(n),
            subjects: Vec::new(),
        };

        for (row, &id) in pool.ids.iter().enumerate() {
            match pool.subjects.last_mut() {
                Some(subject) if subject.id == id => subject.rows.push(row),
                _ => pool.subjects.push(Subject { id, rows: vec![row] }),
            }
            pool.subject_of.push(pool.subjects.len() - 1);
        }

        for (name, column) in columns {
            if name == pool.id_name || name == pool.time_name {
                return Err(PoolError::ReservedColumn(name));
            }
            if pool.index.contains_key(&name) {
                return Err(PoolError::DuplicateColumn(name));
            }
            if column.len() != n {
                return Err(PoolError::LengthMismatch {
                    column: name,
                    expected: n,
                    found: column.len(),
                });
            }
            let sorted = order.iter().map(|&row| column[row]).collect();
            pool.index.insert(name.clone(), pool.names.len());
            pool.names.push(name);
            pool.values.push(sorted);
        }

        Ok(pool)
    }

    pub fn id_name(&self) -> &str {
        &self.id_name
    }

    pub fn time_name(&self) -> &str {
        &self.time_name
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn id(&self, row: usize) -> SubjectId {
        self.ids[row]
    }

    pub fn time(&self, row: usize) -> i64 {
        self.times[row]
    }

    /// Position of the row's subject in `0..n_subjects()`.
    pub fn subject_of(&self, row: usize) -> usize {
        self.subject_of[row]
    }

    pub fn subject_id(&self, subject: usize) -> SubjectId {
        self.subjects[subject].id
    }

    /// Rows of one subject, ordered by time.
    pub fn subject_rows(&self, subject: usize) -> &[usize] {
        &self.subjects[subject].rows
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column_index(&self, name: &str) -> Result<usize, PoolError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PoolError::ColumnNotFound(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<&[f64], PoolError> {
        Ok(&self.values[self.column_index(name)?])
    }

    pub fn value(&self, column: usize, row: usize) -> f64 {
        self.values[column][row]
    }

    pub fn get(&self, name: &str, row: usize) -> Result<f64, PoolError> {
        Ok(self.values[self.column_index(name)?][row])
    }

    /// Values of `name` at the given rows, in the order given.
    pub fn gather(&self, name: &str, rows: &[usize]) -> Result<Vec<f64>, PoolError> {
        let column = self.column(name)?;
        Ok(rows.iter().map(|&row| column[row]).collect())
    }

    fn writable_index(&self, name: &str) -> Result<usize, PoolError> {
        let column = self.column_index(name)?;
        if column == 0 {
            return Err(PoolError::ReservedColumn(name.to_string()));
        }
        Ok(column)
    }

    /// Writes one cell of a writable column previously resolved with
    /// [`Pool::ensure_column`] or [`Pool::column_index`].
    pub fn set_value(&mut self, column: usize, row: usize, value: f64) {
        debug_assert!(column != 0, "the time column is read-only");
        self.values[column][row] = value;
    }

    /// Returns the index of `name`, creating the column filled with `fill`
    /// if it does not exist yet.
    pub fn ensure_column(&mut self, name: &str, fill: f64) -> Result<usize, PoolError> {
        if name == self.id_name {
            return Err(PoolError::ReservedColumn(name.to_string()));
        }
        if let Some(&column) = self.index.get(name) {
            if column == 0 {
                return Err(PoolError::ReservedColumn(name.to_string()));
            }
            return Ok(column);
        }
        let column = self.names.len();
        self.names.push(name.to_string());
        self.values.push(vec![fill; self.len()]);
        self.index.insert(name.to_string(), column);
        Ok(column)
    }

    /// Replaces (or creates) a whole column.
    pub fn set_column(&mut self, name: &str, values: Vec<f64>) -> Result<(), PoolError> {
        if values.len() != self.len() {
            return Err(PoolError::LengthMismatch {
                column: name.to_string(),
                expected: self.len(),
                found: values.len(),
            });
        }
        let column = self.ensure_column(name, f64::NAN)?;
        self.values[column] = values;
        Ok(())
    }

    /// Writes `values[i]` into row `rows[i]` of `name`, creating the column
    /// (missing elsewhere) when needed.
    pub fn write(&mut self, name: &str, rows: &[usize], values: &[f64]) -> Result<(), PoolError> {
        if rows.len() != values.len() {
            return Err(PoolError::LengthMismatch {
                column: name.to_string(),
                expected: rows.len(),
                found: values.len(),
            });
        }
        let column = self.ensure_column(name, f64::NAN)?;
        let target = &mut self.values[column];
        for (&row, &value) in rows.iter().zip(values) {
            target[row] = value;
        }
        Ok(())
    }

    /// Overwrites an existing writable column at the given rows.
    pub fn overwrite(&mut self, name: &str, rows: &[usize], values: &[f64]) -> Result<(), PoolError> {
        self.writable_index(name)?;
        self.write(name, rows, values)
    }

    /// The subject's row at `time`, if any.
    pub fn lookup(&self, subject: usize, time: i64) -> Option<usize> {
        let rows = &self.subjects[subject].rows;
        rows.binary_search_by_key(&time, |&row| self.times[row])
            .ok()
            .map(|position| rows[position])
    }

    /// Rows at `time`, one per subject that has one, in subject order.
    pub fn slice(&self, time: i64) -> Vec<usize> {
        (0..self.subjects.len())
            .filter_map(|subject| self.lookup(subject, time))
            .collect()
    }

    /// Copies every subject's row at `from` into a row at `to` and returns
    /// the created rows in subject order.
    pub fn append_slice(&mut self, from: i64, to: i64) -> Result<Vec<usize>, PoolError> {
        let mut created = Vec::with_capacity(self.subjects.len());
        for subject in 0..self.subjects.len() {
            let Some(source) = self.lookup(subject, from) else {
                continue;
            };
            if self.lookup(subject, to).is_some() {
                return Err(PoolError::DuplicateTime {
                    id: self.subjects[subject].id,
                    time: to,
                });
            }
            let row = self.len();
            self.ids.push(self.subjects[subject].id);
            self.times.push(to);
            self.subject_of.push(subject);
            self.values[0].push(to as f64);
            for column in self.values.iter_mut().skip(1) {
                let copied = column[source];
                column.push(copied);
            }

            let times = &self.times;
            let rows = &mut self.subjects[subject].rows;
            let position = rows.partition_point(|&existing| times[existing] < to);
            rows.insert(position, row);
            created.push(row);
        }
        Ok(created)
    }

    fn rebuild(&self, rows: &[usize], columns: &[usize]) -> Result<Pool, PoolError> {
        let ids = rows.iter().map(|&row| self.ids[row]).collect();
        let times = rows.iter().map(|&row| self.times[row]).collect();
        let kept = columns
            .iter()
            .map(|&column| {
                let values = rows.iter().map(|&row| self.values[column][row]).collect();
                (self.names[column].clone(), values)
            })
            .collect();
        Pool::from_columns(self.id_name.clone(), self.time_name.clone(), ids, times, kept)
    }

    fn data_columns(&self) -> Vec<usize> {
        (1..self.names.len()).collect()
    }

    /// A copy holding only the named columns (plus identifier and time).
    pub fn select(&self, names: &[&str]) -> Result<Pool, PoolError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let column = self.column_index(name)?;
            if column != 0 && !columns.contains(&column) {
                columns.push(column);
            }
        }
        let rows: Vec<usize> = (0..self.len()).collect();
        self.rebuild(&rows, &columns)
    }

    /// A copy holding only rows whose time satisfies `keep`, sorted by
    /// (subject, time).
    pub fn filter_time(&self, keep: impl Fn(i64) -> bool) -> Result<Pool, PoolError> {
        let rows: Vec<usize> = (0..self.len()).filter(|&row| keep(self.times[row])).collect();
        self.rebuild(&rows, &self.data_columns())
    }

    /// Draws `n` subjects with replacement and relabels them `0..n`, copying
    /// every row of each drawn subject.
    pub fn resample_subjects<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Pool, PoolError> {
        if self.subjects.is_empty() {
            return Err(PoolError::NoSubjects);
        }
        let mut ids = Vec::new();
        let mut times = Vec::new();
        let mut source_rows = Vec::new();
        for replicate in 0..n {
            let drawn = &self.subjects[rng.gen_range(0..self.subjects.len())];
            for &row in &drawn.rows {
                ids.push(replicate as SubjectId);
                times.push(self.times[row]);
                source_rows.push(row);
            }
        }
        let columns = self
            .data_columns()
            .into_iter()
            .map(|column| {
                let values = source_rows.iter().map(|&row| self.values[column][row]).collect();
                (self.names[column].clone(), values)
            })
            .collect();
        Pool::from_columns(self.id_name.clone(), self.time_name.clone(), ids, times, columns)
    }

    /// Sorted distinct non-missing values of a column.
    pub fn levels(&self, name: &str) -> Result<Vec<f64>, PoolError> {
        let mut levels: Vec<f64> = self
            .column(name)?
            .iter()
            .copied()
            .filter(|value| !value.is_nan())
            .collect();
        levels.sort_by(f64::total_cmp);
        levels.dedup();
        Ok(levels)
    }

    pub fn min_time(&self) -> Option<i64> {
        self.times.iter().copied().min()
    }

    pub fn max_time(&self) -> Option<i64> {
        self.times.iter().copied().max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn two_subjects() -> Pool {
        Pool::from_columns(
            "id",
            "t0",
            vec![2, 1, 1, 2],
            vec![0, 1, 0, 1],
            vec![("L".to_string(), vec![20.0, 11.0, 10.0, 21.0])],
        )
        .unwrap()
    }

    #[test]
    fn test_rows_are_sorted_by_subject_then_time() {
        let pool = two_subjects();
        assert_eq!(pool.n_subjects(), 2);
        assert_eq!(pool.column("L").unwrap(), &[10.0, 11.0, 20.0, 21.0]);
        assert_eq!(pool.column("t0").unwrap(), &[0.0, 1.0, 0.0, 1.0]);
        assert_eq!(pool.subject_id(0), 1);
        assert_eq!(pool.slice(1), vec![1, 3]);
    }

    #[test]
    fn test_duplicate_time_rejected() {
        let err = Pool::from_columns("id", "t0", vec![1, 1], vec![0, 0], vec![]).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateTime { id: 1, time: 0 }));
    }

    #[test]
    fn test_time_column_is_read_only() {
        let mut pool = two_subjects();
        assert!(matches!(
            pool.set_column("t0", vec![0.0; 4]),
            Err(PoolError::ReservedColumn(_))
        ));
        assert!(matches!(
            pool.overwrite("t0", &[0], &[5.0]),
            Err(PoolError::ReservedColumn(_))
        ));
    }

    #[test]
    fn test_append_slice_copies_previous_row() {
        let mut pool = two_subjects();
        let created = pool.append_slice(1, 2).unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(pool.gather("L", &created).unwrap(), vec![11.0, 21.0]);
        assert_eq!(pool.lookup(0, 2), Some(created[0]));
        assert_eq!(pool.subject_rows(1).last(), Some(&created[1]));
        assert!(matches!(
            pool.append_slice(1, 2),
            Err(PoolError::DuplicateTime { .. })
        ));
    }

    #[test]
    fn test_filter_and_select() {
        let pool = two_subjects();
        let baseline = pool.filter_time(|t| t <= 0).unwrap();
        assert_eq!(baseline.len(), 2);
        assert_eq!(baseline.max_time(), Some(0));
        let selected = pool.select(&["L"]).unwrap();
        assert_eq!(selected.column_names().collect::<Vec<_>>(), vec!["t0", "L"]);
        assert!(pool.select(&["missing"]).is_err());
    }

    #[test]
    fn test_resample_relabels_subjects() {
        let pool = two_subjects();
        let mut rng = StdRng::seed_from_u64(7);
        let resampled = pool.resample_subjects(5, &mut rng).unwrap();
        assert_eq!(resampled.n_subjects(), 5);
        assert_eq!(resampled.len(), 10);
        for subject in 0..5 {
            assert_eq!(resampled.subject_id(subject), subject as SubjectId);
            let rows = resampled.subject_rows(subject);
            let first = resampled.get("L", rows[0]).unwrap();
            assert_eq!(resampled.get("L", rows[1]).unwrap(), first + 1.0);
        }
    }

    #[test]
    fn test_resample_without_subjects_is_an_error() {
        let pool = two_subjects().filter_time(|t| t > 5).unwrap();
        assert!(pool.is_empty());
        let mut rng = StdRng::seed_from_u64(7);
        assert!(matches!(
            pool.resample_subjects(3, &mut rng),
            Err(PoolError::NoSubjects)
        ));
    }

    #[test]
    fn test_levels_skip_missing() {
        let pool = Pool::from_columns(
            "id",
            "t0",
            vec![1, 2, 3],
            vec![0, 0, 0],
            vec![("C".to_string(), vec![2.0, f64::NAN, 1.0])],
        )
        .unwrap();
        assert_eq!(pool.levels("C").unwrap(), vec![1.0, 2.0]);
    }
}
