//! # Cohort Loading
//!
//! Reads person-time tables (tab-separated, or comma-separated for `.csv`
//! files) into a [`Pool`]. The id and time columns must be complete
//! integers; every other loaded column is numeric, and missing entries
//! become `NaN`.

use crate::pool::{Pool, PoolError};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the column '{0}', which must be complete.")]
    MissingValuesFound(String),
    #[error("The input file contains no rows.")]
    Empty,
    #[error(transparent)]
    Pool(#[from] PoolError),
}

fn separator_for(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => b',',
        _ => b'\t',
    }
}

fn read_tabular(path: &Path) -> Result<DataFrame, DataError> {
    let file = File::open(path)?;
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| options.with_separator(separator_for(path)))
        .into_reader_with_file_handle(file)
        .finish()?;
    Ok(df)
}

fn extract_integer_column(df: &DataFrame, name: &str) -> Result<Vec<i64>, DataError> {
    let series = df
        .column(name)
        .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let wrong_type = || DataError::ColumnWrongType {
        column_name: name.to_string(),
        expected_type: "integer",
        found_type: series.dtype().to_string(),
    };
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }
    let values = casted.f64()?;
    values
        .into_no_null_iter()
        .map(|v| {
            if v.is_finite() && v.fract() == 0.0 {
                Ok(v as i64)
            } else {
                Err(wrong_type())
            }
        })
        .collect()
}

/// Numeric column with nulls as `NaN`. A cast that nulls out present
/// entries means the column holds text.
fn extract_numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let series = df
        .column(name)
        .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
    let wrong_type = || DataError::ColumnWrongType {
        column_name: name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: series.dtype().to_string(),
    };
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| wrong_type())?;
    if casted.null_count() > series.null_count() {
        return Err(wrong_type());
    }
    Ok(casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

/// Loads a person-time table. With an empty `columns` list every numeric
/// column besides `id` and `time` is loaded; otherwise exactly the named
/// ones, each of which must exist.
pub fn load_cohort(
    path: impl AsRef<Path>,
    id: &str,
    time: &str,
    columns: &[String],
) -> Result<Pool, DataError> {
    let path = path.as_ref();
    log::info!("Loading cohort from '{}'", path.display());
    let df = read_tabular(path)?;
    if df.height() == 0 {
        return Err(DataError::Empty);
    }

    let present: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    for required in [id, time].into_iter().chain(columns.iter().map(String::as_str)) {
        if !present.contains(required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let ids = extract_integer_column(&df, id)?;
    let times = extract_integer_column(&df, time)?;

    let mut loaded = Vec::new();
    if columns.is_empty() {
        for name in df.get_column_names() {
            let name = name.to_string();
            if name == id || name == time {
                continue;
            }
            match extract_numeric_column(&df, &name) {
                Ok(values) => loaded.push((name, values)),
                Err(DataError::ColumnWrongType { .. }) => {
                    log::debug!("Skipping non-numeric column '{name}'.");
                }
                Err(e) => return Err(e),
            }
        }
    } else {
        let mut seen = HashSet::new();
        for name in columns {
            if name == id || name == time || !seen.insert(name.as_str()) {
                continue;
            }
            loaded.push((name.clone(), extract_numeric_column(&df, name)?));
        }
    }
    let pool = Pool::from_columns(id, time, ids, times, loaded)?;
    log::info!(
        "Loaded {} rows for {} subjects.",
        pool.len(),
        pool.n_subjects()
    );
    Ok(pool)
}

/// Writes every row of `pool` as a table, id and time first.
pub fn write_pool(pool: &Pool, path: impl AsRef<Path>) -> Result<(), DataError> {
    let path = path.as_ref();
    let rows = 0..pool.len();
    let mut columns: Vec<Column> = vec![
        Series::new(
            pool.id_name().into(),
            rows.clone().map(|row| pool.id(row)).collect::<Vec<i64>>(),
        )
        .into(),
        Series::new(
            pool.time_name().into(),
            rows.map(|row| pool.time(row)).collect::<Vec<i64>>(),
        )
        .into(),
    ];
    for name in pool.column_names().filter(|name| *name != pool.time_name()) {
        let values: Vec<Option<f64>> = pool
            .column(name)?
            .iter()
            .map(|&v| if v.is_nan() { None } else { Some(v) })
            .collect();
        columns.push(Series::new(name.into(), values).into());
    }
    let mut df = DataFrame::new(columns)?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .with_separator(separator_for(path))
        .finish(&mut df)?;
    Ok(())
}
