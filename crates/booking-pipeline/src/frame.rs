//! DataFrame helpers shared by the stages: CSV I/O and conversion to the
//! dense matrices the learners consume.

use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::fs;
use std::path::Path;

/// Check if a DataType is numeric (integer or float).
#[inline]
pub fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

pub fn read_csv(path: &Path) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
}

/// Writes `df` with a header row, creating parent directories.
pub fn write_csv(df: &mut DataFrame, path: &Path) -> PolarsResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)
}

/// Column values as `f64`; nulls become `NaN`.
pub fn column_f64(df: &DataFrame, name: &str) -> PolarsResult<Vec<f64>> {
    let series = df
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

/// Column values as `i64`.
///
/// # Errors
///
/// Fails on nulls and on values that do not cast to an integer.
pub fn column_i64(df: &DataFrame, name: &str) -> PolarsResult<Vec<i64>> {
    let column = df.column(name)?.as_materialized_series();
    let series = column.strict_cast(&DataType::Int64)?;
    series
        .i64()?
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| {
                PolarsError::ComputeError(format!("column '{}' contains nulls", name).into())
            })
        })
        .collect()
}

/// Every column except `label` as a row-major `f64` matrix, with the
/// feature names in frame order.
pub fn features_to_array(df: &DataFrame, label: &str) -> PolarsResult<(Array2<f64>, Vec<String>)> {
    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .filter(|n| n.as_str() != label)
        .map(|n| n.to_string())
        .collect();

    let n_rows = df.height();
    let mut x = Array2::<f64>::zeros((n_rows, names.len()));
    for (j, name) in names.iter().enumerate() {
        let values = column_f64(df, name)?;
        x.column_mut(j).assign(&Array1::from(values));
    }
    Ok((x, names))
}

pub fn labels_to_array(df: &DataFrame, label: &str) -> PolarsResult<Array1<i64>> {
    Ok(Array1::from(column_i64(df, label)?))
}
