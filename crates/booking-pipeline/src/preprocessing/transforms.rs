//! Pure DataFrame transforms used by the preprocessing stage.
//!
//! Each function takes a frame by reference and returns a new one; nothing
//! here touches the filesystem.

use crate::error::{PipelineError, Result, ResultExt, Stage};
use crate::frame::{self, is_numeric_dtype};
use booking_learning::{RandomForestClassifier, Smote, class_counts};
use ndarray::Array2;
use polars::prelude::*;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

fn require_columns(df: &DataFrame, columns: &[String], stage: Stage) -> Result<()> {
    let missing: Vec<&str> = columns
        .iter()
        .filter(|c| df.column(c).is_err())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::new(
            stage,
            format!("missing columns: {}", missing.join(", ")),
        ))
    }
}

// =============================================================================
// Cleaning
// =============================================================================

/// Drops `drop_columns`, then exact-duplicate rows (first occurrence kept,
/// order preserved).
pub fn clean(df: &DataFrame, drop_columns: &[String]) -> Result<DataFrame> {
    require_columns(df, drop_columns, Stage::Preprocess)?;
    let dropped = df.drop_many(drop_columns.iter().map(String::as_str));
    let deduped = dropped
        .unique_stable(None, UniqueKeepStrategy::First, None)
        .stage_context(Stage::Preprocess, "Failed to drop duplicate rows")?;
    debug!(
        "Dropped columns {:?} and {} duplicate rows",
        drop_columns,
        dropped.height() - deduped.height()
    );
    Ok(deduped)
}

// =============================================================================
// Categorical encoding
// =============================================================================

/// Sorted distinct values of one categorical column.
#[derive(Debug, Clone, PartialEq)]
pub enum Categories {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

/// Fitted code assignment for one column: the i-th sorted value gets code i.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnEncoding {
    column: String,
    categories: Categories,
}

impl ColumnEncoding {
    fn fit(df: &DataFrame, column: &str) -> Result<Self> {
        let dtype = df
            .column(column)
            .stage_context(Stage::Preprocess, format!("missing column '{}'", column))?
            .dtype();
        let categories = if is_numeric_dtype(dtype) {
            let mut values = numeric_values(df, column)?;
            values.sort_by(f64::total_cmp);
            values.dedup();
            Categories::Numeric(values)
        } else {
            let mut values = text_values(df, column)?;
            values.sort();
            values.dedup();
            Categories::Text(values)
        };
        Ok(Self {
            column: column.to_string(),
            categories,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn len(&self) -> usize {
        match &self.categories {
            Categories::Numeric(v) => v.len(),
            Categories::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Category labels in code order.
    pub fn labels(&self) -> Vec<String> {
        match &self.categories {
            Categories::Numeric(v) => v.iter().map(|x| x.to_string()).collect(),
            Categories::Text(v) => v.clone(),
        }
    }

    /// Code assigned to a category, by its printed label.
    pub fn code_of(&self, label: &str) -> Option<i64> {
        self.labels()
            .iter()
            .position(|l| l == label)
            .map(|p| p as i64)
    }

    fn encode(&self, df: &DataFrame) -> Result<Series> {
        let unseen = |value: String| {
            PipelineError::new(
                Stage::Preprocess,
                format!(
                    "column '{}' has category '{}' not seen during fitting",
                    self.column, value
                ),
            )
        };
        let codes: Vec<i64> = match &self.categories {
            Categories::Numeric(sorted) => numeric_values(df, &self.column)?
                .into_iter()
                .map(|v| {
                    sorted
                        .binary_search_by(|probe| probe.total_cmp(&v))
                        .map(|p| p as i64)
                        .map_err(|_| unseen(v.to_string()))
                })
                .collect::<Result<_>>()?,
            Categories::Text(sorted) => text_values(df, &self.column)?
                .into_iter()
                .map(|v| {
                    sorted
                        .binary_search(&v)
                        .map(|p| p as i64)
                        .map_err(|_| unseen(v))
                })
                .collect::<Result<_>>()?,
        };
        Ok(Series::new(self.column.as_str().into(), codes))
    }
}

impl fmt::Display for ColumnEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .labels()
            .iter()
            .enumerate()
            .map(|(code, label)| format!("{}={}", label, code))
            .collect();
        write!(f, "{}: {{{}}}", self.column, pairs.join(", "))
    }
}

fn numeric_values(df: &DataFrame, column: &str) -> Result<Vec<f64>> {
    let series = df
        .column(column)
        .and_then(|c| c.as_materialized_series().cast(&DataType::Float64))
        .stage_context(Stage::Preprocess, format!("cannot read column '{}'", column))?;
    let ca = series
        .f64()
        .stage_context(Stage::Preprocess, format!("cannot read column '{}'", column))?;
    ca.into_iter()
        .map(|v| {
            v.ok_or_else(|| {
                PipelineError::new(
                    Stage::Preprocess,
                    format!("column '{}' contains missing values", column),
                )
            })
        })
        .collect()
}

fn text_values(df: &DataFrame, column: &str) -> Result<Vec<String>> {
    let series = df
        .column(column)
        .and_then(|c| c.as_materialized_series().cast(&DataType::String))
        .stage_context(Stage::Preprocess, format!("cannot read column '{}'", column))?;
    let ca = series
        .str()
        .stage_context(Stage::Preprocess, format!("cannot read column '{}'", column))?;
    ca.into_iter()
        .map(|v| {
            v.map(str::to_string).ok_or_else(|| {
                PipelineError::new(
                    Stage::Preprocess,
                    format!("column '{}' contains missing values", column),
                )
            })
        })
        .collect()
}

/// Per-column encodings fitted on one frame and reusable on another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingMap {
    encodings: Vec<ColumnEncoding>,
}

impl EncodingMap {
    pub fn get(&self, column: &str) -> Option<&ColumnEncoding> {
        self.encodings.iter().find(|e| e.column == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnEncoding> {
        self.encodings.iter()
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    /// Replaces every encoded column of `df` with its `Int64` codes, in place.
    ///
    /// # Errors
    ///
    /// A preprocess error if a column is absent or holds a category that was
    /// not present when the map was fitted.
    pub fn transform(&self, df: &DataFrame) -> Result<DataFrame> {
        let mut out = df.clone();
        for encoding in &self.encodings {
            let codes = encoding.encode(df)?;
            out.with_column(codes).stage_context(
                Stage::Preprocess,
                format!("failed to replace column '{}'", encoding.column),
            )?;
        }
        Ok(out)
    }
}

/// Fits one encoding per column on `df` and applies it.
pub fn encode_categorical(df: &DataFrame, columns: &[String]) -> Result<(DataFrame, EncodingMap)> {
    require_columns(df, columns, Stage::Preprocess)?;
    let encodings = columns
        .iter()
        .map(|c| ColumnEncoding::fit(df, c))
        .collect::<Result<Vec<_>>>()?;
    let map = EncodingMap { encodings };
    let encoded = map.transform(df)?;
    Ok((encoded, map))
}

// =============================================================================
// Skewness
// =============================================================================

/// Adjusted Fisher-Pearson sample skewness, ignoring `NaN`s.
///
/// `NaN` with fewer than three values and `0.0` for a constant column.
pub fn skewness(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let n = finite.len() as f64;
    if finite.len() < 3 {
        return f64::NAN;
    }
    let mean = finite.iter().sum::<f64>() / n;
    let (mut m2, mut m3) = (0.0, 0.0);
    for v in &finite {
        let d = v - mean;
        m2 += d * d;
        m3 += d * d * d;
    }
    // Round-off from the mean subtraction.
    if m2.abs() < 1e-14 {
        return 0.0;
    }
    if m3.abs() < 1e-14 {
        m3 = 0.0;
    }
    (n * (n - 1.0).sqrt() / (n - 2.0)) * (m3 / m2.powf(1.5))
}

/// Skewness of each listed column, in order.
pub fn column_skewness(df: &DataFrame, columns: &[String]) -> Result<Vec<(String, f64)>> {
    require_columns(df, columns, Stage::Preprocess)?;
    columns
        .iter()
        .map(|c| {
            let values = frame::column_f64(df, c)
                .stage_context(Stage::Preprocess, format!("column '{}' is not numeric", c))?;
            Ok((c.clone(), skewness(&values)))
        })
        .collect()
}

/// Replaces every column whose skewness is strictly above `threshold` with
/// `ln(1 + x)`; returns the new frame and the transformed column names.
pub fn deskew(df: &DataFrame, columns: &[String], threshold: f64) -> Result<(DataFrame, Vec<String>)> {
    let skewed: Vec<String> = column_skewness(df, columns)?
        .into_iter()
        .filter(|(_, skew)| *skew > threshold)
        .map(|(name, _)| name)
        .collect();
    let out = apply_log1p(df, &skewed)?;
    Ok((out, skewed))
}

/// `ln(1 + x)` on each listed column; nulls stay null.
pub fn apply_log1p(df: &DataFrame, columns: &[String]) -> Result<DataFrame> {
    require_columns(df, columns, Stage::Preprocess)?;
    let mut out = df.clone();
    for name in columns {
        let series = df
            .column(name)
            .and_then(|c| c.as_materialized_series().cast(&DataType::Float64))
            .stage_context(Stage::Preprocess, format!("column '{}' is not numeric", name))?;
        let ca = series
            .f64()
            .stage_context(Stage::Preprocess, format!("column '{}' is not numeric", name))?;
        let logged: Float64Chunked = ca.into_iter().map(|v| v.map(f64::ln_1p)).collect();
        out.with_column(logged.with_name(name.as_str().into()).into_series())
            .stage_context(Stage::Preprocess, format!("failed to replace column '{}'", name))?;
    }
    Ok(out)
}

// =============================================================================
// Rebalancing
// =============================================================================

/// SMOTE-oversamples every minority class of `label` up to the majority
/// count. Columns keep their order; features come back as `Float64` and the
/// label as `Int64`, original rows first.
pub fn rebalance(df: &DataFrame, label: &str, k_neighbors: usize, seed: u64) -> Result<DataFrame> {
    if df.column(label).is_err() {
        return Err(PipelineError::new(
            Stage::Balance,
            format!("label column '{}' not found", label),
        ));
    }
    let (x, names) = frame::features_to_array(df, label)
        .stage_context(Stage::Balance, "features are not numeric")?;
    let y = frame::labels_to_array(df, label).stage_context(
        Stage::Balance,
        format!("label column '{}' is not integer-valued", label),
    )?;

    let counts = class_counts(y.iter());
    if counts.len() < 2 {
        return Err(PipelineError::new(
            Stage::Balance,
            format!("need at least 2 classes to rebalance, found {}", counts.len()),
        ));
    }

    let (x_res, y_res) = Smote::new()
        .with_k_neighbors(k_neighbors)
        .with_random_state(seed)
        .fit_resample(&x, &y)
        .stage_context(Stage::Balance, "SMOTE oversampling failed")?;

    rebuild_frame(df, label, &names, &x_res, y_res.to_vec())
        .stage_context(Stage::Balance, "failed to rebuild balanced frame")
}

fn rebuild_frame(
    template: &DataFrame,
    label: &str,
    feature_names: &[String],
    x: &Array2<f64>,
    y: Vec<i64>,
) -> PolarsResult<DataFrame> {
    let mut y = Some(y);
    let mut feature_idx = 0usize;
    let mut columns: Vec<Column> = Vec::with_capacity(template.width());
    for name in template.get_column_names() {
        if name.as_str() == label {
            columns.push(Series::new(name.clone(), y.take().unwrap_or_default()).into());
        } else {
            debug_assert_eq!(feature_names[feature_idx], name.as_str());
            columns.push(Series::new(name.clone(), x.column(feature_idx).to_vec()).into());
            feature_idx += 1;
        }
    }
    DataFrame::new(columns)
}

// =============================================================================
// Feature selection
// =============================================================================

/// Fits `forest` on every non-label column and ranks features by importance,
/// highest first; ties keep column order.
pub fn rank_features(
    df: &DataFrame,
    label: &str,
    forest: &mut RandomForestClassifier,
) -> Result<Vec<(String, f64)>> {
    let (x, names) = frame::features_to_array(df, label)
        .stage_context(Stage::Preprocess, "features are not numeric")?;
    let y = frame::labels_to_array(df, label).stage_context(
        Stage::Preprocess,
        format!("label column '{}' is not integer-valued", label),
    )?;
    forest
        .fit(&x, &y)
        .stage_context(Stage::Preprocess, "feature importance forest failed to fit")?;
    let importances = forest
        .feature_importances()
        .stage_context(Stage::Preprocess, "feature importance forest failed to fit")?;

    let mut ranking: Vec<(String, f64)> = names.into_iter().zip(importances).collect();
    ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    Ok(ranking)
}

/// Keeps the `k` most important features in rank order followed by `label`.
/// Every feature is kept when `k` exceeds the feature count.
pub fn select_top_features(
    df: &DataFrame,
    label: &str,
    k: usize,
    forest: &mut RandomForestClassifier,
) -> Result<(DataFrame, Vec<(String, f64)>)> {
    if df.column(label).is_err() {
        return Err(PipelineError::new(
            Stage::Preprocess,
            format!("label column '{}' not found", label),
        ));
    }
    let ranking = rank_features(df, label, forest)?;
    let mut keep: Vec<String> = ranking.iter().take(k).map(|(n, _)| n.clone()).collect();
    keep.push(label.to_string());

    let selected = df
        .select(keep)
        .stage_context(Stage::Preprocess, "failed to select top features")?;
    Ok((selected, ranking))
}

/// Projects `df` onto exactly `columns`, in that order.
pub fn mirror_columns(df: &DataFrame, columns: &[String]) -> Result<DataFrame> {
    require_columns(df, columns, Stage::Preprocess)?;
    df.select(columns.iter().cloned())
        .stage_context(Stage::Preprocess, "failed to mirror column set")
}
