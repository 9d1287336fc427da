//! Error types for the booking-learning crate.
//!
//! This module defines [`LearningError`], the error type returned by every
//! fallible learner, sampler and search routine in the crate.
//!
//! # Example
//!
//! ```
//! use booking_learning::{GbdtParams, LearningError};
//!
//! fn params() -> Result<GbdtParams, LearningError> {
//!     GbdtParams::builder().n_estimators(50).learning_rate(0.1).build()
//! }
//! # params().unwrap();
//! ```

use thiserror::Error;

/// The main error type for booking-learning operations.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// without breaking downstream matches.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LearningError {
    /// A hyperparameter or search setting is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Training or inference data cannot be used as given.
    ///
    /// Common causes:
    /// - empty feature matrix
    /// - fewer than two classes
    /// - non-finite feature values
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Feature matrix and label vector (or a fitted model) disagree on shape.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// What the caller was required to provide.
        expected: String,
        /// What the caller actually provided.
        actual: String,
    },

    /// `predict` or `feature_importances` was called before `fit`.
    #[error("Model is not fitted")]
    NotFitted,

    /// A search candidate named a hyperparameter the booster does not have,
    /// or gave it a value of the wrong kind.
    #[error("Unknown or mistyped hyperparameter '{0}'")]
    UnknownParameter(String),

    /// Fitting failed for a reason other than invalid input.
    #[error("Training failed: {0}")]
    TrainingFailed(String),

    /// The model file does not exist.
    #[error("Model not found: {path}")]
    ModelNotFound {
        /// The path that was not found.
        path: String,
    },

    /// I/O error during model save/load.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Model (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LearningError {
    /// Stable code for log lines and callers that branch on error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::InvalidData(_) => "INVALID_DATA",
            Self::ShapeMismatch { .. } => "SHAPE_MISMATCH",
            Self::NotFitted => "NOT_FITTED",
            Self::UnknownParameter(_) => "UNKNOWN_PARAMETER",
            Self::TrainingFailed(_) => "TRAINING_FAILED",
            Self::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Result type alias for learning operations.
pub type Result<T> = std::result::Result<T, LearningError>;

/// Checks that `x` has one row per label.
pub(crate) fn check_xy<A>(n_rows: usize, labels: &[A]) -> Result<()> {
    if n_rows == 0 {
        return Err(LearningError::InvalidData(
            "feature matrix has no rows".to_string(),
        ));
    }
    if n_rows != labels.len() {
        return Err(LearningError::ShapeMismatch {
            expected: format!("{} labels", n_rows),
            actual: format!("{} labels", labels.len()),
        });
    }
    Ok(())
}

/// Rejects NaN and infinite feature values.
pub(crate) fn check_finite(x: &ndarray::Array2<f64>) -> Result<()> {
    match x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, col), value)) => Err(LearningError::InvalidData(format!(
            "non-finite value {} at row {}, column {}",
            value, row, col
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(LearningError::NotFitted.error_code(), "NOT_FITTED");
        assert_eq!(
            LearningError::UnknownParameter("alpha".to_string()).error_code(),
            "UNKNOWN_PARAMETER"
        );
    }

    #[test]
    fn test_check_xy() {
        assert!(check_xy(3, &[0, 1, 0]).is_ok());
        assert!(matches!(
            check_xy(3, &[0, 1]),
            Err(LearningError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            check_xy::<i64>(0, &[]),
            Err(LearningError::InvalidData(_))
        ));
    }

    #[test]
    fn test_check_finite() {
        let ok = ndarray::array![[1.0, 2.0]];
        let bad = ndarray::array![[1.0, f64::INFINITY]];
        assert!(check_finite(&ok).is_ok());
        assert!(check_finite(&bad).unwrap_err().to_string().contains("column 1"));
    }

    #[test]
    fn test_display_model_not_found() {
        let err = LearningError::ModelNotFound {
            path: "missing.pkl".to_string(),
        };
        assert!(err.to_string().contains("missing.pkl"));
    }
}
