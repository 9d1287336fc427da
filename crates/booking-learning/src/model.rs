//! Trained model wrapper for inference and persistence.
//!
//! [`TrainedModel`] bundles the fitted booster with what is needed to use it
//! later: the ordered feature names it expects, the target column it
//! predicts, and the hyperparameters it was trained with.
//!
//! # Serialization Formats
//!
//! | Method | Use Case |
//! |--------|----------|
//! | [`save()`](TrainedModel::save) / [`load()`](TrainedModel::load) | File-based persistence |
//! | [`to_bytes()`](TrainedModel::to_bytes) / [`from_bytes()`](TrainedModel::from_bytes) | Database or network transfer |
//!
//! Models are stored as JSON regardless of the file extension. Floats are
//! written in shortest round-trip form, so a reloaded model reproduces the
//! original predictions bit for bit.

use crate::boosting::{GradientBoostedClassifier, ParamValue};
use crate::error::{LearningError, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A fitted classifier ready for inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    estimator: GradientBoostedClassifier,
    feature_names: Vec<String>,
    target_column: String,
}

impl TrainedModel {
    /// # Errors
    ///
    /// [`LearningError::NotFitted`] for an unfitted estimator and
    /// [`LearningError::ShapeMismatch`] when the feature names do not match
    /// the estimator's input width.
    pub fn new(
        estimator: GradientBoostedClassifier,
        feature_names: Vec<String>,
        target_column: impl Into<String>,
    ) -> Result<Self> {
        if !estimator.is_fitted() {
            return Err(LearningError::NotFitted);
        }
        if feature_names.len() != estimator.n_features() {
            return Err(LearningError::ShapeMismatch {
                expected: format!("{} feature names", estimator.n_features()),
                actual: format!("{} feature names", feature_names.len()),
            });
        }
        Ok(Self {
            estimator,
            feature_names,
            target_column: target_column.into(),
        })
    }

    pub fn estimator(&self) -> &GradientBoostedClassifier {
        &self.estimator
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn target_column(&self) -> &str {
        &self.target_column
    }

    /// Flat hyperparameter map of the underlying booster.
    pub fn hyperparameters(&self) -> BTreeMap<String, ParamValue> {
        self.estimator.params().to_param_map()
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<i64>> {
        self.estimator.predict(x)
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.estimator.predict_proba(x)
    }

    /// Writes the model to `path`, creating parent directories and
    /// replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// # Errors
    ///
    /// [`LearningError::ModelNotFound`] when `path` does not exist.
    #[must_use = "returns the loaded model; use it or handle the error"]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LearningError::ModelNotFound {
                path: path.display().to_string(),
            });
        }
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

static_assertions::assert_impl_all!(TrainedModel: Send, Sync);
