//! Hyperparameters of the gradient-boosted classifier.
//!
//! Names and defaults follow the LightGBM scikit-learn wrapper so that a
//! search space written for it (`n_estimators`, `num_leaves`,
//! `boosting_type`, ...) applies unchanged.

use crate::error::{LearningError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Boosting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoostingType {
    /// Plain gradient boosting.
    #[default]
    Gbdt,
    /// Gradient-based one-side sampling.
    Goss,
    /// Dropout trees.
    Dart,
}

impl BoostingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoostingType::Gbdt => "gbdt",
            BoostingType::Goss => "goss",
            BoostingType::Dart => "dart",
        }
    }
}

impl fmt::Display for BoostingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoostingType {
    type Err = LearningError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gbdt" | "gbrt" => Ok(BoostingType::Gbdt),
            "goss" => Ok(BoostingType::Goss),
            "dart" => Ok(BoostingType::Dart),
            other => Err(LearningError::InvalidConfig(format!(
                "unknown boosting_type '{}', expected one of: gbdt, goss, dart",
                other
            ))),
        }
    }
}

/// A single hyperparameter value, as sampled by a search or logged to a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn as_f64(&self, name: &str) -> Result<f64> {
        match self {
            ParamValue::Int(v) => Ok(*v as f64),
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Text(_) => Err(LearningError::UnknownParameter(name.to_string())),
        }
    }

    fn as_i64(&self, name: &str) -> Result<i64> {
        match self {
            ParamValue::Int(v) => Ok(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Ok(*v as i64),
            _ => Err(LearningError::UnknownParameter(name.to_string())),
        }
    }

    fn as_usize(&self, name: &str) -> Result<usize> {
        usize::try_from(self.as_i64(name)?).map_err(|_| {
            LearningError::InvalidConfig(format!("{} must not be negative", name))
        })
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Hyperparameters for [`GradientBoostedClassifier`](super::GradientBoostedClassifier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbdtParams {
    pub boosting_type: BoostingType,
    /// Number of boosting rounds (default: 100).
    pub n_estimators: usize,
    /// Shrinkage applied to every tree (default: 0.1).
    pub learning_rate: f64,
    /// Maximum leaves per tree (default: 31).
    pub num_leaves: usize,
    /// Maximum tree depth; `<= 0` means unlimited (default: -1).
    pub max_depth: i64,
    /// Minimum rows per leaf (default: 20).
    pub min_child_samples: usize,
    /// Minimum hessian sum per leaf (default: 1e-3).
    pub min_child_weight: f64,
    pub min_split_gain: f64,
    /// L1 leaf regularisation.
    pub reg_alpha: f64,
    /// L2 leaf regularisation.
    pub reg_lambda: f64,
    /// Row bagging fraction, active when `subsample_freq > 0`.
    pub subsample: f64,
    pub subsample_freq: usize,
    /// Fraction of features each tree may split on.
    pub colsample_bytree: f64,
    /// Histogram bins per feature, at most 255.
    pub max_bin: usize,
    /// GOSS: fraction of rows kept by gradient magnitude.
    pub top_rate: f64,
    /// GOSS: fraction of the remaining rows sampled at random.
    pub other_rate: f64,
    /// DART: probability of dropping each existing tree.
    pub drop_rate: f64,
    /// DART: cap on trees dropped per round.
    pub max_drop: usize,
    /// DART: probability of skipping dropout for a round.
    pub skip_drop: f64,
    pub random_state: u64,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            boosting_type: BoostingType::Gbdt,
            n_estimators: 100,
            learning_rate: 0.1,
            num_leaves: 31,
            max_depth: -1,
            min_child_samples: 20,
            min_child_weight: 1e-3,
            min_split_gain: 0.0,
            reg_alpha: 0.0,
            reg_lambda: 0.0,
            subsample: 1.0,
            subsample_freq: 0,
            colsample_bytree: 1.0,
            max_bin: 255,
            top_rate: 0.2,
            other_rate: 0.1,
            drop_rate: 0.1,
            max_drop: 50,
            skip_drop: 0.5,
            random_state: 42,
        }
    }
}

fn check_fraction(name: &str, value: f64, allow_zero: bool) -> Result<()> {
    let ok = if allow_zero {
        (0.0..=1.0).contains(&value)
    } else {
        value > 0.0 && value <= 1.0
    };
    if ok {
        Ok(())
    } else {
        Err(LearningError::InvalidConfig(format!(
            "{} must be in {}0.0, 1.0], got {}",
            name,
            if allow_zero { "[" } else { "(" },
            value
        )))
    }
}

impl GbdtParams {
    #[must_use]
    pub fn builder() -> GbdtParamsBuilder {
        GbdtParamsBuilder::default()
    }

    /// # Errors
    ///
    /// Returns [`LearningError::InvalidConfig`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(LearningError::InvalidConfig(
                "n_estimators must be at least 1".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(LearningError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(2..=u16::MAX as usize).contains(&self.num_leaves) {
            return Err(LearningError::InvalidConfig(format!(
                "num_leaves must be in [2, {}], got {}",
                u16::MAX,
                self.num_leaves
            )));
        }
        if self.min_child_samples == 0 {
            return Err(LearningError::InvalidConfig(
                "min_child_samples must be at least 1".to_string(),
            ));
        }
        if self.reg_alpha < 0.0 || self.reg_lambda < 0.0 || self.min_child_weight < 0.0 {
            return Err(LearningError::InvalidConfig(
                "reg_alpha, reg_lambda and min_child_weight must not be negative".to_string(),
            ));
        }
        if !(2..=255).contains(&self.max_bin) {
            return Err(LearningError::InvalidConfig(format!(
                "max_bin must be in [2, 255], got {}",
                self.max_bin
            )));
        }
        check_fraction("subsample", self.subsample, false)?;
        check_fraction("colsample_bytree", self.colsample_bytree, false)?;
        check_fraction("top_rate", self.top_rate, false)?;
        check_fraction("other_rate", self.other_rate, false)?;
        check_fraction("drop_rate", self.drop_rate, true)?;
        check_fraction("skip_drop", self.skip_drop, true)?;
        if self.boosting_type == BoostingType::Goss && self.top_rate + self.other_rate > 1.0 {
            return Err(LearningError::InvalidConfig(
                "top_rate + other_rate must not exceed 1.0 for goss".to_string(),
            ));
        }
        Ok(())
    }

    /// Assigns one hyperparameter by name.
    ///
    /// # Errors
    ///
    /// [`LearningError::UnknownParameter`] for unknown names or values of the
    /// wrong kind; [`LearningError::InvalidConfig`] for bad boosting types.
    pub fn set(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        match name {
            "boosting_type" => match value {
                ParamValue::Text(s) => self.boosting_type = s.parse()?,
                _ => return Err(LearningError::UnknownParameter(name.to_string())),
            },
            "n_estimators" => self.n_estimators = value.as_usize(name)?,
            "learning_rate" => self.learning_rate = value.as_f64(name)?,
            "num_leaves" => self.num_leaves = value.as_usize(name)?,
            "max_depth" => self.max_depth = value.as_i64(name)?,
            "min_child_samples" => self.min_child_samples = value.as_usize(name)?,
            "min_child_weight" => self.min_child_weight = value.as_f64(name)?,
            "min_split_gain" => self.min_split_gain = value.as_f64(name)?,
            "reg_alpha" => self.reg_alpha = value.as_f64(name)?,
            "reg_lambda" => self.reg_lambda = value.as_f64(name)?,
            "subsample" => self.subsample = value.as_f64(name)?,
            "subsample_freq" => self.subsample_freq = value.as_usize(name)?,
            "colsample_bytree" => self.colsample_bytree = value.as_f64(name)?,
            "max_bin" => self.max_bin = value.as_usize(name)?,
            "top_rate" => self.top_rate = value.as_f64(name)?,
            "other_rate" => self.other_rate = value.as_f64(name)?,
            "drop_rate" => self.drop_rate = value.as_f64(name)?,
            "max_drop" => self.max_drop = value.as_usize(name)?,
            "skip_drop" => self.skip_drop = value.as_f64(name)?,
            "random_state" => self.random_state = value.as_usize(name)? as u64,
            _ => return Err(LearningError::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    /// Flat name → value view of every hyperparameter, for logging.
    pub fn to_param_map(&self) -> BTreeMap<String, ParamValue> {
        let entries: [(&str, ParamValue); 20] = [
            ("boosting_type", self.boosting_type.as_str().into()),
            ("n_estimators", (self.n_estimators as i64).into()),
            ("learning_rate", self.learning_rate.into()),
            ("num_leaves", (self.num_leaves as i64).into()),
            ("max_depth", self.max_depth.into()),
            ("min_child_samples", (self.min_child_samples as i64).into()),
            ("min_child_weight", self.min_child_weight.into()),
            ("min_split_gain", self.min_split_gain.into()),
            ("reg_alpha", self.reg_alpha.into()),
            ("reg_lambda", self.reg_lambda.into()),
            ("subsample", self.subsample.into()),
            ("subsample_freq", (self.subsample_freq as i64).into()),
            ("colsample_bytree", self.colsample_bytree.into()),
            ("max_bin", (self.max_bin as i64).into()),
            ("top_rate", self.top_rate.into()),
            ("other_rate", self.other_rate.into()),
            ("drop_rate", self.drop_rate.into()),
            ("max_drop", (self.max_drop as i64).into()),
            ("skip_drop", self.skip_drop.into()),
            ("random_state", (self.random_state as i64).into()),
        ];
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Builder for [`GbdtParams`].
#[derive(Debug, Clone, Default)]
pub struct GbdtParamsBuilder {
    params: GbdtParams,
}

impl GbdtParamsBuilder {
    #[must_use]
    pub fn boosting_type(mut self, boosting_type: BoostingType) -> Self {
        self.params.boosting_type = boosting_type;
        self
    }

    #[must_use]
    pub fn n_estimators(mut self, n: usize) -> Self {
        self.params.n_estimators = n;
        self
    }

    #[must_use]
    pub fn learning_rate(mut self, rate: f64) -> Self {
        self.params.learning_rate = rate;
        self
    }

    #[must_use]
    pub fn num_leaves(mut self, n: usize) -> Self {
        self.params.num_leaves = n;
        self
    }

    #[must_use]
    pub fn max_depth(mut self, depth: i64) -> Self {
        self.params.max_depth = depth;
        self
    }

    #[must_use]
    pub fn min_child_samples(mut self, n: usize) -> Self {
        self.params.min_child_samples = n;
        self
    }

    #[must_use]
    pub fn reg_lambda(mut self, lambda: f64) -> Self {
        self.params.reg_lambda = lambda;
        self
    }

    /// Enables row bagging every `freq` rounds.
    #[must_use]
    pub fn subsample(mut self, fraction: f64, freq: usize) -> Self {
        self.params.subsample = fraction;
        self.params.subsample_freq = freq;
        self
    }

    #[must_use]
    pub fn colsample_bytree(mut self, fraction: f64) -> Self {
        self.params.colsample_bytree = fraction;
        self
    }

    #[must_use]
    pub fn random_state(mut self, seed: u64) -> Self {
        self.params.random_state = seed;
        self
    }

    /// # Errors
    ///
    /// See [`GbdtParams::validate`].
    pub fn build(self) -> Result<GbdtParams> {
        self.params.validate()?;
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let params = GbdtParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.num_leaves, 31);
        assert_eq!(params.min_child_samples, 20);
    }

    #[test]
    fn test_builder_rejects_zero_estimators() {
        let err = GbdtParams::builder().n_estimators(0).build().unwrap_err();
        assert!(err.to_string().contains("n_estimators"));
    }

    #[test]
    fn test_builder_rejects_bad_fraction() {
        assert!(GbdtParams::builder().colsample_bytree(0.0).build().is_err());
        assert!(GbdtParams::builder().subsample(1.5, 1).build().is_err());
    }

    #[test]
    fn test_set_by_name() {
        let mut params = GbdtParams::default();
        params.set("n_estimators", &ParamValue::Int(250)).unwrap();
        params.set("learning_rate", &ParamValue::Float(0.05)).unwrap();
        params.set("boosting_type", &ParamValue::from("dart")).unwrap();
        params.set("max_depth", &ParamValue::Int(7)).unwrap();

        assert_eq!(params.n_estimators, 250);
        assert_eq!(params.learning_rate, 0.05);
        assert_eq!(params.boosting_type, BoostingType::Dart);
        assert_eq!(params.max_depth, 7);
    }

    #[test]
    fn test_set_rejects_unknown_and_mistyped() {
        let mut params = GbdtParams::default();
        assert!(matches!(
            params.set("n_trees", &ParamValue::Int(3)),
            Err(LearningError::UnknownParameter(_))
        ));
        assert!(matches!(
            params.set("num_leaves", &ParamValue::from("many")),
            Err(LearningError::UnknownParameter(_))
        ));
        assert!(params.set("boosting_type", &ParamValue::from("rf")).is_err());
    }

    #[test]
    fn test_param_map_contains_search_keys() {
        let map = GbdtParams::default().to_param_map();
        for key in [
            "n_estimators",
            "max_depth",
            "learning_rate",
            "num_leaves",
            "boosting_type",
        ] {
            assert!(map.contains_key(key), "missing {}", key);
        }
        assert_eq!(map["boosting_type"], ParamValue::Text("gbdt".to_string()));
    }

    #[test]
    fn test_param_value_serde_untagged() {
        let json = serde_json::to_string(&ParamValue::Int(5)).unwrap();
        assert_eq!(json, "5");
        let parsed: ParamValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(parsed, ParamValue::Float(0.25));
        let parsed: ParamValue = serde_json::from_str("\"goss\"").unwrap();
        assert_eq!(parsed, ParamValue::Text("goss".to_string()));
    }
}
