//! Pipeline configuration.
//!
//! The configuration document is YAML with one section per stage. Sections
//! are parsed leniently (every key optional) and each stage resolves its own
//! section into validated settings when it is constructed, reporting
//! missing or invalid keys with that stage's error kind.
//!
//! ```yaml
//! data_ingestion:
//!   bucket_name: my_bucket67
//!   bucket_file_name: Hotel_Reservations.csv
//!   train_ratio: 0.8
//!
//! data preprocessing:
//!   categorical_columns: [type_of_meal_plan, booking_status]
//!   numerical_columns: [lead_time, avg_price_per_room]
//!   skewness_threshold: 5
//!   num_feature: 10
//! ```

use crate::error::{PipelineError, Result, Stage};
use booking_learning::{ParamDistribution, ParamSpace, ParamValue, Scoring, SearchConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default label column of the hotel reservations dataset.
pub const DEFAULT_LABEL_COLUMN: &str = "booking_status";

/// Label value scored as the positive class unless a code is configured.
pub const DEFAULT_POSITIVE_LABEL: &str = "Canceled";

// =============================================================================
// Document
// =============================================================================

/// The whole configuration document, one optional section per stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub data_ingestion: Option<IngestionSection>,

    #[serde(default, rename = "data preprocessing")]
    pub data_preprocessing: Option<PreprocessingSection>,

    #[serde(default)]
    pub model_training: Option<TrainingSection>,

    #[serde(default)]
    pub tracking: Option<TrackingSection>,
}

impl PipelineConfig {
    /// Reads and parses a YAML document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::config_with_source(
                format!("cannot read config file {}", path.display()),
                e,
            )
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // An empty document parses as YAML null.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::config_with_source("malformed YAML document", e))
    }

    pub fn ingestion(&self) -> Result<IngestionSettings> {
        self.data_ingestion.clone().unwrap_or_default().resolve()
    }

    pub fn preprocessing(&self) -> Result<PreprocessingSettings> {
        self.data_preprocessing.clone().unwrap_or_default().resolve()
    }

    pub fn training(&self) -> Result<TrainingSettings> {
        self.model_training.clone().unwrap_or_default().resolve()
    }

    pub fn tracking(&self) -> TrackingSettings {
        self.tracking.clone().unwrap_or_default().resolve()
    }
}

fn missing(stage: Stage, section: &str, key: &str) -> PipelineError {
    PipelineError::new(
        stage,
        format!("missing configuration key '{}.{}'", section, key),
    )
}

// =============================================================================
// Ingestion
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionSection {
    pub bucket_name: Option<String>,
    pub bucket_file_name: Option<String>,
    pub train_ratio: Option<f64>,
    /// Directory standing in for the object store (`<root>/<bucket>/<object>`).
    pub local_root: Option<PathBuf>,
    pub random_state: Option<u64>,
}

/// Validated ingestion settings.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionSettings {
    pub bucket_name: String,
    pub file_name: String,
    pub train_ratio: f64,
    pub local_root: Option<PathBuf>,
    pub random_state: u64,
}

impl IngestionSection {
    pub fn resolve(self) -> Result<IngestionSettings> {
        const SECTION: &str = "data_ingestion";
        let bucket_name = self
            .bucket_name
            .ok_or_else(|| missing(Stage::Ingestion, SECTION, "bucket_name"))?;
        let file_name = self
            .bucket_file_name
            .ok_or_else(|| missing(Stage::Ingestion, SECTION, "bucket_file_name"))?;
        let train_ratio = self
            .train_ratio
            .ok_or_else(|| missing(Stage::Ingestion, SECTION, "train_ratio"))?;

        if !(train_ratio > 0.0 && train_ratio < 1.0) {
            return Err(PipelineError::new(
                Stage::Ingestion,
                format!("train_ratio must be in (0, 1), got {}", train_ratio),
            ));
        }

        Ok(IngestionSettings {
            bucket_name,
            file_name,
            train_ratio,
            local_root: self.local_root,
            random_state: self.random_state.unwrap_or(42),
        })
    }
}

// =============================================================================
// Preprocessing
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingSection {
    pub categorical_columns: Option<Vec<String>>,
    pub numerical_columns: Option<Vec<String>>,
    pub skewness_threshold: Option<f64>,
    pub num_feature: Option<usize>,
    pub label_column: Option<String>,
    pub drop_columns: Option<Vec<String>>,
    pub random_state: Option<u64>,
    pub forest_estimators: Option<usize>,
    pub smote_neighbors: Option<usize>,
}

/// Validated preprocessing settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingSettings {
    pub categorical_columns: Vec<String>,
    pub numerical_columns: Vec<String>,
    pub skewness_threshold: f64,
    pub num_features: usize,
    pub label_column: String,
    pub drop_columns: Vec<String>,
    pub random_state: u64,
    pub forest_estimators: usize,
    pub smote_neighbors: usize,
}

impl PreprocessingSection {
    pub fn resolve(self) -> Result<PreprocessingSettings> {
        const SECTION: &str = "data preprocessing";
        let categorical_columns = self
            .categorical_columns
            .ok_or_else(|| missing(Stage::Preprocess, SECTION, "categorical_columns"))?;
        let numerical_columns = self
            .numerical_columns
            .ok_or_else(|| missing(Stage::Preprocess, SECTION, "numerical_columns"))?;
        let skewness_threshold = self
            .skewness_threshold
            .ok_or_else(|| missing(Stage::Preprocess, SECTION, "skewness_threshold"))?;
        let num_features = self
            .num_feature
            .ok_or_else(|| missing(Stage::Preprocess, SECTION, "num_feature"))?;

        if num_features == 0 {
            return Err(PipelineError::new(
                Stage::Preprocess,
                "num_feature must be at least 1",
            ));
        }
        let forest_estimators = self.forest_estimators.unwrap_or(100);
        if forest_estimators == 0 {
            return Err(PipelineError::new(
                Stage::Preprocess,
                "forest_estimators must be at least 1",
            ));
        }
        let smote_neighbors = self.smote_neighbors.unwrap_or(5);
        if smote_neighbors == 0 {
            return Err(PipelineError::new(
                Stage::Preprocess,
                "smote_neighbors must be at least 1",
            ));
        }

        Ok(PreprocessingSettings {
            categorical_columns,
            numerical_columns,
            skewness_threshold,
            num_features,
            label_column: self
                .label_column
                .unwrap_or_else(|| DEFAULT_LABEL_COLUMN.to_string()),
            drop_columns: self
                .drop_columns
                .unwrap_or_else(|| vec!["Booking_ID".to_string()]),
            random_state: self.random_state.unwrap_or(42),
            forest_estimators,
            smote_neighbors,
        })
    }
}

// =============================================================================
// Training
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    pub target_column: Option<String>,
    pub positive_label: Option<String>,
    pub positive_class: Option<i64>,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub param_distributions: Option<ParamSpace>,
    pub random_search: Option<SearchSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSection {
    pub n_iter: Option<usize>,
    pub cv: Option<usize>,
    pub n_jobs: Option<i32>,
    pub verbose: Option<u8>,
    pub random_state: Option<u64>,
    pub scoring: Option<Scoring>,
}

/// Validated training settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSettings {
    pub target_column: String,
    /// Raw label scored as the positive class.
    pub positive_label: String,
    /// Encoded positive class, when configured directly.
    pub positive_class: Option<i64>,
    pub param_space: ParamSpace,
    pub search: SearchConfig,
}

/// Search space the booking model is tuned over unless configured otherwise.
pub fn default_param_space() -> ParamSpace {
    ParamSpace::new()
        .with("n_estimators", ParamDistribution::Randint(100, 500))
        .with("max_depth", ParamDistribution::Randint(5, 50))
        .with("learning_rate", ParamDistribution::Uniform(0.01, 0.2))
        .with("num_leaves", ParamDistribution::Randint(20, 100))
        .with(
            "boosting_type",
            ParamDistribution::Choice(vec![
                ParamValue::from("gbdt"),
                ParamValue::from("dart"),
                ParamValue::from("goss"),
            ]),
        )
}

impl TrainingSection {
    pub fn resolve(self) -> Result<TrainingSettings> {
        let defaults = SearchConfig::default();
        let section = self.random_search.unwrap_or_default();
        let search = SearchConfig {
            n_iter: section.n_iter.unwrap_or(defaults.n_iter),
            cv: section.cv.unwrap_or(defaults.cv),
            n_jobs: section.n_jobs.unwrap_or(defaults.n_jobs),
            verbose: section.verbose.unwrap_or(defaults.verbose),
            random_state: section.random_state.unwrap_or(defaults.random_state),
            scoring: section.scoring.unwrap_or(defaults.scoring),
            // Replaced by the code of `positive_label` once the label encoding is fitted.
            positive_class: self.positive_class.unwrap_or(0),
        };
        search
            .validate()
            .map_err(|e| PipelineError::with_source(Stage::Training, "invalid random_search", e))?;

        let param_space = self.param_distributions.unwrap_or_else(default_param_space);
        param_space.validate().map_err(|e| {
            PipelineError::with_source(Stage::Training, "invalid param_distributions", e)
        })?;

        Ok(TrainingSettings {
            target_column: self
                .target_column
                .unwrap_or_else(|| DEFAULT_LABEL_COLUMN.to_string()),
            positive_label: self
                .positive_label
                .unwrap_or_else(|| DEFAULT_POSITIVE_LABEL.to_string()),
            positive_class: self.positive_class,
            param_space,
            search,
        })
    }
}

// =============================================================================
// Tracking
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSection {
    pub root: Option<PathBuf>,
    pub experiment_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSettings {
    pub root: PathBuf,
    pub experiment_name: String,
}

impl TrackingSection {
    pub fn resolve(self) -> TrackingSettings {
        TrackingSettings {
            root: self.root.unwrap_or_else(|| PathBuf::from("mlruns")),
            experiment_name: self
                .experiment_name
                .unwrap_or_else(|| "Default".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOTEL_CONFIG: &str = r#"
data_ingestion:
  bucket_name: "my_bucket67"
  bucket_file_name: "Hotel_Reservations.csv"
  train_ratio: 0.8

data preprocessing:
  categorical_columns:
    - type_of_meal_plan
    - booking_status
  numerical_columns:
    - lead_time
    - avg_price_per_room
  skewness_threshold: 5
  num_feature: 10
"#;

    #[test]
    fn test_parse_hotel_config() {
        let config = PipelineConfig::from_yaml_str(HOTEL_CONFIG).unwrap();

        let ingestion = config.ingestion().unwrap();
        assert_eq!(ingestion.bucket_name, "my_bucket67");
        assert_eq!(ingestion.file_name, "Hotel_Reservations.csv");
        assert_eq!(ingestion.train_ratio, 0.8);
        assert_eq!(ingestion.local_root, None);
        assert_eq!(ingestion.random_state, 42);

        let prep = config.preprocessing().unwrap();
        assert_eq!(prep.categorical_columns, vec!["type_of_meal_plan", "booking_status"]);
        assert_eq!(prep.skewness_threshold, 5.0);
        assert_eq!(prep.num_features, 10);
        assert_eq!(prep.label_column, "booking_status");
        assert_eq!(prep.drop_columns, vec!["Booking_ID"]);
        assert_eq!(prep.forest_estimators, 100);
        assert_eq!(prep.smote_neighbors, 5);
    }

    #[test]
    fn test_training_defaults() {
        let config = PipelineConfig::from_yaml_str(HOTEL_CONFIG).unwrap();
        let training = config.training().unwrap();

        assert_eq!(training.target_column, "booking_status");
        assert_eq!(training.param_space, default_param_space());
        assert_eq!(training.search.n_iter, 4);
        assert_eq!(training.search.cv, 2);
        assert_eq!(training.search.n_jobs, -1);
        assert_eq!(training.search.scoring, Scoring::Accuracy);
        assert_eq!(training.positive_label, "Canceled");
        assert_eq!(training.positive_class, None);

        let tracking = config.tracking();
        assert_eq!(tracking.root, PathBuf::from("mlruns"));
        assert_eq!(tracking.experiment_name, "Default");
    }

    #[test]
    fn test_training_overrides() {
        let yaml = r#"
model_training:
  positive_class: 1
  param_distributions:
    n_estimators: {randint: [10, 20]}
    learning_rate: {uniform: [0.05, 0.1]}
    boosting_type: {choice: [gbdt]}
  random_search:
    n_iter: 2
    cv: 3
    n_jobs: 1
    scoring: f1
"#;
        let training = PipelineConfig::from_yaml_str(yaml).unwrap().training().unwrap();
        assert_eq!(training.search.n_iter, 2);
        assert_eq!(training.search.cv, 3);
        assert_eq!(training.search.scoring, Scoring::F1);
        assert_eq!(training.positive_class, Some(1));
        assert_eq!(training.search.positive_class, 1);
        assert_eq!(
            training.param_space.get("n_estimators"),
            Some(&ParamDistribution::Randint(10, 20))
        );
        assert_eq!(training.param_space.len(), 3);
    }

    #[test]
    fn test_missing_num_feature_is_preprocess_error() {
        let yaml = HOTEL_CONFIG.replace("  num_feature: 10\n", "");
        let config = PipelineConfig::from_yaml_str(&yaml).unwrap();
        let err = config.preprocessing().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Preprocess));
        assert!(err.to_string().contains("num_feature"));
        // Other sections are unaffected.
        assert!(config.ingestion().is_ok());
    }

    #[test]
    fn test_missing_section_reports_stage() {
        let config = PipelineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.ingestion().unwrap_err().stage(), Some(Stage::Ingestion));
        assert_eq!(config.preprocessing().unwrap_err().stage(), Some(Stage::Preprocess));
        // Training and tracking are fully defaulted.
        assert!(config.training().is_ok());
    }

    #[test]
    fn test_invalid_ratio() {
        let yaml = HOTEL_CONFIG.replace("train_ratio: 0.8", "train_ratio: 1.5");
        let err = PipelineConfig::from_yaml_str(&yaml).unwrap().ingestion().unwrap_err();
        assert_eq!(err.error_code(), "INGESTION_ERROR");
    }

    #[test]
    fn test_invalid_search_is_training_error() {
        let yaml = "model_training:\n  random_search:\n    cv: 1\n";
        let err = PipelineConfig::from_yaml_str(yaml).unwrap().training().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Training));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = PipelineConfig::from_yaml_str("data_ingestion: [unclosed").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::from_path("/no/such/config.yaml").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
