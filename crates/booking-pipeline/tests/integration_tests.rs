//! Integration tests for the booking cancellation pipeline.
//!
//! Every test runs offline: the raw dataset is served from a temporary
//! directory through the local object store.

use booking_learning::{ClassificationMetrics, TrainedModel, class_counts};
use booking_pipeline::config::IngestionSettings;
use booking_pipeline::frame;
use booking_pipeline::{
    ArtifactPaths, BlobStore, DataIngestion, FileTracker, LocalBlobStore, PipelineConfig,
    RunStatus, Stage, TrainingPipeline,
};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

const BUCKET: &str = "my_bucket67";
const OBJECT: &str = "Hotel_Reservations.csv";

fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// A scratch workspace with the 100-row fixture published as
/// `store/my_bucket67/Hotel_Reservations.csv`.
fn workspace() -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let object = dir.path().join("store").join(BUCKET).join(OBJECT);
    fs::create_dir_all(object.parent().unwrap()).unwrap();
    fs::copy(fixtures_path().join("hotel_reservations_100.csv"), &object)
        .expect("Failed to publish fixture");
    dir
}

fn config_yaml(store_root: &Path) -> String {
    format!(
        r#"
data_ingestion:
  bucket_name: "{bucket}"
  bucket_file_name: "{object}"
  train_ratio: 0.8
  local_root: "{root}"

data preprocessing:
  categorical_columns:
    - type_of_meal_plan
    - required_car_parking_space
    - room_type_reserved
    - market_segment_type
    - repeated_guest
    - booking_status
  numerical_columns:
    - no_of_adults
    - no_of_children
    - no_of_weekend_nights
    - no_of_week_nights
    - lead_time
    - arrival_year
    - arrival_month
    - arrival_date
    - no_of_previous_cancellations
    - no_of_previous_bookings_not_canceled
    - avg_price_per_room
    - no_of_special_requests
  skewness_threshold: 5
  num_feature: 10
  forest_estimators: 10

model_training:
  param_distributions:
    n_estimators: {{randint: [10, 30]}}
    num_leaves: {{randint: [4, 8]}}
    learning_rate: {{uniform: [0.05, 0.1]}}
    min_child_samples: {{choice: [5]}}
    boosting_type: {{choice: [gbdt, dart, goss]}}
  random_search:
    n_iter: 2
    cv: 2
    n_jobs: 2
"#,
        bucket = BUCKET,
        object = OBJECT,
        root = store_root.display()
    )
}

fn pipeline_config(dir: &TempDir) -> PipelineConfig {
    PipelineConfig::from_yaml_str(&config_yaml(&dir.path().join("store")))
        .expect("Failed to parse config")
}

// ============================================================================
// End-to-End
// ============================================================================

#[test]
fn test_full_pipeline_on_hotel_sample() {
    let dir = workspace();
    let paths = ArtifactPaths::new(dir.path());
    let pipeline = TrainingPipeline::new(&pipeline_config(&dir), paths.clone()).unwrap();

    let report = pipeline.run().expect("Pipeline should complete successfully");

    // 80/20 split
    assert_eq!(report.split.train_rows, 80);
    assert_eq!(report.split.test_rows, 20);

    // Balanced training labels, untouched test partition
    let train = frame::read_csv(&paths.processed_train_file()).unwrap();
    let test = frame::read_csv(&paths.processed_test_file()).unwrap();
    let labels = frame::column_i64(&train, "booking_status").unwrap();
    let counts: Vec<usize> = class_counts(labels.iter()).into_values().collect();
    assert_eq!(counts.len(), 2);
    assert_eq!(counts[0], counts[1]);
    assert_eq!(test.height(), 20);

    // Top 10 features plus the label, mirrored onto test
    assert_eq!(train.width(), 11);
    assert_eq!(
        train.get_column_names_str().last().copied(),
        Some("booking_status")
    );
    assert_eq!(train.get_column_names_str(), test.get_column_names_str());
    assert_eq!(
        report.preprocessing.selected_columns,
        train
            .get_column_names_str()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
    );

    // Canceled is encoded first
    let status = report.preprocessing.encodings.get("booking_status").unwrap();
    assert_eq!(status.code_of("Canceled"), Some(0));
    assert_eq!(status.code_of("Not_Canceled"), Some(1));

    // Metrics
    let metrics = &report.training.metrics;
    let keys: Vec<&str> = metrics.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["accuracy", "f1", "precision", "recall"]);
    for value in metrics.values() {
        assert!((0.0..=1.0).contains(value), "metric out of range: {}", value);
    }

    // Reloaded model reproduces the evaluation
    let model = TrainedModel::load(paths.model_file()).expect("Model should reload");
    let (x_test, names) = frame::features_to_array(&test, "booking_status").unwrap();
    let y_test = frame::labels_to_array(&test, "booking_status").unwrap();
    assert_eq!(model.feature_names(), names.as_slice());
    let predictions = model.predict(&x_test).unwrap();
    let recomputed =
        ClassificationMetrics::compute(&y_test.to_vec(), &predictions.to_vec(), 0).unwrap();
    assert_eq!(recomputed.to_map(), *metrics);
}

#[test]
fn test_training_run_is_tracked() {
    let dir = workspace();
    let paths = ArtifactPaths::new(dir.path());
    let report = TrainingPipeline::new(&pipeline_config(&dir), paths)
        .unwrap()
        .run()
        .unwrap();

    let tracker = FileTracker::new(dir.path().join("mlruns"), "Default").unwrap();
    let meta = tracker.run_meta(&report.training.run_id).unwrap();
    assert_eq!(meta.status, RunStatus::Finished);

    let run_dir = dir
        .path()
        .join("mlruns")
        .join(&tracker.experiment().experiment_id)
        .join(&report.training.run_id);
    assert!(run_dir.join("artifacts/datasets/train_processsed.csv").is_file());
    assert!(run_dir.join("artifacts/datasets/test_processed.csv").is_file());
    assert!(run_dir.join("artifacts/lgbm_model.pkl").is_file());
    for metric in ["accuracy", "precision", "recall", "f1"] {
        assert!(run_dir.join("metrics").join(metric).is_file(), "{}", metric);
    }
    assert!(run_dir.join("params/boosting_type").is_file());
}

// ============================================================================
// Ingestion
// ============================================================================

#[test]
fn test_ingestion_is_idempotent() {
    let dir = workspace();
    let paths = ArtifactPaths::new(dir.path());
    let settings = IngestionSettings {
        bucket_name: BUCKET.into(),
        file_name: OBJECT.into(),
        train_ratio: 0.8,
        local_root: None,
        random_state: 42,
    };
    let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path().join("store")));
    let ingestion = DataIngestion::new(settings, paths.clone(), store);

    ingestion.run().unwrap();
    let train_first = fs::read(paths.train_file()).unwrap();
    let test_first = fs::read(paths.test_file()).unwrap();
    ingestion.run().unwrap();

    assert_eq!(fs::read(paths.train_file()).unwrap(), train_first);
    assert_eq!(fs::read(paths.test_file()).unwrap(), test_first);

    let train = frame::read_csv(&paths.train_file()).unwrap();
    let test = frame::read_csv(&paths.test_file()).unwrap();
    assert_eq!(train.height() + test.height(), 100);
}

#[test]
fn test_missing_remote_object() {
    let dir = workspace();
    let yaml = config_yaml(&dir.path().join("store")).replace(OBJECT, "absent.csv");
    let config = PipelineConfig::from_yaml_str(&yaml).unwrap();
    let err = TrainingPipeline::new(&config, ArtifactPaths::new(dir.path()))
        .unwrap()
        .run()
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Ingestion));
    assert!(!dir.path().join("artifacts/processed").exists());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_missing_num_feature_fails_before_any_write() {
    let dir = workspace();
    let yaml = config_yaml(&dir.path().join("store")).replace("  num_feature: 10\n", "");
    let config = PipelineConfig::from_yaml_str(&yaml).unwrap();

    let err = TrainingPipeline::new(&config, ArtifactPaths::new(dir.path()))
        .err()
        .expect("Construction should fail");

    assert_eq!(err.stage(), Some(Stage::Preprocess));
    assert_eq!(err.error_code(), "PREPROCESS_ERROR");
    assert!(!dir.path().join("artifacts").exists());
}

#[test]
fn test_shipped_config_parses() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/config.yaml");
    let config = PipelineConfig::from_path(path).unwrap();

    let ingestion = config.ingestion().unwrap();
    assert_eq!(ingestion.bucket_name, "my_bucket67");
    assert_eq!(ingestion.train_ratio, 0.8);

    let preprocessing = config.preprocessing().unwrap();
    assert_eq!(preprocessing.categorical_columns.len(), 6);
    assert_eq!(preprocessing.numerical_columns.len(), 12);
    assert_eq!(preprocessing.num_features, 10);

    let training = config.training().unwrap();
    assert_eq!(training.search.n_iter, 4);
    assert_eq!(training.positive_label, "Canceled");
    assert_eq!(training.positive_class, None);
    assert_eq!(training.param_space.len(), 5);
}
