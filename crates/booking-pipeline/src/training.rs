//! Training stage: tune, evaluate and persist the booking classifier.

use crate::config::{TrackingSettings, TrainingSettings};
use crate::error::{PipelineError, Result, ResultExt, Stage};
use crate::frame;
use crate::paths::ArtifactPaths;
use crate::preprocessing::ColumnEncoding;
use crate::tracking::{ActiveRun, FileTracker};
use booking_learning::{
    ClassificationMetrics, ParamSpace, RandomizedSearch, SearchConfig, SearchOutcome, TrainedModel,
};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{error, info, info_span, warn};

/// Processed train/test matrices.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub x_train: Array2<f64>,
    pub y_train: Array1<i64>,
    pub x_test: Array2<f64>,
    pub y_test: Array1<i64>,
    pub feature_names: Vec<String>,
}

/// Outcome of a successful training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub run_id: String,
    pub best_params: BTreeMap<String, String>,
    pub best_cv_score: f64,
    pub metrics: BTreeMap<String, f64>,
    pub model_path: PathBuf,
}

pub struct Trainer {
    settings: TrainingSettings,
    tracking: TrackingSettings,
    paths: ArtifactPaths,
}

impl Trainer {
    pub fn new(settings: TrainingSettings, tracking: TrackingSettings, paths: ArtifactPaths) -> Self {
        Self {
            settings,
            tracking,
            paths,
        }
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// Encoded positive class: the configured code if any, otherwise the
    /// code the fitted target encoding gave `positive_label`.
    pub fn positive_class_for(&self, encoding: Option<&ColumnEncoding>) -> Result<i64> {
        if let Some(code) = self.settings.positive_class {
            return Ok(code);
        }
        let label = self.settings.positive_label.as_str();
        let encoding = encoding.ok_or_else(|| {
            PipelineError::new(
                Stage::Training,
                format!("no label encoding for '{}'", self.settings.target_column),
            )
        })?;
        encoding.code_of(label).ok_or_else(|| {
            PipelineError::new(
                Stage::Training,
                format!("positive label '{}' not found in {}", label, encoding),
            )
        })
    }

    fn split_frame(&self, df: &DataFrame, path: &Path) -> Result<(Array2<f64>, Array1<i64>, Vec<String>)> {
        let target = self.settings.target_column.as_str();
        if df.column(target).is_err() {
            return Err(PipelineError::new(
                Stage::Data,
                format!("{} has no '{}' column", path.display(), target),
            ));
        }
        let (x, names) = frame::features_to_array(df, target).stage_context(
            Stage::Data,
            format!("{} has non-numeric features", path.display()),
        )?;
        let y = frame::labels_to_array(df, target).stage_context(
            Stage::Data,
            format!("{} has a non-integer '{}' column", path.display(), target),
        )?;
        Ok((x, y, names))
    }

    /// Reads the processed train and test files and checks they carry the
    /// target and the same feature columns.
    pub fn load_split(&self) -> Result<DataSplit> {
        let train_path = self.paths.processed_train_file();
        let test_path = self.paths.processed_test_file();
        let train = frame::read_csv(&train_path).stage_context(
            Stage::Data,
            format!("Failed to read {}", train_path.display()),
        )?;
        let test = frame::read_csv(&test_path).stage_context(
            Stage::Data,
            format!("Failed to read {}", test_path.display()),
        )?;

        let (x_train, y_train, train_names) = self.split_frame(&train, &train_path)?;
        let (x_test, y_test, test_names) = self.split_frame(&test, &test_path)?;
        if train_names != test_names {
            return Err(PipelineError::new(
                Stage::Data,
                format!(
                    "train features {:?} differ from test features {:?}",
                    train_names, test_names
                ),
            ));
        }
        if train_names.is_empty() {
            return Err(PipelineError::new(Stage::Data, "no feature columns"));
        }

        info!(
            "Loaded {} train and {} test rows with {} features",
            x_train.nrows(),
            x_test.nrows(),
            train_names.len()
        );
        Ok(DataSplit {
            x_train,
            y_train,
            x_test,
            y_test,
            feature_names: train_names,
        })
    }

    /// Randomized search over gradient-boosting hyperparameters; the winner
    /// comes back refitted on all of `x`.
    pub fn search_best_model(
        &self,
        x: &Array2<f64>,
        y: &Array1<i64>,
        param_space: &ParamSpace,
        search_config: &SearchConfig,
    ) -> Result<SearchOutcome> {
        info!(
            "Searching {} candidates x {} folds over {} parameters",
            search_config.n_iter,
            search_config.cv,
            param_space.len()
        );
        let outcome = RandomizedSearch::new(param_space.clone(), search_config.clone())
            .fit(x, y)
            .stage_context(Stage::Training, "Hyperparameter search failed")?;
        info!(
            "Best {} {:.4} with {}",
            search_config.scoring,
            outcome.best_score,
            format_params(&outcome.best_params)
        );
        Ok(outcome)
    }

    /// Accuracy, precision, recall and F1 on held-out rows, with the
    /// configured positive class.
    pub fn evaluate(
        &self,
        model: &TrainedModel,
        x_test: &Array2<f64>,
        y_test: &Array1<i64>,
    ) -> Result<ClassificationMetrics> {
        self.evaluate_for(model, x_test, y_test, self.settings.search.positive_class)
    }

    fn evaluate_for(
        &self,
        model: &TrainedModel,
        x_test: &Array2<f64>,
        y_test: &Array1<i64>,
        positive_class: i64,
    ) -> Result<ClassificationMetrics> {
        let predictions = model
            .predict(x_test)
            .stage_context(Stage::Training, "Prediction on the test set failed")?;
        let metrics = ClassificationMetrics::compute(
            &y_test.to_vec(),
            &predictions.to_vec(),
            positive_class,
        )
        .stage_context(Stage::Training, "Evaluation failed")?;
        for (name, value) in metrics.to_map() {
            info!("{}: {:.4}", name, value);
        }
        Ok(metrics)
    }

    /// Writes `model` to `path`, replacing any existing file.
    pub fn persist(&self, model: &TrainedModel, path: &Path) -> Result<()> {
        model.save(path).stage_context(
            Stage::Training,
            format!("Failed to save model to {}", path.display()),
        )?;
        info!("Model saved to {}", path.display());
        Ok(())
    }

    fn execute(&self, run: &ActiveRun, search: &SearchConfig) -> Result<TrainingReport> {
        let train_path = self.paths.processed_train_file();
        let test_path = self.paths.processed_test_file();
        for dataset in [&train_path, &test_path] {
            run.log_artifact(dataset, Some("datasets"))
                .stage_context(Stage::Training, "Failed to log dataset")?;
        }

        let split = self.load_split()?;
        let outcome = self.search_best_model(
            &split.x_train,
            &split.y_train,
            &self.settings.param_space,
            search,
        )?;
        let model = TrainedModel::new(
            outcome.best_estimator,
            split.feature_names,
            self.settings.target_column.clone(),
        )
        .stage_context(Stage::Training, "Failed to wrap the fitted model")?;

        let metrics =
            self.evaluate_for(&model, &split.x_test, &split.y_test, search.positive_class)?;
        let model_path = self.paths.model_file();
        self.persist(&model, &model_path)?;

        run.log_artifact(&model_path, None)
            .stage_context(Stage::Training, "Failed to log model")?;
        run.log_params(model.hyperparameters())
            .stage_context(Stage::Training, "Failed to log params")?;
        let metric_map = metrics.to_map();
        run.log_metrics(&metric_map)
            .stage_context(Stage::Training, "Failed to log metrics")?;

        Ok(TrainingReport {
            run_id: run.run_id().to_string(),
            best_params: outcome
                .best_params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            best_cv_score: outcome.best_score,
            metrics: metric_map,
            model_path,
        })
    }

    /// Runs load, search, evaluate and persist inside a tracked run. The run
    /// is recorded `FINISHED` on success and `FAILED` on any error or panic.
    pub fn run(&self) -> Result<TrainingReport> {
        self.run_with_positive_class(self.settings.search.positive_class)
    }

    /// Like [`run`](Self::run), scoring `positive_class` as positive.
    pub fn run_with_positive_class(&self, positive_class: i64) -> Result<TrainingReport> {
        let _span = info_span!("training").entered();
        info!("Starting model training");

        let tracker = FileTracker::new(
            self.paths.resolve(&self.tracking.root),
            &self.tracking.experiment_name,
        )
        .stage_context(Stage::Training, "Failed to open experiment tracker")?;
        let run = tracker
            .start_run(Some("training"))
            .stage_context(Stage::Training, "Failed to start tracked run")?;

        let search = SearchConfig {
            positive_class,
            ..self.settings.search.clone()
        };
        info!("Positive class: {}", positive_class);
        match catch_panics(|| self.execute(&run, &search)) {
            Ok(report) => {
                run.finish()
                    .stage_context(Stage::Training, "Failed to close tracked run")?;
                info!("Model training completed (run {})", report.run_id);
                Ok(report)
            }
            Err(e) => {
                error!("Model training failed: {}", e.chain());
                if let Err(tag_err) = record_failure(&run, &e) {
                    warn!("Failed to record the error on run {}: {}", run.run_id(), tag_err);
                }
                drop(run);
                Err(PipelineError::with_source(
                    Stage::Training,
                    "Model training failed",
                    e,
                ))
            }
        }
    }
}

/// Turns a panic inside `f` into a training error.
fn catch_panics<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(PipelineError::new(
            Stage::Training,
            format!("training panicked: {}", panic_message(payload.as_ref())),
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Stores the error as `{code, message}` JSON in the run's `error` tag.
fn record_failure(
    run: &ActiveRun,
    err: &PipelineError,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    run.set_tag("error", serde_json::to_string(err)?)?;
    Ok(())
}

fn format_params<V: std::fmt::Display>(params: &BTreeMap<String, V>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingSection;
    use crate::preprocessing::encode_categorical;
    use crate::tracking::RunStatus;
    use booking_learning::ParamDistribution;
    use std::fs;

    fn small_settings() -> TrainingSettings {
        let mut settings = TrainingSection::default().resolve().unwrap();
        settings.target_column = "label".into();
        settings.param_space = ParamSpace::new()
            .with("n_estimators", ParamDistribution::Randint(5, 15))
            .with("num_leaves", ParamDistribution::Randint(4, 8))
            .with("min_child_samples", ParamDistribution::Randint(2, 5));
        settings.search.n_iter = 2;
        settings.search.n_jobs = 1;
        settings
    }

    fn write_processed(paths: &ArtifactPaths, test_columns: &[&str]) {
        let make = |n: usize, offset: usize| {
            let a: Vec<f64> = (0..n).map(|i| ((i + offset) % 17) as f64).collect();
            let b: Vec<f64> = (0..n).map(|i| ((i + offset) * 7 % 5) as f64).collect();
            let label: Vec<i64> = a.iter().map(|v| i64::from(*v >= 8.0)).collect();
            df!["a" => a, "b" => b, "label" => label].unwrap()
        };
        let mut train = make(80, 0);
        let mut test = make(20, 3).select(test_columns.iter().copied()).unwrap();
        frame::write_csv(&mut train, &paths.processed_train_file()).unwrap();
        frame::write_csv(&mut test, &paths.processed_test_file()).unwrap();
    }

    #[test]
    fn test_run_trains_and_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        write_processed(&paths, &["a", "b", "label"]);

        let tracking = TrackingSettings {
            root: "mlruns".into(),
            experiment_name: "Default".into(),
        };
        let trainer = Trainer::new(small_settings(), tracking, paths.clone());
        let report = trainer.run().unwrap();

        assert!(report.model_path.is_file());
        for value in report.metrics.values() {
            assert!((0.0..=1.0).contains(value));
        }
        let run_dir = dir.path().join("mlruns/0").join(&report.run_id);
        assert!(run_dir.join("artifacts/datasets/train_processsed.csv").is_file());
        assert!(run_dir.join("artifacts/lgbm_model.pkl").is_file());
        assert!(run_dir.join("metrics/f1").is_file());
        assert!(run_dir.join("params/n_estimators").is_file());

        let tracker = FileTracker::new(dir.path().join("mlruns"), "Default").unwrap();
        assert_eq!(
            tracker.run_meta(&report.run_id).unwrap().status,
            RunStatus::Finished
        );
    }

    #[test]
    fn test_feature_mismatch_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        write_processed(&paths, &["b", "a", "label"]);

        let trainer = Trainer::new(
            small_settings(),
            TrackingSettings {
                root: "mlruns".into(),
                experiment_name: "Default".into(),
            },
            paths,
        );
        let err = trainer.load_split().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Data));

        // The tracked run is closed as failed.
        let err = trainer.run().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Training));
        assert!(err.involves(Stage::Data));
        let exp_dir = dir.path().join("mlruns/0");
        let run_dir = fs::read_dir(&exp_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.is_dir())
            .unwrap();
        let meta = fs::read_to_string(run_dir.join("meta.yaml")).unwrap();
        assert!(meta.contains("FAILED"));

        let recorded = fs::read_to_string(run_dir.join("tags/error")).unwrap();
        let recorded: serde_json::Value = serde_json::from_str(&recorded).unwrap();
        assert_eq!(recorded["code"], "DATA_ERROR");
        assert!(recorded["message"].as_str().unwrap().contains("differ from test features"));
    }

    #[test]
    fn test_panic_becomes_training_error() {
        let err = catch_panics(|| -> Result<()> { panic!("tree index out of bounds") })
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Training));
        assert!(err.to_string().contains("tree index out of bounds"));

        let err = catch_panics(|| -> Result<()> { panic!("{} workers", 4) }).unwrap_err();
        assert!(err.to_string().contains("4 workers"));

        assert_eq!(catch_panics(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_positive_class_from_label_encoding() {
        let labels = df!["label" => ["Active", "Canceled", "Active"]].unwrap();
        let (_, encodings) = encode_categorical(&labels, &["label".to_string()]).unwrap();
        let tracking = TrackingSettings {
            root: "mlruns".into(),
            experiment_name: "Default".into(),
        };

        // "Active" sorts first, so "Canceled" is 1 here.
        let trainer = Trainer::new(small_settings(), tracking.clone(), ArtifactPaths::default());
        assert_eq!(trainer.positive_class_for(encodings.get("label")).unwrap(), 1);
        let err = trainer.positive_class_for(None).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Training));

        let mut missing = small_settings();
        missing.positive_label = "No_Show".into();
        let trainer = Trainer::new(missing, tracking.clone(), ArtifactPaths::default());
        assert!(trainer.positive_class_for(encodings.get("label")).is_err());

        let mut explicit = small_settings();
        explicit.positive_class = Some(0);
        let trainer = Trainer::new(explicit, tracking, ArtifactPaths::default());
        assert_eq!(trainer.positive_class_for(encodings.get("label")).unwrap(), 0);
    }

    #[test]
    fn test_missing_target_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        write_processed(&paths, &["a", "b"]);
        let trainer = Trainer::new(
            small_settings(),
            TrackingSettings {
                root: "mlruns".into(),
                experiment_name: "Default".into(),
            },
            paths,
        );
        assert_eq!(trainer.load_split().unwrap_err().error_code(), "DATA_ERROR");
    }
}
