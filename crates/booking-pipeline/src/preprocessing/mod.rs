//! Preprocessing stage.
//!
//! Turns the raw train/test partitions into model-ready files:
//!
//! 1. clean (drop identifier columns and duplicate rows)
//! 2. encode categoricals (fitted on train, applied to test)
//! 3. log-transform skewed numerical columns (chosen on train)
//! 4. SMOTE-rebalance the training partition
//! 5. keep the top-k features ranked by a random forest
//! 6. project the test partition onto the training columns
//!
//! The test partition is never rebalanced and never selected on its own.

mod transforms;

pub use transforms::{
    Categories, ColumnEncoding, EncodingMap, apply_log1p, clean, column_skewness, deskew,
    encode_categorical, mirror_columns, rank_features, rebalance, select_top_features, skewness,
};

use crate::config::PreprocessingSettings;
use crate::error::{PipelineError, Result, ResultExt, Stage};
use crate::frame;
use crate::paths::ArtifactPaths;
use booking_learning::{RandomForestClassifier, class_counts};
use polars::prelude::*;
use std::collections::BTreeMap;
use tracing::{error, info, info_span};

/// What a preprocessing run decided, for logging and inspection.
#[derive(Debug, Clone)]
pub struct PreprocessingReport {
    pub encodings: EncodingMap,
    pub deskewed_columns: Vec<String>,
    pub feature_ranking: Vec<(String, f64)>,
    pub selected_columns: Vec<String>,
    pub class_counts_before: BTreeMap<i64, usize>,
    pub class_counts_after: BTreeMap<i64, usize>,
    pub train_rows: usize,
    pub test_rows: usize,
}

pub struct Preprocessor {
    settings: PreprocessingSettings,
    paths: ArtifactPaths,
}

impl Preprocessor {
    pub fn new(settings: PreprocessingSettings, paths: ArtifactPaths) -> Self {
        Self { settings, paths }
    }

    pub fn settings(&self) -> &PreprocessingSettings {
        &self.settings
    }

    fn label_counts(&self, df: &DataFrame) -> Result<BTreeMap<i64, usize>> {
        let labels = frame::column_i64(df, &self.settings.label_column).stage_context(
            Stage::Preprocess,
            format!(
                "label column '{}' is not integer-valued",
                self.settings.label_column
            ),
        )?;
        Ok(class_counts(labels.iter()))
    }

    /// Runs every transform on in-memory frames and returns the processed
    /// (train, test) pair.
    pub fn transform(
        &self,
        train: &DataFrame,
        test: &DataFrame,
    ) -> Result<(DataFrame, DataFrame, PreprocessingReport)> {
        let s = &self.settings;
        let label = s.label_column.as_str();

        let train = clean(train, &s.drop_columns)?;
        let test = clean(test, &s.drop_columns)?;
        info!(
            "Cleaned data: {} train rows, {} test rows",
            train.height(),
            test.height()
        );

        let (train, encodings) = encode_categorical(&train, &s.categorical_columns)?;
        let test = encodings.transform(&test)?;
        for encoding in encodings.iter() {
            info!("Label mapping {}", encoding);
        }

        let (train, deskewed_columns) = deskew(&train, &s.numerical_columns, s.skewness_threshold)?;
        let test = apply_log1p(&test, &deskewed_columns)?;
        info!("Log-transformed skewed columns: {:?}", deskewed_columns);

        let class_counts_before = self.label_counts(&train)?;
        let train = rebalance(&train, label, s.smote_neighbors, s.random_state)?;
        let class_counts_after = self.label_counts(&train)?;
        info!(
            "Rebalanced classes: {:?} -> {:?}",
            class_counts_before, class_counts_after
        );

        let mut forest = RandomForestClassifier::new(s.forest_estimators).with_random_state(s.random_state);
        let (train, feature_ranking) = select_top_features(&train, label, s.num_features, &mut forest)?;
        for (rank, (name, importance)) in feature_ranking.iter().enumerate() {
            info!("Feature #{:<2} {:<40} {:.6}", rank + 1, name, importance);
        }

        let selected_columns: Vec<String> = train
            .get_column_names()
            .into_iter()
            .map(|n| n.to_string())
            .collect();
        let test = mirror_columns(&test, &selected_columns)?;
        info!("Selected columns: {:?}", selected_columns);

        let report = PreprocessingReport {
            encodings,
            deskewed_columns,
            feature_ranking,
            selected_columns,
            class_counts_before,
            class_counts_after,
            train_rows: train.height(),
            test_rows: test.height(),
        };
        Ok((train, test, report))
    }

    /// Reads the raw partitions, transforms them and writes the processed
    /// train file, then the processed test file.
    pub fn process(&self) -> Result<PreprocessingReport> {
        let train_path = self.paths.train_file();
        let test_path = self.paths.test_file();
        let train = frame::read_csv(&train_path).stage_context(
            Stage::Preprocess,
            format!("Failed to read {}", train_path.display()),
        )?;
        let test = frame::read_csv(&test_path).stage_context(
            Stage::Preprocess,
            format!("Failed to read {}", test_path.display()),
        )?;

        let (mut train, mut test, report) = self.transform(&train, &test)?;

        let out_train = self.paths.processed_train_file();
        frame::write_csv(&mut train, &out_train).stage_context(
            Stage::Preprocess,
            format!("Failed to write {}", out_train.display()),
        )?;
        let out_test = self.paths.processed_test_file();
        frame::write_csv(&mut test, &out_test).stage_context(
            Stage::Preprocess,
            format!("Failed to write {}", out_test.display()),
        )?;
        info!(
            "Wrote {} and {}",
            out_train.display(),
            out_test.display()
        );
        Ok(report)
    }

    pub fn run(&self) -> Result<PreprocessingReport> {
        let _span = info_span!("preprocessing").entered();
        info!("Starting data preprocessing");
        match self.process() {
            Ok(report) => {
                info!("Data preprocessing completed");
                Ok(report)
            }
            Err(e) => {
                error!("Data preprocessing failed: {}", e.chain());
                Err(PipelineError::with_source(
                    Stage::Preprocess,
                    "Data preprocessing failed",
                    e,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings() -> PreprocessingSettings {
        PreprocessingSettings {
            categorical_columns: vec!["meal".into(), "status".into()],
            numerical_columns: vec!["lead".into(), "price".into()],
            skewness_threshold: 1.0,
            num_features: 2,
            label_column: "status".into(),
            drop_columns: vec!["id".into()],
            random_state: 42,
            forest_estimators: 10,
            smote_neighbors: 3,
        }
    }

    fn partition(rows: std::ops::Range<usize>) -> DataFrame {
        let ids: Vec<String> = rows.clone().map(|i| format!("B{:03}", i)).collect();
        let meal: Vec<&str> = rows.clone().map(|i| if i % 3 == 0 { "Plan 1" } else { "Plan 2" }).collect();
        let lead: Vec<i64> = rows.clone().map(|i| if i % 10 == 0 { 400 } else { (i % 9) as i64 }).collect();
        let price: Vec<f64> = rows.clone().map(|i| 50.0 + (i % 13) as f64).collect();
        let status: Vec<&str> = rows
            .map(|i| if i % 5 < 2 { "Canceled" } else { "Not_Canceled" })
            .collect();
        df![
            "id" => ids,
            "meal" => meal,
            "lead" => lead,
            "price" => price,
            "status" => status,
        ]
        .unwrap()
    }

    #[test]
    fn test_transform_shapes() {
        let pre = Preprocessor::new(settings(), ArtifactPaths::default());
        let (train, test, report) = pre.transform(&partition(0..40), &partition(40..50)).unwrap();

        assert_eq!(train.width(), 3);
        assert_eq!(train.get_column_names(), test.get_column_names());
        assert_eq!(report.selected_columns.last().map(String::as_str), Some("status"));
        assert_eq!(test.height(), 10);

        // 16 canceled, 24 not canceled before balancing.
        assert_eq!(report.class_counts_before, BTreeMap::from([(0, 16), (1, 24)]));
        assert_eq!(report.class_counts_after, BTreeMap::from([(0, 24), (1, 24)]));
        assert_eq!(report.train_rows, 48);
        assert!(report.deskewed_columns.contains(&"lead".to_string()));
    }

    #[test]
    fn test_process_writes_processed_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        frame::write_csv(&mut partition(0..40), &paths.train_file()).unwrap();
        frame::write_csv(&mut partition(40..50), &paths.test_file()).unwrap();

        let report = Preprocessor::new(settings(), paths.clone()).run().unwrap();

        let train = frame::read_csv(&paths.processed_train_file()).unwrap();
        let test = frame::read_csv(&paths.processed_test_file()).unwrap();
        assert_eq!(train.height(), report.train_rows);
        assert_eq!(test.get_column_names_str(), train.get_column_names_str());
    }

    #[test]
    fn test_balance_failure_keeps_cause() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        let single_class = |rows| {
            partition(rows)
                .lazy()
                .with_column(lit("Canceled").alias("status"))
                .collect()
                .unwrap()
        };
        frame::write_csv(&mut single_class(0..40), &paths.train_file()).unwrap();
        frame::write_csv(&mut single_class(40..50), &paths.test_file()).unwrap();

        let err = Preprocessor::new(settings(), paths.clone()).run().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Preprocess));
        assert!(err.involves(Stage::Balance));
        assert!(!paths.processed_train_file().exists());
    }
}
