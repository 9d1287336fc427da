//! End-to-end orchestration: ingestion, then preprocessing, then training.

use crate::config::{
    IngestionSettings, PipelineConfig, PreprocessingSettings, TrackingSettings, TrainingSettings,
};
use crate::error::Result;
use crate::ingestion::{BlobStore, DataIngestion, SplitSummary};
use crate::paths::ArtifactPaths;
use crate::preprocessing::{PreprocessingReport, Preprocessor};
use crate::training::{Trainer, TrainingReport};
use std::sync::Arc;
use tracing::info;

/// Summary of a complete pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub split: SplitSummary,
    pub preprocessing: PreprocessingReport,
    pub training: TrainingReport,
}

/// The three stages, built and validated up front.
pub struct TrainingPipeline {
    ingestion: DataIngestion,
    preprocessor: Preprocessor,
    trainer: Trainer,
}

impl TrainingPipeline {
    /// Resolves every configuration section before the object store is
    /// built or any file is touched, so a bad configuration fails with its
    /// stage's error and no side effects.
    pub fn new(config: &PipelineConfig, paths: ArtifactPaths) -> Result<Self> {
        let stages = Stages::resolve(config)?;
        let store = DataIngestion::store_for(&stages.ingestion, &paths)?;
        Ok(stages.build(paths, store))
    }

    /// Like [`new`](Self::new) but with an explicit object store.
    pub fn with_store(
        config: &PipelineConfig,
        paths: ArtifactPaths,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        Ok(Stages::resolve(config)?.build(paths, store))
    }

    /// Runs the stages in order; the first failure stops the pipeline.
    pub fn run(&self) -> Result<PipelineReport> {
        info!("Pipeline started");
        let split = self.ingestion.run()?;
        let preprocessing = self.preprocessor.run()?;
        let target = self.trainer.settings().target_column.as_str();
        let positive_class = self
            .trainer
            .positive_class_for(preprocessing.encodings.get(target))?;
        let training = self.trainer.run_with_positive_class(positive_class)?;
        info!("Pipeline finished");
        Ok(PipelineReport {
            split,
            preprocessing,
            training,
        })
    }
}

/// Validated settings of every stage.
struct Stages {
    ingestion: IngestionSettings,
    preprocessing: PreprocessingSettings,
    training: TrainingSettings,
    tracking: TrackingSettings,
}

impl Stages {
    fn resolve(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            ingestion: config.ingestion()?,
            preprocessing: config.preprocessing()?,
            training: config.training()?,
            tracking: config.tracking(),
        })
    }

    fn build(self, paths: ArtifactPaths, store: Arc<dyn BlobStore>) -> TrainingPipeline {
        let Self {
            ingestion,
            preprocessing,
            training,
            tracking,
        } = self;
        TrainingPipeline {
            ingestion: DataIngestion::new(ingestion, paths.clone(), store),
            preprocessor: Preprocessor::new(preprocessing, paths.clone()),
            trainer: Trainer::new(training, tracking, paths),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;

    const REMOTE_CONFIG: &str = r#"
data_ingestion:
  bucket_name: "my_bucket67"
  bucket_file_name: "Hotel_Reservations.csv"
  train_ratio: 0.8

data preprocessing:
  categorical_columns: [booking_status]
  numerical_columns: [lead_time]
  skewness_threshold: 5
  num_feature: 10
"#;

    #[test]
    fn test_settings_fail_before_store_is_built() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = REMOTE_CONFIG.replace("  num_feature: 10\n", "");
        let config = PipelineConfig::from_yaml_str(&yaml).unwrap();

        let err = TrainingPipeline::new(&config, ArtifactPaths::new(dir.path()))
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(Stage::Preprocess));

        let yaml = format!("{}model_training:\n  random_search:\n    cv: 1\n", REMOTE_CONFIG);
        let config = PipelineConfig::from_yaml_str(&yaml).unwrap();
        let err = TrainingPipeline::new(&config, ArtifactPaths::new(dir.path()))
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some(Stage::Training));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
