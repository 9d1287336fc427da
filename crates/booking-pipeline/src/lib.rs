//! booking-pipeline: training pipeline for a hotel booking cancellation
//! classifier.
//!
//! The pipeline runs three stages in order, each reading the previous
//! stage's files from a fixed artifact layout:
//!
//! - **Ingestion** ([`DataIngestion`]): fetch the raw CSV from object
//!   storage and split it into train/test partitions
//! - **Preprocessing** ([`Preprocessor`]): clean, encode, deskew, rebalance
//!   and select features
//! - **Training** ([`Trainer`]): randomized hyperparameter search over a
//!   gradient-boosted classifier, evaluation, persistence and experiment
//!   tracking
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use booking_pipeline::{ArtifactPaths, PipelineConfig, TrainingPipeline};
//!
//! let config = PipelineConfig::from_path("config/config.yaml")?;
//! let pipeline = TrainingPipeline::new(&config, ArtifactPaths::default())?;
//! let report = pipeline.run()?;
//! println!("accuracy = {:.4}", report.training.metrics["accuracy"]);
//! ```
//!
//! # Errors
//!
//! Every operation returns [`PipelineError`], tagged with the stage that
//! failed; the underlying cause is kept in the error's source chain.

pub mod config;
pub mod error;
pub mod frame;
pub mod ingestion;
pub mod logging;
pub mod paths;
pub mod pipeline;
pub mod preprocessing;
pub mod tracking;
pub mod training;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result, ResultExt, Stage};
pub use ingestion::{BlobStore, DataIngestion, GcsBlobStore, LocalBlobStore, StorageError};
pub use paths::ArtifactPaths;
pub use pipeline::{PipelineReport, TrainingPipeline};
pub use preprocessing::{EncodingMap, PreprocessingReport, Preprocessor};
pub use tracking::{ActiveRun, FileTracker, RunStatus, TrackingError};
pub use training::{DataSplit, Trainer, TrainingReport};
