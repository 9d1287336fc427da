//! Ingestion stage: fetch the raw dataset and split it into train/test.

mod storage;

pub use storage::{
    ACCESS_TOKEN_ENV, BlobStore, EMULATOR_HOST_ENV, GcsBlobStore, LocalBlobStore, StorageError,
};

use crate::config::IngestionSettings;
use crate::error::{PipelineError, Result, ResultExt, Stage};
use crate::frame;
use crate::paths::ArtifactPaths;
use polars::prelude::*;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::{error, info, info_span};

/// Number of training rows for `n` records at `ratio`.
///
/// `floor(ratio * n)`, clamped to `[1, n - 1]` when `n >= 2` so neither
/// partition is empty.
pub fn train_size(n: usize, ratio: f64) -> usize {
    let raw = (ratio * n as f64 + 1e-9).floor() as usize;
    if n < 2 { raw.min(n) } else { raw.clamp(1, n - 1) }
}

/// Row counts written by [`DataIngestion::split_and_persist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSummary {
    pub train_rows: usize,
    pub test_rows: usize,
}

pub struct DataIngestion {
    settings: IngestionSettings,
    paths: ArtifactPaths,
    store: Arc<dyn BlobStore>,
}

impl DataIngestion {
    pub fn new(settings: IngestionSettings, paths: ArtifactPaths, store: Arc<dyn BlobStore>) -> Self {
        Self {
            settings,
            paths,
            store,
        }
    }

    /// Picks the store the settings ask for: a local directory when
    /// `local_root` is set, Google Cloud Storage otherwise.
    pub fn store_for(settings: &IngestionSettings, paths: &ArtifactPaths) -> Result<Arc<dyn BlobStore>> {
        match &settings.local_root {
            Some(root) => Ok(Arc::new(LocalBlobStore::new(paths.resolve(root)))),
            None => {
                let store = GcsBlobStore::from_env()
                    .stage_context(Stage::Ingestion, "Failed to create storage client")?;
                Ok(Arc::new(store))
            }
        }
    }

    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    /// Downloads the configured object to `artifacts/raw/raw.csv`.
    pub fn fetch(&self) -> Result<()> {
        let dest = self.paths.raw_file();
        self.store
            .download(&self.settings.bucket_name, &self.settings.file_name, &dest)
            .map_err(|e| {
                PipelineError::with_source(
                    Stage::Ingestion,
                    format!(
                        "Failed to download {}/{}",
                        self.settings.bucket_name, self.settings.file_name
                    ),
                    e,
                )
            })?;
        info!(
            "Downloaded {}/{} from {} to {}",
            self.settings.bucket_name,
            self.settings.file_name,
            self.store.describe(),
            dest.display()
        );
        Ok(())
    }

    /// Shuffles the raw rows with the configured seed and writes the train
    /// and test partitions.
    pub fn split_and_persist(&self) -> Result<SplitSummary> {
        let raw_path = self.paths.raw_file();
        let raw = frame::read_csv(&raw_path).stage_context(
            Stage::Ingestion,
            format!("Failed to read raw data {}", raw_path.display()),
        )?;

        let n = raw.height();
        let n_train = train_size(n, self.settings.train_ratio);

        let mut order: Vec<IdxSize> = (0..n as IdxSize).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.random_state);
        order.shuffle(&mut rng);
        let (train_idx, test_idx) = order.split_at(n_train);

        let take = |idx: &[IdxSize]| {
            raw.take(&IdxCa::from_vec("idx".into(), idx.to_vec()))
                .stage_context(Stage::Ingestion, "Failed to split raw data")
        };
        let mut train = take(train_idx)?;
        let mut test = take(test_idx)?;

        let train_path = self.paths.train_file();
        frame::write_csv(&mut train, &train_path).stage_context(
            Stage::Ingestion,
            format!("Failed to write {}", train_path.display()),
        )?;
        let test_path = self.paths.test_file();
        frame::write_csv(&mut test, &test_path).stage_context(
            Stage::Ingestion,
            format!("Failed to write {}", test_path.display()),
        )?;

        info!(
            "Split {} rows into {} train / {} test",
            n,
            train.height(),
            test.height()
        );
        Ok(SplitSummary {
            train_rows: train.height(),
            test_rows: test.height(),
        })
    }

    pub fn run(&self) -> Result<SplitSummary> {
        let _span = info_span!("ingestion").entered();
        info!("Starting data ingestion");

        let result = self.fetch().and_then(|_| self.split_and_persist());
        let outcome = match result {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("Data ingestion failed: {}", e.chain());
                Err(PipelineError::with_source(
                    Stage::Ingestion,
                    "Data ingestion failed",
                    e,
                ))
            }
        };
        info!("Data ingestion completed");
        outcome
    }
}
