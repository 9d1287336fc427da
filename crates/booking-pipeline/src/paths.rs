//! Fixed artifact layout, relative to a working root.

use std::path::{Path, PathBuf};

/// Where every stage reads and writes its files.
///
/// ```text
/// <root>/artifacts/raw/{raw,train,test}.csv
/// <root>/artifacts/processed/{train_processsed,test_processed}.csv
/// <root>/artifacts/model/lgbm_model.pkl
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    root: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self::new(".")
    }
}

impl ArtifactPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a configured path against the root; absolute paths pass through.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("raw")
    }

    pub fn raw_file(&self) -> PathBuf {
        self.raw_dir().join("raw.csv")
    }

    pub fn train_file(&self) -> PathBuf {
        self.raw_dir().join("train.csv")
    }

    pub fn test_file(&self) -> PathBuf {
        self.raw_dir().join("test.csv")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("processed")
    }

    /// `train_processsed.csv`, misspelling included: the deployed artifact
    /// layout uses this exact name, so do not correct it.
    pub fn processed_train_file(&self) -> PathBuf {
        self.processed_dir().join("train_processsed.csv")
    }

    pub fn processed_test_file(&self) -> PathBuf {
        self.processed_dir().join("test_processed.csv")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("model")
    }

    /// `lgbm_model.pkl` holds JSON, not a pickle. The name matches the
    /// deployed artifact layout and is kept for compatibility.
    pub fn model_file(&self) -> PathBuf {
        self.model_dir().join("lgbm_model.pkl")
    }
}
