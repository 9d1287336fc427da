//! File-backed experiment tracking.
//!
//! Runs are recorded in the MLflow file-store layout so the standard UI can
//! browse them:
//!
//! ```text
//! <root>/<experiment_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/params/<key>
//! <root>/<experiment_id>/<run_id>/metrics/<key>      "<timestamp_ms> <value> <step>"
//! <root>/<experiment_id>/<run_id>/artifacts/...
//! ```
//!
//! An [`ActiveRun`] is a guard: dropping it without calling
//! [`ActiveRun::finish`] records the run as `FAILED`.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid metadata in {path}: {source}")]
    Meta {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid key '{0}'")]
    InvalidKey(String),

    #[error("artifact {0} does not exist")]
    MissingArtifact(PathBuf),
}

type Result<T> = std::result::Result<T, TrackingError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TrackingError + '_ {
    move |source| TrackingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value).map_err(|source| TrackingError::Meta {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(io_err(path))
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    serde_yaml::from_str(&text).map_err(|source| TrackingError::Meta {
        path: path.to_path_buf(),
        source,
    })
}

/// Param, metric and artifact keys: relative, no `..`, restricted charset.
fn validate_key(key: &str) -> Result<()> {
    let charset_ok = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '/'));
    let path_ok = !key.starts_with('/') && key.split('/').all(|part| !part.is_empty() && part != "..");
    if key.is_empty() || !charset_ok || !path_ok {
        return Err(TrackingError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// =============================================================================
// Metadata
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMeta {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
    pub lifecycle_stage: String,
    pub creation_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub run_uuid: String,
    pub run_name: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub artifact_uri: String,
    pub lifecycle_stage: String,
    pub user_id: String,
}

// =============================================================================
// Tracker
// =============================================================================

/// One experiment in a file store.
#[derive(Debug, Clone)]
pub struct FileTracker {
    root: PathBuf,
    experiment: ExperimentMeta,
}

impl FileTracker {
    /// Opens the experiment called `experiment_name` under `root`, creating
    /// it (and the store) when absent. New experiments take the next free
    /// numeric id, starting at `0`.
    pub fn new(root: impl Into<PathBuf>, experiment_name: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;

        let mut next_id = 0u64;
        for entry in fs::read_dir(&root).map_err(io_err(&root))? {
            let entry = entry.map_err(io_err(&root))?;
            let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            next_id = next_id.max(id + 1);
            let meta_path = entry.path().join("meta.yaml");
            if !meta_path.is_file() {
                continue;
            }
            let meta: ExperimentMeta = read_yaml(&meta_path)?;
            if meta.name == experiment_name {
                debug!("Using experiment '{}' ({})", meta.name, meta.experiment_id);
                return Ok(Self {
                    root,
                    experiment: meta,
                });
            }
        }

        let id = next_id.to_string();
        let dir = root.join(&id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let experiment = ExperimentMeta {
            experiment_id: id,
            name: experiment_name.to_string(),
            artifact_location: dir.display().to_string(),
            lifecycle_stage: "active".to_string(),
            creation_time: now_ms(),
        };
        write_yaml(&dir.join("meta.yaml"), &experiment)?;
        info!(
            "Created experiment '{}' ({})",
            experiment.name, experiment.experiment_id
        );
        Ok(Self { root, experiment })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn experiment(&self) -> &ExperimentMeta {
        &self.experiment
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(&self.experiment.experiment_id).join(run_id)
    }

    pub fn start_run(&self, run_name: Option<&str>) -> Result<ActiveRun> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.run_dir(&run_id);
        for sub in ["params", "metrics", "artifacts", "tags"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(io_err(&path))?;
        }

        let meta = RunMeta {
            run_uuid: run_id.clone(),
            run_name: run_name.map_or_else(|| run_id[..8].to_string(), str::to_string),
            experiment_id: self.experiment.experiment_id.clone(),
            status: RunStatus::Running,
            start_time: now_ms(),
            end_time: None,
            artifact_uri: dir.join("artifacts").display().to_string(),
            lifecycle_stage: "active".to_string(),
            user_id: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            run_id,
        };
        write_yaml(&dir.join("meta.yaml"), &meta)?;
        info!("Started run {} in experiment '{}'", meta.run_id, self.experiment.name);
        Ok(ActiveRun {
            dir,
            meta,
            closed: false,
        })
    }

    /// Reads a run's metadata back from disk.
    pub fn run_meta(&self, run_id: &str) -> Result<RunMeta> {
        read_yaml(&self.run_dir(run_id).join("meta.yaml"))
    }
}

// =============================================================================
// Active run
// =============================================================================

pub struct ActiveRun {
    dir: PathBuf,
    meta: RunMeta,
    closed: bool,
}

impl ActiveRun {
    pub fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub fn log_param(&self, key: &str, value: impl Display) -> Result<()> {
        validate_key(key)?;
        let path = self.dir.join("params").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(&path, value.to_string()).map_err(io_err(&path))
    }

    pub fn log_params<K, V, I>(&self, params: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Display,
    {
        params
            .into_iter()
            .try_for_each(|(k, v)| self.log_param(k.as_ref(), v))
    }

    /// Writes `tags/<key>`, replacing any earlier value.
    pub fn set_tag(&self, key: &str, value: impl Display) -> Result<()> {
        validate_key(key)?;
        let path = self.dir.join("tags").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(&path, value.to_string()).map_err(io_err(&path))
    }

    /// Appends one `<timestamp_ms> <value> <step>` line at step 0.
    pub fn log_metric(&self, key: &str, value: f64) -> Result<()> {
        validate_key(key)?;
        let path = self.dir.join("metrics").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        writeln!(file, "{} {} 0", now_ms(), value).map_err(io_err(&path))
    }

    pub fn log_metrics<'a, I>(&self, metrics: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a String, &'a f64)>,
    {
        metrics
            .into_iter()
            .try_for_each(|(k, v)| self.log_metric(k, *v))
    }

    /// Copies a file into the run's artifacts, under `artifact_path` when
    /// given. Returns the stored location.
    pub fn log_artifact(&self, path: &Path, artifact_path: Option<&str>) -> Result<PathBuf> {
        if !path.is_file() {
            return Err(TrackingError::MissingArtifact(path.to_path_buf()));
        }
        let mut dest_dir = self.artifact_dir();
        if let Some(sub) = artifact_path {
            validate_key(sub)?;
            dest_dir = dest_dir.join(sub);
        }
        fs::create_dir_all(&dest_dir).map_err(io_err(&dest_dir))?;

        let file_name = path
            .file_name()
            .ok_or_else(|| TrackingError::MissingArtifact(path.to_path_buf()))?;
        let dest = dest_dir.join(file_name);
        fs::copy(path, &dest).map_err(io_err(&dest))?;
        debug!("Logged artifact {}", dest.display());
        Ok(dest)
    }

    fn close(&mut self, status: RunStatus) -> Result<()> {
        self.closed = true;
        self.meta.status = status;
        self.meta.end_time = Some(now_ms());
        write_yaml(&self.dir.join("meta.yaml"), &self.meta)
    }

    /// Marks the run `FINISHED`.
    pub fn finish(mut self) -> Result<()> {
        self.close(RunStatus::Finished)?;
        info!("Finished run {}", self.meta.run_id);
        Ok(())
    }

    /// Marks the run `FAILED`.
    pub fn fail(mut self) -> Result<()> {
        self.close(RunStatus::Failed)
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close(RunStatus::Failed) {
            warn!("Failed to close run {}: {}", self.meta.run_id, e);
        }
    }
}
