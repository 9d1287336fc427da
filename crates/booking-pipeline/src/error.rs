//! Error types for the training pipeline.
//!
//! Every failure is reported as a [`PipelineError`] tagged with the stage
//! that raised it. Lower-level errors (polars, I/O, storage, learners) are
//! kept as the error's `source`, so the full cause chain is available to the
//! binary and to log lines.

use serde::Serialize;
use serde::ser::SerializeStruct;
use std::fmt;
use thiserror::Error;

/// Boxed cause carried by stage errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which part of the pipeline an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingestion,
    Preprocess,
    Balance,
    Training,
    Data,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::Preprocess => "preprocess",
            Stage::Balance => "balance",
            Stage::Training => "training",
            Stage::Data => "data",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Download or split of the raw dataset failed.
    #[error("{message}")]
    Ingestion {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Cleaning, encoding, deskewing or feature selection failed.
    #[error("{message}")]
    Preprocess {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Class rebalancing failed.
    #[error("{message}")]
    Balance {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Search, evaluation, persistence or tracking failed.
    #[error("{message}")]
    Training {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A dataset did not have the expected shape or columns.
    #[error("{message}")]
    Data {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The configuration document could not be read or parsed.
    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl PipelineError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self::build(stage, message.into(), None)
    }

    pub fn with_source(stage: Stage, message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::build(stage, message.into(), Some(source.into()))
    }

    fn build(stage: Stage, message: String, source: Option<BoxError>) -> Self {
        match stage {
            Stage::Ingestion => Self::Ingestion { message, source },
            Stage::Preprocess => Self::Preprocess { message, source },
            Stage::Balance => Self::Balance { message, source },
            Stage::Training => Self::Training { message, source },
            Stage::Data => Self::Data { message, source },
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Stage label; `None` for configuration errors.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Ingestion { .. } => Some(Stage::Ingestion),
            Self::Preprocess { .. } => Some(Stage::Preprocess),
            Self::Balance { .. } => Some(Stage::Balance),
            Self::Training { .. } => Some(Stage::Training),
            Self::Data { .. } => Some(Stage::Data),
            Self::Config { .. } => None,
        }
    }

    /// Stable error code for log aggregation and callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Ingestion { .. } => "INGESTION_ERROR",
            Self::Preprocess { .. } => "PREPROCESS_ERROR",
            Self::Balance { .. } => "BALANCE_ERROR",
            Self::Training { .. } => "TRAINING_ERROR",
            Self::Data { .. } => "DATA_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
        }
    }

    /// Whether `stage` appears anywhere in this error's cause chain.
    pub fn involves(&self, stage: Stage) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            let matches = err
                .downcast_ref::<PipelineError>()
                .is_some_and(|e| e.stage() == Some(stage));
            if matches {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// The message followed by every cause, joined with `": "`.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            out.push_str(": ");
            out.push_str(&err.to_string());
            current = err.source();
        }
        out
    }
}

/// Errors are serialized as `{code, message}` for machine-readable output.
impl Serialize for PipelineError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("PipelineError", 2)?;
        state.serialize_field("code", &self.error_code())?;
        state.serialize_field("message", &self.chain())?;
        state.end()
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for tagging any error with a stage and message.
pub trait ResultExt<T> {
    fn stage_context(self, stage: Stage, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn stage_context(self, stage: Stage, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipelineError::with_source(stage, message, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_code() {
        assert_eq!(
            PipelineError::new(Stage::Ingestion, "x").error_code(),
            "INGESTION_ERROR"
        );
        assert_eq!(PipelineError::config("bad").error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_stage_roundtrip() {
        for stage in [
            Stage::Ingestion,
            Stage::Preprocess,
            Stage::Balance,
            Stage::Training,
            Stage::Data,
        ] {
            assert_eq!(PipelineError::new(stage, "m").stage(), Some(stage));
        }
        assert_eq!(PipelineError::config("m").stage(), None);
    }

    #[test]
    fn test_stage_context_keeps_cause() {
        let result: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "raw.csv missing"));
        let err = result
            .stage_context(Stage::Ingestion, "Failed to read raw data")
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to read raw data");
        assert_eq!(err.chain(), "Failed to read raw data: raw.csv missing");
    }

    #[test]
    fn test_involves_nested_stage() {
        let inner = PipelineError::new(Stage::Balance, "only one class");
        let outer = PipelineError::with_source(Stage::Preprocess, "Preprocessing failed", inner);
        assert!(outer.involves(Stage::Preprocess));
        assert!(outer.involves(Stage::Balance));
        assert!(!outer.involves(Stage::Training));
    }

    #[test]
    fn test_serialization() {
        let err = PipelineError::new(Stage::Data, "label column missing");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("DATA_ERROR"));
        assert!(json.contains("label column missing"));
    }
}
