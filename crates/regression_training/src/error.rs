use regression_dataset::DatasetError;
use std::path::PathBuf;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::metrics::MetricsError;

pub type RunResult<T> = Result<T, RunError>;

/// Fatal run failures. None of these are retried.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("data source error: {0}")]
    DataSource(#[from] DatasetError),
    #[error("checkpoint error: {0}")]
    Checkpoint(CheckpointError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("runtime compute error: {0}")]
    RuntimeCompute(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<CheckpointError> for RunError {
    fn from(err: CheckpointError) -> Self {
        match err {
            // A snapshot written for another topology is a flag problem, not a storage one.
            CheckpointError::Mismatch { .. } => RunError::Configuration(err.to_string()),
            other => RunError::Checkpoint(other),
        }
    }
}
