//! Epoch-tagged model + optimizer snapshots.
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! model_epoch50/
//!   model.bin   Burn record of the network (full precision)
//!   optim.bin   Burn record of the Adam state
//!   state.json  epoch, learning rate and network topology
//! ```
//!
//! A snapshot is written under a hidden staging name and renamed into place,
//! so readers only ever see complete snapshots. Snapshots are never rewritten.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::backend::AutodiffBackend;
use regression_models::{RegressionNet, RegressionNetConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SNAPSHOT_PREFIX: &str = "model_epoch";
const MODEL_FILE: &str = "model";
const OPTIM_FILE: &str = "optim";
const STATE_FILE: &str = "state.json";

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found in {dir}")]
    NotFound { dir: PathBuf },
    #[error("checkpoint for epoch {epoch} not found in {dir}")]
    EpochNotFound { dir: PathBuf, epoch: usize },
    #[error("checkpoint for epoch {epoch} already exists at {path}")]
    Exists { path: PathBuf, epoch: usize },
    #[error("checkpoint at {path} was written for {found:?}, but the run is configured for {expected:?}")]
    Mismatch {
        path: PathBuf,
        expected: RegressionNetConfig,
        found: RegressionNetConfig,
    },
    #[error("record error at {path}: {reason}")]
    Recorder { path: PathBuf, reason: RecorderError },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checkpoint state {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Metadata stored beside the records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub epoch: usize,
    pub learning_rate: f64,
    pub model: RegressionNetConfig,
}

/// Model, optimizer and metadata restored from one snapshot.
pub struct Restored<B: AutodiffBackend, O> {
    pub model: RegressionNet<B>,
    pub optim: O,
    pub state: CheckpointState,
}

pub struct CheckpointStore {
    dir: PathBuf,
    recorder: BinFileRecorder<FullPrecisionSettings>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            recorder: BinFileRecorder::<FullPrecisionSettings>::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_dir(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_PREFIX}{epoch}"))
    }

    /// Epochs of all complete snapshots, ascending. A missing directory lists as empty.
    pub fn list(&self) -> CheckpointResult<Vec<usize>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut epochs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(epoch) = parse_snapshot_name(&name.to_string_lossy()) else {
                continue;
            };
            epochs.push(epoch);
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Highest epoch by value, not by name order.
    pub fn latest(&self) -> CheckpointResult<Option<usize>> {
        Ok(self.list()?.last().copied())
    }

    pub fn save<B, O>(
        &self,
        model: &RegressionNet<B>,
        optim: &O,
        state: &CheckpointState,
    ) -> CheckpointResult<PathBuf>
    where
        B: AutodiffBackend,
        O: Optimizer<RegressionNet<B>, B>,
    {
        let target = self.snapshot_dir(state.epoch);
        if target.exists() {
            return Err(CheckpointError::Exists {
                path: target,
                epoch: state.epoch,
            });
        }
        let staging = self
            .dir
            .join(format!(".{SNAPSHOT_PREFIX}{}.partial", state.epoch));
        if staging.exists() {
            // Left over from an interrupted save.
            fs::remove_dir_all(&staging).map_err(|source| CheckpointError::Io {
                path: staging.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&staging).map_err(|source| CheckpointError::Io {
            path: staging.clone(),
            source,
        })?;

        let model_path = staging.join(MODEL_FILE);
        model
            .clone()
            .save_file(model_path.clone(), &self.recorder)
            .map_err(|reason| CheckpointError::Recorder {
                path: model_path,
                reason,
            })?;

        let optim_path = staging.join(OPTIM_FILE);
        Recorder::<B>::record(&self.recorder, optim.to_record(), optim_path.clone()).map_err(
            |reason| CheckpointError::Recorder {
                path: optim_path,
                reason,
            },
        )?;

        let state_path = staging.join(STATE_FILE);
        let json = serde_json::to_string_pretty(state).map_err(|source| CheckpointError::Json {
            path: state_path.clone(),
            source,
        })?;
        fs::write(&state_path, json).map_err(|source| CheckpointError::Io {
            path: state_path,
            source,
        })?;

        fs::rename(&staging, &target).map_err(|source| CheckpointError::Io {
            path: target.clone(),
            source,
        })?;
        tracing::info!(epoch = state.epoch, path = %target.display(), "saved checkpoint");
        Ok(target)
    }

    /// Restores the newest snapshot into `model` / `optim`.
    pub fn load<B, O>(
        &self,
        model: RegressionNet<B>,
        optim: O,
        device: &B::Device,
    ) -> CheckpointResult<Restored<B, O>>
    where
        B: AutodiffBackend,
        O: Optimizer<RegressionNet<B>, B>,
    {
        let epoch = self.latest()?.ok_or_else(|| CheckpointError::NotFound {
            dir: self.dir.clone(),
        })?;
        self.load_epoch(model, optim, epoch, device)
    }

    pub fn load_epoch<B, O>(
        &self,
        model: RegressionNet<B>,
        optim: O,
        epoch: usize,
        device: &B::Device,
    ) -> CheckpointResult<Restored<B, O>>
    where
        B: AutodiffBackend,
        O: Optimizer<RegressionNet<B>, B>,
    {
        let snapshot = self.snapshot_dir(epoch);
        if !snapshot.is_dir() {
            return Err(CheckpointError::EpochNotFound {
                dir: self.dir.clone(),
                epoch,
            });
        }
        let state = read_state(&snapshot.join(STATE_FILE))?;
        let expected = model.config();
        if state.model != expected {
            return Err(CheckpointError::Mismatch {
                path: snapshot,
                expected,
                found: state.model,
            });
        }

        let model_path = snapshot.join(MODEL_FILE);
        let model = model
            .load_file(model_path.clone(), &self.recorder, device)
            .map_err(|reason| CheckpointError::Recorder {
                path: model_path,
                reason,
            })?;

        let optim_path = snapshot.join(OPTIM_FILE);
        let record: O::Record = Recorder::<B>::load(&self.recorder, optim_path.clone(), device).map_err(
            |reason| CheckpointError::Recorder {
                path: optim_path,
                reason,
            },
        )?;
        let optim = optim.load_record(record);

        tracing::info!(epoch = state.epoch, path = %snapshot.display(), "loaded checkpoint");
        Ok(Restored {
            model,
            optim,
            state,
        })
    }
}

fn read_state(path: &Path) -> CheckpointResult<CheckpointState> {
    let raw = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_snapshot_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(SNAPSHOT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
