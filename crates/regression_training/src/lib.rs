#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod layout;
pub mod metrics;
pub mod orchestrator;
pub mod postprocess;
pub mod util;

pub use checkpoint::{CheckpointError, CheckpointState, CheckpointStore, Restored};
pub use config::{BackendKind, Mode, RunArgs, RunConfig, CHECKPOINT_EVERY};
pub use error::{RunError, RunResult};
pub use layout::ResultLayout;
pub use metrics::{FileMetricsSink, LossTracker, MetricsError, MetricsSink, ScalarRecord};
pub use orchestrator::{PassKind, PassOutcome, TestSummary, Trainer, TrainingSummary};
pub use regression_models::{RegressionNet, RegressionNetConfig};
pub use util::{run, run_with_backend, validate_backend_choice, RunSummary};

/// Backend alias for training/test (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
