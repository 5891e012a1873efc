use burn::backend::Autodiff;
use burn::optim::AdamConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use regression_models::RegressionNet;
use tracing::info;

use crate::config::{BackendKind, Mode, RunConfig};
use crate::error::{RunError, RunResult};
use crate::metrics::FileMetricsSink;
use crate::orchestrator::{TestSummary, Trainer, TrainingSummary};
use crate::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

#[derive(Debug, Clone, PartialEq)]
pub enum RunSummary {
    Train(TrainingSummary),
    Test(TestSummary),
}

/// Runs the configured mode on [`TrainBackend`].
pub fn run(config: &RunConfig) -> RunResult<RunSummary> {
    validate_backend_choice(config.backend)?;
    let device = <ADBackend as Backend>::Device::default();
    run_with_backend::<ADBackend>(config, device)
}

pub fn run_with_backend<B: AutodiffBackend>(
    config: &RunConfig,
    device: B::Device,
) -> RunResult<RunSummary> {
    info!("{}", config.summary());
    if let Some(seed) = config.seed {
        B::seed(seed);
    }

    let model = RegressionNet::<B>::new(config.model, &device);
    let optim = AdamConfig::new().init::<B, RegressionNet<B>>();
    let sink = FileMetricsSink::new(&config.log_dir);
    let mut trainer = Trainer::new(config, device, model, optim, sink)?;

    match config.mode {
        Mode::Train => trainer.train().map(RunSummary::Train),
        Mode::Test => trainer.test().map(RunSummary::Test),
    }
}

pub fn validate_backend_choice(kind: BackendKind) -> RunResult<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            return Err(RunError::Configuration(
                "backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose the ndarray backend".into(),
            ));
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; running on the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
