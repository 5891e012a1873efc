use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use regression_dataset::{Corruption, Task};
use regression_models::{check_input_size, LearningType, Network, RegressionNetConfig};

use crate::error::RunError;

/// Epoch cadence of checkpoint snapshots.
pub const CHECKPOINT_EVERY: usize = 50;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "snake_case")]
pub enum TaskKind {
    Inpainting,
    Denoising,
    SuperResolution,
}

impl From<TaskKind> for Task {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Inpainting => Task::Inpainting,
            TaskKind::Denoising => Task::Denoising,
            TaskKind::SuperResolution => Task::SuperResolution,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Unet,
    Hourglass,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningKind {
    Plain,
    Residual,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "Train or evaluate a U-Net image-regression model (inpainting, denoising, super-resolution)"
)]
pub struct RunArgs {
    /// Run mode.
    #[arg(long = "mode", value_enum, default_value_t = Mode::Train)]
    pub mode: Mode,
    /// Resume from the latest checkpoint in --ckpt_dir (train mode only).
    #[arg(long = "train_continue", value_enum, default_value_t = Toggle::Off)]
    pub train_continue: Toggle,
    /// Adam learning rate.
    #[arg(long = "lr", default_value_t = 1e-3)]
    pub lr: f64,
    #[arg(long = "batch_size", default_value_t = 4)]
    pub batch_size: usize,
    #[arg(long = "num_epoch", default_value_t = 100)]
    pub num_epoch: usize,
    /// Dataset root holding train/, val/ and test/ image folders.
    #[arg(long = "data_dir", default_value = "./datasets/BSR/BSDS500/data/images")]
    pub data_dir: PathBuf,
    #[arg(long = "ckpt_dir", default_value = "./checkpoint")]
    pub ckpt_dir: PathBuf,
    #[arg(long = "log_dir", default_value = "./log")]
    pub log_dir: PathBuf,
    #[arg(long = "result_dir", default_value = "./result")]
    pub result_dir: PathBuf,
    #[arg(long = "task", value_enum, default_value_t = TaskKind::SuperResolution)]
    pub task: TaskKind,
    /// Corruption kind followed by its parameters, e.g. `bilinear 4` or `random 30`.
    #[arg(
        long = "opts",
        num_args = 1..,
        default_values = ["bilinear", "4"]
    )]
    pub opts: Vec<String>,
    /// Crop height (divisible by 16).
    #[arg(long = "ny", default_value_t = 320)]
    pub ny: usize,
    /// Crop width (divisible by 16).
    #[arg(long = "nx", default_value_t = 480)]
    pub nx: usize,
    /// Image channels (1 or 3).
    #[arg(long = "nch", default_value_t = 3)]
    pub nch: usize,
    /// Width of the first encoder stage.
    #[arg(long = "nker", default_value_t = 64)]
    pub nker: usize,
    #[arg(long = "network", value_enum, default_value_t = NetworkKind::Unet)]
    pub network: NetworkKind,
    #[arg(long = "learning_type", value_enum, default_value_t = LearningKind::Plain)]
    pub learning_type: LearningKind,
    /// Seed for shuffling, augmentation, corruption and parameter init.
    #[arg(long = "seed")]
    pub seed: Option<u64>,
    /// Load this checkpoint epoch instead of the latest.
    #[arg(long = "ckpt_epoch")]
    pub ckpt_epoch: Option<usize>,
    /// Backend to use (ndarray, or wgpu when built with backend-wgpu).
    #[arg(long = "backend", value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub train_continue: bool,
    pub lr: f64,
    pub batch_size: usize,
    pub num_epoch: usize,
    pub data_dir: PathBuf,
    pub ckpt_dir: PathBuf,
    pub log_dir: PathBuf,
    pub result_dir: PathBuf,
    pub task: Task,
    pub corruption: Corruption,
    /// Crop size as (ny, nx).
    pub crop: (usize, usize),
    pub model: RegressionNetConfig,
    pub seed: Option<u64>,
    pub ckpt_epoch: Option<usize>,
    pub backend: BackendKind,
    pub checkpoint_every: usize,
}

impl RunConfig {
    /// Resume is only meaningful while training.
    pub fn resumes(&self) -> bool {
        self.mode == Mode::Train && self.train_continue
    }

    pub fn summary(&self) -> String {
        format!(
            "mode={:?} task={} corruption=[{}] crop={}x{} nch={} nker={} network={:?} learning_type={:?} lr={} batch_size={} num_epoch={} continue={}",
            self.mode,
            self.task,
            self.corruption.describe(),
            self.crop.0,
            self.crop.1,
            self.model.channels,
            self.model.base_width,
            self.model.network,
            self.model.learning_type,
            self.lr,
            self.batch_size,
            self.num_epoch,
            self.resumes(),
        )
    }
}

impl TryFrom<RunArgs> for RunConfig {
    type Error = RunError;

    fn try_from(args: RunArgs) -> Result<Self, Self::Error> {
        if !(args.lr.is_finite() && args.lr > 0.0) {
            return Err(RunError::Configuration(format!(
                "--lr must be a positive number, got {}",
                args.lr
            )));
        }
        if args.batch_size == 0 {
            return Err(RunError::Configuration("--batch_size must be >= 1".into()));
        }
        if args.num_epoch == 0 {
            return Err(RunError::Configuration("--num_epoch must be >= 1".into()));
        }
        if args.nch != 1 && args.nch != 3 {
            return Err(RunError::Configuration(format!(
                "--nch must be 1 or 3, got {}",
                args.nch
            )));
        }
        if args.nker == 0 {
            return Err(RunError::Configuration("--nker must be >= 1".into()));
        }
        check_input_size(args.ny, args.nx)
            .map_err(|e| RunError::Configuration(format!("--ny/--nx: {e}")))?;
        if args.ckpt_epoch == Some(0) {
            return Err(RunError::Configuration("--ckpt_epoch must be >= 1".into()));
        }

        let task = Task::from(args.task);
        let corruption = Corruption::from_opts(task, &args.opts)
            .map_err(|e| RunError::Configuration(format!("--opts: {e}")))?;

        let model = RegressionNetConfig {
            channels: args.nch,
            base_width: args.nker,
            network: match args.network {
                NetworkKind::Unet => Network::UNet,
                NetworkKind::Hourglass => Network::Hourglass,
            },
            learning_type: match args.learning_type {
                LearningKind::Plain => LearningType::Plain,
                LearningKind::Residual => LearningType::Residual,
            },
        };

        Ok(Self {
            mode: args.mode,
            train_continue: args.train_continue == Toggle::On,
            lr: args.lr,
            batch_size: args.batch_size,
            num_epoch: args.num_epoch,
            data_dir: args.data_dir,
            ckpt_dir: args.ckpt_dir,
            log_dir: args.log_dir,
            result_dir: args.result_dir,
            task,
            corruption,
            crop: (args.ny, args.nx),
            model,
            seed: args.seed,
            ckpt_epoch: args.ckpt_epoch,
            backend: args.backend,
            checkpoint_every: CHECKPOINT_EVERY,
        })
    }
}
