//! Epoch loop, checkpoint cadence and artifact emission.

use std::time::Instant;

use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use regression_dataset::{
    BatchLoader, DatasetConfig, DatasetSource, RegressionBatch, Split, NORM_MEAN, NORM_STD,
};
use regression_models::RegressionNet;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::{Mode, RunConfig};
use crate::error::{RunError, RunResult};
use crate::layout::ResultLayout;
use crate::metrics::{LossTracker, MetricsSink};
use crate::postprocess::{
    clip, denormalize, first_to_hwc, preview_step, tensor_to_hwc, test_sample_index,
};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

const ARTIFACT_TAGS: [&str; 3] = ["label", "input", "output"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Gradient updates, previews keyed per epoch.
    Train,
    /// No updates, previews keyed per epoch.
    Validate,
    /// No updates, every sample exported.
    Test,
}

impl PassKind {
    pub fn split(&self) -> Split {
        match self {
            PassKind::Train => Split::Train,
            PassKind::Validate => Split::Val,
            PassKind::Test => Split::Test,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PassKind::Train => "TRAIN",
            PassKind::Validate => "VALID",
            PassKind::Test => "TEST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassOutcome {
    pub batches: usize,
    pub samples: usize,
    /// Unweighted mean of the batch losses.
    pub mean_loss: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epoch the run resumed from (0 for a fresh run).
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub last_train_loss: Option<f64>,
    pub last_val_loss: Option<f64>,
    /// Epochs of the snapshots written by this run.
    pub checkpoints: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestSummary {
    /// Epoch of the checkpoint that was evaluated.
    pub epoch: usize,
    pub batches: usize,
    pub samples: usize,
    pub mean_loss: f64,
}

pub struct Trainer<'a, B: AutodiffBackend, O, S> {
    config: &'a RunConfig,
    device: B::Device,
    model: RegressionNet<B>,
    optim: O,
    sink: S,
    store: CheckpointStore,
    layout: ResultLayout,
    start_epoch: usize,
}

impl<'a, B, O, S> Trainer<'a, B, O, S>
where
    B: AutodiffBackend,
    O: Optimizer<RegressionNet<B>, B>,
    S: MetricsSink,
{
    /// Restores state as the mode requires: test and `--train_continue on`
    /// load a snapshot, a fresh training run refuses a populated checkpoint dir.
    pub fn new(
        config: &'a RunConfig,
        device: B::Device,
        model: RegressionNet<B>,
        optim: O,
        sink: S,
    ) -> RunResult<Self> {
        let store = CheckpointStore::new(&config.ckpt_dir);
        let layout = ResultLayout::new(&config.result_dir);

        let (model, optim, start_epoch) = if config.mode == Mode::Test || config.resumes() {
            let restored = match config.ckpt_epoch {
                Some(epoch) => store.load_epoch(model, optim, epoch, &device)?,
                None => store.load(model, optim, &device)?,
            };
            if (restored.state.learning_rate - config.lr).abs() > f64::EPSILON
                && config.mode == Mode::Train
            {
                warn!(
                    saved = restored.state.learning_rate,
                    configured = config.lr,
                    "checkpoint learning rate differs; continuing with the configured one"
                );
            }
            if config.mode == Mode::Train {
                check_resume_cadence(&store, config, restored.state.epoch)?;
            }
            (restored.model, restored.optim, restored.state.epoch)
        } else {
            if let Some(latest) = store.latest()? {
                return Err(RunError::Configuration(format!(
                    "{} already holds checkpoints up to epoch {latest}; pass --train_continue on or choose an empty --ckpt_dir",
                    store.dir().display()
                )));
            }
            (model, optim, 0)
        };

        Ok(Self {
            config,
            device,
            model,
            optim,
            sink,
            store,
            layout,
            start_epoch,
        })
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn model(&self) -> &RegressionNet<B> {
        &self.model
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn open_loader(&self, split: Split, shuffle: bool) -> RunResult<BatchLoader> {
        let cfg = DatasetConfig {
            crop: self.config.crop,
            channels: self.config.model.channels,
            corruption: self.config.corruption.clone(),
            seed: self.config.seed,
        };
        let source = DatasetSource::open(&self.config.data_dir, split, &cfg)?;
        Ok(BatchLoader::new(
            source,
            self.config.batch_size,
            shuffle,
            self.config.seed,
        ))
    }

    pub fn train(&mut self) -> RunResult<TrainingSummary> {
        let mut train_loader = self.open_loader(Split::Train, true)?;
        let mut val_loader = self.open_loader(Split::Val, true)?;
        self.layout.ensure()?;
        info!(
            train_samples = train_loader.len(),
            train_batches = train_loader.num_batches(),
            val_samples = val_loader.len(),
            val_batches = val_loader.num_batches(),
            start_epoch = self.start_epoch,
            "starting training"
        );
        if self.start_epoch >= self.config.num_epoch {
            info!(
                "checkpoint epoch {} already reaches --num_epoch {}; nothing to train",
                self.start_epoch, self.config.num_epoch
            );
        }

        let mut summary = TrainingSummary {
            start_epoch: self.start_epoch,
            epochs_run: 0,
            last_train_loss: None,
            last_val_loss: None,
            checkpoints: Vec::new(),
        };
        for epoch in self.start_epoch + 1..=self.config.num_epoch {
            let started = Instant::now();
            let train = self.run_pass(PassKind::Train, &mut train_loader, epoch)?;
            let val = self.run_pass(PassKind::Validate, &mut val_loader, epoch)?;

            self.sink.scalar("train", "loss", train.mean_loss, epoch)?;
            self.sink.scalar("val", "loss", val.mean_loss, epoch)?;

            if epoch % self.config.checkpoint_every == 0 {
                let state = CheckpointState {
                    epoch,
                    learning_rate: self.config.lr,
                    model: self.config.model,
                };
                self.store.save(&self.model, &self.optim, &state)?;
                summary.checkpoints.push(epoch);
            }

            info!(
                "epoch {epoch}/{}: train loss {:.4} | val loss {:.4} | {:.1}s",
                self.config.num_epoch,
                train.mean_loss,
                val.mean_loss,
                started.elapsed().as_secs_f32()
            );
            summary.epochs_run += 1;
            summary.last_train_loss = Some(train.mean_loss);
            summary.last_val_loss = Some(val.mean_loss);
        }

        self.sink.close()?;
        Ok(summary)
    }

    pub fn test(&mut self) -> RunResult<TestSummary> {
        let mut loader = self.open_loader(Split::Test, false)?;
        self.layout.ensure()?;
        info!(
            samples = loader.len(),
            batches = loader.num_batches(),
            checkpoint_epoch = self.start_epoch,
            "starting test"
        );
        let outcome = self.run_pass(PassKind::Test, &mut loader, self.start_epoch)?;
        self.sink.close()?;
        Ok(TestSummary {
            epoch: self.start_epoch,
            batches: outcome.batches,
            samples: outcome.samples,
            mean_loss: outcome.mean_loss,
        })
    }

    /// One full pass over `loader`. Only [`PassKind::Train`] touches gradients.
    pub fn run_pass(
        &mut self,
        kind: PassKind,
        loader: &mut BatchLoader,
        epoch: usize,
    ) -> RunResult<PassOutcome> {
        loader.reset();
        let num_batches = loader.num_batches();
        let eval_model = (kind != PassKind::Train).then(|| self.model.valid());

        let mut tracker = LossTracker::default();
        let mut batch_no = 0;
        let mut samples = 0;
        while let Some(batch) = loader.next_batch::<Inner<B>>(&self.device)? {
            batch_no += 1;
            samples += batch.len();
            let RegressionBatch { input, label, .. } = batch;

            let (output, loss) = match &eval_model {
                None => self.train_step(input.clone(), label.clone())?,
                Some(model) => evaluate(model, input.clone(), label.clone())?,
            };
            tracker.push(loss);

            match kind {
                PassKind::Train | PassKind::Validate => {
                    info!(
                        "{}: EPOCH {epoch:04} / {:04} | BATCH {batch_no:04} / {num_batches:04} | LOSS {:.4}",
                        kind.label(),
                        self.config.num_epoch,
                        tracker.mean()
                    );
                    let id = preview_step(num_batches, epoch, batch_no);
                    self.write_previews(kind.split(), id, [label, input, output])?;
                }
                PassKind::Test => {
                    info!(
                        "TEST: BATCH {batch_no:04} / {num_batches:04} | LOSS {:.4}",
                        tracker.mean()
                    );
                    self.write_test_artifacts(batch_no, [label, input, output])?;
                }
            }
        }
        if kind == PassKind::Test {
            info!(
                "AVERAGE TEST: BATCH {batch_no:04} / {num_batches:04} | LOSS {:.4}",
                tracker.mean()
            );
        }

        Ok(PassOutcome {
            batches: batch_no,
            samples,
            mean_loss: tracker.mean(),
        })
    }

    fn train_step(
        &mut self,
        input: Tensor<Inner<B>, 4>,
        label: Tensor<Inner<B>, 4>,
    ) -> RunResult<(Tensor<Inner<B>, 4>, f64)> {
        let input = Tensor::<B, 4>::from_inner(input);
        let label = Tensor::<B, 4>::from_inner(label);

        let output = self.model.forward(input);
        check_shapes(output.dims(), label.dims())?;
        let loss = MseLoss::new().forward(output.clone(), label, Reduction::Mean);
        let value = finite_loss(loss.clone().inner())?;

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optim.step(self.config.lr, self.model.clone(), grads);
        Ok((output.inner(), value))
    }

    /// Label, input and output previews of the first sample of a batch.
    fn write_previews(
        &mut self,
        split: Split,
        id: usize,
        tensors: [Tensor<Inner<B>, 4>; 3],
    ) -> RunResult<()> {
        let dir = self.layout.png_dir(split);
        for (tag, tensor) in ARTIFACT_TAGS.into_iter().zip(tensors) {
            let preview = clip(denormalize(first_to_hwc(tensor)?, NORM_MEAN, NORM_STD), 0.0, 1.0);
            self.sink.image(&dir, tag, &preview, id)?;
        }
        Ok(())
    }

    /// Raw `.npy` dumps plus clipped previews for every sample of a test batch.
    fn write_test_artifacts(
        &mut self,
        batch_no: usize,
        tensors: [Tensor<Inner<B>, 4>; 3],
    ) -> RunResult<()> {
        let png_dir = self.layout.png_dir(Split::Test);
        let numpy_dir = self.layout.numpy_dir();
        for (tag, tensor) in ARTIFACT_TAGS.into_iter().zip(tensors) {
            for (offset, array) in tensor_to_hwc(tensor)?.into_iter().enumerate() {
                let id = test_sample_index(self.config.batch_size, batch_no, offset);
                let raw = denormalize(array, NORM_MEAN, NORM_STD);
                self.sink.array(&numpy_dir, tag, &raw, id)?;
                self.sink.image(&png_dir, tag, &clip(raw, 0.0, 1.0), id)?;
            }
        }
        debug!(batch = batch_no, "wrote test artifacts");
        Ok(())
    }
}

/// A resumed run must not reach a cadence epoch that already has a snapshot,
/// since snapshots are never rewritten.
fn check_resume_cadence(
    store: &CheckpointStore,
    config: &RunConfig,
    start_epoch: usize,
) -> RunResult<()> {
    let conflict = store.list()?.into_iter().find(|&epoch| {
        epoch > start_epoch && epoch <= config.num_epoch && epoch % config.checkpoint_every == 0
    });
    match conflict {
        Some(epoch) => Err(RunError::Configuration(format!(
            "resuming from epoch {start_epoch} would rewrite the existing snapshot {}; resume from epoch {epoch} or later, or lower --num_epoch",
            store.snapshot_dir(epoch).display()
        ))),
        None => Ok(()),
    }
}

fn evaluate<IB: Backend>(
    model: &RegressionNet<IB>,
    input: Tensor<IB, 4>,
    label: Tensor<IB, 4>,
) -> RunResult<(Tensor<IB, 4>, f64)> {
    let output = model.forward(input);
    check_shapes(output.dims(), label.dims())?;
    let loss = MseLoss::new().forward(output.clone(), label, Reduction::Mean);
    Ok((output, finite_loss(loss)?))
}

fn check_shapes(output: [usize; 4], label: [usize; 4]) -> RunResult<()> {
    if output != label {
        return Err(RunError::RuntimeCompute(format!(
            "model output shape {output:?} does not match label shape {label:?}"
        )));
    }
    Ok(())
}

fn finite_loss<IB: Backend>(loss: Tensor<IB, 1>) -> RunResult<f64> {
    let value = loss.into_scalar().elem::<f64>();
    if !value.is_finite() {
        return Err(RunError::RuntimeCompute(format!("loss is not finite ({value})")));
    }
    Ok(value)
}
