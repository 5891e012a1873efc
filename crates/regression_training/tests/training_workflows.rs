use std::fs;
use std::path::{Path, PathBuf};

use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::{Distribution, Tensor};
use regression_dataset::{BatchLoader, Corruption, DatasetConfig, DatasetSource, Split, Task};
use regression_models::{LearningType, Network, RegressionNet, RegressionNetConfig};
use regression_training::{
    run_with_backend, BackendKind, CheckpointError, CheckpointState, CheckpointStore,
    FileMetricsSink, Mode, PassKind, ResultLayout, RunConfig, RunError, RunSummary,
    ScalarRecord, Trainer, CHECKPOINT_EVERY,
};

type AD = Autodiff<NdArray<f32>>;

struct Workspace {
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new(channels: usize, test_images: usize) -> Self {
        Self::with_train_images(channels, 2, test_images)
    }

    fn with_train_images(channels: usize, train_images: usize, test_images: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        for (split, count) in [("train", train_images), ("val", 2), ("test", test_images)] {
            let dir = root.join("data").join(split);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                write_image(&dir.join(format!("img_{i}.png")), channels, i as u8);
            }
        }
        Self { _tmp: tmp, root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn write_image(path: &Path, channels: usize, seed: u8) {
    if channels == 1 {
        image::GrayImage::from_fn(16, 16, |x, y| {
            image::Luma([(x as u8 * 13).wrapping_add(y as u8 * 7).wrapping_add(seed * 31)])
        })
        .save(path)
        .unwrap();
    } else {
        image::RgbImage::from_fn(16, 16, |x, y| {
            image::Rgb([x as u8 * 15, y as u8 * 15, seed.wrapping_mul(40)])
        })
        .save(path)
        .unwrap();
    }
}

fn tiny_model(channels: usize, base_width: usize) -> RegressionNetConfig {
    RegressionNetConfig {
        channels,
        base_width,
        network: Network::UNet,
        learning_type: LearningType::Plain,
    }
}

fn config(ws: &Workspace, mode: Mode, train_continue: bool, num_epoch: usize) -> RunConfig {
    let opts = vec!["random".to_string(), "10".to_string()];
    RunConfig {
        mode,
        train_continue,
        lr: 1e-3,
        batch_size: 2,
        num_epoch,
        data_dir: ws.path("data"),
        ckpt_dir: ws.path("checkpoint"),
        log_dir: ws.path("log"),
        result_dir: ws.path("result"),
        task: Task::Denoising,
        corruption: Corruption::from_opts(Task::Denoising, &opts).unwrap(),
        crop: (16, 16),
        model: tiny_model(1, 2),
        seed: Some(7),
        ckpt_epoch: None,
        backend: BackendKind::NdArray,
        checkpoint_every: CHECKPOINT_EVERY,
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn open_loader(cfg: &RunConfig, split: Split, shuffle: bool) -> BatchLoader {
    let dataset = DatasetConfig {
        crop: cfg.crop,
        channels: cfg.model.channels,
        corruption: cfg.corruption.clone(),
        seed: cfg.seed,
    };
    let source = DatasetSource::open(&cfg.data_dir, split, &dataset).unwrap();
    BatchLoader::new(source, cfg.batch_size, shuffle, cfg.seed)
}

fn read_scalars(path: &Path) -> Vec<ScalarRecord> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Independent copy, so batch-norm running statistics are not shared.
fn twin(model: &RegressionNet<AD>) -> RegressionNet<AD> {
    RegressionNet::<AD>::new(model.config(), &Default::default())
        .load_record(model.clone().into_record())
}

fn save_untrained(cfg: &RunConfig, epoch: usize) {
    let device = Default::default();
    let model = RegressionNet::<AD>::new(cfg.model, &device);
    let optim = AdamConfig::new().init::<AD, RegressionNet<AD>>();
    let state = CheckpointState {
        epoch,
        learning_rate: cfg.lr,
        model: cfg.model,
    };
    CheckpointStore::new(&cfg.ckpt_dir)
        .save(&model, &optim, &state)
        .unwrap();
}

#[test]
fn fifty_epochs_write_exactly_one_checkpoint_and_resume_continues_after_it() {
    let ws = Workspace::new(1, 2);
    let cfg = config(&ws, Mode::Train, false, 50);
    let summary = match run_with_backend::<AD>(&cfg, Default::default()).unwrap() {
        RunSummary::Train(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    };
    assert_eq!(summary.start_epoch, 0);
    assert_eq!(summary.epochs_run, 50);
    assert_eq!(summary.checkpoints, vec![50]);
    assert!(summary.last_train_loss.unwrap().is_finite());
    assert_eq!(CheckpointStore::new(&cfg.ckpt_dir).list().unwrap(), vec![50]);

    // One batch per epoch, so preview ids equal epochs.
    let train_png = ws.path("result/train/png");
    assert!(train_png.join("0001_label.png").exists());
    assert!(train_png.join("0050_output.png").exists());
    assert!(!train_png.join("0051_output.png").exists());
    assert!(ws.path("result/val/png/0050_input.png").exists());

    let scalars = fs::read_to_string(ws.path("log/train/scalars.jsonl")).unwrap();
    assert_eq!(scalars.lines().count(), 50);
    let val_scalars = fs::read_to_string(ws.path("log/val/scalars.jsonl")).unwrap();
    assert_eq!(val_scalars.lines().count(), 50);

    // Resume into a fresh result directory to see exactly what the second run produces.
    let mut resumed = config(&ws, Mode::Train, true, 100);
    resumed.result_dir = ws.path("result_resumed");
    let summary = match run_with_backend::<AD>(&resumed, Default::default()).unwrap() {
        RunSummary::Train(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    };
    assert_eq!(summary.start_epoch, 50);
    assert_eq!(summary.epochs_run, 50);
    assert_eq!(summary.checkpoints, vec![100]);
    assert_eq!(
        CheckpointStore::new(&cfg.ckpt_dir).list().unwrap(),
        vec![50, 100]
    );

    let names = file_names(&ws.path("result_resumed/train/png"));
    assert_eq!(names.len(), 50 * 3);
    let ids: Vec<usize> = names
        .iter()
        .map(|n| n[..4].parse::<usize>().unwrap())
        .collect();
    assert!(ids.iter().all(|id| (51..=100).contains(id)));
}

#[test]
fn fresh_training_refuses_a_populated_checkpoint_dir() {
    let ws = Workspace::new(1, 1);
    let cfg = config(&ws, Mode::Train, false, 2);
    save_untrained(&cfg, 50);
    let err = run_with_backend::<AD>(&cfg, Default::default()).unwrap_err();
    assert!(matches!(err, RunError::Configuration(_)), "{err}");
}

#[test]
fn resume_that_would_rewrite_a_later_snapshot_fails_before_training() {
    let ws = Workspace::new(1, 1);
    let mut cfg = config(&ws, Mode::Train, false, 3);
    cfg.checkpoint_every = 1;
    run_with_backend::<AD>(&cfg, Default::default()).unwrap();
    let store = CheckpointStore::new(&cfg.ckpt_dir);
    assert_eq!(store.list().unwrap(), vec![1, 2, 3]);

    let mut resumed = config(&ws, Mode::Train, true, 3);
    resumed.checkpoint_every = 1;
    resumed.ckpt_epoch = Some(1);
    resumed.result_dir = ws.path("result_resumed");
    let err = run_with_backend::<AD>(&resumed, Default::default()).unwrap_err();
    match &err {
        RunError::Configuration(msg) => assert!(msg.contains("model_epoch2"), "{msg}"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(read_scalars(&ws.path("log/train/scalars.jsonl")).len(), 3);
    assert!(!ws.path("result_resumed").exists());

    // Stopping short of the next snapshot is allowed.
    resumed.num_epoch = 1;
    let summary = match run_with_backend::<AD>(&resumed, Default::default()).unwrap() {
        RunSummary::Train(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    };
    assert_eq!(summary.start_epoch, 1);
    assert_eq!(summary.epochs_run, 0);
}

#[test]
fn missing_train_split_fails_before_creating_the_result_tree() {
    let ws = Workspace::new(1, 1);
    fs::remove_dir_all(ws.path("data/train")).unwrap();
    let cfg = config(&ws, Mode::Train, false, 1);
    let err = run_with_backend::<AD>(&cfg, Default::default()).unwrap_err();
    assert!(matches!(err, RunError::DataSource(_)), "{err}");
    assert!(!ws.path("result").exists());
}

#[test]
fn validation_pass_leaves_the_model_untouched() {
    let ws = Workspace::new(1, 1);
    let cfg = config(&ws, Mode::Train, false, 1);
    ResultLayout::new(&cfg.result_dir).ensure().unwrap();
    let device = Default::default();
    let input = Tensor::<AD, 4>::random([2, 1, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);
    let model = RegressionNet::<AD>::new(cfg.model, &device);

    let mut validated = Trainer::new(
        &cfg,
        device,
        twin(&model),
        AdamConfig::new().init::<AD, RegressionNet<AD>>(),
        FileMetricsSink::new(ws.path("log_validated")),
    )
    .unwrap();
    let before = eval_values(validated.model(), &input);
    let outcome = validated
        .run_pass(PassKind::Validate, &mut open_loader(&cfg, Split::Val, true), 1)
        .unwrap();
    assert_eq!(outcome.batches, 1);
    assert_eq!(outcome.samples, 2);
    assert_eq!(eval_values(validated.model(), &input), before);

    // A training pass after validation matches one without it.
    let mut direct = Trainer::new(
        &cfg,
        device,
        twin(&model),
        AdamConfig::new().init::<AD, RegressionNet<AD>>(),
        FileMetricsSink::new(ws.path("log_direct")),
    )
    .unwrap();
    let after_val = validated
        .run_pass(PassKind::Train, &mut open_loader(&cfg, Split::Train, true), 1)
        .unwrap();
    let plain = direct
        .run_pass(PassKind::Train, &mut open_loader(&cfg, Split::Train, true), 1)
        .unwrap();
    assert_eq!(after_val, plain);
    assert_eq!(
        eval_values(validated.model(), &input),
        eval_values(direct.model(), &input)
    );
}

#[test]
fn epoch_loss_is_the_unweighted_mean_of_batch_losses() {
    // Three samples at batch size 2: a full batch and a single-sample batch.
    let ws = Workspace::with_train_images(1, 3, 1);
    let mut cfg = config(&ws, Mode::Train, false, 1);
    // Zero learning rate keeps the weights fixed so the batch losses can be recomputed.
    cfg.lr = 0.0;
    let device = Default::default();
    let model = RegressionNet::<AD>::new(cfg.model, &device);
    let mut trainer = Trainer::new(
        &cfg,
        device,
        twin(&model),
        AdamConfig::new().init::<AD, RegressionNet<AD>>(),
        FileMetricsSink::new(&cfg.log_dir),
    )
    .unwrap();
    let summary = trainer.train().unwrap();

    // The trainer's loader has been reset once by the time its first pass starts.
    let mut loader = open_loader(&cfg, Split::Train, true);
    loader.reset();
    let mut losses = Vec::new();
    while let Some(batch) = loader.next_batch::<NdArray<f32>>(&device).unwrap() {
        let output = model.forward(Tensor::from_inner(batch.input));
        let loss = MseLoss::new().forward(output, Tensor::from_inner(batch.label), Reduction::Mean);
        losses.push(loss.into_scalar() as f64);
    }
    assert_eq!(losses.len(), 2);
    let unweighted = (losses[0] + losses[1]) / 2.0;
    let weighted = (2.0 * losses[0] + losses[1]) / 3.0;
    assert!((unweighted - weighted).abs() > 1e-9);

    let records = read_scalars(&ws.path("log/train/scalars.jsonl"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step, 1);
    assert!(
        (records[0].value - unweighted).abs() <= 1e-12 * unweighted.abs().max(1.0),
        "{} != {unweighted}",
        records[0].value
    );
    let last = summary.last_train_loss.unwrap();
    assert!((last - unweighted).abs() <= 1e-12 * unweighted.abs().max(1.0));
}

#[test]
fn test_mode_without_checkpoint_fails_before_writing_artifacts() {
    let ws = Workspace::new(1, 2);
    let cfg = config(&ws, Mode::Test, false, 1);
    let err = run_with_backend::<AD>(&cfg, Default::default()).unwrap_err();
    assert!(
        matches!(err, RunError::Checkpoint(CheckpointError::NotFound { .. })),
        "{err}"
    );
    assert!(file_names(&ws.path("result/test/numpy")).is_empty());
    assert!(file_names(&ws.path("result/test/png")).is_empty());
}

#[test]
fn resume_without_checkpoint_is_fatal() {
    let ws = Workspace::new(1, 1);
    let cfg = config(&ws, Mode::Train, true, 2);
    let err = run_with_backend::<AD>(&cfg, Default::default()).unwrap_err();
    assert!(matches!(
        err,
        RunError::Checkpoint(CheckpointError::NotFound { .. })
    ));
}

#[test]
fn test_mode_exports_every_sample() {
    let ws = Workspace::new(3, 3);
    let mut cfg = config(&ws, Mode::Test, false, 1);
    let opts = vec!["bilinear".to_string(), "2".to_string()];
    cfg.task = Task::SuperResolution;
    cfg.corruption = Corruption::from_opts(Task::SuperResolution, &opts).unwrap();
    cfg.model = tiny_model(3, 2);
    save_untrained(&cfg, 7);

    let summary = match run_with_backend::<AD>(&cfg, Default::default()).unwrap() {
        RunSummary::Test(summary) => summary,
        other => panic!("unexpected summary {other:?}"),
    };
    assert_eq!(summary.epoch, 7);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.samples, 3);
    assert!(summary.mean_loss.is_finite());

    let expected: Vec<String> = (0..3)
        .flat_map(|id| {
            ["input", "label", "output"]
                .into_iter()
                .map(move |tag| format!("{id:04}_{tag}"))
        })
        .collect();
    let stems = |dir: &str, ext: &str| -> Vec<String> {
        file_names(&ws.path(dir))
            .into_iter()
            .map(|n| n.trim_end_matches(ext).to_string())
            .collect()
    };
    assert_eq!(stems("result/test/numpy", ".npy"), expected);
    assert_eq!(stems("result/test/png", ".png"), expected);

    let png = image::open(ws.path("result/test/png/0002_output.png")).unwrap();
    assert_eq!((png.width(), png.height()), (16, 16));
}

#[test]
fn snapshot_for_another_topology_is_a_configuration_error() {
    let ws = Workspace::new(1, 1);
    let cfg = config(&ws, Mode::Test, false, 1);
    save_untrained(&cfg, 50);

    let mut wider = cfg.clone();
    wider.model = tiny_model(1, 4);
    let err = run_with_backend::<AD>(&wider, Default::default()).unwrap_err();
    assert!(matches!(err, RunError::Configuration(_)), "{err}");
}

fn train_step(
    model: RegressionNet<AD>,
    optim: &mut impl Optimizer<RegressionNet<AD>, AD>,
    input: Tensor<AD, 4>,
) -> RegressionNet<AD> {
    let output = model.forward(input.clone());
    let loss = MseLoss::new().forward(output, input, Reduction::Mean);
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    optim.step(1e-2, model, grads)
}

fn eval_values(model: &RegressionNet<AD>, input: &Tensor<AD, 4>) -> Vec<f32> {
    model
        .valid()
        .forward(input.clone().inner())
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn checkpoint_round_trip_restores_model_and_optimizer() {
    let tmp = tempfile::tempdir().unwrap();
    let device = Default::default();
    let cfg = tiny_model(1, 2);
    let input = Tensor::<AD, 4>::random([2, 1, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);

    let mut optim = AdamConfig::new().init::<AD, RegressionNet<AD>>();
    let mut model = RegressionNet::<AD>::new(cfg, &device);
    for _ in 0..2 {
        model = train_step(model, &mut optim, input.clone());
    }

    let store = CheckpointStore::new(tmp.path());
    let state = CheckpointState {
        epoch: 3,
        learning_rate: 1e-2,
        model: cfg,
    };
    store.save(&model, &optim, &state).unwrap();
    assert!(matches!(
        store.save(&model, &optim, &state),
        Err(CheckpointError::Exists { epoch: 3, .. })
    ));

    let restored = store
        .load(
            RegressionNet::<AD>::new(cfg, &device),
            AdamConfig::new().init::<AD, RegressionNet<AD>>(),
            &device,
        )
        .unwrap();
    assert_eq!(restored.state, state);
    assert_eq!(
        eval_values(&model, &input),
        eval_values(&restored.model, &input)
    );

    // Identical moments mean an identical next update.
    let mut restored_optim = restored.optim;
    let continued = train_step(model, &mut optim, input.clone());
    let continued_restored = train_step(restored.model, &mut restored_optim, input.clone());
    assert_eq!(
        eval_values(&continued, &input),
        eval_values(&continued_restored, &input)
    );
}

#[test]
fn empty_checkpoint_directory_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let device = Default::default();
    let store = CheckpointStore::new(tmp.path());
    let result = store.load(
        RegressionNet::<AD>::new(tiny_model(1, 2), &device),
        AdamConfig::new().init::<AD, RegressionNet<AD>>(),
        &device,
    );
    assert!(matches!(result, Err(CheckpointError::NotFound { .. })));
    let result = store.load_epoch(
        RegressionNet::<AD>::new(tiny_model(1, 2), &device),
        AdamConfig::new().init::<AD, RegressionNet<AD>>(),
        5,
        &device,
    );
    assert!(matches!(
        result,
        Err(CheckpointError::EpochNotFound { epoch: 5, .. })
    ));
}
