//! Batch iteration for training, validation and test passes.

use crate::source::DatasetSource;
use crate::types::{DatasetError, DatasetResult, Sample};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// Stacked `[N, C, H, W]` input/label tensors plus the source indices.
#[derive(Debug, Clone)]
pub struct RegressionBatch<B: Backend> {
    pub input: Tensor<B, 4>,
    pub label: Tensor<B, 4>,
    pub indices: Vec<usize>,
}

impl<B: Backend> RegressionBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Groups samples of one split into mini-batches. Samples within a batch are
/// decoded in parallel and reassembled in order; only the last batch of a
/// pass may be short.
pub struct BatchLoader {
    source: DatasetSource,
    batch_size: usize,
    shuffle: bool,
    seed: Option<u64>,
    order: Vec<usize>,
    cursor: usize,
    pass: u64,
    processed_samples: usize,
    processed_batches: usize,
    total_load_time: Duration,
    started: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
}

impl BatchLoader {
    pub fn new(source: DatasetSource, batch_size: usize, shuffle: bool, seed: Option<u64>) -> Self {
        let log_every_samples = match std::env::var("REGRESSION_LOADER_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.trim().parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
        };
        let order = (0..source.len()).collect();
        let mut loader = Self {
            source,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            order,
            cursor: 0,
            pass: 0,
            processed_samples: 0,
            processed_batches: 0,
            total_load_time: Duration::ZERO,
            started: Instant::now(),
            last_logged_samples: 0,
            log_every_samples,
        };
        loader.reset();
        loader
    }

    pub fn source(&self) -> &DatasetSource {
        &self.source
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of samples in the split.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// `ceil(len / batch_size)`.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Rewinds to the start of a new pass, reshuffling when enabled.
    pub fn reset(&mut self) {
        self.pass += 1;
        self.cursor = 0;
        self.order = (0..self.source.len()).collect();
        if self.shuffle {
            let mut rng = match self.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(self.pass)),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            self.order.shuffle(&mut rng);
        }
    }

    /// Next group of decoded samples in loader order, or None at the end of the pass.
    pub fn next_samples(&mut self) -> DatasetResult<Option<Vec<Sample>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let slice = &self.order[self.cursor..end];
        self.cursor = end;

        let salt = self.pass.wrapping_mul(0xD1B5_4A32_D192_ED03);
        let t_load = Instant::now();
        let source = &self.source;
        let mut loaded: Vec<(usize, DatasetResult<Sample>)> = slice
            .par_iter()
            .enumerate()
            .map(|(i, idx)| (i, source.load(*idx, salt)))
            .collect();
        loaded.sort_by_key(|(i, _)| *i);
        self.total_load_time += t_load.elapsed();

        let samples = loaded
            .into_iter()
            .map(|(_, res)| res)
            .collect::<DatasetResult<Vec<_>>>()?;
        self.processed_samples += samples.len();
        self.processed_batches += 1;
        self.maybe_log_progress();
        Ok(Some(samples))
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<RegressionBatch<B>>> {
        match self.next_samples()? {
            Some(samples) => stack_samples(&samples, device).map(Some),
            None => Ok(None),
        }
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        if self.processed_samples.saturating_sub(self.last_logged_samples) < threshold {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_load_ms =
            (self.total_load_time.as_secs_f64() * 1000.0) / self.processed_batches.max(1) as f64;
        tracing::debug!(
            split = %self.source.split(),
            batches = self.processed_batches,
            samples = self.processed_samples,
            rate = self.processed_samples as f32 / secs,
            avg_load_ms,
            "[dataset] loader throughput"
        );
        self.last_logged_samples = self.processed_samples;
    }
}

/// Stacks samples along a new leading dimension.
pub fn stack_samples<B: Backend>(
    samples: &[Sample],
    device: &B::Device,
) -> DatasetResult<RegressionBatch<B>> {
    let Some(first) = samples.first() else {
        return Err(DatasetError::Other("cannot stack an empty batch".to_string()));
    };
    let (c, h, w) = (first.label.channels, first.label.height, first.label.width);
    let per_sample = c * h * w;
    let mut input_buf = Vec::with_capacity(samples.len() * per_sample);
    let mut label_buf = Vec::with_capacity(samples.len() * per_sample);
    let mut indices = Vec::with_capacity(samples.len());
    for sample in samples {
        if !sample.label.same_shape(&first.label) || !sample.input.same_shape(&first.label) {
            return Err(DatasetError::Other(format!(
                "sample {} has shape {}x{}x{} / {}x{}x{}, expected {c}x{h}x{w}",
                sample.index,
                sample.input.channels,
                sample.input.height,
                sample.input.width,
                sample.label.channels,
                sample.label.height,
                sample.label.width,
            )));
        }
        input_buf.extend_from_slice(&sample.input.data);
        label_buf.extend_from_slice(&sample.label.data);
        indices.push(sample.index);
    }
    let shape = [samples.len(), c, h, w];
    let input = Tensor::<B, 4>::from_data(TensorData::new(input_buf, shape), device);
    let label = Tensor::<B, 4>::from_data(TensorData::new(label_buf, shape), device);
    Ok(RegressionBatch {
        input,
        label,
        indices,
    })
}
