//! Pure conversions from model-space tensors to exportable images.
//!
//! Model tensors are normalized `[N, C, H, W]`; exports are denormalized
//! `[H, W, C]` arrays. Previews are clipped to [0, 1], raw dumps are not.

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{RunError, RunResult};

/// One image in HWC order.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl ImageArray {
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            })
    }
}

/// Splits an `[N, C, H, W]` tensor into `N` HWC arrays.
pub fn tensor_to_hwc<B: Backend>(tensor: Tensor<B, 4>) -> RunResult<Vec<ImageArray>> {
    let [n, c, h, w] = tensor.dims();
    let values = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| RunError::RuntimeCompute(format!("tensor readback failed: {e:?}")))?;
    Ok(chw_batch_to_hwc(&values, [n, c, h, w]))
}

/// Same as [`tensor_to_hwc`] but only for the first sample of the batch.
pub fn first_to_hwc<B: Backend>(tensor: Tensor<B, 4>) -> RunResult<ImageArray> {
    let [_, c, h, w] = tensor.dims();
    let first = tensor.slice([0..1, 0..c, 0..h, 0..w]);
    tensor_to_hwc(first)?
        .into_iter()
        .next()
        .ok_or_else(|| RunError::RuntimeCompute("empty batch has no preview".into()))
}

pub fn chw_batch_to_hwc(values: &[f32], dims: [usize; 4]) -> Vec<ImageArray> {
    let [n, c, h, w] = dims;
    let per_sample = c * h * w;
    (0..n)
        .map(|i| {
            let chw = &values[i * per_sample..(i + 1) * per_sample];
            let mut data = vec![0.0; per_sample];
            for ch in 0..c {
                for y in 0..h {
                    for x in 0..w {
                        data[(y * w + x) * c + ch] = chw[(ch * h + y) * w + x];
                    }
                }
            }
            ImageArray {
                height: h,
                width: w,
                channels: c,
                data,
            }
        })
        .collect()
}

/// Inverse of `(x - mean) / std`.
pub fn denormalize(mut array: ImageArray, mean: f32, std: f32) -> ImageArray {
    for v in &mut array.data {
        *v = *v * std + mean;
    }
    array
}

pub fn clip(mut array: ImageArray, lo: f32, hi: f32) -> ImageArray {
    for v in &mut array.data {
        *v = v.clamp(lo, hi);
    }
    array
}

/// Preview id of a train/val batch; `batch` is 1-indexed, `epoch` >= 1.
pub fn preview_step(batches_per_epoch: usize, epoch: usize, batch: usize) -> usize {
    batches_per_epoch * epoch.saturating_sub(1) + batch
}

/// Test artifact id of the `offset`-th sample in 1-indexed `batch`.
pub fn test_sample_index(batch_size: usize, batch: usize, offset: usize) -> usize {
    batch_size * batch.saturating_sub(1) + offset
}

/// `0007_output`, the shared stem of preview and raw artifacts.
pub fn artifact_stem(index: usize, tag: &str) -> String {
    format!("{index:04}_{tag}")
}
