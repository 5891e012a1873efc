//! Dataset loading and Burn-compatible batching for image-regression tasks.
//!
//! This crate provides:
//! - Task corruptions (inpainting masks, noise, down-sampling) that turn a
//!   clean image into the model input
//! - A joint crop / normalize / flip pipeline for (input, label) pairs
//! - Split listing and per-sample decoding from `<data_dir>/<split>`
//! - A batch loader yielding `[N, C, H, W]` tensors

pub mod aug;
pub mod batch;
pub mod corrupt;
pub mod source;
pub mod types;

pub use aug::{normalize, TransformPipeline, NORM_MEAN, NORM_STD};
pub use batch::{stack_samples, BatchLoader, RegressionBatch};
pub use corrupt::{Corruption, Interpolation};
pub use source::{decode_image, list_images, DatasetConfig, DatasetSource};
pub use types::*;
