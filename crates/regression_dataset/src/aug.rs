//! Geometric and normalizing transforms applied jointly to (input, label) pairs.

use crate::types::{DatasetResult, ImagePlanes};
use rand::Rng;

/// Mean/std used to map [0, 1] pixels onto the model's [-1, 1] range.
pub const NORM_MEAN: f32 = 0.5;
pub const NORM_STD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct TransformPipeline {
    /// Crop target (height, width).
    pub crop: (usize, usize),
    pub mean: f32,
    pub std: f32,
    /// Flip left/right and up/down, each with probability 0.5.
    pub random_flip: bool,
}

impl TransformPipeline {
    /// Crop, normalize, flip.
    pub fn train(crop: (usize, usize)) -> Self {
        Self {
            crop,
            mean: NORM_MEAN,
            std: NORM_STD,
            random_flip: true,
        }
    }

    /// Crop, normalize; no flipping for validation and test splits.
    pub fn eval(crop: (usize, usize)) -> Self {
        Self {
            random_flip: false,
            ..Self::train(crop)
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "crop={}x{} normalize(mean={:.2}, std={:.2}) flip={}",
            self.crop.0, self.crop.1, self.mean, self.std, self.random_flip
        )
    }

    /// Applies the same random crop/flip to both images, then normalizes them.
    pub fn apply(
        &self,
        input: ImagePlanes,
        label: ImagePlanes,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<(ImagePlanes, ImagePlanes)> {
        let (mut input, mut label) = random_crop(&input, &label, self.crop, rng);
        normalize(&mut input, self.mean, self.std);
        normalize(&mut label, self.mean, self.std);
        if self.random_flip {
            maybe_flip(&mut input, &mut label, rng);
        }
        Ok((input, label))
    }
}

/// Crops both images at the same random offset. Callers guarantee the images
/// are at least `crop` in size.
pub(crate) fn random_crop(
    input: &ImagePlanes,
    label: &ImagePlanes,
    (crop_h, crop_w): (usize, usize),
    rng: &mut dyn rand::RngCore,
) -> (ImagePlanes, ImagePlanes) {
    let y0 = rng.random_range(0..=label.height - crop_h);
    let x0 = rng.random_range(0..=label.width - crop_w);
    (
        input.crop(y0, x0, crop_h, crop_w),
        label.crop(y0, x0, crop_h, crop_w),
    )
}

pub fn normalize(img: &mut ImagePlanes, mean: f32, std: f32) {
    for v in img.data.iter_mut() {
        *v = (*v - mean) / std;
    }
}

pub(crate) fn maybe_flip(
    input: &mut ImagePlanes,
    label: &mut ImagePlanes,
    rng: &mut dyn rand::RngCore,
) {
    if rng.random_range(0.0..1.0) > 0.5 {
        input.flip_horizontal();
        label.flip_horizontal();
    }
    if rng.random_range(0.0..1.0) > 0.5 {
        input.flip_vertical();
        label.flip_vertical();
    }
}
