//! Task-specific corruption: turns a clean label image into the model input.

use crate::types::{DatasetError, DatasetResult, ImagePlanes, Task};
use image::imageops::FilterType;
use image::{ImageBuffer, Luma};
use rand::Rng;
use rand_distr::{Distribution, Poisson, StandardNormal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos,
}

impl Interpolation {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nearest" => Some(Interpolation::Nearest),
            "bilinear" => Some(Interpolation::Bilinear),
            "bicubic" => Some(Interpolation::Bicubic),
            "lanczos" => Some(Interpolation::Lanczos),
            _ => None,
        }
    }

    fn filter(self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::Bicubic => FilterType::CatmullRom,
            Interpolation::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// Corruption policy parsed from `--task` and `--opts`.
#[derive(Debug, Clone, PartialEq)]
pub enum Corruption {
    /// Keep every `ds_y`-th row and `ds_x`-th column.
    UniformSampling { ds_y: usize, ds_x: usize },
    /// Keep each pixel with probability `keep_prob`.
    RandomSampling { keep_prob: f32 },
    /// Keep pixels with a gaussian-shaped probability over a [-1, 1] grid.
    GaussianSampling {
        x0: f32,
        y0: f32,
        sgm_x: f32,
        sgm_y: f32,
        amplitude: f32,
    },
    /// Additive gaussian noise; `sigma` is on the 0-255 scale.
    GaussianNoise { sigma: f32 },
    PoissonNoise,
    /// Downscale by `factor`, then upscale back to the original size.
    Downsample {
        interpolation: Interpolation,
        factor: f32,
    },
}

impl Corruption {
    pub fn from_opts(task: Task, opts: &[String]) -> DatasetResult<Self> {
        let Some((kind, rest)) = opts.split_first() else {
            return Err(DatasetError::InvalidOpts(format!(
                "task {task} needs at least a corruption kind"
            )));
        };
        let params = rest
            .iter()
            .map(|s| {
                s.parse::<f32>().map_err(|_| {
                    DatasetError::InvalidOpts(format!("`{s}` is not a number (kind {kind})"))
                })
            })
            .collect::<DatasetResult<Vec<f32>>>()?;
        let want = |n: usize| -> DatasetResult<()> {
            if params.len() < n {
                Err(DatasetError::InvalidOpts(format!(
                    "{task}/{kind} expects {n} numeric parameter(s), got {}",
                    params.len()
                )))
            } else {
                Ok(())
            }
        };

        let corruption = match (task, kind.to_ascii_lowercase().as_str()) {
            (Task::Inpainting, "uniform") => {
                want(2)?;
                if params[0] < 1.0 || params[1] < 1.0 {
                    return Err(DatasetError::InvalidOpts(
                        "uniform sampling strides must be >= 1".into(),
                    ));
                }
                Corruption::UniformSampling {
                    ds_y: params[0] as usize,
                    ds_x: params[1] as usize,
                }
            }
            (Task::Inpainting, "random") => {
                want(1)?;
                if !(0.0..=1.0).contains(&params[0]) {
                    return Err(DatasetError::InvalidOpts(
                        "random sampling probability must be within [0, 1]".into(),
                    ));
                }
                Corruption::RandomSampling {
                    keep_prob: params[0],
                }
            }
            (Task::Inpainting, "gaussian") => {
                want(5)?;
                if params[2] <= 0.0 || params[3] <= 0.0 {
                    return Err(DatasetError::InvalidOpts(
                        "gaussian sampling sigmas must be positive".into(),
                    ));
                }
                Corruption::GaussianSampling {
                    x0: params[0],
                    y0: params[1],
                    sgm_x: params[2],
                    sgm_y: params[3],
                    amplitude: params[4],
                }
            }
            (Task::Denoising, "random") => {
                want(1)?;
                if params[0] < 0.0 {
                    return Err(DatasetError::InvalidOpts(
                        "noise sigma must be non-negative".into(),
                    ));
                }
                Corruption::GaussianNoise { sigma: params[0] }
            }
            (Task::Denoising, "poisson") => Corruption::PoissonNoise,
            (Task::SuperResolution, name) => {
                let interpolation = Interpolation::parse(name).ok_or_else(|| {
                    DatasetError::InvalidOpts(format!("unknown interpolation `{name}`"))
                })?;
                want(1)?;
                if params[0] < 1.0 {
                    return Err(DatasetError::InvalidOpts(
                        "downsampling factor must be >= 1".into(),
                    ));
                }
                if params.get(1).is_some_and(|keep| *keep == 0.0) {
                    return Err(DatasetError::InvalidOpts(
                        "keepdim=0 would change the input shape; the model needs equal shapes"
                            .into(),
                    ));
                }
                Corruption::Downsample {
                    interpolation,
                    factor: params[0],
                }
            }
            (task, other) => {
                return Err(DatasetError::InvalidOpts(format!(
                    "corruption kind `{other}` is not available for {task}"
                )))
            }
        };
        Ok(corruption)
    }

    pub fn task(&self) -> Task {
        match self {
            Corruption::UniformSampling { .. }
            | Corruption::RandomSampling { .. }
            | Corruption::GaussianSampling { .. } => Task::Inpainting,
            Corruption::GaussianNoise { .. } | Corruption::PoissonNoise => Task::Denoising,
            Corruption::Downsample { .. } => Task::SuperResolution,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Corruption::UniformSampling { ds_y, ds_x } => {
                format!("uniform sampling ds_y={ds_y} ds_x={ds_x}")
            }
            Corruption::RandomSampling { keep_prob } => {
                format!("random sampling keep_p={keep_prob:.3}")
            }
            Corruption::GaussianSampling {
                x0,
                y0,
                sgm_x,
                sgm_y,
                amplitude,
            } => format!(
                "gaussian sampling x0={x0:.2} y0={y0:.2} sgm=({sgm_x:.2},{sgm_y:.2}) a={amplitude:.2}"
            ),
            Corruption::GaussianNoise { sigma } => format!("gaussian noise sigma={sigma:.1}/255"),
            Corruption::PoissonNoise => "poisson noise".to_string(),
            Corruption::Downsample {
                interpolation,
                factor,
            } => format!("{interpolation:?} downsample x{factor}").to_lowercase(),
        }
    }

    /// Produces the corrupted input for a label with values in [0, 1].
    pub fn apply(
        &self,
        label: &ImagePlanes,
        rng: &mut dyn rand::RngCore,
    ) -> DatasetResult<ImagePlanes> {
        let out = match self {
            Corruption::UniformSampling { ds_y, ds_x } => {
                let (ds_y, ds_x) = (*ds_y, *ds_x);
                apply_mask(label, |y, x| y % ds_y == 0 && x % ds_x == 0)
            }
            Corruption::RandomSampling { keep_prob } => {
                let mask = random_mask(label.height, label.width, rng, |_, _| *keep_prob);
                apply_mask(label, |y, x| mask[y * label.width + x])
            }
            Corruption::GaussianSampling {
                x0,
                y0,
                sgm_x,
                sgm_y,
                amplitude,
            } => {
                let (h, w) = (label.height, label.width);
                let mask = random_mask(h, w, rng, |y, x| {
                    let gx = grid_coord(x, w) - x0;
                    let gy = grid_coord(y, h) - y0;
                    amplitude
                        * (-(gx * gx / (2.0 * sgm_x * sgm_x) + gy * gy / (2.0 * sgm_y * sgm_y)))
                            .exp()
                });
                apply_mask(label, |y, x| mask[y * w + x])
            }
            Corruption::GaussianNoise { sigma } => {
                let scale = sigma / 255.0;
                let mut out = label.clone();
                for v in out.data.iter_mut() {
                    let n: f32 = StandardNormal.sample(&mut *rng);
                    *v += scale * n;
                }
                out
            }
            Corruption::PoissonNoise => {
                let mut out = label.clone();
                for v in out.data.iter_mut() {
                    let lambda = f64::from(v.max(0.0) * 255.0);
                    let counts = match Poisson::new(lambda) {
                        Ok(dist) => dist.sample(&mut *rng),
                        Err(_) => 0.0,
                    };
                    *v = (counts / 255.0) as f32;
                }
                out
            }
            Corruption::Downsample {
                interpolation,
                factor,
            } => downsample(label, *interpolation, *factor)?,
        };
        Ok(out)
    }
}

fn grid_coord(i: usize, n: usize) -> f32 {
    if n <= 1 {
        0.0
    } else {
        -1.0 + 2.0 * i as f32 / (n - 1) as f32
    }
}

fn random_mask(
    height: usize,
    width: usize,
    rng: &mut dyn rand::RngCore,
    keep_prob: impl Fn(usize, usize) -> f32,
) -> Vec<bool> {
    let mut mask = Vec::with_capacity(height * width);
    for y in 0..height {
        for x in 0..width {
            mask.push(rng.random_range(0.0..1.0) < keep_prob(y, x));
        }
    }
    mask
}

/// Zeroes every pixel (across all channels) for which `keep` is false.
fn apply_mask(label: &ImagePlanes, keep: impl Fn(usize, usize) -> bool) -> ImagePlanes {
    let mut out = label.clone();
    let (h, w) = (label.height, label.width);
    for c in 0..label.channels {
        let plane = out.plane_mut(c);
        for y in 0..h {
            for x in 0..w {
                if !keep(y, x) {
                    plane[y * w + x] = 0.0;
                }
            }
        }
    }
    out
}

fn downsample(
    label: &ImagePlanes,
    interpolation: Interpolation,
    factor: f32,
) -> DatasetResult<ImagePlanes> {
    let (h, w) = (label.height as u32, label.width as u32);
    let small_w = ((w as f32 / factor).round() as u32).max(1);
    let small_h = ((h as f32 / factor).round() as u32).max(1);
    let filter = interpolation.filter();

    let mut out = ImagePlanes::zeros(label.channels, label.height, label.width);
    for c in 0..label.channels {
        let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(w, h, label.plane(c).to_vec()).ok_or_else(|| {
                DatasetError::Other(format!("plane {c} does not match {h}x{w}"))
            })?;
        let small = image::imageops::resize(&plane, small_w, small_h, filter);
        let restored = image::imageops::resize(&small, w, h, filter);
        out.plane_mut(c).copy_from_slice(restored.as_raw());
    }
    Ok(out)
}
