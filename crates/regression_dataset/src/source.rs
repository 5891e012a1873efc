//! On-disk image splits and per-sample loading.

use crate::aug::TransformPipeline;
use crate::corrupt::Corruption;
use crate::types::{DatasetError, DatasetResult, ImagePlanes, Sample, Split};
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Crop target (height, width).
    pub crop: (usize, usize),
    /// 1 (grayscale) or 3 (RGB).
    pub channels: usize,
    pub corruption: Corruption,
    /// Seed for reproducible corruption/augmentation; thread RNG when None.
    pub seed: Option<u64>,
}

/// One split of the dataset: a sorted listing of image files plus the
/// transforms that turn each into a training pair.
#[derive(Debug, Clone)]
pub struct DatasetSource {
    split: Split,
    dir: PathBuf,
    files: Vec<PathBuf>,
    channels: usize,
    corruption: Corruption,
    pipeline: TransformPipeline,
    seed: Option<u64>,
}

impl DatasetSource {
    /// Lists `<data_dir>/<split>`; training gets random flips, other splits don't.
    pub fn open(data_dir: &Path, split: Split, cfg: &DatasetConfig) -> DatasetResult<Self> {
        if cfg.channels != 1 && cfg.channels != 3 {
            return Err(DatasetError::Channels(cfg.channels));
        }
        let dir = data_dir.join(split.as_str());
        let files = list_images(&dir)?;
        let pipeline = match split {
            Split::Train => TransformPipeline::train(cfg.crop),
            Split::Val | Split::Test => TransformPipeline::eval(cfg.crop),
        };
        tracing::debug!(
            split = %split,
            dir = %dir.display(),
            files = files.len(),
            pipeline = %pipeline.describe(),
            corruption = %cfg.corruption.describe(),
            "opened dataset split"
        );
        Ok(Self {
            split,
            dir,
            files,
            channels: cfg.channels,
            corruption: cfg.corruption.clone(),
            pipeline,
            seed: cfg.seed,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Loads sample `index`. `salt` varies the random stream between passes
    /// when a seed is configured.
    pub fn load(&self, index: usize, salt: u64) -> DatasetResult<Sample> {
        let path = self.files.get(index).ok_or_else(|| {
            DatasetError::Other(format!(
                "sample index {index} out of range for {} ({} files)",
                self.dir.display(),
                self.files.len()
            ))
        })?;
        let label = decode_image(path, self.channels)?;
        let (crop_h, crop_w) = self.pipeline.crop;
        if label.height < crop_h || label.width < crop_w {
            return Err(DatasetError::TooSmall {
                path: path.clone(),
                height: label.height,
                width: label.width,
                crop_h,
                crop_w,
            });
        }

        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.seed {
            let mixed = seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ salt;
            seeded_rng = rand::rngs::StdRng::seed_from_u64(mixed);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let input = self.corruption.apply(&label, rng)?;
        let (input, label) = self.pipeline.apply(input, label, rng)?;
        Ok(Sample {
            index,
            input,
            label,
        })
    }
}

/// Image files directly under `dir`, sorted by name.
pub fn list_images(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(DatasetError::MissingDir {
            path: dir.to_path_buf(),
        });
    }
    let entries = fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(DatasetError::Empty {
            path: dir.to_path_buf(),
        });
    }
    files.sort();
    Ok(files)
}

/// Decodes an image into [0, 1] CHW planes, transposed to landscape when it
/// is taller than wide.
pub fn decode_image(path: &Path, channels: usize) -> DatasetResult<ImagePlanes> {
    let img = image::open(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let planes = match channels {
        1 => {
            let gray = img.to_luma8();
            let (w, h) = gray.dimensions();
            let data = gray.as_raw().iter().map(|v| *v as f32 / 255.0).collect();
            ImagePlanes::from_data(1, h as usize, w as usize, data)?
        }
        3 => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let hw = (w * h) as usize;
            let mut data = vec![0.0f32; 3 * hw];
            for (x, y, pixel) in rgb.enumerate_pixels() {
                let base = (y * w + x) as usize;
                data[base] = pixel[0] as f32 / 255.0;
                data[hw + base] = pixel[1] as f32 / 255.0;
                data[2 * hw + base] = pixel[2] as f32 / 255.0;
            }
            ImagePlanes::from_data(3, h as usize, w as usize, data)?
        }
        other => return Err(DatasetError::Channels(other)),
    };
    if planes.height > planes.width {
        Ok(planes.transpose_hw())
    } else {
        Ok(planes)
    }
}
