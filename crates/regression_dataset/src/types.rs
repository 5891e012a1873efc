//! Core types, error definitions, and data structures for regression_dataset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset directory not found: {path}")]
    MissingDir { path: PathBuf },
    #[error("no images found under {path}")]
    Empty { path: PathBuf },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image {path} is {height}x{width}, smaller than the {crop_h}x{crop_w} crop")]
    TooSmall {
        path: PathBuf,
        height: usize,
        width: usize,
        crop_h: usize,
        crop_w: usize,
    },
    #[error("unsupported channel count {0} (expected 1 or 3)")]
    Channels(usize),
    #[error("invalid corruption options: {0}")]
    InvalidOpts(String),
    #[error("{0}")]
    Other(String),
}

/// Dataset partition, also the sub-directory name under the data root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restoration task; selects which corruption family produces the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Inpainting,
    Denoising,
    SuperResolution,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Inpainting => "inpainting",
            Task::Denoising => "denoising",
            Task::SuperResolution => "super_resolution",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Float image in CHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlanes {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImagePlanes {
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    pub fn from_data(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> DatasetResult<Self> {
        if data.len() != channels * height * width {
            return Err(DatasetError::Other(format!(
                "buffer of {} values does not match {}x{}x{}",
                data.len(),
                channels,
                height,
                width
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn same_shape(&self, other: &ImagePlanes) -> bool {
        self.channels == other.channels && self.height == other.height && self.width == other.width
    }

    pub fn plane(&self, c: usize) -> &[f32] {
        let hw = self.height * self.width;
        &self.data[c * hw..(c + 1) * hw]
    }

    pub fn plane_mut(&mut self, c: usize) -> &mut [f32] {
        let hw = self.height * self.width;
        &mut self.data[c * hw..(c + 1) * hw]
    }

    #[inline]
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    /// Swaps the spatial axes.
    pub fn transpose_hw(&self) -> ImagePlanes {
        let mut out = ImagePlanes::zeros(self.channels, self.width, self.height);
        for c in 0..self.channels {
            for y in 0..self.height {
                for x in 0..self.width {
                    out.data[(c * self.width + x) * self.height + y] = self.at(c, y, x);
                }
            }
        }
        out
    }

    pub fn crop(&self, y0: usize, x0: usize, height: usize, width: usize) -> ImagePlanes {
        let mut out = ImagePlanes::zeros(self.channels, height, width);
        for c in 0..self.channels {
            for y in 0..height {
                let src = (c * self.height + y0 + y) * self.width + x0;
                let dst = (c * height + y) * width;
                out.data[dst..dst + width].copy_from_slice(&self.data[src..src + width]);
            }
        }
        out
    }

    pub fn flip_horizontal(&mut self) {
        let w = self.width;
        for row in self.data.chunks_mut(w) {
            row.reverse();
        }
    }

    pub fn flip_vertical(&mut self) {
        let (h, w) = (self.height, self.width);
        for c in 0..self.channels {
            let plane = self.plane_mut(c);
            for y in 0..h / 2 {
                let (top, bottom) = plane.split_at_mut((h - 1 - y) * w);
                top[y * w..(y + 1) * w].swap_with_slice(&mut bottom[..w]);
            }
        }
    }
}

/// A paired (corrupted input, clean label) example, both normalized.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Position of the source file in the split listing.
    pub index: usize,
    pub input: ImagePlanes,
    pub label: ImagePlanes,
}
