use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::postprocess::{artifact_stem, ImageArray};

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("serialize scalar: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot export {channels}-channel image (expected 1 or 3)")]
    Channels { channels: usize },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MetricsError + '_ {
    move |source| MetricsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Scalar curves plus image/array artifacts.
pub trait MetricsSink {
    /// Appends one datapoint to `track` (e.g. `train`, `val`).
    fn scalar(&mut self, track: &str, name: &str, value: f64, step: usize) -> MetricsResult<()>;
    /// Writes a PNG preview; values are expected in [0, 1].
    fn image(&mut self, dir: &Path, tag: &str, array: &ImageArray, index: usize)
        -> MetricsResult<()>;
    /// Writes a raw f32 dump.
    fn array(&mut self, dir: &Path, tag: &str, array: &ImageArray, index: usize)
        -> MetricsResult<()>;
    /// Flushes and releases every open writer.
    fn close(&mut self) -> MetricsResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
    pub wall_time: f64,
}

/// Scalars go to `<log_dir>/<track>/scalars.jsonl`; artifacts go wherever the caller points.
pub struct FileMetricsSink {
    log_dir: PathBuf,
    writers: BTreeMap<String, BufWriter<File>>,
}

impl FileMetricsSink {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            writers: BTreeMap::new(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn scalars_path(&self, track: &str) -> PathBuf {
        self.log_dir.join(track).join("scalars.jsonl")
    }

    fn writer(&mut self, track: &str) -> MetricsResult<&mut BufWriter<File>> {
        if !self.writers.contains_key(track) {
            let path = self.scalars_path(track);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(io_err(&path))?;
            self.writers.insert(track.to_string(), BufWriter::new(file));
        }
        let path = self.scalars_path(track);
        self.writers.get_mut(track).ok_or(MetricsError::Io {
            path,
            source: std::io::Error::other("scalar writer vanished"),
        })
    }
}

impl MetricsSink for FileMetricsSink {
    fn scalar(&mut self, track: &str, name: &str, value: f64, step: usize) -> MetricsResult<()> {
        let record = ScalarRecord {
            name: name.to_string(),
            value,
            step,
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };
        let line = serde_json::to_string(&record)?;
        let path = self.scalars_path(track);
        let writer = self.writer(track)?;
        writeln!(writer, "{line}").map_err(io_err(&path))?;
        Ok(())
    }

    fn image(
        &mut self,
        dir: &Path,
        tag: &str,
        array: &ImageArray,
        index: usize,
    ) -> MetricsResult<()> {
        let path = dir.join(format!("{}.png", artifact_stem(index, tag)));
        write_png(&path, array)
    }

    fn array(
        &mut self,
        dir: &Path,
        tag: &str,
        array: &ImageArray,
        index: usize,
    ) -> MetricsResult<()> {
        let path = dir.join(format!("{}.npy", artifact_stem(index, tag)));
        write_npy(&path, array)
    }

    fn close(&mut self) -> MetricsResult<()> {
        let tracks: Vec<String> = self.writers.keys().cloned().collect();
        for track in tracks {
            if let Some(mut writer) = self.writers.remove(&track) {
                let path = self.scalars_path(&track);
                writer.flush().map_err(io_err(&path))?;
            }
        }
        Ok(())
    }
}

impl Drop for FileMetricsSink {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!("failed to flush scalar logs: {err}");
        }
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn write_png(path: &Path, array: &ImageArray) -> MetricsResult<()> {
    let (w, h) = (array.width as u32, array.height as u32);
    let result = match array.channels {
        1 => GrayImage::from_fn(w, h, |x, y| {
            Luma([to_u8(array.data[y as usize * array.width + x as usize])])
        })
        .save(path),
        3 => RgbImage::from_fn(w, h, |x, y| {
            let base = (y as usize * array.width + x as usize) * 3;
            Rgb([
                to_u8(array.data[base]),
                to_u8(array.data[base + 1]),
                to_u8(array.data[base + 2]),
            ])
        })
        .save(path),
        channels => return Err(MetricsError::Channels { channels }),
    };
    result.map_err(|source| MetricsError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// NPY v1.0 header for a little-endian f32 C-order array.
fn npy_header(shape: [usize; 3]) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}, {}), }}",
        shape[0], shape[1], shape[2]
    );
    // magic + version + u16 length, then the dict padded so data starts 64-byte aligned.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(unpadded + padding);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.resize(out.len() + padding, b' ');
    out.push(b'\n');
    out
}

pub fn write_npy(path: &Path, array: &ImageArray) -> MetricsResult<()> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&npy_header(array.shape()))
        .map_err(io_err(path))?;
    for v in &array.data {
        writer.write_all(&v.to_le_bytes()).map_err(io_err(path))?;
    }
    writer.flush().map_err(io_err(path))
}

/// Running mean of per-batch losses (unweighted by batch size).
#[derive(Debug, Default, Clone)]
pub struct LossTracker {
    sum: f64,
    count: usize,
}

impl LossTracker {
    pub fn push(&mut self, loss: f64) {
        self.sum += loss;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
