use std::fs;
use std::path::{Path, PathBuf};

use regression_dataset::Split;

use crate::error::{RunError, RunResult};

/// Artifact directories under `result_dir`.
#[derive(Debug, Clone)]
pub struct ResultLayout {
    root: PathBuf,
}

impl ResultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<split>/png`
    pub fn png_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.as_str()).join("png")
    }

    /// `<root>/test/numpy`
    pub fn numpy_dir(&self) -> PathBuf {
        self.root.join(Split::Test.as_str()).join("numpy")
    }

    /// Creates the subtree; existing directories are left untouched.
    pub fn ensure(&self) -> RunResult<()> {
        let dirs = [
            self.png_dir(Split::Train),
            self.png_dir(Split::Val),
            self.png_dir(Split::Test),
            self.numpy_dir(),
        ];
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| RunError::Io { path: dir, source })?;
        }
        Ok(())
    }
}
