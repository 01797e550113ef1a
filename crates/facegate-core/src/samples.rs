//! Canonical face samples, one JPEG per identity.

use crate::types::Identity;
use image::{ImageFormat, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("failed to create sample directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to list samples in {path}: {source}")]
    List {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode sample {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Stores samples as `<root>/<identity>/<identity>.jpg`.
#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, identity: &Identity) -> PathBuf {
        self.root
            .join(identity.as_str())
            .join(format!("{}.jpg", identity.as_str()))
    }

    /// Write the sample, replacing any earlier one for the same identity.
    pub fn save(&self, identity: &Identity, face: &RgbImage) -> Result<PathBuf, SampleError> {
        let path = self.path_for(identity);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| SampleError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        face.save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| SampleError::Encode {
                path: path.clone(),
                source,
            })?;
        tracing::info!(identity = %identity, path = %path.display(), "face sample saved");
        Ok(path)
    }

    /// Every stored sample, ordered by identity. A missing root is empty.
    ///
    /// Directories without a matching `<identity>.jpg` are skipped.
    pub fn list(&self) -> Result<Vec<(Identity, PathBuf)>, SampleError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SampleError::List {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut found: Vec<(Identity, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| Identity::from_token(entry.file_name().to_string_lossy()))
            .map(|identity| {
                let path = self.path_for(&identity);
                (identity, path)
            })
            .filter(|(_, path)| path.is_file())
            .collect();
        found.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Ok(found)
    }
}
