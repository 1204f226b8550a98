use thiserror::Error;

use crate::math::GridShape;

/// Failure to locate, open or validate a diffraction dataset.
#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("no reader registered for format '{0}'")]
    UnknownFormat(String),
    #[error("dataset not found: {0}")]
    NotFound(String),
    #[error("frame count {frames} does not match position count {positions}")]
    CountMismatch { frames: usize, positions: usize },
    #[error("frame {index} has shape {actual}, expected {expected}")]
    ShapeMismatch {
        index: usize,
        expected: GridShape,
        actual: GridShape,
    },
    #[error("frame {index} contains negative or non-finite intensities")]
    InvalidIntensity { index: usize },
    #[error("dataset contains no frames")]
    Empty,
    #[error("malformed dataset header {path}: {reason}")]
    MalformedHeader { path: String, reason: String },
    #[error("invalid dataset metadata: {0}")]
    InvalidMetadata(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DataLoadError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Frame index outside `0..len`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("frame index {index} out of range for dataset of {len} frames")]
pub struct IndexError {
    pub index: usize,
    pub len: usize,
}

/// Any failure while reading frames from a loaded dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Load(#[from] DataLoadError),
}
