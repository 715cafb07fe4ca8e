//! Error types for cluster validation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::projection::Direction;

/// Errors that can occur while building, projecting or counting clusters.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Insufficient signal: {reason}")]
    InsufficientSignal { reason: String },

    #[error("No transform available for direction {direction} ({reason})")]
    TransformUnavailable { direction: Direction, reason: String },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("Bounding box {bbox} does not fit volume of shape {dims:?}")]
    BoxOutOfBounds { bbox: String, dims: [usize; 3] },

    #[error("Invalid volume '{path}': {reason}")]
    InvalidVolume { path: PathBuf, reason: String },

    #[error("Failed to read NIfTI file '{path}': {source}")]
    ReadNifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Failed to write NIfTI file '{path}': {source}")]
    WriteNifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Missing artifact '{path}'")]
    MissingArtifact { path: PathBuf },

    #[error("Corrupt artifact '{path}': {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization failed for '{path}': {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: common::SerdeFormatError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that are the operator's fault and must stop a batch before it starts.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
