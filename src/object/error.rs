//! Read-outcome taxonomy for file-backed objects.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from single-object file operations.
///
/// Absence, corruption, and type mismatch are distinct outcomes:
/// absence is recoverable and usually triggers a lazy create, corrupted
/// bytes are not a document at all, and a mismatch is a well-formed
/// document that is not the expected type and is never silently
/// coerced.
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("no object file at {path}")]
    NotFound { path: PathBuf },

    #[error("object in {path} is not a {expected}: {source}")]
    TypeMismatch {
        path: PathBuf,
        expected: &'static str,
        source: serde_json::Error,
    },

    #[error("object file {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("value for {path} is not serializable: {source}")]
    NotSerializable {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{path} is a directory, not an object file")]
    IsDirectory { path: PathBuf },

    #[error("cannot watch {path}: {source}")]
    WatchFailed {
        path: PathBuf,
        source: crate::watch::WatchError,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type ObjectResult<T> = Result<T, ObjectError>;

impl ObjectError {
    /// Classify a deserialization failure: a well-formed document of
    /// the wrong shape is a type mismatch, anything else is corruption.
    pub(crate) fn from_serde(path: &Path, expected: &'static str, e: serde_json::Error) -> Self {
        match e.classify() {
            serde_json::error::Category::Data => Self::TypeMismatch {
                path: path.to_path_buf(),
                expected,
                source: e,
            },
            _ => Self::Corrupted {
                path: path.to_path_buf(),
                source: e,
            },
        }
    }

    pub(crate) fn io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    }
}
