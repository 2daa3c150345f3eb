//! Error types for the object store.

use std::path::PathBuf;
use thiserror::Error;

use crate::object::ObjectError;
use crate::watch::WatchError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store directory {path} does not exist or is not a directory")]
    NoStoreDirectory { path: PathBuf },

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("store feed failed: {0}")]
    Watch(#[from] WatchError),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A programmer error, not a runtime condition.
    #[error("object store integrity violation: {detail}")]
    Integrity { detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
