//! Error types for the watching subsystem.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher construction and lifecycle operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("cannot watch {path}: not a directory")]
    NotADirectory { path: PathBuf },

    #[error("cannot watch {path}: it is a directory, not a file")]
    NotAFile { path: PathBuf },

    #[error("failed to initialize watcher for {path}: {reason}")]
    InitFailed { path: PathBuf, reason: String },

    #[error("watcher for {path} is already started")]
    AlreadyStarted { path: PathBuf },

    #[error("watcher for {path} is destroyed")]
    Terminated { path: PathBuf },
}
