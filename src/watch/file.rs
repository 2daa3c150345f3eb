//! Watcher specialized to a single file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::paths::canonical_key;

use super::directory::DirectoryWatcher;
use super::error::WatchError;
use super::event::ChangeKind;
use super::SyncPolicy;

/// A [`DirectoryWatcher`] over one file's parent directory, composed
/// with a predicate accepting only that file's resolved path.
pub struct FileWatcher {
    path: PathBuf,
    inner: DirectoryWatcher,
}

impl FileWatcher {
    /// Watcher for the single file at `path`. Directory targets are
    /// rejected; the parent directory must exist.
    pub fn new(
        path: impl Into<PathBuf>,
        callback: impl Fn(ChangeKind, &Path) + Send + Sync + 'static,
        policy: SyncPolicy,
    ) -> Result<Self, WatchError> {
        let path: PathBuf = path.into();
        if path.is_dir() {
            return Err(WatchError::NotAFile { path });
        }

        let resolved = canonical_key(&path);
        let parent = resolved
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WatchError::NotAFile {
                path: resolved.clone(),
            })?;

        let target = resolved.clone();
        let inner = DirectoryWatcher::build(
            parent,
            Arc::new(callback),
            policy,
            Some(Arc::new(move |event_path: &Path| {
                canonical_key(event_path) == target
            })),
        )?;

        Ok(Self {
            path: resolved,
            inner,
        })
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> super::WatcherState {
        self.inner.state()
    }

    pub fn start(&self) -> Result<(), WatchError> {
        self.inner.start()
    }

    pub fn destroy(&self) {
        self.inner.destroy();
    }
}
