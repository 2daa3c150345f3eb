//! Slot with external-change detection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::watch::{FileWatcher, SyncPolicy};

use super::error::{ObjectError, ObjectResult};
use super::slot::{EmptyInit, FileSlot, SlotInitializer};

/// A [`FileSlot`] that also observes external writes to its backing
/// file.
///
/// Raw filesystem events fire on every write, including writes that do
/// not change the logical value, so change detection is edge-triggered:
/// the listener runs only on a presence transition or an actual value
/// change. Self-writes through this slot are observed the same way as
/// writes by any other thread or process.
pub struct WatchedSlot<T> {
    slot: Arc<FileSlot<T>>,
    watcher: FileWatcher,
}

impl<T> WatchedSlot<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    /// Open with no initial value; `listener` receives the new value
    /// after each observed logical change.
    pub fn open(
        path: impl Into<PathBuf>,
        listener: impl Fn(Option<&T>) + Send + Sync + 'static,
    ) -> ObjectResult<Self> {
        Self::open_with(path, EmptyInit, listener)
    }

    pub fn open_with(
        path: impl Into<PathBuf>,
        init: impl SlotInitializer<T>,
        listener: impl Fn(Option<&T>) + Send + Sync + 'static,
    ) -> ObjectResult<Self> {
        let slot = Arc::new(FileSlot::open_with(path, init)?);
        let last = Mutex::new(slot.read()?);

        let reader = Arc::clone(&slot);
        let watcher = FileWatcher::new(
            slot.path(),
            move |_kind, _path| {
                let new = match reader.read() {
                    Ok(value) => value,
                    Err(e) => {
                        // a write may be in flight; skip this event
                        tracing::warn!("re-read of watched slot failed: {e}");
                        return;
                    }
                };
                let old = std::mem::replace(&mut *last.lock(), new.clone());

                let changed = match (&old, &new) {
                    (None, None) => false,
                    (Some(old), Some(new)) => old != new,
                    _ => true,
                };
                if changed {
                    listener(new.as_ref());
                }
            },
            SyncPolicy::PerWatcher,
        )
        .map_err(|e| ObjectError::WatchFailed {
            path: slot.path().to_path_buf(),
            source: e,
        })?;

        watcher.start().map_err(|e| ObjectError::WatchFailed {
            path: slot.path().to_path_buf(),
            source: e,
        })?;

        Ok(Self { slot, watcher })
    }

    pub fn path(&self) -> &Path {
        self.slot.path()
    }

    /// The underlying slot, for the full read/modify/write contract.
    pub fn slot(&self) -> &FileSlot<T> {
        &self.slot
    }

    pub fn read(&self) -> ObjectResult<Option<T>> {
        self.slot.read()
    }

    pub fn write(&self, value: Option<T>) -> ObjectResult<()> {
        self.slot.write(value)
    }

    /// Stop observing. The backing file is untouched. Idempotent.
    pub fn close(&self) {
        self.watcher.destroy();
    }
}
