//! RAII guard over OS advisory file locks.

use std::fs::File;
use std::io;
use std::ops::{Deref, DerefMut};

/// A file held under an exclusive advisory lock.
///
/// Advisory locks are cooperative: they exclude only participants that
/// take the same lock on the same file. The lock is released when the
/// value is dropped; a failed release is logged, never propagated,
/// since teardown must always complete.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
}

/// Block until an exclusive advisory lock on `file` is held.
///
/// Acquisition is unbounded by design: no holder is expected to keep
/// the lock longer than a single read or write.
pub fn lock_exclusive(file: File) -> io::Result<LockedFile> {
    file.lock()?;
    Ok(LockedFile { file })
}

impl Deref for LockedFile {
    type Target = File;

    fn deref(&self) -> &File {
        &self.file
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("failed to release advisory file lock: {e}");
        }
    }
}
