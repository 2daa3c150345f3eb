//! Single-file monotonic counter with corruption self-healing.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::lock::{LockedFile, PathLock, PathLockRegistry, lock_exclusive};

use super::error::{ObjectError, ObjectResult};

/// Restores a lost counter value from an external source of truth.
pub type RestoreFn = Box<dyn Fn() -> i64 + Send + Sync>;

const VALUE_LEN: usize = 8;

/// Crash-recoverable persistent counter.
///
/// The backing file holds exactly eight bytes: the current value as a
/// two's-complement big-endian integer, no header. Recovery always
/// rewrites the whole file. Incrementing past `i64::MAX` wraps to
/// `i64::MIN`; the wraparound is part of the contract, not an error.
pub struct FileSequence {
    path: PathBuf,
    lock: PathLock,
    initial: i64,
    step: i64,
    restore: Option<RestoreFn>,
    /// Mirrors the on-disk value after every successful operation; the
    /// recovery fallback when no restore fn is supplied.
    cached: AtomicI64,
}

impl FileSequence {
    /// Sequence starting at zero with step one.
    pub fn new(path: impl Into<PathBuf>) -> ObjectResult<Self> {
        Self::with(path, 0, 1, None)
    }

    pub fn with(
        path: impl Into<PathBuf>,
        initial: i64,
        step: i64,
        restore: Option<RestoreFn>,
    ) -> ObjectResult<Self> {
        Self::with_registry(path, initial, step, restore, PathLockRegistry::global())
    }

    /// Full constructor with an injected lock registry. Bootstraps the
    /// backing file with the initial value when it does not exist;
    /// an existing file is left untouched.
    pub fn with_registry(
        path: impl Into<PathBuf>,
        initial: i64,
        step: i64,
        restore: Option<RestoreFn>,
        registry: &PathLockRegistry,
    ) -> ObjectResult<Self> {
        let path: PathBuf = path.into();
        let lock = registry.lock_for(&path);
        let sequence = Self {
            path,
            lock,
            initial,
            step,
            restore,
            cached: AtomicI64::new(initial),
        };
        sequence.create_if_missing()?;
        Ok(sequence)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_if_missing(&self) -> ObjectResult<()> {
        let _path_guard = self.lock.acquire();
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => {
                let mut file = lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                file.write_all(&self.initial.to_be_bytes())
                    .map_err(|e| ObjectError::io(&self.path, e))?;
                self.cached.store(self.initial, Ordering::SeqCst);
                tracing::info!(
                    "sequence file {} created with initial value {}",
                    self.path.display(),
                    self.initial
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(ObjectError::io(&self.path, e)),
        }
    }

    /// Current value. Self-healing: lost or malformed content is
    /// recovered (restore fn if supplied, cached value otherwise) and
    /// immediately written back before returning.
    pub fn get(&self) -> ObjectResult<i64> {
        self.read_modify(0)
    }

    /// Fetch-and-add: persists `value + step`, returns the
    /// pre-increment value.
    pub fn get_and_increment(&self) -> ObjectResult<i64> {
        self.read_modify(self.step)
    }

    fn read_modify(&self, add: i64) -> ObjectResult<i64> {
        let _path_guard = self.lock.acquire();
        loop {
            let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    match self.bootstrap(add)? {
                        Some(value) => return Ok(value),
                        // lost the create race, retry as a plain call
                        None => continue,
                    }
                }
                Err(e) => return Err(ObjectError::io(&self.path, e)),
            };

            let mut file = lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;

            let (current, healed) = match self.read_value(&mut file)? {
                Some(value) => (value, false),
                None => (self.restore_or_cached(), true),
            };

            let next = current.wrapping_add(add);
            if add != 0 || healed {
                self.rewrite(&mut file, next)?;
            }
            self.cached.store(next, Ordering::SeqCst);
            return Ok(current);
        }
    }

    /// Exclusive-create bootstrap for an operation that found no file.
    /// Returns the operation result, or `None` when the create lost a
    /// race to a concurrent writer.
    fn bootstrap(&self, add: i64) -> ObjectResult<Option<i64>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(ObjectError::io(&self.path, e)),
        };

        let mut file = lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
        let current = self.restore_or_cached();
        let next = current.wrapping_add(add);
        file.write_all(&next.to_be_bytes())
            .map_err(|e| ObjectError::io(&self.path, e))?;
        self.cached.store(next, Ordering::SeqCst);
        tracing::info!(
            "sequence file {} did not exist, created with value {next}",
            self.path.display()
        );
        Ok(Some(current))
    }

    fn read_value(&self, file: &mut LockedFile) -> ObjectResult<Option<i64>> {
        let mut buf = Vec::with_capacity(VALUE_LEN);
        file.read_to_end(&mut buf)
            .map_err(|e| ObjectError::io(&self.path, e))?;

        if buf.len() == VALUE_LEN {
            let mut raw = [0u8; VALUE_LEN];
            raw.copy_from_slice(&buf);
            Ok(Some(i64::from_be_bytes(raw)))
        } else if buf.is_empty() {
            tracing::error!(
                "sequence value of {} is lost, trying to restore",
                self.path.display()
            );
            Ok(None)
        } else {
            tracing::error!(
                "sequence {} is corrupted, trying to restore",
                self.path.display()
            );
            Ok(None)
        }
    }

    fn restore_or_cached(&self) -> i64 {
        match &self.restore {
            Some(restore) => restore(),
            None => self.cached.load(Ordering::SeqCst),
        }
    }

    fn rewrite(&self, file: &mut LockedFile, value: i64) -> ObjectResult<()> {
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ObjectError::io(&self.path, e))?;
        file.set_len(0)
            .map_err(|e| ObjectError::io(&self.path, e))?;
        file.write_all(&value.to_be_bytes())
            .map_err(|e| ObjectError::io(&self.path, e))?;
        Ok(())
    }
}
