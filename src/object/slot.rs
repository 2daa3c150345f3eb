//! Durable single-value slot with a full read/modify/write contract.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::lock::{LockedFile, PathLock, PathLockRegistry, lock_exclusive};

use super::error::{ObjectError, ObjectResult};

/// Hooks distinguishing cold-start (file created) from warm-start
/// (existing value adopted) during slot construction.
pub trait SlotInitializer<T> {
    /// Value written when the backing file does not exist yet.
    fn initial(&self) -> Option<T> {
        None
    }

    /// Called when construction created the backing file.
    fn on_created(&self, _initial: Option<&T>) {}

    /// Called when construction adopted an existing on-disk value.
    fn on_adopted(&self, _existing: Option<&T>) {}
}

impl<T, S: SlotInitializer<T>> SlotInitializer<T> for &S {
    fn initial(&self) -> Option<T> {
        (**self).initial()
    }

    fn on_created(&self, initial: Option<&T>) {
        (**self).on_created(initial)
    }

    fn on_adopted(&self, existing: Option<&T>) {
        (**self).on_adopted(existing)
    }
}

/// Initializer with no initial value and no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyInit;

impl<T> SlotInitializer<T> for EmptyInit {}

/// Initializer seeding a freshly created file with a fixed value.
#[derive(Debug, Clone)]
pub struct InitialValue<T>(pub Option<T>);

impl<T: Clone> SlotInitializer<T> for InitialValue<T> {
    fn initial(&self) -> Option<T> {
        self.0.clone()
    }
}

/// Durable storage for one optional value.
///
/// The stored value is always an `Option<T>`: an explicit `None`
/// persists as a JSON `null` tombstone, which is distinct from the
/// backing file not existing at all. Every operation is one atomic
/// critical section under the path lock and the file's advisory lock.
///
/// The slot remembers the last value this process itself read or
/// wrote. That memory is only the fallback when an absent file has to
/// be lazily recreated; it is never an authoritative read source.
pub struct FileSlot<T> {
    path: PathBuf,
    lock: PathLock,
    last: Mutex<Option<T>>,
}

impl<T> FileSlot<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open with no initial value and no hooks.
    pub fn open(path: impl Into<PathBuf>) -> ObjectResult<Self> {
        Self::open_with(path, EmptyInit)
    }

    /// Open, adopting the existing on-disk value or creating the file
    /// with the initializer's initial value. The matching hook fires,
    /// letting callers tell warm-start from cold-start.
    pub fn open_with(
        path: impl Into<PathBuf>,
        init: impl SlotInitializer<T>,
    ) -> ObjectResult<Self> {
        Self::open_in(path, init, PathLockRegistry::global())
    }

    pub fn open_in(
        path: impl Into<PathBuf>,
        init: impl SlotInitializer<T>,
        registry: &PathLockRegistry,
    ) -> ObjectResult<Self> {
        let path: PathBuf = path.into();
        if path.is_dir() {
            return Err(ObjectError::IsDirectory { path });
        }

        let lock = registry.lock_for(&path);
        let slot = Self {
            path,
            lock,
            last: Mutex::new(None),
        };

        let _path_guard = slot.lock.acquire();
        loop {
            match slot.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&slot.path, e))?;
                    let current = slot.decode(&mut file)?;
                    init.on_adopted(current.as_ref());
                    *slot.last.lock() = current;
                    break;
                }
                None => {
                    if let Some(file) = slot.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&slot.path, e))?;
                        let initial = init.initial();
                        slot.encode(&mut file, &initial)?;
                        init.on_created(initial.as_ref());
                        *slot.last.lock() = initial;
                        break;
                    }
                    // lost the create race: the file exists now, adopt it
                }
            }
        }
        drop(_path_guard);

        Ok(slot)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current value. An absent backing file is lazily recreated
    /// holding the last value this process read or wrote, which is
    /// then returned.
    pub fn read(&self) -> ObjectResult<Option<T>> {
        let _path_guard = self.lock.acquire();
        loop {
            match self.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                    let current = self.decode(&mut file)?;
                    *self.last.lock() = current.clone();
                    return Ok(current);
                }
                None => {
                    if let Some(file) = self.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                        let last = self.last.lock().clone();
                        self.encode(&mut file, &last)?;
                        return Ok(last);
                    }
                }
            }
        }
    }

    /// Truncate-and-rewrite with `value`. `None` writes the explicit
    /// tombstone.
    pub fn write(&self, value: Option<T>) -> ObjectResult<()> {
        let _path_guard = self.lock.acquire();
        loop {
            let file = match self.open_existing()? {
                Some(file) => file,
                None => match self.try_create()? {
                    Some(file) => file,
                    None => continue,
                },
            };
            let mut file = lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
            self.encode(&mut file, &value)?;
            *self.last.lock() = value;
            return Ok(());
        }
    }

    /// Write `value` and return the prior value, as one critical
    /// section. When the backing file was absent there is no prior
    /// value on disk; the freshly written value is returned.
    pub fn swap(&self, value: Option<T>) -> ObjectResult<Option<T>> {
        let _path_guard = self.lock.acquire();
        loop {
            match self.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                    let current = self.decode(&mut file)?;
                    self.encode(&mut file, &value)?;
                    *self.last.lock() = value;
                    return Ok(current);
                }
                None => {
                    if let Some(file) = self.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                        self.encode(&mut file, &value)?;
                        *self.last.lock() = value.clone();
                        return Ok(value);
                    }
                }
            }
        }
    }

    /// Apply `f` to the current value and persist the result when a
    /// value is present, or when absent and `apply_if_absent` is set.
    /// Always returns the pre-transform value.
    pub fn modify(
        &self,
        f: impl FnOnce(Option<&T>) -> Option<T>,
        apply_if_absent: bool,
    ) -> ObjectResult<Option<T>> {
        let _path_guard = self.lock.acquire();
        loop {
            match self.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                    let current = self.decode(&mut file)?;
                    *self.last.lock() = current.clone();
                    if current.is_some() || apply_if_absent {
                        let next = f(current.as_ref());
                        self.encode(&mut file, &next)?;
                        *self.last.lock() = next;
                    }
                    return Ok(current);
                }
                None => {
                    if let Some(file) = self.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                        let current = self.last.lock().clone();
                        if current.is_some() || apply_if_absent {
                            let next = f(current.as_ref());
                            self.encode(&mut file, &next)?;
                            *self.last.lock() = next;
                        } else {
                            self.encode(&mut file, &current)?;
                        }
                        return Ok(current);
                    }
                }
            }
        }
    }

    /// Deserialize, mutate the value in place, re-serialize it. No-op
    /// returning `None` when the current value is absent. Returns the
    /// stored value after mutation.
    pub fn mutate_if_present(&self, f: impl FnOnce(&mut T)) -> ObjectResult<Option<T>> {
        let _path_guard = self.lock.acquire();
        loop {
            match self.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                    let mut current = self.decode(&mut file)?;
                    if let Some(value) = current.as_mut() {
                        f(value);
                        self.encode(&mut file, &current)?;
                    }
                    *self.last.lock() = current.clone();
                    return Ok(current);
                }
                None => {
                    if let Some(file) = self.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                        self.encode(&mut file, &None)?;
                        *self.last.lock() = None;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Replace the value with `value` only when the current value is
    /// absent (tombstoned). Returns the pre-update value.
    pub fn reset_if_absent(&self, value: Option<T>) -> ObjectResult<Option<T>> {
        let _path_guard = self.lock.acquire();
        loop {
            match self.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                    let current = self.decode(&mut file)?;
                    if current.is_none() {
                        self.encode(&mut file, &value)?;
                        *self.last.lock() = value;
                    }
                    return Ok(current);
                }
                None => {
                    if let Some(file) = self.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                        self.encode(&mut file, &value)?;
                        *self.last.lock() = value.clone();
                        return Ok(value);
                    }
                }
            }
        }
    }

    /// Replace the value with `value` only when a value is present.
    /// Returns the pre-update value.
    pub fn reset_if_present(&self, value: Option<T>) -> ObjectResult<Option<T>> {
        let _path_guard = self.lock.acquire();
        loop {
            match self.open_existing()? {
                Some(file) => {
                    let mut file =
                        lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                    let current = self.decode(&mut file)?;
                    if current.is_some() {
                        self.encode(&mut file, &value)?;
                        *self.last.lock() = value;
                    }
                    return Ok(current);
                }
                None => {
                    if let Some(file) = self.try_create()? {
                        let mut file =
                            lock_exclusive(file).map_err(|e| ObjectError::io(&self.path, e))?;
                        self.encode(&mut file, &None)?;
                        *self.last.lock() = None;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Swap in the tombstone and return what was stored.
    pub fn take(&self) -> ObjectResult<Option<T>> {
        self.swap(None)
    }

    pub fn is_present(&self) -> ObjectResult<bool> {
        Ok(self.read()?.is_some())
    }

    fn open_existing(&self) -> ObjectResult<Option<File>> {
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectError::io(&self.path, e)),
        }
    }

    fn try_create(&self) -> ObjectResult<Option<File>> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(ObjectError::io(&self.path, e)),
        }
    }

    fn decode(&self, file: &mut LockedFile) -> ObjectResult<Option<T>> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| ObjectError::io(&self.path, e))?;
        serde_json::from_slice(&buf)
            .map_err(|e| ObjectError::from_serde(&self.path, std::any::type_name::<T>(), e))
    }

    fn encode(&self, file: &mut LockedFile, value: &Option<T>) -> ObjectResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| ObjectError::NotSerializable {
            path: self.path.clone(),
            source: e,
        })?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ObjectError::io(&self.path, e))?;
        file.set_len(0)
            .map_err(|e| ObjectError::io(&self.path, e))?;
        file.write_all(&bytes)
            .map_err(|e| ObjectError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[test]
    fn cold_start_creates_the_file_and_fires_the_hook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");

        struct Probe(AtomicBool);
        impl SlotInitializer<String> for Probe {
            fn initial(&self) -> Option<String> {
                Some("seed".to_string())
            }
            fn on_created(&self, initial: Option<&String>) {
                assert_eq!(initial.map(String::as_str), Some("seed"));
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let probe = Probe(AtomicBool::new(false));
        let slot: FileSlot<String> = FileSlot::open_with(&path, &probe).unwrap();
        assert!(probe.0.load(Ordering::SeqCst));
        assert_eq!(slot.read().unwrap().as_deref(), Some("seed"));
    }

    #[test]
    fn warm_start_adopts_the_existing_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");

        let first: FileSlot<u32> = FileSlot::open(&path).unwrap();
        first.write(Some(11)).unwrap();
        drop(first);

        struct Probe(AtomicBool);
        impl SlotInitializer<u32> for Probe {
            fn initial(&self) -> Option<u32> {
                Some(99)
            }
            fn on_adopted(&self, existing: Option<&u32>) {
                assert_eq!(existing, Some(&11));
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let probe = Probe(AtomicBool::new(false));
        let second: FileSlot<u32> = FileSlot::open_with(&path, &probe).unwrap();
        assert!(probe.0.load(Ordering::SeqCst));
        assert_eq!(second.read().unwrap(), Some(11));
    }

    #[test]
    fn tombstone_is_distinct_from_absence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");

        let slot: FileSlot<String> = FileSlot::open(&path).unwrap();
        slot.write(None).unwrap();

        assert_eq!(slot.read().unwrap(), None);
        assert_eq!(fs::read_to_string(&path).unwrap(), "null");
    }

    #[test]
    fn swap_returns_the_prior_value() {
        let dir = TempDir::new().unwrap();
        let slot: FileSlot<u32> = FileSlot::open(dir.path().join("slot")).unwrap();

        slot.write(Some(1)).unwrap();
        assert_eq!(slot.swap(Some(2)).unwrap(), Some(1));
        assert_eq!(slot.read().unwrap(), Some(2));
    }

    #[test]
    fn reset_if_absent_applies_only_on_tombstone() {
        let dir = TempDir::new().unwrap();
        let slot: FileSlot<u32> = FileSlot::open(dir.path().join("slot")).unwrap();

        assert_eq!(slot.reset_if_absent(Some(5)).unwrap(), None);
        assert_eq!(slot.read().unwrap(), Some(5));

        assert_eq!(slot.reset_if_absent(Some(9)).unwrap(), Some(5));
        assert_eq!(slot.read().unwrap(), Some(5));
    }

    #[test]
    fn reset_if_present_applies_only_on_value() {
        let dir = TempDir::new().unwrap();
        let slot: FileSlot<u32> = FileSlot::open(dir.path().join("slot")).unwrap();

        assert_eq!(slot.reset_if_present(Some(5)).unwrap(), None);
        assert_eq!(slot.read().unwrap(), None);

        slot.write(Some(1)).unwrap();
        assert_eq!(slot.reset_if_present(Some(5)).unwrap(), Some(1));
        assert_eq!(slot.read().unwrap(), Some(5));
    }

    #[test]
    fn modify_skips_absent_values_unless_told_otherwise() {
        let dir = TempDir::new().unwrap();
        let slot: FileSlot<u32> = FileSlot::open(dir.path().join("slot")).unwrap();

        let prior = slot.modify(|v| v.map(|n| n + 1), false).unwrap();
        assert_eq!(prior, None);
        assert_eq!(slot.read().unwrap(), None);

        let prior = slot.modify(|_| Some(1), true).unwrap();
        assert_eq!(prior, None);
        assert_eq!(slot.read().unwrap(), Some(1));

        let prior = slot.modify(|v| v.map(|n| n + 1), false).unwrap();
        assert_eq!(prior, Some(1));
        assert_eq!(slot.read().unwrap(), Some(2));
    }

    #[test]
    fn modify_on_a_deleted_file_works_from_the_last_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");
        let slot: FileSlot<u32> = FileSlot::open(&path).unwrap();

        slot.write(Some(1)).unwrap();
        fs::remove_file(&path).unwrap();

        let prior = slot.modify(|v| v.map(|n| n + 1), false).unwrap();
        assert_eq!(prior, Some(1));
        assert_eq!(slot.read().unwrap(), Some(2));
    }

    #[test]
    fn mutate_if_present_is_a_noop_on_tombstone() {
        let dir = TempDir::new().unwrap();
        let slot: FileSlot<Vec<u32>> = FileSlot::open(dir.path().join("slot")).unwrap();

        assert_eq!(slot.mutate_if_present(|v| v.push(1)).unwrap(), None);
        assert_eq!(slot.read().unwrap(), None);

        slot.write(Some(vec![1])).unwrap();
        let after = slot.mutate_if_present(|v| v.push(2)).unwrap();
        assert_eq!(after, Some(vec![1, 2]));
        assert_eq!(slot.read().unwrap(), Some(vec![1, 2]));
    }

    #[test]
    fn deleted_file_is_lazily_recreated_with_the_last_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");
        let slot: FileSlot<String> = FileSlot::open(&path).unwrap();

        slot.write(Some("kept".to_string())).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(slot.read().unwrap().as_deref(), Some("kept"));
        assert!(path.exists());
    }

    #[test]
    fn wrong_shape_is_a_type_mismatch_never_coerced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");
        let slot: FileSlot<u32> = FileSlot::open(&path).unwrap();

        fs::write(&path, "\"a string, not a number\"").unwrap();
        assert!(matches!(
            slot.read(),
            Err(ObjectError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unparseable_bytes_are_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");
        let slot: FileSlot<u32> = FileSlot::open(&path).unwrap();

        fs::write(&path, "{{{ not json").unwrap();
        assert!(matches!(slot.read(), Err(ObjectError::Corrupted { .. })));
    }

    #[test]
    fn take_leaves_the_tombstone() {
        let dir = TempDir::new().unwrap();
        let slot: FileSlot<u32> = FileSlot::open(dir.path().join("slot")).unwrap();

        slot.write(Some(3)).unwrap();
        assert_eq!(slot.take().unwrap(), Some(3));
        assert_eq!(slot.read().unwrap(), None);
        assert!(slot.path().exists());
    }

    #[test]
    fn directory_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result: ObjectResult<FileSlot<u32>> = FileSlot::open(dir.path());
        assert!(matches!(result, Err(ObjectError::IsDirectory { .. })));
    }
}
