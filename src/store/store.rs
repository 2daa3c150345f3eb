//! Directory-backed keyed collection of persistent objects.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::lock::{PathLock, PathLockGuard, PathLockRegistry, lock_exclusive};
use crate::object::{ObjectError, ObjectResult};
use crate::watch::{ChangeKind, DirectoryWatcher, SyncPolicy};

use super::error::{StoreError, StoreResult};
use super::executor::SerialExecutor;

/// An object storable in a [`FileObjectStore`].
pub trait StoreObject: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key rendered into the object's file name.
    type Key: fmt::Display + Clone + Send + Sync;

    /// Filename-safe signature shared by every file of this type.
    const SIGNATURE: &'static str;

    fn key(&self) -> Self::Key;
}

/// Opaque identity of a subscribed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Feed listener, tagged by the event kind it consumes.
///
/// The routing is decided here, at subscribe time. Removed listeners
/// receive the raw key string parsed from the deleted file's name: the
/// object is gone, so the filename-derived string is the only identity
/// left.
pub enum StoreListener<T: StoreObject> {
    Created(Box<dyn Fn(&T) + Send + Sync>),
    Changed(Box<dyn Fn(&T) + Send + Sync>),
    Removed(Box<dyn Fn(&str) + Send + Sync>),
}

impl<T: StoreObject> StoreListener<T> {
    pub fn on_created(f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self::Created(Box::new(f))
    }

    pub fn on_changed(f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self::Changed(Box::new(f))
    }

    pub fn on_removed(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self::Removed(Box::new(f))
    }

    fn consumes(&self, kind: ChangeKind) -> bool {
        matches!(
            (kind, self),
            (ChangeKind::Created, Self::Created(_))
                | (ChangeKind::Modified, Self::Changed(_))
                | (ChangeKind::Deleted, Self::Removed(_))
        )
    }
}

struct Inner<T: StoreObject> {
    directory: PathBuf,
    sentinel: PathBuf,
    registry: PathLockRegistry,
    store_lock: PathLock,
    listeners: DashMap<u64, Arc<StoreListener<T>>>,
    executor: SerialExecutor,
}

/// Directory-backed keyed collection of persistent objects with a
/// create/modify/remove listener feed.
///
/// Every object lives in its own file named `{SIGNATURE}.{key}`; one
/// payload-less sentinel file named by the bare signature exists solely
/// to be lockable and is never enumerated.
///
/// Locking protocol: every operation holds the store-wide lock (path
/// lock plus advisory lock around the sentinel) for its entire
/// duration; operations touching one object nest that object's own
/// path and file locks inside. The store is deliberately a
/// single-writer bottleneck: even disjoint-key operations serialize
/// through the store lock.
pub struct FileObjectStore<T: StoreObject> {
    inner: Arc<Inner<T>>,
    watcher: DirectoryWatcher,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl<T: StoreObject> FileObjectStore<T> {
    /// Store over `directory`, which must exist and be a directory.
    /// Creates the sentinel when missing, then starts the change feed.
    pub fn new(directory: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::with_registry(directory, PathLockRegistry::global().clone())
    }

    pub fn with_registry(
        directory: impl Into<PathBuf>,
        registry: PathLockRegistry,
    ) -> StoreResult<Self> {
        let directory: PathBuf = directory.into();
        if !directory.is_dir() {
            return Err(StoreError::NoStoreDirectory { path: directory });
        }

        let sentinel = directory.join(T::SIGNATURE);
        if !sentinel.exists() {
            // losing a create race is fine, the sentinel just has to exist
            if let Err(e) = OpenOptions::new().write(true).create(true).open(&sentinel) {
                return Err(StoreError::Io {
                    path: sentinel,
                    source: e,
                });
            }
        }

        let store_lock = registry.lock_for(&sentinel);
        let inner = Arc::new(Inner {
            directory: directory.clone(),
            sentinel,
            registry,
            store_lock,
            listeners: DashMap::new(),
            executor: SerialExecutor::new(format!(
                "store<{}>[{}]",
                T::SIGNATURE,
                directory.display()
            )),
        });

        let feed = Arc::clone(&inner);
        let watcher = DirectoryWatcher::new(
            directory,
            move |kind, path| Inner::route_event(&feed, kind, path),
            SyncPolicy::PerWatcher,
        )?;
        watcher.start()?;

        Ok(Self {
            inner,
            watcher,
            next_listener: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// The store's backing directory.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Unlocked existence probe; advisory only.
    pub fn exists(&self, key: &T::Key) -> bool {
        self.inner.file_of_key(key).exists()
    }

    pub fn get_by(&self, key: &T::Key) -> StoreResult<T> {
        let _store = self.store_guard()?;
        Ok(self.inner.read_object(&self.inner.file_of_key(key))?)
    }

    /// Like [`get_by`](Self::get_by), but absence is a result, not an
    /// error.
    pub fn find_by(&self, key: &T::Key) -> StoreResult<Option<T>> {
        let _store = self.store_guard()?;
        match self.inner.read_object(&self.inner.file_of_key(key)) {
            Ok(object) => Ok(Some(object)),
            Err(ObjectError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Unreadable or vanished members are skipped and logged, never
    /// abort the batch.
    pub fn get_all_by(&self, keys: &[T::Key]) -> StoreResult<Vec<T>> {
        let _store = self.store_guard()?;
        Ok(keys
            .iter()
            .filter_map(|key| self.inner.read_or_skip(&self.inner.file_of_key(key)))
            .collect())
    }

    pub fn get_all(&self) -> StoreResult<Vec<T>> {
        let _store = self.store_guard()?;
        let mut all = Vec::new();
        for path in self.member_paths()? {
            if let Some(object) = self.inner.read_or_skip(&path) {
                all.push(object);
            }
        }
        Ok(all)
    }

    /// Full-replace serialize, creating the file when absent.
    pub fn save(&self, object: &T) -> StoreResult<()> {
        let _store = self.store_guard()?;
        self.inner
            .write_object(&self.inner.file_of_key(&object.key()), object)
    }

    pub fn save_all(&self, objects: &[T]) -> StoreResult<()> {
        let _store = self.store_guard()?;
        for object in objects {
            self.inner
                .write_object(&self.inner.file_of_key(&object.key()), object)?;
        }
        Ok(())
    }

    /// Delete-if-exists; reports whether a file was actually removed.
    pub fn remove(&self, key: &T::Key) -> StoreResult<bool> {
        let _store = self.store_guard()?;
        self.inner.remove_object(&self.inner.file_of_key(key))
    }

    pub fn remove_all(&self, keys: &[T::Key]) -> StoreResult<bool> {
        let _store = self.store_guard()?;
        let mut any = false;
        for key in keys {
            any |= self.inner.remove_object(&self.inner.file_of_key(key))?;
        }
        Ok(any)
    }

    /// Delete every object file of this type; the sentinel survives.
    pub fn clear(&self) -> StoreResult<()> {
        let _store = self.store_guard()?;
        for path in self.member_paths()? {
            self.inner.remove_object(&path)?;
        }
        Ok(())
    }

    /// Register a feed listener; the returned id is the handle for
    /// [`unsubscribe`](Self::unsubscribe). Subscribing to a closed
    /// store is a programmer error.
    pub fn subscribe(&self, listener: StoreListener<T>) -> StoreResult<ListenerId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Integrity {
                detail: "subscribe on a closed store".to_string(),
            });
        }
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.insert(id.0, Arc::new(listener));
        Ok(id)
    }

    /// Idempotent; reports whether a listener was actually removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id.0).is_some()
    }

    /// Stop the change feed: destroy the watcher and shut the listener
    /// executor down, draining already-submitted deliveries while
    /// admitting no new ones. Data operations remain usable.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watcher.destroy();
        self.inner.executor.shutdown();
    }

    fn store_guard(&self) -> StoreResult<StoreGuard> {
        let path_guard = self.inner.store_lock.acquire();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.inner.sentinel)
            .map_err(|e| StoreError::Io {
                path: self.inner.sentinel.clone(),
                source: e,
            })?;
        let file_guard = lock_exclusive(file).map_err(|e| StoreError::Io {
            path: self.inner.sentinel.clone(),
            source: e,
        })?;
        Ok(StoreGuard {
            _path: path_guard,
            _file: file_guard,
        })
    }

    fn member_paths(&self) -> StoreResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.inner.directory).map_err(|e| StoreError::Io {
            path: self.inner.directory.clone(),
            source: e,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.inner.directory.clone(),
                source: e,
            })?;
            let path = entry.path();
            if self.inner.belongs_to_store(&path) {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

impl<T: StoreObject> Drop for FileObjectStore<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Store-wide lock: path lock plus advisory lock around the sentinel.
/// Fields drop in declaration order, releasing the file lock before
/// the path lock.
struct StoreGuard {
    _file: crate::lock::LockedFile,
    _path: PathLockGuard,
}

impl<T: StoreObject> Inner<T> {
    fn file_of_key(&self, key: &T::Key) -> PathBuf {
        self.directory.join(format!("{}.{key}", T::SIGNATURE))
    }

    /// Key substring of a member file name, `None` for the sentinel
    /// and for files that do not belong to this store.
    fn key_part_of<'p>(&self, path: &'p Path) -> Option<&'p str> {
        let name = path.file_name()?.to_str()?;
        let key = name.strip_prefix(T::SIGNATURE)?.strip_prefix('.')?;
        (!key.is_empty()).then_some(key)
    }

    fn belongs_to_store(&self, path: &Path) -> bool {
        self.key_part_of(path).is_some()
    }

    fn read_object(&self, path: &Path) -> ObjectResult<T> {
        let object_lock = self.registry.lock_for(path);
        let _object_guard = object_lock.acquire();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ObjectError::io(path, e))?;
        let mut file = lock_exclusive(file).map_err(|e| ObjectError::io(path, e))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| ObjectError::io(path, e))?;
        serde_json::from_slice(&buf)
            .map_err(|e| ObjectError::from_serde(path, std::any::type_name::<T>(), e))
    }

    fn read_or_skip(&self, path: &Path) -> Option<T> {
        match self.read_object(path) {
            Ok(object) => Some(object),
            Err(e) => {
                tracing::error!("skipping unreadable member {}: {e}", path.display());
                None
            }
        }
    }

    fn write_object(&self, path: &Path, object: &T) -> StoreResult<()> {
        let object_lock = self.registry.lock_for(path);
        let _object_guard = object_lock.acquire();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        let mut file = lock_exclusive(file).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let bytes = serde_json::to_vec(object).map_err(|e| ObjectError::NotSerializable {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.seek(SeekFrom::Start(0)).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.set_len(0).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        file.write_all(&bytes).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    fn remove_object(&self, path: &Path) -> StoreResult<bool> {
        let object_lock = self.registry.lock_for(path);
        let _object_guard = object_lock.acquire();

        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        let _file_guard = lock_exclusive(file).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn has_listener_for(&self, kind: ChangeKind) -> bool {
        self.listeners.iter().any(|entry| entry.value().consumes(kind))
    }

    /// Snapshot the listeners consuming `kind`, so delivery never
    /// holds a registry shard while user code runs. A listener may
    /// unsubscribe, even itself, from inside its own callback.
    fn listeners_for(&self, kind: ChangeKind) -> Vec<Arc<StoreListener<T>>> {
        self.listeners
            .iter()
            .filter(|entry| entry.value().consumes(kind))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Watcher callback: discard events for the sentinel, the
    /// directory root, and foreign files, then hand the rest to the
    /// executor.
    fn route_event(inner: &Arc<Self>, kind: ChangeKind, path: &Path) {
        if path == inner.directory || path == inner.sentinel || !inner.belongs_to_store(path) {
            tracing::debug!("store feed skips {}", path.display());
            return;
        }

        if !inner.has_listener_for(kind) {
            return;
        }

        match kind {
            ChangeKind::Created | ChangeKind::Modified => {
                let feed = Arc::clone(inner);
                let path = path.to_path_buf();
                inner.executor.submit(move || {
                    let object = {
                        let _store = feed.store_lock.acquire();
                        match feed.read_object(&path) {
                            Ok(object) => object,
                            Err(e) => {
                                tracing::warn!(
                                    "feed re-read of {} failed: {e}",
                                    path.display()
                                );
                                return;
                            }
                        }
                    };
                    for listener in feed.listeners_for(kind) {
                        match listener.as_ref() {
                            StoreListener::Created(f) | StoreListener::Changed(f) => f(&object),
                            StoreListener::Removed(_) => {}
                        }
                    }
                });
            }
            ChangeKind::Deleted => {
                let Some(key) = inner.key_part_of(path).map(str::to_owned) else {
                    return;
                };
                let feed = Arc::clone(inner);
                inner.executor.submit(move || {
                    for listener in feed.listeners_for(ChangeKind::Deleted) {
                        if let StoreListener::Removed(f) = listener.as_ref() {
                            f(&key);
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u64,
        body: String,
    }

    impl StoreObject for Note {
        type Key = u64;
        const SIGNATURE: &'static str = "note";

        fn key(&self) -> u64 {
            self.id
        }
    }

    fn note(id: u64, body: &str) -> Note {
        Note {
            id,
            body: body.to_string(),
        }
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result: StoreResult<FileObjectStore<Note>> =
            FileObjectStore::new(dir.path().join("absent"));
        assert!(matches!(result, Err(StoreError::NoStoreDirectory { .. })));
    }

    #[test]
    fn construction_creates_the_sentinel() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        assert!(dir.path().join("note").exists());
        store.close();
    }

    #[test]
    fn save_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        let n = note(1, "first");
        store.save(&n).unwrap();

        assert!(store.exists(&1));
        assert_eq!(store.get_by(&1).unwrap(), n);
        store.close();
    }

    #[test]
    fn find_by_models_absence_as_none() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        assert_eq!(store.find_by(&404).unwrap(), None);
        store.save(&note(7, "x")).unwrap();
        assert_eq!(store.find_by(&7).unwrap(), Some(note(7, "x")));
        store.close();
    }

    #[test]
    fn get_by_on_a_missing_key_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        assert!(store.get_by(&404).is_err());
        store.close();
    }

    #[test]
    fn get_all_skips_the_sentinel_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.save(&note(1, "a")).unwrap();
        store.save(&note(2, "b")).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let mut all = store.get_all().unwrap();
        all.sort_by_key(|n| n.id);
        assert_eq!(all, vec![note(1, "a"), note(2, "b")]);
        store.close();
    }

    #[test]
    fn get_all_skips_unreadable_members() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.save(&note(1, "good")).unwrap();
        std::fs::write(dir.path().join("note.999"), b"{{{ garbage").unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all, vec![note(1, "good")]);
        store.close();
    }

    #[test]
    fn get_all_by_reads_only_the_requested_keys() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store
            .save_all(&[note(1, "a"), note(2, "b"), note(3, "c")])
            .unwrap();

        let mut some = store.get_all_by(&[1, 3, 404]).unwrap();
        some.sort_by_key(|n| n.id);
        assert_eq!(some, vec![note(1, "a"), note(3, "c")]);
        store.close();
    }

    #[test]
    fn save_replaces_longer_stale_content() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.save(&note(1, "a body long enough to leave a tail")).unwrap();
        store.save(&note(1, "short")).unwrap();

        assert_eq!(store.get_by(&1).unwrap(), note(1, "short"));
        store.close();
    }

    #[test]
    fn remove_reports_whether_something_was_deleted() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        assert!(!store.remove(&1).unwrap());
        store.save(&note(1, "x")).unwrap();
        assert!(store.remove(&1).unwrap());
        assert!(!store.exists(&1));
        store.close();
    }

    #[test]
    fn remove_all_reports_any_removal() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.save(&note(2, "x")).unwrap();
        assert!(store.remove_all(&[1, 2]).unwrap());
        assert!(!store.remove_all(&[1, 2]).unwrap());
        store.close();
    }

    #[test]
    fn clear_preserves_the_sentinel() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.save_all(&[note(1, "a"), note(2, "b")]).unwrap();
        store.clear().unwrap();

        assert!(store.get_all().unwrap().is_empty());
        assert!(dir.path().join("note").exists());
        store.close();
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        let id = store
            .subscribe(StoreListener::on_created(|_: &Note| {}))
            .unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.close();
    }

    #[test]
    fn subscribe_after_close_is_an_integrity_error() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.close();
        let result = store.subscribe(StoreListener::on_created(|_: &Note| {}));
        assert!(matches!(result, Err(StoreError::Integrity { .. })));
    }

    #[test]
    fn data_operations_survive_close() {
        let dir = TempDir::new().unwrap();
        let store: FileObjectStore<Note> = FileObjectStore::new(dir.path()).unwrap();

        store.close();
        store.save(&note(1, "after close")).unwrap();
        assert_eq!(store.get_by(&1).unwrap(), note(1, "after close"));
    }
}
