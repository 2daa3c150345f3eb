//! Process-wide registry of per-path reentrant locks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::lock_api::ArcReentrantMutexGuard;
use parking_lot::{RawMutex, RawThreadId, ReentrantMutex};

use crate::paths::canonical_key;

type SharedMutex = Arc<ReentrantMutex<()>>;
type OwnedGuard = ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>;

static GLOBAL: OnceLock<PathLockRegistry> = OnceLock::new();

/// Map from canonical path to a reentrant lock.
///
/// Filesystem paths, not object references, are the only correlation
/// key available to independently constructed components, so any two
/// components that resolve to the same canonical path receive the same
/// underlying lock. Entries live for the registry's lifetime and are
/// never evicted.
///
/// The registry is a cheap clone over shared state; clones observe the
/// same lock map.
#[derive(Debug, Clone, Default)]
pub struct PathLockRegistry {
    locks: Arc<DashMap<PathBuf, SharedMutex>>,
}

impl PathLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    ///
    /// Components that are not handed an explicit registry fall back to
    /// this one, which is what lets unrelated code sharing only a path
    /// string still exclude each other.
    pub fn global() -> &'static PathLockRegistry {
        GLOBAL.get_or_init(PathLockRegistry::new)
    }

    /// Return the lock for `path`.
    ///
    /// Identical canonical paths always yield the identical underlying
    /// lock instance, no matter how many times or from where this is
    /// called.
    pub fn lock_for(&self, path: impl AsRef<Path>) -> PathLock {
        let key = canonical_key(path.as_ref());
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone();
        PathLock { path: key, mutex }
    }

    /// Number of paths ever locked through this registry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Reentrant lock tied to one canonical path.
#[derive(Debug, Clone)]
pub struct PathLock {
    path: PathBuf,
    mutex: SharedMutex,
}

impl PathLock {
    /// The canonical path this lock guards.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held. Reentrant: a thread already
    /// holding the lock acquires it again without blocking.
    pub fn acquire(&self) -> PathLockGuard {
        PathLockGuard {
            _inner: self.mutex.lock_arc(),
        }
    }

    /// Acquire without blocking; `None` when another thread holds the
    /// lock.
    pub fn try_acquire(&self) -> Option<PathLockGuard> {
        self.mutex
            .try_lock_arc()
            .map(|guard| PathLockGuard { _inner: guard })
    }

    /// Acquire with a bounded wait.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<PathLockGuard> {
        self.mutex
            .try_lock_arc_for(timeout)
            .map(|guard| PathLockGuard { _inner: guard })
    }

    /// Whether this and `other` resolve to the same underlying lock.
    pub fn shares_target(&self, other: &PathLock) -> bool {
        Arc::ptr_eq(&self.mutex, &other.mutex)
    }
}

/// Holds the path lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PathLockGuard {
    _inner: OwnedGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn same_path_yields_same_lock() {
        let dir = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();

        let a = registry.lock_for(dir.path().join("shared"));
        let b = registry.lock_for(dir.path().join(".").join("shared"));

        assert!(a.shares_target(&b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_paths_yield_different_locks() {
        let dir = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();

        let a = registry.lock_for(dir.path().join("one"));
        let b = registry.lock_for(dir.path().join("two"));

        assert!(!a.shares_target(&b));
    }

    #[test]
    fn reentrant_acquisition_does_not_deadlock() {
        let dir = TempDir::new().unwrap();
        let lock = PathLockRegistry::new().lock_for(dir.path().join("reentrant"));

        let outer = lock.acquire();
        let inner = lock.acquire();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn concurrent_holders_never_overlap() {
        let dir = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let path = dir.path().join("contended");

        let holder = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let path = path.clone();
            let holder = Arc::clone(&holder);
            workers.push(thread::spawn(move || {
                let lock = registry.lock_for(&path);
                for _ in 0..100 {
                    let _guard = lock.acquire();
                    let me = thread_id::get();
                    holder.store(me, Ordering::SeqCst);
                    thread::yield_now();
                    assert_eq!(holder.load(Ordering::SeqCst), me);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn bounded_wait_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let registry = PathLockRegistry::new();
        let path = dir.path().join("held");

        let lock = registry.lock_for(&path);
        let _guard = lock.acquire();

        let registry2 = registry.clone();
        let contender = thread::spawn(move || {
            let lock = registry2.lock_for(&path);
            lock.try_acquire_for(Duration::from_millis(50)).is_none()
        });
        assert!(contender.join().unwrap());
    }
}
