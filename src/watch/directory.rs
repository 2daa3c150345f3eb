//! Directory watcher with one dedicated blocking worker per instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::WatchError;
use super::event::ChangeKind;

/// Callback invoked with each accepted `(kind, absolute path)` event.
pub(crate) type EventCallback = Arc<dyn Fn(ChangeKind, &Path) + Send + Sync>;
/// Optional predicate deciding which paths reach the callback.
pub(crate) type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Serializes callbacks of every watcher that chose [`SyncPolicy::Global`].
static GLOBAL_CALLBACK_LOCK: Mutex<()> = Mutex::new(());

/// How callback invocations are serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// No serialization; the callback must be self-synchronizing.
    None,
    /// Serialized across this watcher's own events only.
    #[default]
    PerWatcher,
    /// Serialized across every watcher in the process. For callbacks
    /// touching shared process-wide state.
    Global,
}

const CREATED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;
const STOPPED: u8 = 4;

/// Watcher lifecycle. `Stopped` is terminal and irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl WatcherState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CREATED => Self::Created,
            STARTING => Self::Starting,
            RUNNING => Self::Running,
            STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct Dispatch {
    callback: EventCallback,
    filter: Option<PathFilter>,
    policy: SyncPolicy,
    /// Monitor for [`SyncPolicy::PerWatcher`].
    serial: Mutex<()>,
}

impl Dispatch {
    fn invoke(&self, kind: ChangeKind, path: &Path) {
        match self.policy {
            SyncPolicy::None => (self.callback)(kind, path),
            SyncPolicy::PerWatcher => {
                let _serial = self.serial.lock();
                (self.callback)(kind, path);
            }
            SyncPolicy::Global => {
                let _serial = GLOBAL_CALLBACK_LOCK.lock();
                (self.callback)(kind, path);
            }
        }
    }
}

struct WorkerHandle {
    /// Dropping the watcher closes the OS watch handle, which
    /// disconnects the event channel and unblocks the worker.
    watcher: RecommendedWatcher,
    thread: JoinHandle<()>,
}

/// One background observer over a single directory.
///
/// Raw OS events are translated into `(ChangeKind, absolute path)`
/// pairs, run through the optional predicate, and dispatched under the
/// chosen [`SyncPolicy`] on a dedicated worker thread.
pub struct DirectoryWatcher {
    path: PathBuf,
    dispatch: Arc<Dispatch>,
    state: Arc<AtomicU8>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl DirectoryWatcher {
    /// Watcher over `dir`, which must exist and be a directory.
    pub fn new(
        dir: impl Into<PathBuf>,
        callback: impl Fn(ChangeKind, &Path) + Send + Sync + 'static,
        policy: SyncPolicy,
    ) -> Result<Self, WatchError> {
        Self::build(dir.into(), Arc::new(callback), policy, None)
    }

    /// Watcher over `dir` reporting only paths accepted by `filter`.
    pub fn with_filter(
        dir: impl Into<PathBuf>,
        callback: impl Fn(ChangeKind, &Path) + Send + Sync + 'static,
        policy: SyncPolicy,
        filter: impl Fn(&Path) -> bool + Send + Sync + 'static,
    ) -> Result<Self, WatchError> {
        Self::build(dir.into(), Arc::new(callback), policy, Some(Arc::new(filter)))
    }

    pub(crate) fn build(
        path: PathBuf,
        callback: EventCallback,
        policy: SyncPolicy,
        filter: Option<PathFilter>,
    ) -> Result<Self, WatchError> {
        if !path.is_dir() {
            return Err(WatchError::NotADirectory { path });
        }

        Ok(Self {
            path,
            dispatch: Arc::new(Dispatch {
                callback,
                filter,
                policy,
                serial: Mutex::new(()),
            }),
            state: Arc::new(AtomicU8::new(CREATED)),
            worker: Mutex::new(None),
        })
    }

    /// The watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WatcherState {
        WatcherState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Open the OS watch handle, register interest in
    /// create/modify/delete, and launch the worker.
    ///
    /// Failures are returned as values and leave the watcher back in
    /// `Created`, so callers can degrade gracefully or retry.
    pub fn start(&self) -> Result<(), WatchError> {
        if let Err(actual) =
            self.state
                .compare_exchange(CREATED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
        {
            return Err(match actual {
                STARTING | RUNNING => WatchError::AlreadyStarted {
                    path: self.path.clone(),
                },
                _ => WatchError::Terminated {
                    path: self.path.clone(),
                },
            });
        }

        let (tx, rx) = crossbeam_channel::unbounded::<notify::Result<Event>>();
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                self.state.store(CREATED, Ordering::SeqCst);
                return Err(WatchError::InitFailed {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            self.state.store(CREATED, Ordering::SeqCst);
            return Err(WatchError::InitFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            });
        }

        let dispatch = Arc::clone(&self.dispatch);
        let state = Arc::clone(&self.state);
        let root = self.path.clone();
        let thread = std::thread::Builder::new()
            .name(format!("watch[{}]", root.display()))
            .spawn(move || run_loop(rx, dispatch, state, root));
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                self.state.store(CREATED, Ordering::SeqCst);
                return Err(WatchError::InitFailed {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        *self.worker.lock() = Some(WorkerHandle { watcher, thread });

        if self
            .state
            .compare_exchange(STARTING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // destroyed while starting; tear the fresh worker down
            self.join_worker();
            self.state.store(STOPPED, Ordering::SeqCst);
            return Err(WatchError::Terminated {
                path: self.path.clone(),
            });
        }

        tracing::debug!("watching {}", self.path.display());
        Ok(())
    }

    /// Stop watching. Always reaches `Stopped`, even when closing the
    /// OS handle or joining the worker fails; such failures are logged,
    /// not propagated. Idempotent. Must not be called from inside the
    /// watcher's own callback.
    pub fn destroy(&self) {
        if self.state.load(Ordering::SeqCst) == STOPPED {
            return;
        }
        self.state.store(STOPPING, Ordering::SeqCst);
        self.join_worker();
        self.state.store(STOPPED, Ordering::SeqCst);
        tracing::debug!("watch on {} stopped", self.path.display());
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(WorkerHandle { watcher, thread }) = handle {
            drop(watcher);
            if thread.join().is_err() {
                tracing::warn!(
                    "watch worker for {} panicked during shutdown",
                    self.path.display()
                );
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_loop(
    rx: Receiver<notify::Result<Event>>,
    dispatch: Arc<Dispatch>,
    state: Arc<AtomicU8>,
    root: PathBuf,
) {
    while let Ok(batch) = rx.recv() {
        if state.load(Ordering::SeqCst) >= STOPPING {
            break;
        }

        match batch {
            Ok(event) => {
                let Some(kind) = ChangeKind::from_notify(&event.kind) else {
                    continue;
                };
                if kind == ChangeKind::Deleted && event.paths.iter().any(|p| p == &root) {
                    tracing::warn!("watched directory {} vanished, watch ended", root.display());
                    break;
                }
                for path in &event.paths {
                    if let Some(filter) = &dispatch.filter {
                        if !filter(path) {
                            continue;
                        }
                    }
                    dispatch.invoke(kind, path);
                }
            }
            Err(e) => {
                // The watch itself failing means the watched directory
                // is gone; anything else is logged and survived.
                let fatal = matches!(e.kind, notify::ErrorKind::PathNotFound)
                    || e.paths.iter().any(|p| p == &root);
                if fatal {
                    tracing::warn!("watch on {} ended: {e}", root.display());
                    break;
                }
                tracing::warn!("watch error on {}: {e}", root.display());
            }
        }
    }
}
