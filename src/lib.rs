//! Embedded file-granularity data store.
//!
//! Turns a plain filesystem into a minimal data store without a server
//! process: per-path mutual exclusion spanning threads and cooperating
//! processes, live change notifications, and persistence primitives
//! built on both (a crash-recoverable counter, durable single-value
//! slots, and a keyed object store with a change feed).

pub mod lock;
pub mod object;
mod paths;
pub mod store;
pub mod watch;

pub use lock::{LockedFile, PathLock, PathLockGuard, PathLockRegistry, lock_exclusive};
pub use object::{
    EmptyInit, FileSequence, FileSlot, InitialValue, ObjectError, ObjectResult, RestoreFn,
    SlotInitializer, WatchedSlot,
};
pub use store::{FileObjectStore, ListenerId, StoreError, StoreListener, StoreObject, StoreResult};
pub use watch::{ChangeKind, DirectoryWatcher, FileWatcher, SyncPolicy, WatchError, WatcherState};
