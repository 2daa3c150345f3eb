//! Path-keyed mutual exclusion.
//!
//! Two independent lock layers guard every persistent object: a
//! process-local reentrant lock keyed by canonical path, and an OS
//! advisory lock on the backing file. They are always acquired in that
//! order; acquiring them reversed risks deadlock across processes.

mod file;
mod registry;

pub use file::{LockedFile, lock_exclusive};
pub use registry::{PathLock, PathLockGuard, PathLockRegistry};
