//! Directory and file change watching.
//!
//! One background worker per watcher translates raw OS events into
//! filtered callbacks dispatched under a chosen synchronization policy.
//!
//! # Architecture
//!
//! ```text
//! DirectoryWatcher
//!   - notify::RecommendedWatcher feeding a channel
//!   - one dedicated blocking worker thread
//!   - optional path predicate
//!   - SyncPolicy: None | PerWatcher | Global
//!         |
//! FileWatcher = DirectoryWatcher over the parent directory
//!               + a predicate accepting exactly one path
//! ```

mod directory;
mod error;
mod event;
mod file;

pub use directory::{DirectoryWatcher, SyncPolicy, WatcherState};
pub use error::WatchError;
pub use event::ChangeKind;
pub use file::FileWatcher;
