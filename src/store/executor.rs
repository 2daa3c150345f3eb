//! Single-thread executor decoupling listener delivery from the watch
//! loop.

use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send>;

/// Runs submitted jobs one at a time on one dedicated thread.
///
/// Parallelism is fixed at one so deliveries retain their submission
/// order. Shutdown drains jobs already submitted and admits no new
/// ones. A panicking job is contained; the worker survives it.
pub(crate) struct SerialExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    pub(crate) fn new(name: String) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(job) = rx.recv() {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    tracing::error!("listener delivery panicked");
                }
            }
        });

        match spawned {
            Ok(handle) => Self {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
            },
            Err(e) => {
                tracing::error!("failed to spawn executor thread {name}: {e}");
                Self {
                    tx: Mutex::new(None),
                    worker: Mutex::new(None),
                }
            }
        }
    }

    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    tracing::warn!("executor worker is gone, delivery dropped");
                }
            }
            None => tracing::debug!("executor is shut down, delivery dropped"),
        }
    }

    /// Drain already-submitted jobs, then stop the worker.
    pub(crate) fn shutdown(&self) {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::warn!("executor worker panicked during shutdown");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
