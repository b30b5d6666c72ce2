//! Worker-task abstraction
//!
//! Transport mappings never spawn tasks themselves; they hand their receive
//! loops to a [`ThreadFactory`] and keep only the narrow
//! {terminate, interrupt, join} control surface of the returned
//! [`WorkerHandle`]. The default factory spawns tokio tasks; a custom
//! factory can substitute pooled or OS-thread execution.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

/// Boxed future a factory turns into a running worker.
pub type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Baseline advisory priority for worker tasks.
pub const NORM_PRIORITY: i32 = 5;

/// Stop signal shared between a worker's owner and its loop.
///
/// A `stop()` is guaranteed visible to the loop's very next
/// `is_stopped()` check.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Control surface for a spawned worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Requests a graceful stop at the worker's next loop check.
    fn terminate(&self);

    /// Forcibly cancels the worker at its next suspension point.
    fn interrupt(&self);

    /// Waits until the worker has fully exited. Returns immediately if it
    /// already has.
    async fn join(&self);

    fn name(&self) -> String;

    fn set_name(&self, name: &str);

    /// Advisory scheduling priority. Factories that cannot apply it record
    /// the value and otherwise ignore it.
    fn priority(&self) -> i32;

    fn set_priority(&self, priority: i32);
}

/// Creates background workers on behalf of transport mappings.
pub trait ThreadFactory: Send + Sync {
    /// Spawns `task` as a named background worker. `daemon` workers must not
    /// keep the process alive on their own. The `stop` flag is shared with
    /// the task; `terminate()` on the returned handle raises it.
    fn create_worker_thread(
        &self,
        name: String,
        task: WorkerFuture,
        stop: StopFlag,
        daemon: bool,
    ) -> Box<dyn WorkerHandle>;
}

/// Default factory: one tokio task per worker.
pub struct TokioTaskFactory;

struct TokioWorkerHandle {
    name: Mutex<String>,
    priority: AtomicI32,
    stop: StopFlag,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadFactory for TokioTaskFactory {
    fn create_worker_thread(
        &self,
        name: String,
        task: WorkerFuture,
        stop: StopFlag,
        _daemon: bool,
    ) -> Box<dyn WorkerHandle> {
        // Tokio tasks never block process exit, so the daemon flag needs no
        // special handling here.
        debug!("Spawning worker task: {}", name);
        let handle = tokio::spawn(task);
        Box::new(TokioWorkerHandle {
            name: Mutex::new(name),
            priority: AtomicI32::new(NORM_PRIORITY),
            stop,
            task: Mutex::new(Some(handle)),
        })
    }
}

impl TokioWorkerHandle {
    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkerHandle for TokioWorkerHandle {
    fn terminate(&self) {
        debug!("Terminating worker task: {}", self.name());
        self.stop.stop();
    }

    fn interrupt(&self) {
        debug!("Interrupting worker task: {}", self.name());
        self.stop.stop();
        if let Some(task) = self.lock_task().as_ref() {
            task.abort();
        }
    }

    async fn join(&self) {
        let task = self.lock_task().take();
        if let Some(task) = task {
            // A JoinError only means the task was aborted; either way the
            // worker is gone.
            let _ = task.await;
        }
    }

    fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_name(&self, name: &str) {
        let mut guard = self
            .name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = name.to_string();
    }

    fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }
}
