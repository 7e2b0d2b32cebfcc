use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{sync::Notify, task::JoinHandle};

/// Handle to one background worker task.
///
/// Owns the running flag and the notifier the worker polls; dropping the
/// handle signals the worker to stop at its next wakeup. The join handle is
/// detached rather than awaited so that teardown never blocks.
pub(crate) struct WorkerHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    notifier: Arc<Notify>,
}

impl WorkerHandle {
    pub fn new<F>(notifier: Arc<Notify>, task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let handle = task(running.clone(), notifier.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    #[allow(dead_code)]
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
        // Detach; the worker observes the flag within one poll interval.
        drop(self.handle.take());
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
