//! Shared batch scheduler: named queues that coalesce tasks into batches
//! bounded by size and time, drained by a fixed pool of worker tasks.
//!
//! Each worker is pinned to one batch at a time: it awaits the process
//! callback to completion before looking for more work. That blocking is
//! deliberate back-pressure, giving upstream callers time to coalesce the
//! next batch instead of letting workers race ahead.

mod queue;
mod worker;

pub(crate) use queue::{BatchQueue, QueueOptions, SplitInputTaskFn};
pub(crate) use worker::WorkerHandle;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::communication::Pill;

/// A unit of schedulable work; `size` is its extent along dimension 0.
pub(crate) trait SchedulableTask: Send + 'static {
    fn size(&self) -> usize;
}

/// An ordered group of tasks, closed once handed to a worker.
pub(crate) struct Batch<T> {
    tasks: Vec<T>,
}

impl<T: SchedulableTask> Batch<T> {
    fn new(tasks: Vec<T>) -> Self {
        Self { tasks }
    }

    pub fn size(&self) -> usize {
        self.tasks.iter().map(|t| t.size()).sum()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[T] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<T> {
        self.tasks
    }
}

/// Per-batch processing callback; awaited to completion by the worker that
/// picked the batch up.
pub(crate) type ProcessBatchFn<T> =
    Arc<dyn Fn(Batch<T>) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) struct SchedulerOptions {
    pub num_batch_threads: usize,
}

struct SchedulerShared<T: SchedulableTask> {
    queues: Mutex<Vec<Arc<BatchQueue<T>>>>,
    next_queue: AtomicUsize,
    notifier: Arc<Notify>,
}

impl<T: SchedulableTask> SchedulerShared<T> {
    /// Scan queues round-robin for a batch that is ready to run.
    fn pop_ready_batch(&self) -> Option<(ProcessBatchFn<T>, Batch<T>)> {
        let queues: Vec<Arc<BatchQueue<T>>> = self.queues.lock().unwrap().clone();
        if queues.is_empty() {
            return None;
        }
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed) % queues.len();
        for offset in 0..queues.len() {
            let queue = &queues[(start + offset) % queues.len()];
            if let Some(batch) = queue.pop_ready_batch() {
                return Some((queue.process_fn(), batch));
            }
        }
        None
    }
}

/// Accepts tasks on named queues and runs their process callbacks on a
/// fixed-size worker pool shared across all queues.
pub(crate) struct SharedBatchScheduler<T: SchedulableTask> {
    shared: Arc<SchedulerShared<T>>,
    _workers: Vec<WorkerHandle>,
}

impl<T: SchedulableTask> SharedBatchScheduler<T> {
    pub fn new(options: SchedulerOptions) -> Self {
        let shared = Arc::new(SchedulerShared {
            queues: Mutex::new(Vec::new()),
            next_queue: AtomicUsize::new(0),
            notifier: Arc::new(Notify::new()),
        });

        let workers = (0..options.num_batch_threads)
            .map(|_| {
                let weak = Arc::downgrade(&shared);
                let pill = Pill::new();
                WorkerHandle::new(shared.notifier.clone(), move |running, notifier| {
                    tokio::spawn(async move {
                        let _moved_pill = pill;
                        worker_loop(weak, running, notifier).await;
                    })
                })
            })
            .collect();

        Self {
            shared,
            _workers: workers,
        }
    }

    pub fn add_queue(
        &self,
        options: QueueOptions<T>,
        process_fn: ProcessBatchFn<T>,
    ) -> Arc<BatchQueue<T>> {
        let queue = Arc::new(BatchQueue::new(
            options,
            process_fn,
            self.shared.notifier.clone(),
        ));
        self.shared.queues.lock().unwrap().push(queue.clone());
        queue
    }
}

async fn worker_loop<T: SchedulableTask>(
    shared: Weak<SchedulerShared<T>>,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let work = match shared.upgrade() {
            None => break,
            Some(shared) => shared.pop_ready_batch(),
        };
        match work {
            Some((process_fn, batch)) => {
                // Pinned to this batch until its processing completes.
                process_fn(batch).await;
            }
            None => {
                let _ =
                    tokio::time::timeout(Duration::from_millis(1), notifier.notified()).await;
            }
        }
    }
}
