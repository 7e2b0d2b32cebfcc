use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{BatchError, BatchResult};

use super::{Batch, ProcessBatchFn, SchedulableTask};

/// Split hook invoked when a task does not fit into the open batch.
///
/// Receives the task, the remaining slot of the open batch, and the maximum
/// execution batch size; returns the sub-tasks to enqueue in its place.
pub(crate) type SplitInputTaskFn<T> =
    Arc<dyn Fn(T, usize, usize) -> BatchResult<Vec<T>> + Send + Sync>;

/// Per-queue batching policy.
pub(crate) struct QueueOptions<T> {
    /// Largest task size accepted for scheduling.
    pub input_batch_size_limit: usize,
    /// Maximum number of closed batches waiting for a worker.
    pub max_enqueued_batches: usize,
    /// How long an open batch may wait for more tasks before it is
    /// dispatched anyway.
    pub batch_timeout: Duration,
    pub enable_large_batch_splitting: bool,
    /// Largest batch handed to the process callback. Equal to
    /// `input_batch_size_limit` unless splitting decouples the two.
    pub max_execution_batch_size: usize,
    pub split_input_task_fn: Option<SplitInputTaskFn<T>>,
}

struct QueueState<T> {
    open: Vec<T>,
    open_size: usize,
    open_deadline: Option<Instant>,
    closed: VecDeque<Batch<T>>,
}

/// One named batching queue.
///
/// Tasks accumulate in the open batch until it fills or times out, at which
/// point it moves to the closed list where scheduler workers pick it up.
pub(crate) struct BatchQueue<T: SchedulableTask> {
    options: QueueOptions<T>,
    process_fn: ProcessBatchFn<T>,
    state: Mutex<QueueState<T>>,
    notifier: Arc<Notify>,
}

impl<T: SchedulableTask> BatchQueue<T> {
    pub(super) fn new(
        options: QueueOptions<T>,
        process_fn: ProcessBatchFn<T>,
        notifier: Arc<Notify>,
    ) -> Self {
        Self {
            options,
            process_fn,
            state: Mutex::new(QueueState {
                open: Vec::new(),
                open_size: 0,
                open_deadline: None,
                closed: VecDeque::new(),
            }),
            notifier,
        }
    }

    pub(super) fn process_fn(&self) -> ProcessBatchFn<T> {
        self.process_fn.clone()
    }

    fn execution_capacity(&self) -> usize {
        if self.options.enable_large_batch_splitting {
            self.options.max_execution_batch_size
        } else {
            self.options.input_batch_size_limit
        }
    }

    /// Enqueue one task. Fails synchronously when the task is oversized or
    /// the queue has reached its backlog cap.
    pub fn schedule(&self, task: T) -> BatchResult<()> {
        let task_size = task.size();
        if task_size > self.options.input_batch_size_limit {
            return Err(BatchError::InvalidArgument(format!(
                "task size {} is larger than maximum input batch size {}",
                task_size, self.options.input_batch_size_limit
            )));
        }

        let capacity = self.execution_capacity();
        let mut state = self.state.lock().unwrap();

        if state.closed.len() >= self.options.max_enqueued_batches {
            return Err(BatchError::Unavailable(
                "the batch scheduling queue to which this task was submitted is full".to_string(),
            ));
        }

        let remaining = capacity - state.open_size;
        if task_size <= remaining {
            self.push_task(&mut state, task, capacity);
        } else if self.options.enable_large_batch_splitting {
            let split_fn = self.options.split_input_task_fn.as_ref().ok_or_else(|| {
                BatchError::Internal(
                    "large batch splitting enabled without a split function".to_string(),
                )
            })?;
            let sub_tasks = split_fn(task, remaining, self.options.max_execution_batch_size)?;
            for sub_task in sub_tasks {
                self.push_task(&mut state, sub_task, capacity);
            }
        } else {
            // Does not fit next to the already queued tasks; give it a
            // fresh batch of its own.
            Self::close_open_batch(&mut state);
            self.push_task(&mut state, task, capacity);
        }
        drop(state);

        self.notifier.notify_one();
        Ok(())
    }

    fn push_task(&self, state: &mut QueueState<T>, task: T, capacity: usize) {
        if state.open.is_empty() {
            state.open_deadline = Some(Instant::now() + self.options.batch_timeout);
        }
        state.open_size += task.size();
        state.open.push(task);
        if state.open_size >= capacity {
            Self::close_open_batch(state);
        }
    }

    fn close_open_batch(state: &mut QueueState<T>) {
        if state.open.is_empty() {
            return;
        }
        let tasks = std::mem::take(&mut state.open);
        state.open_size = 0;
        state.open_deadline = None;
        state.closed.push_back(Batch::new(tasks));
    }

    /// Take the next batch that is ready for processing, closing the open
    /// batch first if its timeout has elapsed.
    pub(super) fn pop_ready_batch(&self) -> Option<Batch<T>> {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.closed.pop_front() {
            return Some(batch);
        }
        if let Some(deadline) = state.open_deadline {
            if Instant::now() >= deadline {
                Self::close_open_batch(&mut state);
                return state.closed.pop_front();
            }
        }
        None
    }

    /// Number of tasks not yet handed to a worker (open plus closed).
    #[cfg(test)]
    pub(super) fn num_pending_tasks(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.open.len() + state.closed.iter().map(|b| b.num_tasks()).sum::<usize>()
    }
}
