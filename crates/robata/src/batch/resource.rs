use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{warn, Instrument};

use crate::backend::Backend;
use crate::communication::{reply_channel, Item};
use crate::error::{BatchError, BatchResult};
use crate::metrics;
use crate::scheduler::{
    Batch, BatchQueue, QueueOptions, SchedulerOptions, SharedBatchScheduler, SplitInputTaskFn,
};
use crate::sync::{IncrementalBarrier, ThreadSafeStatus};
use crate::tensor::operations::{concat_rows, empty_like, leading_dim, split_rows};

use super::index::BatchIndex;
use super::task::{BatchTask, CallContext, TensorMatrix};
use super::BatchReply;

/// The compute function executed once per formed batch.
///
/// `run` receives the concatenated input tensors followed by the captured
/// side inputs and produces `num_outputs` tensors whose dimension 0 equals
/// the (padded) batch size. It may suspend; the worker that dispatched the
/// batch stays pinned to it until the function completes.
#[async_trait]
pub trait BatchFunction<B: Backend>: Send + Sync + 'static {
    fn num_outputs(&self) -> usize;

    async fn run(&self, inputs: Vec<B>) -> BatchResult<Vec<B>>;
}

/// Construction parameters for a [`BatchResource`].
#[derive(Debug, Clone)]
pub struct BatchResourceOptions {
    pub num_batch_threads: usize,
    pub max_batch_size: usize,
    pub batch_timeout_micros: u64,
    pub max_enqueued_batches: usize,
    /// Strictly increasing whitelist of execution sizes used to quantize
    /// padded batch sizes. Empty disables quantization.
    pub allowed_batch_sizes: Vec<usize>,
    pub enable_large_batch_splitting: bool,
}

impl Default for BatchResourceOptions {
    fn default() -> Self {
        Self {
            num_batch_threads: 1,
            max_batch_size: 1,
            batch_timeout_micros: 0,
            max_enqueued_batches: 10,
            allowed_batch_sizes: Vec::new(),
            enable_large_batch_splitting: false,
        }
    }
}

/// The state and logic for batching tensors.
///
/// Ingests data from individual op invocations via [`register_input`],
/// routes it onto named scheduler queues, and processes formed batches with
/// either the configured compute function or the function-less concatenate
/// and emit-index form.
///
/// [`register_input`]: BatchResource::register_input
pub struct BatchResource<B: Backend> {
    scheduler: SharedBatchScheduler<BatchTask<B>>,
    options: BatchResourceOptions,
    max_execution_batch_size: usize,
    function: Option<Arc<dyn BatchFunction<B>>>,
    model_name: String,
    // Keyed on queue name. Queues are created on first use and never
    // removed. TODO: reclaim queues that have sat empty for a while; they
    // are cheap but not free.
    queues: Mutex<HashMap<String, Arc<BatchQueue<BatchTask<B>>>>>,
}

impl<B: Backend> BatchResource<B> {
    pub fn new(
        options: BatchResourceOptions,
        function: Option<Arc<dyn BatchFunction<B>>>,
        model_name: String,
    ) -> BatchResult<Arc<Self>> {
        Self::validate_allowed_batch_sizes(&options)?;
        if options.num_batch_threads == 0 {
            return Err(BatchError::InvalidArgument(
                "num_batch_threads must be positive".to_string(),
            ));
        }
        if options.max_batch_size == 0 {
            return Err(BatchError::InvalidArgument(
                "max_batch_size must be positive".to_string(),
            ));
        }

        let max_execution_batch_size = if options.enable_large_batch_splitting {
            options
                .allowed_batch_sizes
                .last()
                .copied()
                .unwrap_or(options.max_batch_size)
        } else {
            options.max_batch_size
        };

        let scheduler = SharedBatchScheduler::new(SchedulerOptions {
            num_batch_threads: options.num_batch_threads,
        });

        Ok(Arc::new(Self {
            scheduler,
            options,
            max_execution_batch_size,
            function,
            model_name,
            queues: Mutex::new(HashMap::new()),
        }))
    }

    /// The entries must increase strictly; when splitting is disabled the
    /// last one must equal `max_batch_size`. An empty list is permitted.
    fn validate_allowed_batch_sizes(options: &BatchResourceOptions) -> BatchResult<()> {
        let sizes = &options.allowed_batch_sizes;
        if sizes.is_empty() {
            return Ok(());
        }
        let mut last_size = 0;
        for (i, &size) in sizes.iter().enumerate() {
            if i > 0 && size <= last_size {
                return Err(BatchError::InvalidArgument(
                    "allowed_batch_sizes entries must be monotonically increasing".to_string(),
                ));
            }
            if !options.enable_large_batch_splitting
                && i == sizes.len() - 1
                && size != options.max_batch_size
            {
                return Err(BatchError::InvalidArgument(
                    "final entry in allowed_batch_sizes must equal max_batch_size when \
                     enable_large_batch_splitting is false"
                        .to_string(),
                ));
            }
            last_size = size;
        }
        Ok(())
    }

    /// Ingests data from one op invocation. The tensors are enqueued to be
    /// combined with others into a batch, asynchronously; the returned item
    /// resolves when this call's outputs (or error) are published.
    pub fn register_input(
        self: &Arc<Self>,
        guid: u64,
        inputs: Vec<B>,
        captured_inputs: Vec<B>,
        queue_name: &str,
    ) -> BatchResult<Item<BatchReply<B>>> {
        if inputs.is_empty() {
            return Err(BatchError::InvalidArgument(
                "batching requires at least one input tensor".to_string(),
            ));
        }
        for tensor in &inputs {
            if tensor.shape().is_empty() {
                return Err(BatchError::InvalidArgument(
                    "batching input tensors must have at least one dimension".to_string(),
                ));
            }
        }
        let size = leading_dim(&inputs[0]);
        if inputs.iter().any(|t| leading_dim(t) != size) {
            return Err(BatchError::InvalidArgument(
                "batching input tensors supplied in a given op invocation must have equal \
                 0th-dimension size"
                    .to_string(),
            ));
        }
        metrics::record_input_batch_size(size, &self.model_name);

        let num_outputs = match &self.function {
            Some(function) => function.num_outputs(),
            None => inputs.len(),
        };
        let (reply, item) = reply_channel();
        let context = CallContext::new(guid, num_outputs, reply);
        let task = BatchTask {
            guid,
            inputs,
            captured_inputs,
            done_callback: {
                let context = context.clone();
                Box::new(move || context.finish())
            },
            context,
            split_index: 0,
            is_partial: false,
            output: Arc::new(Mutex::new(TensorMatrix::new())),
            status: Arc::new(ThreadSafeStatus::new()),
            start_time: Instant::now(),
            span: tracing::Span::current(),
        };

        let queue = self.lookup_or_create_queue(queue_name);
        queue.schedule(task)?;
        Ok(item)
    }

    fn lookup_or_create_queue(self: &Arc<Self>, queue_name: &str) -> Arc<BatchQueue<BatchTask<B>>> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get(queue_name) {
            return queue.clone();
        }

        let split_input_task_fn: Option<SplitInputTaskFn<BatchTask<B>>> =
            if self.options.enable_large_batch_splitting {
                let split_fn: SplitInputTaskFn<BatchTask<B>> = Arc::new(Self::split_input_task);
                Some(split_fn)
            } else {
                None
            };
        let queue_options = QueueOptions {
            input_batch_size_limit: self.options.max_batch_size,
            max_enqueued_batches: self.options.max_enqueued_batches,
            batch_timeout: Duration::from_micros(self.options.batch_timeout_micros),
            enable_large_batch_splitting: self.options.enable_large_batch_splitting,
            max_execution_batch_size: self.max_execution_batch_size,
            split_input_task_fn,
        };
        let process_fn = {
            let weak: Weak<Self> = Arc::downgrade(self);
            Arc::new(move |batch: Batch<BatchTask<B>>| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(this) => this.process_batch_callback(batch).await,
                        None => fan_out_status(
                            batch.into_tasks(),
                            BatchError::Cancelled("batch resource dropped".to_string()),
                        ),
                    }
                }) as futures::future::BoxFuture<'static, ()>
            })
        };

        let queue = self.scheduler.add_queue(queue_options, process_fn);
        queues.insert(queue_name.to_string(), queue.clone());
        queue
    }

    async fn process_batch_callback(self: Arc<Self>, batch: Batch<BatchTask<B>>) {
        if batch.is_empty() {
            return;
        }
        // Re-enter the caller-scoped span of the last task, carrying its
        // context onto the batching worker.
        let span = batch.tasks().last().unwrap().span.clone();
        match self.function.clone() {
            Some(function) => {
                self.process_func_batch(function, batch)
                    .instrument(span)
                    .await
            }
            None => span.in_scope(|| self.process_batch(batch)),
        }
    }

    /// The smallest allowed size that is no smaller than `batch_size`; the
    /// raw size when the whitelist is empty or exceeded.
    fn round_to_lowest_allowed_batch_size(&self, batch_size: usize) -> usize {
        if self.options.allowed_batch_sizes.is_empty() {
            return batch_size;
        }
        for &allowed_size in &self.options.allowed_batch_sizes {
            if allowed_size >= batch_size {
                return allowed_size;
            }
        }
        warn!(
            batch_size,
            "batch size greater than largest allowed size; ignoring allowed sizes constraint"
        );
        metrics::increment_oversize_unrounded_batches();
        batch_size
    }

    /// Concatenate the batch's tensors along each input edge, appending
    /// replicas of the first task's first row until the batch reaches
    /// `padded_batch_size`.
    fn concat_input_tensors(
        &self,
        batch: &Batch<BatchTask<B>>,
        padded_batch_size: usize,
    ) -> BatchResult<Vec<B>> {
        let padding_amount = padded_batch_size - batch.size();
        metrics::record_padding_size(padding_amount, &self.model_name, padded_batch_size);
        metrics::record_processed_batch_size(padded_batch_size, &self.model_name);

        let tasks = batch.tasks();
        let num_inputs = tasks[0].inputs.len();
        let mut concatenated = Vec::with_capacity(num_inputs);
        for i in 0..num_inputs {
            let mut to_concatenate: Vec<B> =
                tasks.iter().map(|task| task.inputs[i].clone()).collect();
            if padding_amount > 0 {
                let padding_source = &tasks[0].inputs[i];
                if leading_dim(padding_source) == 0 {
                    return Err(BatchError::InvalidArgument(format!(
                        "cannot use an empty tensor with zero rows as padding when batching \
                         (input {} got shape {:?})",
                        i,
                        padding_source.shape()
                    )));
                }
                let padding = padding_source.slice(0, 0, 1);
                for _ in 0..padding_amount {
                    to_concatenate.push(padding.clone());
                }
            }
            concatenated.push(concat_rows(&to_concatenate)?);
        }
        Ok(concatenated)
    }

    /// Split one oversize task along dimension 0 into sub-tasks sized
    /// `[open_batch_remaining_slot, max_execution_batch_size, ...,
    /// remainder]`, wiring their completions through a fan-in barrier whose
    /// terminal callback reassembles the shared output matrix and answers
    /// the original caller.
    fn split_input_task(
        task: BatchTask<B>,
        open_batch_remaining_slot: usize,
        max_execution_batch_size: usize,
    ) -> BatchResult<Vec<BatchTask<B>>> {
        let input_task_size = crate::scheduler::SchedulableTask::size(&task);
        debug_assert!(input_task_size > open_batch_remaining_slot);

        let BatchTask {
            guid,
            inputs,
            captured_inputs,
            context,
            done_callback,
            status,
            output,
            start_time,
            span,
            ..
        } = task;

        let mut output_task_sizes = Vec::new();
        if open_batch_remaining_slot > 0 {
            output_task_sizes.push(open_batch_remaining_slot);
        }
        let mut left_task_size = input_task_size - open_batch_remaining_slot;
        while left_task_size > 0 {
            let next_task_size = left_task_size.min(max_execution_batch_size);
            output_task_sizes.push(next_task_size);
            left_task_size -= next_task_size;
        }

        let output_task_num = output_task_sizes.len();
        let num_outputs = context.num_outputs();
        *output.lock().unwrap() = vec![vec![None; num_outputs]; output_task_num];

        // Runs only after every split completes: concatenate the per-split
        // rows of each output edge in split-index order, publish them on
        // the caller's context together with the shared status, and fire
        // the original done callback.
        let terminal = {
            let output = output.clone();
            let context = context.clone();
            let status = status.clone();
            move || {
                let matrix = output.lock().unwrap();
                for i in 0..num_outputs {
                    let column: Option<Vec<B>> =
                        matrix.iter().map(|row| row[i].clone()).collect();
                    match column {
                        None => status.update(Err(BatchError::Internal(
                            "split completed without filling its output row".to_string(),
                        ))),
                        Some(column) => match concat_rows(&column) {
                            Ok(tensor) => context.set_output(i, tensor),
                            Err(err) => status.update(Err(BatchError::Internal(format!(
                                "merging split outputs failed: {err}"
                            )))),
                        },
                    }
                }
                drop(matrix);
                if let Err(err) = status.read() {
                    context.set_status(err);
                }
                done_callback();
            }
        };
        let barrier = IncrementalBarrier::new(terminal);

        // Split every input edge by the size vector; row j of the splits
        // becomes sub-task j's inputs.
        let mut task_inputs: Vec<Vec<B>> = vec![Vec::with_capacity(inputs.len()); output_task_num];
        for input_tensor in &inputs {
            let split_tensors =
                split_rows(input_tensor, &output_task_sizes).map_err(|err| {
                    BatchError::Internal(format!(
                        "when splitting input, tensor split operation failed: {err}"
                    ))
                })?;
            for (j, split_tensor) in split_tensors.into_iter().enumerate() {
                task_inputs[j].push(split_tensor);
            }
        }

        let output_tasks = task_inputs
            .into_iter()
            .enumerate()
            .map(|(i, inputs)| {
                let token = barrier.inc();
                BatchTask {
                    guid,
                    inputs,
                    captured_inputs: captured_inputs.clone(),
                    context: context.clone(),
                    done_callback: Box::new(move || drop(token)),
                    split_index: i,
                    is_partial: true,
                    output: output.clone(),
                    status: status.clone(),
                    start_time,
                    span: span.clone(),
                }
            })
            .collect();
        Ok(output_tasks)
    }

    /// Function-backed batch processing: concatenate, pad, run the compute
    /// function, split its outputs back per task, and fire every done
    /// callback with a definite status.
    async fn process_func_batch(&self, function: Arc<dyn BatchFunction<B>>, batch: Batch<BatchTask<B>>) {
        let batch_size = batch.size();
        let padded_batch_size = self.round_to_lowest_allowed_batch_size(batch_size);

        let num_inputs = batch.tasks()[0].inputs.len();
        if batch.tasks().iter().any(|t| t.inputs.len() != num_inputs) {
            fan_out_status(
                batch.into_tasks(),
                BatchError::InvalidArgument(
                    "batching inputs must have equal number of edges".to_string(),
                ),
            );
            return;
        }

        let concatenated = match self.concat_input_tensors(&batch, padded_batch_size) {
            Ok(concatenated) => concatenated,
            Err(err) => {
                fan_out_status(batch.into_tasks(), err);
                return;
            }
        };

        let now = Instant::now();
        for task in batch.tasks() {
            let delay_ms = now.saturating_duration_since(task.start_time).as_secs_f64() * 1e3;
            metrics::record_batch_delay_ms(delay_ms, &self.model_name);
        }

        let mut args = concatenated;
        args.extend(batch.tasks().last().unwrap().captured_inputs.iter().cloned());

        let mut tasks = batch.into_tasks();
        match function.run(args).await {
            Err(err) => fan_out_status(tasks, err),
            Ok(combined_outputs) => {
                match self.split_output_tensors(
                    combined_outputs,
                    batch_size,
                    padded_batch_size,
                    &mut tasks,
                ) {
                    Err(err) => fan_out_status(tasks, err),
                    Ok(()) => {
                        for task in tasks {
                            (task.done_callback)();
                        }
                    }
                }
            }
        }
    }

    /// Scatter the combined outputs back per task, dropping the padding
    /// tail. Partial tasks land in their row of the shared output matrix;
    /// whole calls go straight onto their context.
    fn split_output_tensors(
        &self,
        combined_outputs: Vec<B>,
        batch_size: usize,
        padded_batch_size: usize,
        tasks: &mut [BatchTask<B>],
    ) -> BatchResult<()> {
        let num_outputs = tasks[0].context.num_outputs();
        if combined_outputs.len() != num_outputs {
            return Err(BatchError::Internal(
                "wrong number of batched output tensors".to_string(),
            ));
        }

        let mut task_sizes_plus_optional_padding: Vec<usize> = tasks
            .iter()
            .map(crate::scheduler::SchedulableTask::size)
            .collect();
        let padding_size = padded_batch_size - batch_size;
        if padding_size > 0 {
            task_sizes_plus_optional_padding.push(padding_size);
        }

        for (i, output_tensor) in combined_outputs.into_iter().enumerate() {
            if output_tensor.shape().is_empty() {
                return Err(BatchError::FailedPrecondition(
                    "batched output tensor has 0 dimensions".to_string(),
                ));
            }
            if leading_dim(&output_tensor) != batch_size + padding_size {
                return Err(BatchError::FailedPrecondition(
                    "batched output tensor's 0th dimension does not equal the sum of the \
                     0th dimension sizes of the input tensors"
                        .to_string(),
                ));
            }

            let split_tensor = split_rows(&output_tensor, &task_sizes_plus_optional_padding)
                .map_err(|err| {
                    BatchError::Internal(format!("tensor split operation failed: {err}"))
                })?;

            // A possible final entry holds the padding; it stays behind.
            for (task, tensor) in tasks.iter().zip(split_tensor) {
                if task.is_partial {
                    task.output.lock().unwrap()[task.split_index][i] = Some(tensor);
                } else {
                    task.context.set_output(i, tensor);
                }
            }
        }
        Ok(())
    }

    /// Function-less processing: emit the concatenated tensors and the
    /// index tensor on the last task of the batch, empty tensors on every
    /// other task so per-caller output arity is preserved, and each task's
    /// own batch key.
    fn process_batch(&self, batch: Batch<BatchTask<B>>) {
        let index = BatchIndex::from_task_sizes(
            batch
                .tasks()
                .iter()
                .map(|t| (t.guid, crate::scheduler::SchedulableTask::size(t))),
        );

        let num_inputs = batch.tasks()[0].inputs.len();
        if batch.tasks().iter().any(|t| t.inputs.len() != num_inputs) {
            fan_out_status(
                batch.into_tasks(),
                BatchError::InvalidArgument(
                    "batching inputs must have equal number of edges".to_string(),
                ),
            );
            return;
        }

        let padded_batch_size = self.round_to_lowest_allowed_batch_size(batch.size());
        let concatenated = match self.concat_input_tensors(&batch, padded_batch_size) {
            Ok(concatenated) => concatenated,
            Err(err) => {
                fan_out_status(batch.into_tasks(), err);
                return;
            }
        };

        let tasks = batch.into_tasks();
        let last = tasks.len() - 1;
        for (task_idx, task) in tasks.into_iter().enumerate() {
            if task_idx == last {
                for (i, tensor) in concatenated.iter().enumerate() {
                    task.context.set_output(i, tensor.clone());
                }
                task.context.set_batch_index(index.clone());
            } else {
                for i in 0..num_inputs {
                    task.context.set_output(i, empty_like(&task.inputs[i]));
                }
            }
            (task.done_callback)();
        }
    }
}

/// Propagate one status to every task of a batch and signal completion:
/// splits record into their shared first-error status, whole calls set the
/// status on their context directly. Every done callback fires exactly once.
fn fan_out_status<B: Backend>(tasks: Vec<BatchTask<B>>, err: BatchError) {
    for task in tasks {
        if task.is_partial {
            task.status.update(Err(err.clone()));
        } else {
            task.context.set_status(err.clone());
        }
        (task.done_callback)();
    }
}
