use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::backend::Backend;
use crate::communication::ReplySender;
use crate::error::{BatchError, BatchResult};
use crate::scheduler::SchedulableTask;
use crate::sync::ThreadSafeStatus;
use crate::tensor::operations::leading_dim;

use super::index::BatchIndex;

/// What a caller gets back for one batch-op invocation.
#[derive(Debug, Clone)]
pub struct BatchReply<B> {
    /// The call's output tensors: the compute function's outputs for this
    /// call's slice, or (in the function-less form) the per-edge
    /// concatenated tensors on the last call of the batch and empty tensors
    /// on the others.
    pub outputs: Vec<B>,
    /// Index of the concatenated batch; empty except on the last call of a
    /// function-less batch.
    pub batch_index: BatchIndex,
    /// This call's batch key.
    pub batch_key: u64,
}

/// Invoked exactly once when a task's outputs (or error) are published.
pub(crate) type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// Given a call split into N sub-tasks with M outputs each, a TensorMatrix
/// is N x M: row i holds the i-th split's portion of every output edge.
/// Concatenating a column across rows yields one whole output tensor.
pub(crate) type TensorMatrix<B> = Vec<Vec<Option<B>>>;

struct ReplySlots<B> {
    outputs: Vec<Option<B>>,
    batch_index: BatchIndex,
    status: BatchResult<()>,
    reply: Option<ReplySender<BatchReply<B>>>,
}

/// Per-call handle standing in for the op-invocation shell: collects output
/// tensors and the terminal status, and converts them into the caller's
/// reply when the call's done-callback fires.
pub(crate) struct CallContext<B: Backend> {
    guid: u64,
    num_outputs: usize,
    slots: Mutex<ReplySlots<B>>,
}

impl<B: Backend> CallContext<B> {
    pub fn new(guid: u64, num_outputs: usize, reply: ReplySender<BatchReply<B>>) -> Arc<Self> {
        Arc::new(Self {
            guid,
            num_outputs,
            slots: Mutex::new(ReplySlots {
                outputs: vec![None; num_outputs],
                batch_index: BatchIndex::new(),
                status: Ok(()),
                reply: Some(reply),
            }),
        })
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn set_output(&self, index: usize, tensor: B) {
        self.slots.lock().unwrap().outputs[index] = Some(tensor);
    }

    pub fn set_batch_index(&self, batch_index: BatchIndex) {
        self.slots.lock().unwrap().batch_index = batch_index;
    }

    pub fn set_status(&self, status: BatchError) {
        self.slots.lock().unwrap().status = Err(status);
    }

    /// Publish the reply. Idempotent: only the first call sends anything,
    /// so done-callback fan-out can never answer a caller twice.
    pub fn finish(&self) {
        let mut slots = self.slots.lock().unwrap();
        let Some(reply) = slots.reply.take() else {
            return;
        };
        let result = match std::mem::replace(&mut slots.status, Ok(())) {
            Err(err) => Err(err),
            Ok(()) => {
                let outputs: Option<Vec<B>> = slots.outputs.drain(..).collect();
                match outputs {
                    Some(outputs) => Ok(BatchReply {
                        outputs,
                        batch_index: std::mem::take(&mut slots.batch_index),
                        batch_key: self.guid,
                    }),
                    None => Err(BatchError::Internal(
                        "call finished without all outputs set".to_string(),
                    )),
                }
            }
        };
        drop(slots);
        let _ = reply.send(result);
    }
}

/// One task to be batched: a whole original call, or one split of it.
///
/// All splits of a call share `guid`, `context`, `captured_inputs`,
/// `output` and `status`; their sizes sum to the original call's dimension
/// 0 extent.
pub(crate) struct BatchTask<B: Backend> {
    pub guid: u64,
    pub inputs: Vec<B>,
    pub captured_inputs: Vec<B>,
    pub context: Arc<CallContext<B>>,
    pub done_callback: DoneCallback,
    /// Position of this split along dimension 0 of the originating call;
    /// 0 when the call was not split.
    pub split_index: usize,
    pub is_partial: bool,
    pub output: Arc<Mutex<TensorMatrix<B>>>,
    pub status: Arc<ThreadSafeStatus>,
    pub start_time: Instant,
    /// Caller-scoped span re-entered on the batching thread.
    pub span: tracing::Span,
}

impl<B: Backend> SchedulableTask for BatchTask<B> {
    fn size(&self) -> usize {
        leading_dim(&self.inputs[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_tensor::MockTensor;
    use crate::communication::reply_channel;

    #[tokio::test]
    async fn finish_delivers_outputs_and_key() {
        let (tx, item) = reply_channel();
        let context = CallContext::<MockTensor>::new(42, 1, tx);
        context.set_output(0, MockTensor::vector(&[1.0, 2.0]));
        context.finish();
        let reply = item.await.unwrap();
        assert_eq!(reply.batch_key, 42);
        assert_eq!(reply.outputs[0].values(), &[1.0, 2.0]);
        assert!(reply.batch_index.is_empty());
    }

    #[tokio::test]
    async fn finish_prefers_recorded_error() {
        let (tx, item) = reply_channel();
        let context = CallContext::<MockTensor>::new(1, 1, tx);
        context.set_output(0, MockTensor::vector(&[1.0]));
        context.set_status(BatchError::Internal("compute failed".to_string()));
        context.finish();
        assert!(matches!(item.await, Err(BatchError::Internal(_))));
    }

    #[tokio::test]
    async fn finish_with_missing_outputs_is_internal_error() {
        let (tx, item) = reply_channel();
        let context = CallContext::<MockTensor>::new(1, 2, tx);
        context.set_output(0, MockTensor::vector(&[1.0]));
        context.finish();
        assert!(matches!(item.await, Err(BatchError::Internal(_))));
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let (tx, item) = reply_channel();
        let context = CallContext::<MockTensor>::new(1, 0, tx);
        context.finish();
        context.finish();
        let reply = item.await.unwrap();
        assert!(reply.outputs.is_empty());
    }
}
