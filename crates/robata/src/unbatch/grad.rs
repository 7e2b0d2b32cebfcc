use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::batch::BatchIndex;
use crate::communication::{reply_channel, Item, ReplySender};
use crate::error::{BatchError, BatchResult};
use crate::tensor::operations::{concat_rows, empty_like, num_elements};

// A still-incomplete reassembly. When `missing` drains, the gradients are
// concatenated in index order and sent through `reply`.
struct PendingBatch<B> {
    missing: HashSet<u64>,
    batch_index: BatchIndex,
    reply: ReplySender<B>,
}

struct GradState<B> {
    // Gradient slices that have arrived, keyed by their batch key.
    available_tensors: HashMap<u64, B>,
    // Incomplete reassemblies, keyed by the batch key of the caller that
    // carried the original data and index.
    available_batches: HashMap<u64, PendingBatch<B>>,
    // Inverse index from a missing slice key to the batch awaiting it.
    // Injective: a slice can be desired by at most one batch.
    desired_tensor_to_batch: HashMap<u64, u64>,
}

/// Deterministic re-batching of gradient slices for a formerly batched
/// call: each caller contributes the gradient for its slice, and the caller
/// holding the original index tensor receives the gradients reassembled in
/// the original batch order, exactly once.
pub struct UnbatchGradResource<B: Backend> {
    state: Mutex<GradState<B>>,
}

impl<B: Backend> UnbatchGradResource<B> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GradState {
                available_tensors: HashMap::new(),
                available_batches: HashMap::new(),
                desired_tensor_to_batch: HashMap::new(),
            }),
        })
    }

    /// One gradient arrival. `data` is the original concatenated input
    /// (only its emptiness matters), `batch_index` its index tensor, `grad`
    /// the gradient for this caller's slice, and `batch_key` this caller's
    /// own key.
    pub fn compute(
        &self,
        data: &B,
        batch_index: &BatchIndex,
        grad: &B,
        batch_key: u64,
    ) -> Item<B> {
        let (reply, item) = reply_channel();
        let mut replies_to_fire: Vec<(ReplySender<B>, BatchResult<B>)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            if state.available_tensors.contains_key(&batch_key) {
                let _ = reply.send(Err(BatchError::InvalidArgument(
                    "two runs with the same batch key".to_string(),
                )));
                return item;
            }
            state.available_tensors.insert(batch_key, grad.clone());

            let mut own_reply = Some(reply);
            if num_elements(data) > 0 {
                if batch_index.is_empty() {
                    let _ = own_reply.take().unwrap().send(Err(BatchError::InvalidArgument(
                        "batch_index is empty while the tensor isn't".to_string(),
                    )));
                    return item;
                }
                let missing: HashSet<u64> = batch_index
                    .iter()
                    .map(|entry| entry.key)
                    .filter(|key| !state.available_tensors.contains_key(key))
                    .collect();
                if missing.is_empty() {
                    let result = output_batch(&mut state, batch_index);
                    replies_to_fire.push((own_reply.take().unwrap(), result));
                } else {
                    if state.available_batches.contains_key(&batch_key) {
                        let _ = own_reply.take().unwrap().send(Err(
                            BatchError::InvalidArgument(
                                "batch key with valid batch used twice".to_string(),
                            ),
                        ));
                        return item;
                    }
                    for &key in &missing {
                        if state.desired_tensor_to_batch.contains_key(&key) {
                            // Roll back this call's desires so the tables
                            // stay consistent before failing it.
                            for &inserted in &missing {
                                if state.desired_tensor_to_batch.get(&inserted)
                                    == Some(&batch_key)
                                {
                                    state.desired_tensor_to_batch.remove(&inserted);
                                }
                            }
                            let _ = own_reply.take().unwrap().send(Err(
                                BatchError::InvalidArgument(
                                    "missing tensor wanted by more than one batch".to_string(),
                                ),
                            ));
                            return item;
                        }
                        state.desired_tensor_to_batch.insert(key, batch_key);
                    }
                    state.available_batches.insert(
                        batch_key,
                        PendingBatch {
                            missing,
                            batch_index: batch_index.clone(),
                            reply: own_reply.take().unwrap(),
                        },
                    );
                }
            } else {
                // No valid input tensor: answer immediately with an empty
                // gradient. This call's own grad may still complete another
                // batch below.
                replies_to_fire.push((own_reply.take().unwrap(), Ok(empty_like(grad))));
            }

            // Is our tensor desired by an existing batch?
            if let Some(owner) = state.desired_tensor_to_batch.remove(&batch_key) {
                if let Some(mut pending) = state.available_batches.remove(&owner) {
                    pending.missing.remove(&batch_key);
                    if pending.missing.is_empty() {
                        let result = output_batch(&mut state, &pending.batch_index);
                        replies_to_fire.push((pending.reply, result));
                    } else {
                        state.available_batches.insert(owner, pending);
                    }
                }
            }
        }

        for (reply, result) in replies_to_fire {
            let _ = reply.send(result);
        }
        item
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.available_tensors.len(),
            state.available_batches.len(),
            state.desired_tensor_to_batch.len(),
        )
    }
}

/// Flush one completed batch: collect the gradient of every index row in
/// order, erase them from the table, and concatenate.
fn output_batch<B: Backend>(
    state: &mut GradState<B>,
    batch_index: &BatchIndex,
) -> BatchResult<B> {
    let mut tensors = Vec::with_capacity(batch_index.len());
    for entry in batch_index {
        let tensor = state
            .available_tensors
            .remove(&entry.key)
            .ok_or_else(|| {
                BatchError::Internal("bad bookkeeping of available tensors".to_string())
            })?;
        tensors.push(tensor);
    }
    concat_rows(&tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_tensor::MockTensor;
    use crate::batch::IndexEntry;

    fn index(rows: &[(u64, usize, usize)]) -> BatchIndex {
        let mut index = BatchIndex::new();
        for &(key, start, end) in rows {
            index.push(IndexEntry { key, start, end });
        }
        index
    }

    fn empty() -> MockTensor {
        MockTensor::vector(&[])
    }

    // Two gradient slices arrive first, then the data carrier: the
    // reassembled output has d0 = 3 with g1's rows first.
    #[tokio::test]
    async fn slices_then_data_reassemble_in_index_order() {
        let resource = UnbatchGradResource::<MockTensor>::new();

        let g1 = resource.compute(
            &empty(),
            &BatchIndex::new(),
            &MockTensor::vector(&[1.0, 2.0]),
            1,
        );
        let g2 = resource.compute(&empty(), &BatchIndex::new(), &MockTensor::vector(&[3.0]), 2);

        // Empty-data callers get an empty output immediately.
        assert_eq!(g1.await.unwrap().shape(), vec![0]);
        assert_eq!(g2.await.unwrap().shape(), vec![0]);

        let data = MockTensor::vector(&[9.0, 9.0, 9.0]);
        let carrier = resource.compute(
            &data,
            &index(&[(1, 0, 2), (2, 2, 3)]),
            &MockTensor::vector(&[4.0]),
            3,
        );
        let out = carrier.await.unwrap();
        assert_eq!(out.values(), &[1.0, 2.0, 3.0]);
        // g3's own grad is still parked; the rest was consumed.
        assert_eq!(resource.table_sizes(), (1, 0, 0));
    }

    // The data carrier arrives before the slices it needs and is completed
    // by the last arriving gradient.
    #[tokio::test]
    async fn data_first_waits_for_missing_slices() {
        let resource = UnbatchGradResource::<MockTensor>::new();

        let data = MockTensor::vector(&[9.0, 9.0, 9.0]);
        let carrier = resource.compute(
            &data,
            &index(&[(1, 0, 2), (2, 2, 3)]),
            &MockTensor::vector(&[0.5]),
            3,
        );
        assert_eq!(resource.table_sizes(), (1, 1, 2));

        let g1 = resource.compute(
            &empty(),
            &BatchIndex::new(),
            &MockTensor::vector(&[1.0, 2.0]),
            1,
        );
        g1.await.unwrap();
        let g2 = resource.compute(&empty(), &BatchIndex::new(), &MockTensor::vector(&[3.0]), 2);
        g2.await.unwrap();

        let out = carrier.await.unwrap();
        assert_eq!(out.values(), &[1.0, 2.0, 3.0]);
    }

    // A carrier whose own slice participates in the batch completes
    // immediately when everything else already arrived.
    #[tokio::test]
    async fn carrier_contributes_its_own_slice() {
        let resource = UnbatchGradResource::<MockTensor>::new();

        let g1 = resource.compute(
            &empty(),
            &BatchIndex::new(),
            &MockTensor::vector(&[1.0]),
            1,
        );
        g1.await.unwrap();

        let data = MockTensor::vector(&[9.0, 9.0]);
        let carrier = resource.compute(
            &data,
            &index(&[(1, 0, 1), (2, 1, 2)]),
            &MockTensor::vector(&[2.0]),
            2,
        );
        let out = carrier.await.unwrap();
        assert_eq!(out.values(), &[1.0, 2.0]);
        assert_eq!(resource.table_sizes(), (0, 0, 0));
    }

    #[tokio::test]
    async fn duplicate_batch_key_is_invalid() {
        let resource = UnbatchGradResource::<MockTensor>::new();
        let first = resource.compute(
            &empty(),
            &BatchIndex::new(),
            &MockTensor::vector(&[1.0]),
            5,
        );
        first.await.unwrap();
        let second = resource.compute(
            &empty(),
            &BatchIndex::new(),
            &MockTensor::vector(&[2.0]),
            5,
        );
        assert!(matches!(second.await, Err(BatchError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn nonempty_data_with_empty_index_is_invalid() {
        let resource = UnbatchGradResource::<MockTensor>::new();
        let item = resource.compute(
            &MockTensor::vector(&[1.0]),
            &BatchIndex::new(),
            &MockTensor::vector(&[1.0]),
            1,
        );
        assert!(matches!(item.await, Err(BatchError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn slice_desired_by_two_batches_is_invalid() {
        let resource = UnbatchGradResource::<MockTensor>::new();
        let data = MockTensor::vector(&[9.0]);

        let first = resource.compute(
            &data,
            &index(&[(100, 0, 1)]),
            &MockTensor::vector(&[1.0]),
            10,
        );
        let second = resource.compute(
            &data,
            &index(&[(100, 0, 1)]),
            &MockTensor::vector(&[2.0]),
            11,
        );
        assert!(matches!(second.await, Err(BatchError::InvalidArgument(_))));
        // The first batch remains parked, still waiting for key 100.
        assert_eq!(resource.table_sizes().1, 1);
        drop(first);
    }
}
