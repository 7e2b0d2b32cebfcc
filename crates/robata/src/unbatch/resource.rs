use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::trace;

use crate::backend::Backend;
use crate::batch::BatchIndex;
use crate::communication::{reply_channel, Item, ReplySender};
use crate::error::{BatchError, BatchResult};
use crate::scheduler::WorkerHandle;
use crate::tensor::operations::{leading_dim, split_rows};

const ENFORCE_INTERVAL: Duration = Duration::from_millis(1);

struct WaitingTensor<B> {
    deadline: Instant,
    tensor: B,
}

struct WaitingCallback<B> {
    deadline: Instant,
    reply: ReplySender<B>,
}

struct UnbatchState<B> {
    // Keyed by batch key: tensors waiting for their kernels, and kernels
    // waiting for their tensors. A live key is in at most one of the two.
    waiting_tensors: HashMap<u64, WaitingTensor<B>>,
    waiting_callbacks: HashMap<u64, WaitingCallback<B>>,
}

/// Key-indexed rendezvous between arriving kernels and arriving tensor
/// slices.
///
/// Whenever a kernel runs, it either grabs its tensor if the batched data
/// already arrived, or parks itself on the waitlist and then scatters any
/// slices it carried to whoever is waiting for them. A periodic enforcer
/// evicts both sides once their deadline passes: unclaimed tensors are
/// dropped silently, waiting kernels fail with `DeadlineExceeded`.
pub struct UnbatchResource<B: Backend> {
    timeout: Duration,
    state: Arc<Mutex<UnbatchState<B>>>,
    _enforcer: WorkerHandle,
}

impl<B: Backend> UnbatchResource<B> {
    pub fn new(timeout_micros: u64) -> Arc<Self> {
        let state = Arc::new(Mutex::new(UnbatchState {
            waiting_tensors: HashMap::new(),
            waiting_callbacks: HashMap::new(),
        }));

        let enforcer = WorkerHandle::new(Arc::new(Notify::new()), {
            let state = state.clone();
            move |running, notifier| {
                tokio::spawn(async move {
                    while running.load(std::sync::atomic::Ordering::SeqCst) {
                        let _ = tokio::time::timeout(ENFORCE_INTERVAL, notifier.notified()).await;
                        Self::enforce_timeout(&state);
                    }
                })
            }
        });

        Arc::new(Self {
            timeout: Duration::from_micros(timeout_micros),
            state,
            _enforcer: enforcer,
        })
    }

    /// One kernel arrival: `data` and `batch_index` are the batched tensor
    /// and its index (both may be empty), `batch_key` identifies the slice
    /// this caller is entitled to. The returned item resolves once the
    /// rendezvous completes, fails over the timeout, or hits a duplicate
    /// key.
    pub fn compute(&self, data: &B, batch_index: &BatchIndex, batch_key: u64) -> Item<B> {
        let (reply, item) = reply_channel();

        if let Err(err) = batch_index.check_against_data_rows(leading_dim(data)) {
            let _ = reply.send(Err(err));
            return item;
        }

        // Slice up a non-empty tensor before taking the lock.
        let split_inputs = if batch_index.is_empty() {
            Vec::new()
        } else {
            match split_rows(data, &batch_index.sizes()) {
                Ok(split_inputs) => split_inputs,
                Err(err) => {
                    let _ = reply.send(Err(err));
                    return item;
                }
            }
        };

        let mut replies_to_fire: Vec<(ReplySender<B>, BatchResult<B>)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            // Check whether the tensor we want is already waiting.
            if let Some(waiting) = state.waiting_tensors.remove(&batch_key) {
                replies_to_fire.push((reply, Ok(waiting.tensor)));
            } else if state.waiting_callbacks.contains_key(&batch_key) {
                replies_to_fire.push((
                    reply,
                    Err(BatchError::AlreadyExists(
                        "multiple session runs with the same batch key".to_string(),
                    )),
                ));
            } else {
                let deadline = Instant::now() + self.timeout;
                state
                    .waiting_callbacks
                    .insert(batch_key, WaitingCallback { deadline, reply });

                // Finish the waitlisted runs this tensor can satisfy and
                // park the remaining pieces. The inserting caller itself may
                // be among the index rows.
                'scatter: for (entry, slice) in batch_index.iter().zip(split_inputs) {
                    if let Some(waiting) = state.waiting_callbacks.remove(&entry.key) {
                        replies_to_fire.push((waiting.reply, Ok(slice)));
                    } else if state.waiting_tensors.contains_key(&entry.key) {
                        // Charge the duplicate to the caller that brought
                        // the data, reclaiming its parked entry so it is
                        // answered exactly once.
                        if let Some(own) = state.waiting_callbacks.remove(&batch_key) {
                            replies_to_fire.push((
                                own.reply,
                                Err(BatchError::AlreadyExists(
                                    "multiple tensors returned for same batch key".to_string(),
                                )),
                            ));
                        }
                        break 'scatter;
                    } else {
                        // Deadline also applies here: this slice may be
                        // arriving after its kernel already timed out.
                        state.waiting_tensors.insert(
                            entry.key,
                            WaitingTensor {
                                deadline,
                                tensor: slice,
                            },
                        );
                    }
                }
            }
        }

        for (reply, result) in replies_to_fire {
            let _ = reply.send(result);
        }
        item
    }

    fn enforce_timeout(state: &Mutex<UnbatchState<B>>) {
        let now = Instant::now();
        let mut evicted_callbacks = Vec::new();
        {
            let mut state = state.lock().unwrap();
            state.waiting_tensors.retain(|_, waiting| waiting.deadline >= now);
            let expired: Vec<u64> = state
                .waiting_callbacks
                .iter()
                .filter(|(_, waiting)| waiting.deadline < now)
                .map(|(&key, _)| key)
                .collect();
            for key in expired {
                if let Some(waiting) = state.waiting_callbacks.remove(&key) {
                    evicted_callbacks.push((key, waiting));
                }
            }
        }

        for (key, waiting) in evicted_callbacks {
            trace!(batch_key = key, "evicting unbatch caller past its deadline");
            let _ = waiting.reply.send(Err(BatchError::DeadlineExceeded(
                "batched data did not arrive within timeout window".to_string(),
            )));
        }
    }

    #[cfg(test)]
    fn waiting_counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.waiting_tensors.len(), state.waiting_callbacks.len())
    }
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

    // The caller arrives before the batched tensor; its entry sits in the
    // callback waitlist until the data carrier scatters to it.
    #[tokio::test]
    async fn callback_first_then_data() {
        let resource = UnbatchResource::<MockTensor>::new(1_000_000);

        let waiting = resource.compute(&empty(), &BatchIndex::new(), 202);
        assert_eq!(resource.waiting_counts(), (0, 1));

        let data = MockTensor::vector(&[1.0, 2.0, 3.0]);
        let carrier = resource.compute(&data, &index(&[(201, 0, 2), (202, 2, 3)]), 201);

        let carrier_out = carrier.await.unwrap();
        assert_eq!(carrier_out.values(), &[1.0, 2.0]);
        let waiting_out = waiting.await.unwrap();
        assert_eq!(waiting_out.values(), &[3.0]);
        assert_eq!(resource.waiting_counts(), (0, 0));
    }

    // The tensor arrives first and is claimed later.
    #[tokio::test]
    async fn data_first_then_callback() {
        let resource = UnbatchResource::<MockTensor>::new(1_000_000);

        let data = MockTensor::vector(&[5.0, 6.0]);
        let carrier = resource.compute(&data, &index(&[(1, 0, 1), (2, 1, 2)]), 1);
        assert_eq!(carrier.await.unwrap().values(), &[5.0]);
        assert_eq!(resource.waiting_counts(), (1, 0));

        let late = resource.compute(&empty(), &BatchIndex::new(), 2);
        assert_eq!(late.await.unwrap().values(), &[6.0]);
        assert_eq!(resource.waiting_counts(), (0, 0));
    }

    #[tokio::test]
    async fn duplicate_callback_reports_already_exists() {
        let resource = UnbatchResource::<MockTensor>::new(1_000_000);
        let _first = resource.compute(&empty(), &BatchIndex::new(), 9);
        let second = resource.compute(&empty(), &BatchIndex::new(), 9);
        assert!(matches!(second.await, Err(BatchError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn waiting_caller_times_out() {
        let resource = UnbatchResource::<MockTensor>::new(5_000);
        let item = resource.compute(&empty(), &BatchIndex::new(), 77);
        assert!(matches!(item.await, Err(BatchError::DeadlineExceeded(_))));
        assert_eq!(resource.waiting_counts(), (0, 0));
    }

    #[tokio::test]
    async fn unclaimed_tensors_are_dropped_silently() {
        let resource = UnbatchResource::<MockTensor>::new(5_000);
        let data = MockTensor::vector(&[1.0, 2.0]);
        let carrier = resource.compute(&data, &index(&[(1, 0, 1), (2, 1, 2)]), 1);
        carrier.await.unwrap();
        assert_eq!(resource.waiting_counts(), (1, 0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(resource.waiting_counts(), (0, 0));
    }

    #[tokio::test]
    async fn index_larger_than_data_is_rejected() {
        let resource = UnbatchResource::<MockTensor>::new(1_000_000);
        let data = MockTensor::vector(&[1.0]);
        let item = resource.compute(&data, &index(&[(1, 0, 1), (2, 1, 2)]), 1);
        assert!(matches!(item.await, Err(BatchError::InvalidArgument(_))));
    }
}
