use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type DoneFn = Box<dyn FnOnce() + Send + 'static>;

struct BarrierInner {
    count: AtomicUsize,
    on_done: Mutex<Option<DoneFn>>,
}

fn decrement(inner: &Arc<BarrierInner>) {
    if inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
        let callback = inner.on_done.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Fan-in of N asynchronous completions into a single callback.
///
/// The counter starts at 1 for the barrier itself, so the terminal callback
/// cannot fire while tokens are still being handed out; it runs exactly
/// once, on whichever thread performs the final decrement (token drop or
/// barrier drop, whichever comes last).
pub(crate) struct IncrementalBarrier {
    inner: Arc<BarrierInner>,
}

impl IncrementalBarrier {
    pub fn new<F>(on_done: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(BarrierInner {
                count: AtomicUsize::new(1),
                on_done: Mutex::new(Some(Box::new(on_done))),
            }),
        }
    }

    /// Returns a fresh token whose destruction counts as one completion.
    pub fn inc(&self) -> BarrierToken {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        BarrierToken {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for IncrementalBarrier {
    fn drop(&mut self) {
        decrement(&self.inner);
    }
}

/// Move-only completion token handed out by [`IncrementalBarrier::inc`].
pub(crate) struct BarrierToken {
    inner: Arc<BarrierInner>,
}

impl Drop for BarrierToken {
    fn drop(&mut self) {
        decrement(&self.inner);
    }
}
