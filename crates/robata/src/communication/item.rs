use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::error::{BatchError, BatchResult};

/// # Item
///
/// The caller-side handle for one submitted request: a future over the
/// oneshot channel that the core's done-callback machinery eventually fires.
///
/// Every registered request is answered exactly once, with either a value or
/// a definite error status. If the resource serving the request is dropped
/// before a reply is produced, the channel closes and the item resolves to
/// [`BatchError::Cancelled`] rather than hanging forever.
#[derive(Debug)]
pub struct Item<T> {
    /// The underlying channel receiver
    receiver: oneshot::Receiver<BatchResult<T>>,
}

impl<T> Item<T> {
    /// Creates a new `Item` from a Tokio oneshot channel receiver.
    pub(crate) fn new(receiver: oneshot::Receiver<BatchResult<T>>) -> Self {
        Self { receiver }
    }
}

/// Sender half matching an [`Item`].
pub(crate) type ReplySender<T> = oneshot::Sender<BatchResult<T>>;

/// Build a connected reply channel: the sender is kept by the core, the
/// item is handed to the caller.
pub(crate) fn reply_channel<T>() -> (ReplySender<T>, Item<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, Item::new(rx))
}

impl<T> Future for Item<T> {
    type Output = BatchResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BatchError::Cancelled(
                "reply channel dropped before completion".to_string(),
            ))),
        }
    }
}
