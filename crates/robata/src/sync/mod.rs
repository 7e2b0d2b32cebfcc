//! Small concurrency primitives shared by the batching pipeline: the
//! first-error status cell co-owned by the splits of a call, and the
//! fan-in barrier that runs a completion thunk when every split is done.

mod barrier;
mod status;

pub(crate) use barrier::IncrementalBarrier;
pub(crate) use status::ThreadSafeStatus;
