//! Batch aggregation and dispatch: the front door that ingests per-call
//! tensors, queues them by name, forms batches bounded by size and time,
//! runs the compute function once per batch, and scatters outputs back to
//! their callers.

mod index;
mod resource;
mod task;

pub use index::{BatchIndex, IndexEntry};
pub use resource::{BatchFunction, BatchResource, BatchResourceOptions};
pub use task::BatchReply;
