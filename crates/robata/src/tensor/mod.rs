//! Dimension-0 tensor manipulation shared by the batching and unbatching
//! sides: concatenation with shape validation, splitting by a size vector,
//! and the empty-tensor and padding helpers the batch former relies on.

pub(crate) mod operations;
