//! The downstream half of the batching core: the key-indexed rendezvous
//! that hands each caller its slice of a previously batched tensor, and the
//! gradient-side re-batching that reassembles per-slice gradients in the
//! original batch order.

mod grad;
mod resource;

pub use grad::UnbatchGradResource;
pub use resource::UnbatchResource;
