mod item;
mod pill;

pub use item::Item;
pub(crate) use item::{reply_channel, ReplySender};
#[allow(unused_imports)]
pub(crate) use pill::Pill;
