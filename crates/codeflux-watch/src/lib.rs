pub mod accumulator;
pub mod source;

pub use accumulator::{BatchAccumulator, BatchWindow};
pub use source::{ChangeSource, WatchGuard};
