pub mod invalidation;

pub use invalidation::{FollowUp, InvalidationEngine};
