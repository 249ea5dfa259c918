mod consumer;
mod registry;

pub use consumer::{Consumer, Delivery};
pub use registry::{Dispatch, ReplayMode, SubscriptionChange, SubscriptionKey, SubscriptionRegistry, SubscriptionToken, WireSubscription};
