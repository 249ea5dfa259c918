use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Receiver of pushed payloads for one subscription key.
#[derive(Clone)]
pub enum Consumer {
	Callback(Callback),
	Channel(mpsc::UnboundedSender<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Delivered,
	/// The channel's receiver is gone; the consumer should be pruned.
	Gone,
	/// The callback panicked. It is pruned as well.
	Panicked,
}

impl Consumer {
	pub fn callback<F>(f: F) -> Self
	where
		F: Fn(&Value) + Send + Sync + 'static,
	{
		Self::Callback(Arc::new(f))
	}

	pub fn deliver(&self, payload: &Value) -> Delivery {
		match self {
			Self::Callback(f) => match catch_unwind(AssertUnwindSafe(|| f(payload))) {
				Ok(()) => Delivery::Delivered,
				Err(_) => Delivery::Panicked,
			},
			Self::Channel(tx) => match tx.send(payload.clone()) {
				Ok(()) => Delivery::Delivered,
				Err(_) => Delivery::Gone,
			},
		}
	}
}

impl fmt::Debug for Consumer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Callback(_) => f.write_str("Consumer::Callback"),
			Self::Channel(tx) => f.debug_tuple("Consumer::Channel").field(&tx.is_closed()).finish(),
		}
	}
}
