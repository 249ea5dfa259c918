use super::{Consumer, Delivery};
use crate::frame::{SUBSCRIBE, UNSUBSCRIBE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// `(service, subsystem-or-field)` a consumer is interested in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
	pub service: String,
	pub key: String,
}

impl SubscriptionKey {
	pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			key: key.into(),
		}
	}
}

impl fmt::Display for SubscriptionKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.service, self.key)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// A subscribe or unsubscribe frame the backend must see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireSubscription {
	pub service: String,
	pub method: &'static str,
	pub keys: Vec<String>,
}

/// Granularity of the subscribe frames replayed after a reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayMode {
	/// One frame per live key.
	#[default]
	PerKey,
	/// One frame per service carrying all of its live keys.
	PerService,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
	/// Consumers left on the key after the change.
	pub consumers: usize,
	/// Frame to send when the key went empty -> non-empty or back.
	pub wire: Option<WireSubscription>,
}

#[derive(Debug, Default)]
pub struct Dispatch {
	pub delivered: usize,
	/// Channel consumers whose receiver has been dropped.
	pub gone: Vec<SubscriptionToken>,
}

/// Union of client-side interest in pushed data.
///
/// Pure bookkeeping: every operation returns the frames to send instead of
/// sending them, and entries survive disconnects.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
	entries: BTreeMap<SubscriptionKey, BTreeMap<SubscriptionToken, Consumer>>,
	tokens: HashMap<SubscriptionToken, SubscriptionKey>,
	next_token: u64,
	replay_mode: ReplayMode,
}

impl SubscriptionRegistry {
	#[must_use]
	pub fn new(replay_mode: ReplayMode) -> Self {
		Self {
			replay_mode,
			..Self::default()
		}
	}

	/// Register a consumer. A subscribe frame is produced only for a key that had no consumers.
	pub fn subscribe(&mut self, key: SubscriptionKey, consumer: Consumer) -> (SubscriptionToken, SubscriptionChange) {
		self.next_token += 1;
		let token = SubscriptionToken(self.next_token);

		let is_new = !self.entries.contains_key(&key);
		let consumers = self.entries.entry(key.clone()).or_default();
		consumers.insert(token, consumer);
		let count = consumers.len();

		let wire = is_new.then(|| WireSubscription {
			service: key.service.clone(),
			method: SUBSCRIBE,
			keys: vec![key.key.clone()],
		});
		self.tokens.insert(token, key);

		(token, SubscriptionChange { consumers: count, wire })
	}

	/// Remove a consumer. The last one leaving produces an unsubscribe frame.
	/// Unknown tokens yield `None`.
	pub fn unsubscribe(&mut self, token: SubscriptionToken) -> Option<SubscriptionChange> {
		let key = self.tokens.remove(&token)?;
		let consumers = self.entries.get_mut(&key)?;
		consumers.remove(&token);
		let count = consumers.len();

		let wire = if count == 0 {
			self.entries.remove(&key);
			Some(WireSubscription {
				service: key.service,
				method: UNSUBSCRIBE,
				keys: vec![key.key],
			})
		} else {
			None
		};

		Some(SubscriptionChange { consumers: count, wire })
	}

	/// Deliver a push to every consumer of exactly this key.
	pub fn dispatch(&self, key: &SubscriptionKey, payload: &Value) -> Dispatch {
		let mut dispatch = Dispatch::default();
		let Some(consumers) = self.entries.get(key) else {
			return dispatch;
		};

		for (token, consumer) in consumers {
			match consumer.deliver(payload) {
				Delivery::Delivered => dispatch.delivered += 1,
				Delivery::Gone => dispatch.gone.push(*token),
				Delivery::Panicked => {
					tracing::warn!(%key, ?token, "Subscriber callback panicked, removing it");
					dispatch.gone.push(*token);
				}
			}
		}
		dispatch
	}

	/// Subscribe frames re-establishing every live key, grouped by service.
	#[must_use]
	pub fn replay(&self) -> Vec<WireSubscription> {
		match self.replay_mode {
			ReplayMode::PerKey => self
				.entries
				.keys()
				.map(|key| WireSubscription {
					service: key.service.clone(),
					method: SUBSCRIBE,
					keys: vec![key.key.clone()],
				})
				.collect(),
			ReplayMode::PerService => {
				let mut frames: Vec<WireSubscription> = Vec::new();
				for key in self.entries.keys() {
					match frames.last_mut() {
						Some(frame) if frame.service == key.service => frame.keys.push(key.key.clone()),
						_ => frames.push(WireSubscription {
							service: key.service.clone(),
							method: SUBSCRIBE,
							keys: vec![key.key.clone()],
						}),
					}
				}
				frames
			}
		}
	}

	#[must_use]
	pub fn is_subscribed_to(&self, key: &SubscriptionKey) -> bool {
		self.entries.contains_key(key)
	}

	#[must_use]
	pub fn consumer_count(&self, key: &SubscriptionKey) -> usize {
		self.entries.get(key).map_or(0, BTreeMap::len)
	}

	#[must_use]
	pub fn key_count(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
