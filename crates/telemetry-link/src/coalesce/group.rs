use super::{BatchStrategy, HousekeepingBatch};
use crate::correlation::CallResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::time::DelayQueue;
use tracing::{debug, trace};

/// One participant's ask: "give me `key` of `target` from `service.method`
/// with these options".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchQuery {
	pub service: String,
	pub method: String,
	/// Subsystem or other scope shared by everyone in the batch.
	pub target: String,
	/// Must be equal, structurally, for two queries to share a call.
	pub options: Value,
}

impl BatchQuery {
	/// A `request` call with no options.
	pub fn new(service: impl Into<String>, target: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			method: "request".to_owned(),
			target: target.into(),
			options: Value::Object(Map::new()),
		}
	}

	#[must_use]
	pub fn method(mut self, method: impl Into<String>) -> Self {
		self.method = method.into();
		self
	}

	#[must_use]
	pub fn option(mut self, name: &str, value: impl Into<Value>) -> Self {
		if !self.options.is_object() {
			self.options = Value::Object(Map::new());
		}
		if let Value::Object(options) = &mut self.options {
			options.insert(name.to_owned(), value.into());
		}
		self
	}

	/// Aggregation strategy (`latest`, `minmax`, `none`).
	#[must_use]
	pub fn strategy(self, strategy: &str) -> Self {
		self.option("strategy", strategy)
	}

	#[must_use]
	pub fn group_key(&self) -> GroupKey {
		GroupKey {
			service: self.service.clone(),
			method: self.method.clone(),
			target: self.target.clone(),
			// Object keys serialize sorted, so equal options give equal text.
			options: self.options.to_string(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
	pub service: String,
	pub method: String,
	pub target: String,
	pub options: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
	Open,
	Flushed,
}

#[derive(Debug)]
pub struct Participant {
	pub key: String,
	reply: oneshot::Sender<CallResult>,
}

impl Participant {
	pub fn new(key: impl Into<String>, reply: oneshot::Sender<CallResult>) -> Self {
		Self { key: key.into(), reply }
	}
}

pub struct CoalescingGroup {
	query: BatchQuery,
	participants: Vec<Participant>,
	state: GroupState,
}

impl CoalescingGroup {
	fn open(query: BatchQuery, first: Participant) -> Self {
		Self {
			query,
			participants: vec![first],
			state: GroupState::Open,
		}
	}

	fn add(&mut self, participant: Participant) -> usize {
		self.participants.push(participant);
		self.participants.len()
	}

	fn flush(&mut self) -> Vec<Participant> {
		self.state = GroupState::Flushed;
		std::mem::take(&mut self.participants)
	}

	#[must_use]
	pub const fn state(&self) -> GroupState {
		self.state
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.participants.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.participants.is_empty()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined {
	/// A new group was opened and its flush timer armed.
	Opened,
	Appended { participants: usize },
}

/// A group whose window closed. Owns the participants until the single
/// backend result comes back.
pub struct FlushedGroup {
	pub key: GroupKey,
	pub query: BatchQuery,
	participants: Vec<Participant>,
	state: GroupState,
	strategy: Arc<dyn BatchStrategy>,
}

impl FlushedGroup {
	#[must_use]
	pub const fn state(&self) -> GroupState {
		self.state
	}

	/// Union of participant keys, first occurrence wins the position.
	#[must_use]
	pub fn keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = Vec::with_capacity(self.participants.len());
		for participant in &self.participants {
			if !keys.contains(&participant.key) {
				keys.push(participant.key.clone());
			}
		}
		keys
	}

	#[must_use]
	pub fn params(&self) -> Value {
		self.strategy.params(&self.query, &self.keys())
	}

	#[must_use]
	pub fn participants(&self) -> usize {
		self.participants.len()
	}

	/// Fan the single outcome out. Every participant gets its own slice, or
	/// the same error.
	pub fn complete(self, outcome: CallResult) {
		let Self { participants, strategy, key, .. } = self;
		match outcome {
			Ok(result) => {
				for participant in participants {
					let slice = strategy.partition(&participant.key, &result);
					if participant.reply.send(Ok(slice)).is_err() {
						trace!(subsystem = %key.target, key = %participant.key, "participant abandoned request");
					}
				}
			}
			Err(e) => {
				debug!("{}.{} for {} failed for {} participants: {}", key.service, key.method, key.target, participants.len(), e);
				for participant in participants {
					let _ = participant.reply.send(Err(e.clone()));
				}
			}
		}
	}
}

/// Open groups plus one flush timer per group.
pub struct Coalescer {
	window: Duration,
	open: HashMap<GroupKey, CoalescingGroup>,
	timers: DelayQueue<GroupKey>,
	strategies: HashMap<String, Arc<dyn BatchStrategy>>,
	fallback: Arc<dyn BatchStrategy>,
}

impl Coalescer {
	#[must_use]
	pub fn new(window: Duration) -> Self {
		Self {
			window,
			open: HashMap::new(),
			timers: DelayQueue::new(),
			strategies: HashMap::new(),
			fallback: Arc::new(HousekeepingBatch),
		}
	}

	/// Use `strategy` for every query against `service`.
	pub fn register_strategy(&mut self, service: impl Into<String>, strategy: Arc<dyn BatchStrategy>) {
		self.strategies.insert(service.into(), strategy);
	}

	/// Join the open group for this query, opening one if none exists.
	pub fn join(&mut self, query: BatchQuery, participant: Participant) -> Joined {
		let key = query.group_key();

		// Flushing removes a group, so anything still here is open.
		if let Some(group) = self.open.get_mut(&key) {
			let participants = group.add(participant);
			trace!(subsystem = %key.target, participants, "joined open group");
			return Joined::Appended { participants };
		}

		self.timers.insert(key.clone(), self.window);
		self.open.insert(key, CoalescingGroup::open(query, participant));
		Joined::Opened
	}

	/// Wait for the next window to close. The group is removed, so later
	/// queries with the same key open a fresh one.
	pub async fn next_flush(&mut self) -> Option<FlushedGroup> {
		let expired = poll_fn(|cx| self.timers.poll_expired(cx)).await?;
		let key = expired.into_inner();
		let mut group = self.open.remove(&key)?;
		let participants = group.flush();

		let strategy = self.strategies.get(&key.service).map_or_else(|| Arc::clone(&self.fallback), Arc::clone);
		debug!(service = %key.service, subsystem = %key.target, participants = participants.len(), "flushing group");

		Some(FlushedGroup {
			key,
			query: group.query,
			participants,
			state: group.state,
			strategy,
		})
	}

	/// `None` once the group has flushed (or never existed).
	#[must_use]
	pub fn state(&self, key: &GroupKey) -> Option<GroupState> {
		self.open.get(key).map(CoalescingGroup::state)
	}

	#[must_use]
	pub fn open_groups(&self) -> usize {
		self.open.len()
	}

	#[must_use]
	pub const fn window(&self) -> Duration {
		self.window
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::coalesce::KeyedBatch;
	use crate::LinkError;
	use serde_json::json;

	const WINDOW: Duration = Duration::from_millis(50);

	fn ask(coalescer: &mut Coalescer, query: &BatchQuery, key: &str) -> (Joined, oneshot::Receiver<CallResult>) {
		let (tx, rx) = oneshot::channel();
		(coalescer.join(query.clone(), Participant::new(key, tx)), rx)
	}

	fn eps_minmax() -> BatchQuery {
		BatchQuery::new("housekeeping", "fs1.eps").strategy("minmax").option("size", 500)
	}

	#[test]
	fn group_key_ignores_option_order() {
		let a = BatchQuery::new("housekeeping", "fs1.eps").option("size", 10).option("strategy", "latest");
		let b = BatchQuery::new("housekeeping", "fs1.eps").option("strategy", "latest").option("size", 10);
		assert_eq!(a.group_key(), b.group_key());
	}

	#[test]
	fn group_key_differs_on_options() {
		let a = BatchQuery::new("housekeeping", "fs1.eps").strategy("latest");
		let b = BatchQuery::new("housekeeping", "fs1.eps").strategy("minmax");
		assert_ne!(a.group_key(), b.group_key());
	}

	#[tokio::test(start_paused = true)]
	async fn same_window_joins_one_group() {
		let mut coalescer = Coalescer::new(WINDOW);
		let query = eps_minmax();

		let (first, _a) = ask(&mut coalescer, &query, "temp");
		let (second, _b) = ask(&mut coalescer, &query, "volt");
		assert_eq!(first, Joined::Opened);
		assert_eq!(second, Joined::Appended { participants: 2 });
		assert_eq!(coalescer.state(&query.group_key()), Some(GroupState::Open));

		let flushed = coalescer.next_flush().await.unwrap();
		assert_eq!(flushed.participants(), 2);
		assert_eq!(flushed.keys(), vec!["temp".to_string(), "volt".to_string()]);
		assert_eq!(
			flushed.params(),
			json!({"key": ["fs1.eps.temp", "fs1.eps.volt"], "options": {"size": 500, "strategy": "minmax"}})
		);
		assert_eq!(flushed.state(), GroupState::Flushed);
		assert_eq!(coalescer.state(&query.group_key()), None);
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_keys_are_requested_once_and_both_answered() {
		let mut coalescer = Coalescer::new(WINDOW);
		let query = eps_minmax();
		let (_, a) = ask(&mut coalescer, &query, "temp");
		let (_, b) = ask(&mut coalescer, &query, "temp");

		let flushed = coalescer.next_flush().await.unwrap();
		assert_eq!(flushed.keys(), vec!["temp".to_string()]);

		flushed.complete(Ok(json!({"subsystem": "fs1.eps", "housekeeping": [{"timestamp": 1, "temp": {"value": 2}}]})));
		assert_eq!(a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
	}

	#[tokio::test(start_paused = true)]
	async fn join_after_flush_opens_a_new_group() {
		let mut coalescer = Coalescer::new(WINDOW);
		let query = eps_minmax();
		ask(&mut coalescer, &query, "temp");
		let _flushed = coalescer.next_flush().await.unwrap();

		let (joined, _rx) = ask(&mut coalescer, &query, "volt");
		assert_eq!(joined, Joined::Opened);
		assert_eq!(coalescer.state(&query.group_key()), Some(GroupState::Open));
		assert_eq!(coalescer.open_groups(), 1);
		let second = coalescer.next_flush().await.unwrap();
		assert_eq!(second.keys(), vec!["volt".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn differing_options_never_share_a_call() {
		let mut coalescer = Coalescer::new(WINDOW);
		ask(&mut coalescer, &BatchQuery::new("housekeeping", "fs1.eps").strategy("latest"), "temp");
		ask(&mut coalescer, &BatchQuery::new("housekeeping", "fs1.eps").strategy("minmax"), "temp");
		assert_eq!(coalescer.open_groups(), 2);

		assert_eq!(coalescer.next_flush().await.unwrap().participants(), 1);
		assert_eq!(coalescer.next_flush().await.unwrap().participants(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn failure_reaches_every_participant() {
		let mut coalescer = Coalescer::new(WINDOW);
		let query = eps_minmax();
		let (_, a) = ask(&mut coalescer, &query, "temp");
		let (_, b) = ask(&mut coalescer, &query, "volt");

		let error = LinkError::Remote {
			code: -1,
			message: "No such subsystem".into(),
		};
		coalescer.next_flush().await.unwrap().complete(Err(error.clone()));
		assert_eq!(a.await.unwrap(), Err(error.clone()));
		assert_eq!(b.await.unwrap(), Err(error));
	}

	#[tokio::test(start_paused = true)]
	async fn registered_strategy_is_used_for_its_service() {
		let mut coalescer = Coalescer::new(WINDOW);
		coalescer.register_strategy("tracking", Arc::new(KeyedBatch));
		let query = BatchQuery::new("tracking", "tle").method("get_tle");
		let (_, a) = ask(&mut coalescer, &query, "fs1");
		let (_, b) = ask(&mut coalescer, &query, "fs2");

		let flushed = coalescer.next_flush().await.unwrap();
		assert_eq!(flushed.params(), json!({"target": "tle", "keys": ["fs1", "fs2"], "options": {}}));
		flushed.complete(Ok(json!({"fs1": "line-a", "fs2": "line-b"})));
		assert_eq!(a.await.unwrap().unwrap(), json!("line-a"));
		assert_eq!(b.await.unwrap().unwrap(), json!("line-b"));
	}
}
