use crate::frame::{CallId, OutboundFrame};
use crate::LinkError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, warn};

pub type CallResult = Result<Value, LinkError>;

/// Who is waiting on a pending call.
#[derive(Debug)]
pub enum Completion {
	Caller(oneshot::Sender<CallResult>),
	/// Fire-and-forget traffic such as subscribe frames; outcomes are only logged.
	Detached,
}

#[derive(Debug)]
struct PendingCall {
	service: String,
	method: String,
	timeout: Duration,
	completion: Completion,
	deadline: delay_queue::Key,
}

/// How an inbound response or a local failure was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
	Delivered,
	/// The call was known but its caller had already gone away.
	Abandoned,
	Detached,
	Unknown,
}

/// Pending calls keyed by id, each with its own deadline.
pub struct CorrelationTable {
	next_id: u64,
	pending: HashMap<CallId, PendingCall>,
	deadlines: DelayQueue<CallId>,
}

impl CorrelationTable {
	#[must_use]
	pub fn new() -> Self {
		Self {
			next_id: 1,
			pending: HashMap::new(),
			deadlines: DelayQueue::new(),
		}
	}

	/// Allocate an id, arm its deadline and build the frame to send.
	pub fn register(&mut self, service: &str, method: &str, params: Value, timeout: Duration, completion: Completion) -> OutboundFrame {
		let id = CallId(self.next_id);
		self.next_id += 1;

		let deadline = self.deadlines.insert(id, timeout);
		self.pending.insert(
			id,
			PendingCall {
				service: service.to_owned(),
				method: method.to_owned(),
				timeout,
				completion,
				deadline,
			},
		);
		trace!(%id, service, method, "call registered");

		OutboundFrame {
			service: service.to_owned(),
			method: method.to_owned(),
			params,
			id,
		}
	}

	/// Settle a call at most once. Unknown ids are ignored.
	pub fn complete(&mut self, id: CallId, outcome: CallResult) -> Resolution {
		let Some(call) = self.pending.remove(&id) else {
			debug!(%id, "dropping response for unknown call id");
			return Resolution::Unknown;
		};
		self.deadlines.remove(&call.deadline);
		Self::settle(id, call, outcome)
	}

	/// Wait for the next deadline and reject that call with `Timeout`.
	pub async fn next_timeout(&mut self) -> Option<CallId> {
		let expired = poll_fn(|cx| self.deadlines.poll_expired(cx)).await?;
		let id = expired.into_inner();
		let call = self.pending.remove(&id)?;
		let error = LinkError::Timeout {
			service: call.service.clone(),
			method: call.method.clone(),
			after: call.timeout,
		};
		Self::settle(id, call, Err(error));
		Some(id)
	}

	fn settle(id: CallId, call: PendingCall, outcome: CallResult) -> Resolution {
		match call.completion {
			Completion::Caller(reply) => {
				if reply.send(outcome).is_err() {
					trace!(%id, "caller abandoned the call");
					Resolution::Abandoned
				} else {
					Resolution::Delivered
				}
			}
			Completion::Detached => {
				match outcome {
					Err(e) if e.is_timeout() => debug!(%id, service = %call.service, method = %call.method, "no ack before deadline"),
					Err(e) => warn!("{}.{} (id {}) failed: {}", call.service, call.method, id, e),
					Ok(_) => trace!(%id, "ack received"),
				}
				Resolution::Detached
			}
		}
	}

	#[must_use]
	pub fn is_pending(&self, id: CallId) -> bool {
		self.pending.contains_key(&id)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.pending.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}
}

impl Default for CorrelationTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn caller() -> (Completion, oneshot::Receiver<CallResult>) {
		let (tx, rx) = oneshot::channel();
		(Completion::Caller(tx), rx)
	}

	#[tokio::test(start_paused = true)]
	async fn ids_are_unique_while_pending() {
		let mut table = CorrelationTable::new();
		let a = table.register("housekeeping", "request", Value::Null, Duration::from_secs(1), Completion::Detached);
		let b = table.register("housekeeping", "request", Value::Null, Duration::from_secs(1), Completion::Detached);
		assert_ne!(a.id, b.id);
		assert_eq!(table.len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn response_resolves_and_removes_call() {
		let mut table = CorrelationTable::new();
		let (completion, rx) = caller();
		let frame = table.register("housekeeping", "get_schema", Value::Null, Duration::from_secs(5), completion);

		assert_eq!(table.complete(frame.id, Ok(json!({"schema": {}}))), Resolution::Delivered);
		assert_eq!(rx.await.unwrap().unwrap(), json!({"schema": {}}));
		assert!(table.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn remote_error_rejects_caller() {
		let mut table = CorrelationTable::new();
		let (completion, rx) = caller();
		let frame = table.register("events", "request", Value::Null, Duration::from_secs(5), completion);

		let error = LinkError::Remote {
			code: -1,
			message: "Invalid domain!".into(),
		};
		table.complete(frame.id, Err(error.clone()));
		assert_eq!(rx.await.unwrap(), Err(error));
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_rejects_with_timeout_and_late_response_is_ignored() {
		let mut table = CorrelationTable::new();
		let (completion, rx) = caller();
		let frame = table.register("tracking", "get_tle", Value::Null, Duration::from_millis(200), completion);

		assert_eq!(table.next_timeout().await, Some(frame.id));
		let err = rx.await.unwrap().unwrap_err();
		assert!(err.is_timeout());

		assert_eq!(table.complete(frame.id, Ok(json!(1))), Resolution::Unknown);
		assert!(!table.is_pending(frame.id));
	}

	#[tokio::test(start_paused = true)]
	async fn resolved_call_never_times_out() {
		let mut table = CorrelationTable::new();
		let (completion, _rx) = caller();
		let frame = table.register("system", "request", Value::Null, Duration::from_millis(10), completion);
		table.complete(frame.id, Ok(Value::Null));

		let timed_out = tokio::time::timeout(Duration::from_secs(1), table.next_timeout()).await;
		// An empty queue yields `None` straight away rather than waiting.
		assert!(matches!(timed_out, Ok(None)));
	}

	#[tokio::test(start_paused = true)]
	async fn dropped_handle_is_abandoned_without_error() {
		let mut table = CorrelationTable::new();
		let (completion, rx) = caller();
		let frame = table.register("housekeeping", "request", Value::Null, Duration::from_secs(1), completion);
		drop(rx);

		assert_eq!(table.complete(frame.id, Ok(Value::Null)), Resolution::Abandoned);
	}

	#[tokio::test(start_paused = true)]
	async fn unknown_id_is_ignored() {
		let mut table = CorrelationTable::new();
		assert_eq!(table.complete(CallId(99), Ok(Value::Null)), Resolution::Unknown);
	}
}
