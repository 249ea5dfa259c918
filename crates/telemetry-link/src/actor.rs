pub mod command;
pub mod handle;
pub mod stats;

pub use command::LinkCommand;
pub use handle::{CallHandle, LinkBuilder, Subscription, TelemetryLink};
pub use stats::LinkStats;

use crate::coalesce::{Coalescer, FlushedGroup, Joined};
use crate::correlation::{CallResult, Completion, CorrelationTable, Resolution};
use crate::frame::{subscription_params, CallId, InboundFrame, OutboundFrame, PushItem};
use crate::subscription::{SubscriptionKey, SubscriptionRegistry, SubscriptionToken, WireSubscription};
use crate::transport::{ConnectionId, SessionEvent, SessionHandle};
use crate::LinkError;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Owns the correlation table, subscription registry and coalescer, and every
/// timer they use. All core state changes happen on this one task.
pub struct LinkActor {
	commands: mpsc::Receiver<LinkCommand>,
	events: mpsc::Receiver<SessionEvent>,
	session: SessionHandle,
	table: CorrelationTable,
	registry: SubscriptionRegistry,
	coalescer: Coalescer,
	call_timeout: Duration,
	connection: Option<ConnectionId>,
	stats: LinkStats,
	cancel: CancellationToken,
}

impl LinkActor {
	#[must_use]
	pub fn new(
		commands: mpsc::Receiver<LinkCommand>,
		events: mpsc::Receiver<SessionEvent>,
		session: SessionHandle,
		registry: SubscriptionRegistry,
		coalescer: Coalescer,
		call_timeout: Duration,
		cancel: CancellationToken,
	) -> Self {
		Self {
			commands,
			events,
			session,
			table: CorrelationTable::new(),
			registry,
			coalescer,
			call_timeout,
			connection: None,
			stats: LinkStats::default(),
			cancel,
		}
	}

	/// Run the actor event loop until shutdown or until every handle is dropped.
	pub async fn run(mut self) {
		debug!("Link actor started");

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => break,
				command = self.commands.recv() => match command {
					Some(command) => {
						if self.handle_command(command).is_break() {
							break;
						}
					}
					None => break,
				},
				event = self.events.recv() => match event {
					Some(event) => self.handle_event(event),
					None => break,
				},
				Some(id) = self.table.next_timeout() => {
					self.stats.timeouts += 1;
					trace!(%id, "call deadline passed");
				}
				Some(group) = self.coalescer.next_flush() => self.flush(group),
			}
		}

		self.session.shutdown();
		info!("Link actor stopped with {} calls still pending", self.table.len());
	}

	fn handle_command(&mut self, command: LinkCommand) -> ControlFlow<()> {
		match command {
			LinkCommand::Call {
				service,
				method,
				params,
				timeout,
				reply,
			} => {
				let timeout = timeout.unwrap_or(self.call_timeout);
				let frame = self.table.register(&service, &method, params, timeout, Completion::Caller(reply));
				self.transmit(&frame, None);
			}

			LinkCommand::Subscribe { key, consumer, reply } => {
				let (token, change) = self.registry.subscribe(key, consumer);
				if let Some(wire) = change.wire {
					self.send_subscription(&wire);
				}
				if reply.send(token).is_err() {
					// The subscriber went away before learning its token.
					self.unsubscribe(token);
				}
			}

			LinkCommand::Unsubscribe { token } => self.unsubscribe(token),

			LinkCommand::Request { query, participant } => {
				self.stats.requests += 1;
				if let Joined::Appended { participants } = self.coalescer.join(query, participant) {
					self.stats.requests_coalesced += 1;
					trace!(participants, "request coalesced");
				}
			}

			LinkCommand::Stats { reply } => {
				let _ = reply.send(self.snapshot());
			}

			LinkCommand::Shutdown => {
				debug!("Link actor shutting down");
				return ControlFlow::Break(());
			}
		}

		ControlFlow::Continue(())
	}

	fn handle_event(&mut self, event: SessionEvent) {
		match event {
			SessionEvent::Opened { connection_id, replay } => {
				self.connection = Some(connection_id);
				self.stats.connections += 1;

				let frames = self.replay_frames();
				info!("Connection {} opened, replaying {} subscriptions", connection_id, frames.len());
				if replay.send(frames).is_err() {
					debug!("Session dropped the replay request");
				}
			}

			SessionEvent::Closed { connection_id, reason } => {
				if self.connection == Some(connection_id) {
					self.connection = None;
				}
				info!("Connection {} closed ({}); {} subscriptions dormant", connection_id, reason, self.registry.key_count());
			}

			SessionEvent::Frame(text) => self.handle_frame(&text),
		}
	}

	fn handle_frame(&mut self, text: &str) {
		match InboundFrame::parse(text) {
			Ok(InboundFrame::Response { id, result }) => self.resolve(id, Ok(result)),
			Ok(InboundFrame::Failure { id, code, message }) => self.resolve(id, Err(LinkError::Remote { code, message })),
			Ok(InboundFrame::Push { service, items }) => self.dispatch(&service, items),
			Ok(InboundFrame::Other) => {
				self.stats.ignored_frames += 1;
				trace!("Ignoring frame that is neither a response nor a push");
			}
			Err(e) => {
				self.stats.malformed_frames += 1;
				debug!("Dropping malformed frame: {}", e);
			}
		}
	}

	fn resolve(&mut self, id: CallId, outcome: CallResult) {
		let failed = outcome.is_err();
		match self.table.complete(id, outcome) {
			Resolution::Unknown => self.stats.unknown_responses += 1,
			_ if failed => self.stats.remote_errors += 1,
			_ => self.stats.responses += 1,
		}
	}

	/// Fan one push frame out to the consumers of each key it carries.
	fn dispatch(&mut self, service: &str, items: Vec<PushItem>) {
		let mut delivered = 0;
		let mut gone = Vec::new();
		for PushItem { key, payload } in items {
			let key = SubscriptionKey::new(service, key);
			let dispatch = self.registry.dispatch(&key, &payload);
			delivered += dispatch.delivered;
			gone.extend(dispatch.gone.into_iter().map(|token| (key.clone(), token)));
		}

		if delivered == 0 {
			self.stats.pushes_dropped += 1;
			trace!(service, "push with no live consumer");
		} else {
			self.stats.pushes_delivered += 1;
		}

		for (key, token) in gone {
			debug!(%key, "pruning consumer that is gone");
			self.unsubscribe(token);
		}
	}

	fn unsubscribe(&mut self, token: SubscriptionToken) {
		match self.registry.unsubscribe(token) {
			Some(change) => {
				if let Some(wire) = change.wire {
					self.send_subscription(&wire);
				}
			}
			None => trace!(?token, "unsubscribe for unknown token"),
		}
	}

	/// Subscribe/unsubscribe frames are bound to the connection they were
	/// decided on. Without one, or if it closes first, the replay on the next
	/// open covers them.
	fn send_subscription(&mut self, wire: &WireSubscription) {
		let Some(connection_id) = self.connection else {
			debug!(service = %wire.service, keys = ?wire.keys, "{} deferred until the next open", wire.method);
			return;
		};
		let frame = self.table.register(&wire.service, wire.method, subscription_params(&wire.keys), self.call_timeout, Completion::Detached);
		self.transmit(&frame, Some(connection_id));
	}

	fn replay_frames(&mut self) -> Vec<String> {
		let mut frames = Vec::new();
		for wire in self.registry.replay() {
			let frame = self.table.register(&wire.service, wire.method, subscription_params(&wire.keys), self.call_timeout, Completion::Detached);
			match frame.encode() {
				Ok(text) => {
					self.stats.calls_sent += 1;
					frames.push(text);
				}
				Err(e) => {
					self.table.complete(frame.id, Err(e.into()));
				}
			}
		}
		frames
	}

	/// Hand a registered call to the session. A call that can't be sent fails
	/// through the table like any other call.
	fn transmit(&mut self, frame: &OutboundFrame, scope: Option<ConnectionId>) {
		let sent = frame.encode().map_err(LinkError::from).and_then(|text| match scope {
			Some(connection_id) => self.session.send_on(connection_id, text),
			None => self.session.send(text),
		});
		match sent {
			Ok(()) => self.stats.calls_sent += 1,
			Err(e) => {
				trace!(id = %frame.id, "call not sent: {}", e);
				self.table.complete(frame.id, Err(e));
			}
		}
	}

	/// Issue the single call for a closed window and fan its outcome out.
	fn flush(&mut self, group: FlushedGroup) {
		self.stats.batches_flushed += 1;

		let (reply, outcome) = oneshot::channel();
		let frame = self.table.register(&group.key.service, &group.key.method, group.params(), self.call_timeout, Completion::Caller(reply));
		self.transmit(&frame, None);

		tokio::spawn(async move {
			let outcome = outcome.await.unwrap_or_else(|_| Err(LinkError::Shutdown));
			group.complete(outcome);
		});
	}

	fn snapshot(&self) -> LinkStats {
		LinkStats {
			pending_calls: self.table.len(),
			subscribed_keys: self.registry.key_count(),
			open_groups: self.coalescer.open_groups(),
			..self.stats.clone()
		}
	}
}
