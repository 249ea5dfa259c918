use super::{ConnectionId, Connector, Duplex, FrameSink, ReconnectConfig, RetryPolicy, SessionState, SessionTransition, TransportError, WireMessage};
use crate::LinkError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// What `send` does while the connection is not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum QueuePolicy {
	/// Fail immediately with `NotConnected`.
	FailFast,
	/// Queue for replay on the next open. The oldest frame is dropped when full.
	Buffer { capacity: usize },
}

impl Default for QueuePolicy {
	fn default() -> Self {
		Self::Buffer { capacity: 256 }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
	pub enabled: bool,
	pub ping_interval: Duration,
	/// Silence after which the connection is considered dead.
	pub idle_timeout: Duration,
}

impl Default for KeepaliveConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			ping_interval: Duration::from_secs(30),
			idle_timeout: Duration::from_secs(120),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
	pub queue: QueuePolicy,
	pub reconnect: ReconnectConfig,
	pub keepalive: KeepaliveConfig,
	pub connect_timeout: Option<Duration>,
}

/// Lifecycle and traffic reported by the session.
#[derive(Debug)]
pub enum SessionEvent {
	/// A connection opened. The receiver answers with the frames that must be
	/// written before anything queued or newly sent.
	Opened {
		connection_id: ConnectionId,
		replay: oneshot::Sender<Vec<String>>,
	},
	Closed {
		connection_id: ConnectionId,
		reason: String,
	},
	Frame(String),
}

/// A frame on its way to the session.
#[derive(Debug)]
struct Outbound {
	frame: String,
	/// Set for frames that only make sense on one connection. They are
	/// dropped rather than queued or sent anywhere else.
	scope: Option<ConnectionId>,
}

/// Cloneable send side of the session. The socket itself never leaves the session task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
	outbound: mpsc::UnboundedSender<Outbound>,
	state: watch::Receiver<SessionState>,
	queue: QueuePolicy,
	cancel: CancellationToken,
}

impl SessionHandle {
	/// Hand one raw frame to the session.
	///
	/// # Errors
	/// `NotConnected` under [`QueuePolicy::FailFast`] while not open, `Shutdown`
	/// once the session task is gone.
	pub fn send(&self, frame: String) -> Result<(), LinkError> {
		if self.queue == QueuePolicy::FailFast && !self.state.borrow().is_open() {
			return Err(LinkError::NotConnected);
		}
		self.outbound.send(Outbound { frame, scope: None }).map_err(|_| LinkError::Shutdown)
	}

	/// Send a frame that belongs to `connection_id` only. It is written after
	/// that connection's replay, or silently dropped if the connection is gone.
	/// Never subject to the queue policy.
	///
	/// # Errors
	/// `Shutdown` once the session task is gone.
	pub fn send_on(&self, connection_id: ConnectionId, frame: String) -> Result<(), LinkError> {
		self
			.outbound
			.send(Outbound {
				frame,
				scope: Some(connection_id),
			})
			.map_err(|_| LinkError::Shutdown)
	}

	#[must_use]
	pub fn state(&self) -> SessionState {
		self.state.borrow().clone()
	}

	#[must_use]
	pub fn watch(&self) -> watch::Receiver<SessionState> {
		self.state.clone()
	}

	pub fn shutdown(&self) {
		self.cancel.cancel();
	}
}

/// Owns the single physical connection and everything about reconnecting it.
pub struct TransportSession<C: Connector> {
	connector: Arc<C>,
	config: SessionConfig,
	outbound: mpsc::UnboundedReceiver<Outbound>,
	events: mpsc::Sender<SessionEvent>,
	state: watch::Sender<SessionState>,
	backlog: VecDeque<String>,
	retry: RetryPolicy,
	cancel: CancellationToken,
}

impl<C: Connector> TransportSession<C> {
	/// Spawn the session task. It starts connecting immediately.
	pub fn spawn(connector: C, config: SessionConfig, events: mpsc::Sender<SessionEvent>, cancel: CancellationToken) -> (SessionHandle, JoinHandle<()>) {
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(SessionState::initial());

		let handle = SessionHandle {
			outbound: outbound_tx,
			state: state_rx,
			queue: config.queue,
			cancel: cancel.clone(),
		};

		let session = Self {
			connector: Arc::new(connector),
			retry: RetryPolicy::new(config.reconnect.clone()),
			config,
			outbound: outbound_rx,
			events,
			state: state_tx,
			backlog: VecDeque::new(),
			cancel,
		};

		(handle, tokio::spawn(session.run()))
	}

	async fn run(mut self) {
		info!("Transport session started for {}", self.connector.endpoint());

		let mut attempt = 0;
		loop {
			attempt += 1;
			self.transition(SessionTransition::StartConnecting { attempt });

			let Some(result) = self.connect().await else { break };
			match result {
				Ok(duplex) => {
					self.retry.reset();
					attempt = 0;
					let connection_id = ConnectionId::new();
					let Some(reason) = self.serve(connection_id, duplex).await else { break };

					info!("Connection {} lost: {}", connection_id, reason);
					self.transition(SessionTransition::Lost(reason.clone()));
					if self.events.send(SessionEvent::Closed { connection_id, reason }).await.is_err() {
						break;
					}
				}
				Err(e) => {
					warn!("Failed to connect to {}: {}", self.connector.endpoint(), e);
					self.transition(SessionTransition::ConnectFailed(e.to_string()));
				}
			}

			match self.retry.next_delay() {
				Some(delay) => {
					debug!(delay_ms = delay.as_millis(), attempt = self.retry.consecutive_failures(), "scheduling reconnect");
					if !self.idle_for(delay).await {
						break;
					}
				}
				None => {
					info!("Reconnect disabled, session stays closed");
					self.idle_until_cancelled().await;
					break;
				}
			}
		}

		self.transition(SessionTransition::Stopped);
		info!("Transport session stopped for {}", self.connector.endpoint());
	}

	/// `None` when cancelled mid-attempt.
	async fn connect(&mut self) -> Option<Result<Duplex, TransportError>> {
		let connector = Arc::clone(&self.connector);
		let timeout = self.config.connect_timeout;
		let connect = async move {
			match timeout {
				Some(limit) => tokio::time::timeout(limit, connector.connect()).await.unwrap_or_else(|_| {
					Err(TransportError::Connect {
						endpoint: connector.endpoint().to_owned(),
						reason: format!("timed out after {}ms", limit.as_millis()),
					})
				}),
				None => connector.connect().await,
			}
		};
		tokio::pin!(connect);

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => return None,
				result = &mut connect => return Some(result),
				Some(frame) = self.outbound.recv() => self.enqueue(frame),
			}
		}
	}

	/// Drive one open connection. Returns the loss reason, or `None` when the
	/// session should stop.
	#[instrument(skip_all, fields(connection_id = %connection_id))]
	async fn serve(&mut self, connection_id: ConnectionId, duplex: Duplex) -> Option<String> {
		let Duplex { mut sink, mut stream } = duplex;

		let (replay_tx, replay_rx) = oneshot::channel();
		if self.events.send(SessionEvent::Opened { connection_id, replay: replay_tx }).await.is_err() {
			return None;
		}
		let replay = replay_rx.await.unwrap_or_default();

		debug!(replay = replay.len(), backlog = self.backlog.len(), "flushing replay and backlog");
		for frame in replay {
			if let Err(e) = sink.send(WireMessage::Text(frame)).await {
				return Some(e.to_string());
			}
		}
		if let Err(e) = self.flush_backlog(&mut sink).await {
			return Some(e.to_string());
		}

		self.transition(SessionTransition::Established(connection_id));
		info!("Connected to {}", self.connector.endpoint());

		let keepalive = self.config.keepalive.clone();
		let mut last_activity = Instant::now();
		let mut ping_interval = tokio::time::interval_at(Instant::now() + keepalive.ping_interval, keepalive.ping_interval);
		ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => {
					if let Err(e) = sink.send(WireMessage::Close).await {
						debug!("Failed to send close frame: {}", e);
					}
					return None;
				}
				message = stream.next() => match message {
					Some(Ok(WireMessage::Text(text))) => {
						last_activity = Instant::now();
						trace!(len = text.len(), "frame received");
						if self.events.send(SessionEvent::Frame(text)).await.is_err() {
							return None;
						}
					}
					Some(Ok(WireMessage::Ping(payload))) => {
						last_activity = Instant::now();
						if let Err(e) = sink.send(WireMessage::Pong(payload)).await {
							return Some(e.to_string());
						}
					}
					Some(Ok(WireMessage::Pong(_))) => last_activity = Instant::now(),
					Some(Ok(WireMessage::Close)) => return Some("closed by peer".into()),
					Some(Err(e)) => return Some(e.to_string()),
					None => return Some("stream ended".into()),
				},
				outbound = self.outbound.recv() => match outbound {
					Some(Outbound { scope: Some(scope), .. }) if scope != connection_id => {
						trace!(%scope, "dropping frame bound to an earlier connection");
					}
					Some(Outbound { frame, scope }) => {
						trace!(len = frame.len(), "frame sent");
						if let Err(e) = sink.send(WireMessage::Text(frame.clone())).await {
							if scope.is_none() {
								self.requeue(frame);
							}
							return Some(e.to_string());
						}
					}
					None => return None,
				},
				_ = ping_interval.tick(), if keepalive.enabled => {
					if last_activity.elapsed() > keepalive.idle_timeout {
						return Some(format!("no activity for {}s", keepalive.idle_timeout.as_secs()));
					}
					if let Err(e) = sink.send(WireMessage::Ping(Vec::new())).await {
						return Some(e.to_string());
					}
				}
			}
		}
	}

	async fn flush_backlog(&mut self, sink: &mut FrameSink) -> Result<(), TransportError> {
		while let Some(frame) = self.backlog.pop_front() {
			if let Err(e) = sink.send(WireMessage::Text(frame.clone())).await {
				self.backlog.push_front(frame);
				return Err(e);
			}
		}
		Ok(())
	}

	/// Sleep before the next attempt while still accepting outbound frames.
	/// Returns `false` when cancelled.
	async fn idle_for(&mut self, delay: Duration) -> bool {
		let sleep = tokio::time::sleep(delay);
		tokio::pin!(sleep);

		loop {
			tokio::select! {
				() = self.cancel.cancelled() => return false,
				() = &mut sleep => return true,
				Some(frame) = self.outbound.recv() => self.enqueue(frame),
			}
		}
	}

	async fn idle_until_cancelled(&mut self) {
		loop {
			tokio::select! {
				() = self.cancel.cancelled() => return,
				frame = self.outbound.recv() => match frame {
					Some(frame) => self.enqueue(frame),
					None => return,
				},
			}
		}
	}

	fn enqueue(&mut self, outbound: Outbound) {
		let Outbound { frame, scope } = outbound;
		if let Some(scope) = scope {
			trace!(%scope, "dropping frame bound to a closed connection");
			return;
		}
		match self.config.queue {
			QueuePolicy::FailFast => debug!("Dropping frame sent while disconnected"),
			QueuePolicy::Buffer { capacity } => {
				if self.backlog.len() >= capacity {
					self.backlog.pop_front();
					warn!("Backlog full ({} frames), dropping oldest queued frame", capacity);
				}
				self.backlog.push_back(frame);
			}
		}
	}

	/// Put back a frame whose write failed so it goes out first on the next open.
	fn requeue(&mut self, frame: String) {
		if matches!(self.config.queue, QueuePolicy::Buffer { .. }) {
			self.backlog.push_front(frame);
		}
	}

	fn transition(&self, transition: SessionTransition) {
		let next = self.state.borrow().apply(transition);
		match next {
			Ok(state) => {
				trace!(state = state.name(), "session state changed");
				self.state.send_replace(state);
			}
			Err(e) => warn!("{}", e),
		}
	}
}
