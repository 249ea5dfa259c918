use super::command::LinkCommand;
use super::stats::LinkStats;
use super::LinkActor;
use crate::coalesce::{BatchQuery, BatchStrategy, Coalescer, Participant};
use crate::config::LinkConfig;
use crate::correlation::CallResult;
use crate::error::{LinkError, Result};
use crate::subscription::{Consumer, SubscriptionKey, SubscriptionRegistry, SubscriptionToken};
use crate::transport::{Connector, SessionHandle, SessionState, TransportSession, WsConnector};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cloneable handle to a running link.
///
/// Exposes calls, subscriptions and coalesced requests; frames and the
/// socket stay internal.
#[derive(Clone, Debug)]
pub struct TelemetryLink {
	sender: mpsc::Sender<LinkCommand>,
	session: SessionHandle,
	cancel: CancellationToken,
}

impl TelemetryLink {
	/// Start a link to `config.endpoint` over WebSocket.
	///
	/// # Errors
	/// `LinkError::Config` if the configuration is invalid.
	pub fn connect(config: LinkConfig) -> Result<Self> {
		let connector = WsConnector::new(config.endpoint.clone());
		LinkBuilder::new(config).spawn(connector)
	}

	#[must_use]
	pub fn builder(config: LinkConfig) -> LinkBuilder {
		LinkBuilder::new(config)
	}

	/// Call `service.method` with the default deadline and wait for the answer.
	///
	/// # Errors
	/// `Timeout`, `Remote`, `NotConnected` (fail-fast queueing) or `Shutdown`.
	pub async fn call(&self, service: &str, method: &str, params: Value) -> Result<Value> {
		self.start_call(service, method, params, None).await?.await
	}

	/// # Errors
	/// Same as [`TelemetryLink::call`].
	pub async fn call_with_timeout(&self, service: &str, method: &str, params: Value, timeout: Duration) -> Result<Value> {
		self.start_call(service, method, params, Some(timeout)).await?.await
	}

	/// Issue a call and return as soon as it is registered. Dropping the
	/// returned handle abandons interest without touching the wire.
	///
	/// # Errors
	/// `ActorUnavailable` if the link is gone.
	pub async fn start_call(&self, service: &str, method: &str, params: Value, timeout: Option<Duration>) -> Result<CallHandle> {
		let (reply, rx) = oneshot::channel();
		self
			.sender
			.send(LinkCommand::Call {
				service: service.to_owned(),
				method: method.to_owned(),
				params,
				timeout,
				reply,
			})
			.await?;

		Ok(CallHandle { rx })
	}

	/// Invoke `on_data` for every push on `(service, key)`.
	///
	/// # Errors
	/// `ActorUnavailable` if the link is gone.
	pub async fn subscribe<F>(&self, service: &str, key: &str, on_data: F) -> Result<Subscription>
	where
		F: Fn(&Value) + Send + Sync + 'static,
	{
		self.register(SubscriptionKey::new(service, key), Consumer::callback(on_data)).await
	}

	/// Like [`TelemetryLink::subscribe`] but pushes arrive on a channel.
	/// Dropping the receiver unsubscribes on the next push.
	///
	/// # Errors
	/// `ActorUnavailable` if the link is gone.
	pub async fn subscribe_channel(&self, service: &str, key: &str) -> Result<(Subscription, mpsc::UnboundedReceiver<Value>)> {
		let (tx, rx) = mpsc::unbounded_channel();
		let subscription = self.register(SubscriptionKey::new(service, key), Consumer::Channel(tx)).await?;
		Ok((subscription, rx))
	}

	async fn register(&self, key: SubscriptionKey, consumer: Consumer) -> Result<Subscription> {
		let (reply, rx) = oneshot::channel();
		self
			.sender
			.send(LinkCommand::Subscribe {
				key: key.clone(),
				consumer,
				reply,
			})
			.await?;

		Ok(Subscription {
			token: rx.await?,
			key,
			sender: Some(self.sender.clone()),
		})
	}

	/// Detach one consumer. Unknown or already-removed tokens are ignored.
	///
	/// # Errors
	/// `ActorUnavailable` if the link is gone.
	pub async fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
		self.sender.send(LinkCommand::Unsubscribe { token }).await.map_err(LinkError::from)
	}

	/// Ask for `key` within `query`. Requests with the same query made in the
	/// same coalescing window share one backend call.
	///
	/// # Errors
	/// The shared call's error, delivered to every participant.
	pub async fn request(&self, query: BatchQuery, key: &str) -> Result<Value> {
		let (reply, rx) = oneshot::channel();
		self
			.sender
			.send(LinkCommand::Request {
				query,
				participant: Participant::new(key, reply),
			})
			.await?;

		CallHandle { rx }.await
	}

	/// # Errors
	/// `ActorUnavailable` if the link is gone.
	pub async fn stats(&self) -> Result<LinkStats> {
		let (reply, rx) = oneshot::channel();
		self.sender.send(LinkCommand::Stats { reply }).await?;
		Ok(rx.await?)
	}

	#[must_use]
	pub fn state(&self) -> SessionState {
		self.session.state()
	}

	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.session.state().is_open()
	}

	/// Observe session state changes.
	#[must_use]
	pub fn watch_state(&self) -> watch::Receiver<SessionState> {
		self.session.watch()
	}

	/// Stop the actor and the session. Pending calls resolve with `Shutdown`.
	pub async fn shutdown(&self) {
		if self.sender.send(LinkCommand::Shutdown).await.is_err() {
			debug!("Link actor already stopped");
		}
		self.cancel.cancel();
	}
}

/// Spawns a link with non-default collaborators.
pub struct LinkBuilder {
	config: LinkConfig,
	strategies: Vec<(String, Arc<dyn BatchStrategy>)>,
	cancel: Option<CancellationToken>,
}

impl LinkBuilder {
	#[must_use]
	pub fn new(config: LinkConfig) -> Self {
		Self {
			config,
			strategies: Vec::new(),
			cancel: None,
		}
	}

	/// Merge and split coalesced requests for `service` with `strategy`.
	#[must_use]
	pub fn strategy(mut self, service: impl Into<String>, strategy: impl BatchStrategy) -> Self {
		let strategy: Arc<dyn BatchStrategy> = Arc::new(strategy);
		self.strategies.push((service.into(), strategy));
		self
	}

	/// Tie the link's lifetime to `parent`.
	#[must_use]
	pub fn cancel_token(mut self, parent: &CancellationToken) -> Self {
		self.cancel = Some(parent.child_token());
		self
	}

	/// Spawn the session and actor tasks. Must be called inside a Tokio runtime.
	///
	/// # Errors
	/// `LinkError::Config` if the configuration is invalid.
	pub fn spawn<C: Connector>(self, connector: C) -> Result<TelemetryLink> {
		self.config.validate()?;
		let cancel = self.cancel.unwrap_or_default();

		let (event_tx, event_rx) = mpsc::channel(self.config.command_buffer);
		let (session, _session_task) = TransportSession::spawn(connector, self.config.session(), event_tx, cancel.clone());

		let mut coalescer = Coalescer::new(self.config.coalesce_window);
		for (service, strategy) in self.strategies {
			coalescer.register_strategy(service, strategy);
		}

		let (sender, commands) = mpsc::channel(self.config.command_buffer);
		let actor = LinkActor::new(
			commands,
			event_rx,
			session.clone(),
			SubscriptionRegistry::new(self.config.replay),
			coalescer,
			self.config.call_timeout,
			cancel.clone(),
		);
		tokio::spawn(actor.run());

		Ok(TelemetryLink { sender, session, cancel })
	}
}

/// Pending result of one call.
#[derive(Debug)]
pub struct CallHandle {
	rx: oneshot::Receiver<CallResult>,
}

impl Future for CallHandle {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx).poll(cx).map(|received| received.unwrap_or_else(|_| Err(LinkError::Shutdown)))
	}
}

/// One registered consumer. Dropping it unsubscribes, like [`Subscription::unsubscribe`]
/// without waiting.
#[derive(Debug)]
pub struct Subscription {
	token: SubscriptionToken,
	key: SubscriptionKey,
	sender: Option<mpsc::Sender<LinkCommand>>,
}

impl Subscription {
	#[must_use]
	pub const fn token(&self) -> SubscriptionToken {
		self.token
	}

	#[must_use]
	pub const fn key(&self) -> &SubscriptionKey {
		&self.key
	}

	/// # Errors
	/// `ActorUnavailable` if the link is gone.
	pub async fn unsubscribe(mut self) -> Result<()> {
		let Some(sender) = self.sender.take() else { return Ok(()) };
		sender.send(LinkCommand::Unsubscribe { token: self.token }).await.map_err(LinkError::from)
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		let Some(sender) = self.sender.take() else { return };
		let command = LinkCommand::Unsubscribe { token: self.token };
		match sender.try_send(command) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(command)) => match tokio::runtime::Handle::try_current() {
				Ok(runtime) => {
					runtime.spawn(async move {
						let _ = sender.send(command).await;
					});
				}
				Err(_) => debug!(key = %self.key, "No runtime to unsubscribe dropped subscription"),
			},
			Err(mpsc::error::TrySendError::Closed(_)) => debug!(key = %self.key, "Link gone before dropped subscription could unsubscribe"),
		}
	}
}
