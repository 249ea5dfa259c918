#![allow(dead_code)]

use futures::channel::mpsc as wire;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_link::transport::{Connector, Duplex, KeepaliveConfig, ReconnectConfig, SessionState, TransportError, WireMessage};
use telemetry_link::{LinkConfig, TelemetryLink};
use tokio::sync::mpsc;

/// Connector whose connections land in a [`MemoryBackend`].
pub struct MemoryConnector {
	accepted: mpsc::UnboundedSender<ServerConn>,
	refuse: Arc<AtomicBool>,
	/// Delay applied to each connect attempt and to every frame the client writes.
	latency: Option<Duration>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
	async fn connect(&self) -> Result<Duplex, TransportError> {
		if let Some(latency) = self.latency {
			tokio::time::sleep(latency).await;
		}
		if self.refuse.load(Ordering::SeqCst) {
			return Err(TransportError::Connect {
				endpoint: self.endpoint().to_owned(),
				reason: "refused".into(),
			});
		}

		let (client_tx, from_client) = wire::unbounded::<WireMessage>();
		let (to_client, client_rx) = wire::unbounded::<Result<WireMessage, TransportError>>();
		self.accepted.send(ServerConn { from_client, to_client }).map_err(|_| TransportError::Closed)?;

		let latency = self.latency;
		let sink = client_tx.sink_map_err(|_| TransportError::Closed).with(move |message: WireMessage| async move {
			if let Some(latency) = latency {
				tokio::time::sleep(latency).await;
			}
			Ok::<_, TransportError>(message)
		});
		Ok(Duplex::new(sink, client_rx))
	}

	fn endpoint(&self) -> &str {
		"memory://backend"
	}
}

pub struct MemoryBackend {
	accepted: mpsc::UnboundedReceiver<ServerConn>,
	refuse: Arc<AtomicBool>,
}

impl MemoryBackend {
	pub async fn accept(&mut self) -> ServerConn {
		self.accepted.recv().await.expect("connector dropped")
	}

	pub async fn try_accept(&mut self, within: Duration) -> Option<ServerConn> {
		tokio::time::timeout(within, self.accepted.recv()).await.ok().flatten()
	}

	/// Make every following connect attempt fail.
	pub fn refuse(&self, refuse: bool) {
		self.refuse.store(refuse, Ordering::SeqCst);
	}
}

/// Server side of one in-memory connection. Dropping it closes the connection.
pub struct ServerConn {
	from_client: wire::UnboundedReceiver<WireMessage>,
	to_client: wire::UnboundedSender<Result<WireMessage, TransportError>>,
}

impl ServerConn {
	/// Next text frame the client wrote, parsed.
	pub async fn next_frame(&mut self) -> Value {
		loop {
			match self.from_client.next().await {
				Some(WireMessage::Text(text)) => return serde_json::from_str(&text).expect("client sent JSON"),
				Some(_) => {}
				None => panic!("client closed the connection"),
			}
		}
	}

	pub async fn try_frame(&mut self, within: Duration) -> Option<Value> {
		tokio::time::timeout(within, self.next_frame()).await.ok()
	}

	/// Everything the client writes until it goes quiet.
	pub async fn drain(&mut self) -> Vec<Value> {
		let mut frames = Vec::new();
		while let Some(frame) = self.try_frame(Duration::from_millis(100)).await {
			frames.push(frame);
		}
		frames
	}

	pub fn send_raw(&self, text: &str) {
		self.to_client.unbounded_send(Ok(WireMessage::Text(text.to_owned()))).expect("client stream open");
	}

	pub fn send(&self, frame: &Value) {
		self.send_raw(&frame.to_string());
	}

	pub fn reply(&self, request: &Value, result: Value) {
		self.send(&json!({"id": request["id"], "result": result}));
	}

	pub fn fail(&self, request: &Value, code: i64, message: &str) {
		self.send(&json!({"id": request["id"], "error": {"code": code, "message": message}}));
	}

	pub fn push(&self, service: &str, subsystem: &str, data: Value) {
		self.send(&json!({"subscription": {"service": service, "subsystem": subsystem, "data": data}}));
	}

	/// Push id-tagged samples the way the housekeeping backend does.
	pub fn push_samples(&self, service: &str, samples: Value) {
		self.send(&json!({"subscription": {"service": service, "data": samples}}));
	}

	/// Push one log record the way the system backend does.
	pub fn push_log(&self, record: Value) {
		self.send(&json!({"subscription": {"subsystem": "log", "exchange": "logs", "log": record}}));
	}
}

pub fn memory_backend() -> (MemoryConnector, MemoryBackend) {
	memory_backend_with_latency(None)
}

pub fn memory_backend_with_latency(latency: Option<Duration>) -> (MemoryConnector, MemoryBackend) {
	let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
	let refuse = Arc::new(AtomicBool::new(false));
	(
		MemoryConnector {
			accepted: accepted_tx,
			refuse: Arc::clone(&refuse),
			latency,
		},
		MemoryBackend {
			accepted: accepted_rx,
			refuse,
		},
	)
}

pub fn test_config() -> LinkConfig {
	LinkConfig {
		call_timeout: Duration::from_secs(1),
		coalesce_window: Duration::from_millis(50),
		keepalive: KeepaliveConfig {
			enabled: false,
			..KeepaliveConfig::default()
		},
		reconnect: ReconnectConfig {
			enabled: true,
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(1),
			backoff_multiplier: 2.0,
			max_attempts: None,
		},
		connect_timeout: None,
		..LinkConfig::new("memory://backend")
	}
}

pub fn spawn_link(config: LinkConfig) -> (TelemetryLink, MemoryBackend) {
	spawn_link_with_latency(config, None)
}

pub fn spawn_link_with_latency(config: LinkConfig, latency: Option<Duration>) -> (TelemetryLink, MemoryBackend) {
	let (connector, backend) = memory_backend_with_latency(latency);
	let link = TelemetryLink::builder(config).spawn(connector).expect("valid config");
	(link, backend)
}

pub async fn wait_open(link: &TelemetryLink) {
	link.watch_state().wait_for(SessionState::is_open).await.expect("session task alive");
}

pub async fn wait_closed(link: &TelemetryLink) {
	link.watch_state().wait_for(|state| !state.is_open()).await.expect("session task alive");
}

/// Let every task run until the runtime is idle.
pub async fn settle() {
	tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn methods(frames: &[Value]) -> Vec<&str> {
	frames.iter().filter_map(|frame| frame["method"].as_str()).collect()
}

pub fn count_method(frames: &[Value], method: &str) -> usize {
	methods(frames).into_iter().filter(|m| *m == method).count()
}
