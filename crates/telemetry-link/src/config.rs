use crate::error::{LinkError, Result};
use crate::subscription::ReplayMode;
use crate::transport::{KeepaliveConfig, QueuePolicy, ReconnectConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Everything needed to bring a link up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
	/// WebSocket URL of the backend
	pub endpoint: String,
	/// Deadline applied to calls that don't pick their own
	pub call_timeout: Duration,
	/// How long a coalescing group stays open
	pub coalesce_window: Duration,
	pub queue: QueuePolicy,
	pub reconnect: ReconnectConfig,
	pub keepalive: KeepaliveConfig,
	pub replay: ReplayMode,
	/// Capacity of the handle -> actor command channel
	pub command_buffer: usize,
	pub connect_timeout: Option<Duration>,
}

impl Default for LinkConfig {
	fn default() -> Self {
		Self {
			endpoint: "ws://localhost:8080/ws".to_string(),
			call_timeout: Duration::from_secs(10),
			coalesce_window: Duration::from_millis(50),
			queue: QueuePolicy::default(),
			reconnect: ReconnectConfig::default(),
			keepalive: KeepaliveConfig::default(),
			replay: ReplayMode::default(),
			command_buffer: 128,
			connect_timeout: Some(Duration::from_secs(10)),
		}
	}
}

impl LinkConfig {
	pub fn new(endpoint: impl Into<String>) -> Self {
		Self {
			endpoint: endpoint.into(),
			..Self::default()
		}
	}

	/// Load configuration from environment variables, falling back to defaults.
	///
	/// # Errors
	/// `LinkError::Config` when a variable is set but can't be parsed, or the
	/// result fails [`LinkConfig::validate`].
	pub fn from_env() -> Result<Self> {
		let defaults = Self::default();

		let config = Self {
			endpoint: std::env::var("TELEMETRY_LINK_URL").unwrap_or(defaults.endpoint),
			call_timeout: env_parsed("TELEMETRY_LINK_CALL_TIMEOUT_MS")?.map_or(defaults.call_timeout, Duration::from_millis),
			coalesce_window: env_parsed("TELEMETRY_LINK_COALESCE_MS")?.map_or(defaults.coalesce_window, Duration::from_millis),
			reconnect: match env_parsed::<bool>("TELEMETRY_LINK_RECONNECT")? {
				Some(false) => ReconnectConfig::disabled(),
				_ => defaults.reconnect,
			},
			queue: match std::env::var("TELEMETRY_LINK_QUEUE") {
				Ok(value) => parse_queue(&value)?,
				Err(_) => defaults.queue,
			},
			..defaults
		};

		config.validate()?;
		Ok(config)
	}

	/// # Errors
	/// `LinkError::Config` describing the first invalid field.
	pub fn validate(&self) -> Result<()> {
		if self.endpoint.is_empty() {
			return Err(LinkError::Config("endpoint must not be empty".into()));
		}
		if self.call_timeout.is_zero() {
			return Err(LinkError::Config("call_timeout must be greater than zero".into()));
		}
		if self.queue == (QueuePolicy::Buffer { capacity: 0 }) {
			return Err(LinkError::Config("queue capacity must be greater than zero".into()));
		}
		if self.command_buffer == 0 {
			return Err(LinkError::Config("command_buffer must be greater than zero".into()));
		}
		Ok(())
	}

	pub(crate) fn session(&self) -> SessionConfig {
		SessionConfig {
			queue: self.queue,
			reconnect: self.reconnect.clone(),
			keepalive: self.keepalive.clone(),
			connect_timeout: self.connect_timeout,
		}
	}
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
	match std::env::var(name) {
		Ok(raw) => raw
			.trim()
			.parse()
			.map(Some)
			.map_err(|_| LinkError::Config(format!("{name}={raw:?} is not valid"))),
		Err(_) => Ok(None),
	}
}

fn parse_queue(value: &str) -> Result<QueuePolicy> {
	match value.trim() {
		"fail-fast" | "failfast" => Ok(QueuePolicy::FailFast),
		capacity => capacity
			.parse()
			.map(|capacity| QueuePolicy::Buffer { capacity })
			.map_err(|_| LinkError::Config(format!("TELEMETRY_LINK_QUEUE={value:?}: expected \"fail-fast\" or a capacity"))),
	}
}
