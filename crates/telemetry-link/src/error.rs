use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors surfaced to callers of the link.
///
/// `Clone` so a single failure can be handed to every participant of a
/// coalesced request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
	#[error("not connected to the backend")]
	NotConnected,

	#[error("{service}.{method} timed out after {}ms", after.as_millis())]
	Timeout { service: String, method: String, after: Duration },

	#[error("backend error {code}: {message}")]
	Remote { code: i64, message: String },

	#[error("link actor unavailable")]
	ActorUnavailable,

	#[error("link shut down")]
	Shutdown,

	#[error("transport error: {0}")]
	Transport(String),

	#[error("serialization error: {0}")]
	Serialization(String),

	#[error("invalid configuration: {0}")]
	Config(String),
}

impl LinkError {
	#[must_use]
	pub const fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout { .. })
	}
}

impl From<serde_json::Error> for LinkError {
	fn from(err: serde_json::Error) -> Self {
		Self::Serialization(err.to_string())
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
	fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
		Self::ActorUnavailable
	}
}

impl From<tokio::sync::oneshot::error::RecvError> for LinkError {
	fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
		Self::ActorUnavailable
	}
}
