use thiserror::Error;

/// Connector and socket level failures.
#[derive(Error, Debug)]
pub enum TransportError {
	#[error("websocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("connection closed")]
	Closed,

	#[error("connect to {endpoint} failed: {reason}")]
	Connect { endpoint: String, reason: String },

	#[error("{0}")]
	Other(String),
}

impl From<TransportError> for crate::LinkError {
	fn from(err: TransportError) -> Self {
		Self::Transport(err.to_string())
	}
}
