use std::fmt;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one successfully opened physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for ConnectionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Connecting { attempt: u32, started_at: Instant },
	Open { connection_id: ConnectionId, opened_at: Instant },
	Closed { reason: String },
}

impl SessionState {
	#[must_use]
	pub const fn is_open(&self) -> bool {
		matches!(self, Self::Open { .. })
	}

	#[must_use]
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Connecting { .. } => "connecting",
			Self::Open { .. } => "open",
			Self::Closed { .. } => "closed",
		}
	}
}

#[derive(Debug, Clone)]
pub enum SessionTransition {
	/// `attempt` counts from 1 since the last open connection.
	StartConnecting { attempt: u32 },
	Established(ConnectionId),
	ConnectFailed(String),
	Lost(String),
	Stopped,
}

#[derive(Debug, Error)]
pub enum StateError {
	#[error("invalid session transition from {from} on {transition:?}")]
	InvalidTransition { from: &'static str, transition: SessionTransition },
}

impl SessionState {
	pub(crate) fn initial() -> Self {
		Self::Closed { reason: "not started".into() }
	}

	/// Validate a transition and produce the next state.
	pub fn apply(&self, transition: SessionTransition) -> Result<Self, StateError> {
		use SessionTransition::{ConnectFailed, Established, Lost, StartConnecting, Stopped};

		let next = match (self, transition) {
			(Self::Closed { .. } | Self::Connecting { .. }, StartConnecting { attempt }) => Self::Connecting {
				attempt,
				started_at: Instant::now(),
			},
			(Self::Connecting { .. }, Established(connection_id)) => Self::Open {
				connection_id,
				opened_at: Instant::now(),
			},
			(Self::Connecting { .. }, ConnectFailed(reason) | Lost(reason)) | (Self::Open { .. }, Lost(reason)) => Self::Closed { reason },
			(_, Stopped) => Self::Closed { reason: "shut down".into() },
			(current, transition) => {
				return Err(StateError::InvalidTransition {
					from: current.name(),
					transition,
				})
			}
		};

		Ok(next)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connect_open_lose_cycle() {
		let state = SessionState::initial();
		let state = state.apply(SessionTransition::StartConnecting { attempt: 1 }).unwrap();
		assert!(matches!(state, SessionState::Connecting { attempt: 1, .. }));

		let id = ConnectionId::new();
		let state = state.apply(SessionTransition::Established(id)).unwrap();
		assert!(state.is_open());

		let state = state.apply(SessionTransition::Lost("reset".into())).unwrap();
		assert_eq!(state, SessionState::Closed { reason: "reset".into() });
	}

	#[test]
	fn failed_attempt_closes() {
		let state = SessionState::initial().apply(SessionTransition::StartConnecting { attempt: 1 }).unwrap();
		let state = state.apply(SessionTransition::ConnectFailed("refused".into())).unwrap();
		assert_eq!(state.name(), "closed");
	}

	#[test]
	fn retry_after_failure_reports_its_attempt() {
		let state = SessionState::initial().apply(SessionTransition::StartConnecting { attempt: 1 }).unwrap();
		let state = state.apply(SessionTransition::ConnectFailed("refused".into())).unwrap();
		let state = state.apply(SessionTransition::StartConnecting { attempt: 2 }).unwrap();
		assert!(matches!(state, SessionState::Connecting { attempt: 2, .. }));
	}

	#[test]
	fn open_requires_connecting() {
		let err = SessionState::initial().apply(SessionTransition::Established(ConnectionId::new())).unwrap_err();
		assert!(matches!(err, StateError::InvalidTransition { from: "closed", .. }));
	}

	#[test]
	fn stop_is_always_allowed() {
		let open = SessionState::Open {
			connection_id: ConnectionId::new(),
			opened_at: Instant::now(),
		};
		assert_eq!(open.apply(SessionTransition::Stopped).unwrap().name(), "closed");
	}
}
