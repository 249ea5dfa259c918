mod connector;
mod error;
mod retry;
mod session;
mod state;

pub use connector::{Connector, Duplex, FrameSink, FrameStream, WireMessage, WsConnector};
pub use error::TransportError;
pub use retry::{ReconnectConfig, RetryPolicy};
pub use session::{KeepaliveConfig, QueuePolicy, SessionConfig, SessionEvent, SessionHandle, TransportSession};
pub use state::{ConnectionId, SessionState, SessionTransition, StateError};
