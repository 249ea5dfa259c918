use super::TransportError;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as TungsteniteMessage};
use tracing::{debug, instrument};

/// One unit on the wire as the session sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
	Text(String),
	Ping(Vec<u8>),
	Pong(Vec<u8>),
	Close,
}

pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;

/// Both halves of one open connection.
pub struct Duplex {
	pub sink: FrameSink,
	pub stream: FrameStream,
}

impl Duplex {
	pub fn new<Si, St>(sink: Si, stream: St) -> Self
	where
		Si: Sink<WireMessage, Error = TransportError> + Send + 'static,
		St: Stream<Item = Result<WireMessage, TransportError>> + Send + 'static,
	{
		Self {
			sink: Box::pin(sink),
			stream: Box::pin(stream),
		}
	}
}

/// Opens duplex connections to one fixed endpoint.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
	async fn connect(&self) -> Result<Duplex, TransportError>;

	fn endpoint(&self) -> &str;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
	url: String,
}

impl WsConnector {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}
}

#[async_trait::async_trait]
impl Connector for WsConnector {
	#[instrument(skip(self), fields(url = %self.url))]
	async fn connect(&self) -> Result<Duplex, TransportError> {
		let (ws_stream, response) = connect_async(self.url.as_str()).await?;
		debug!(status = %response.status(), "websocket handshake complete");

		let (sink, stream) = ws_stream.split();
		let sink = sink
			.sink_map_err(TransportError::from)
			.with(|message: WireMessage| future::ready(Ok::<_, TransportError>(TungsteniteMessage::from(message))));
		let stream = stream.filter_map(|message| {
			future::ready(match message {
				Ok(message) => WireMessage::from_tungstenite(message).map(Ok),
				Err(e) => Some(Err(TransportError::from(e))),
			})
		});

		Ok(Duplex::new(sink, stream))
	}

	fn endpoint(&self) -> &str {
		&self.url
	}
}

impl WireMessage {
	fn from_tungstenite(message: TungsteniteMessage) -> Option<Self> {
		match message {
			TungsteniteMessage::Text(text) => Some(Self::Text(text.as_str().to_owned())),
			// Some backends ship JSON in binary frames.
			TungsteniteMessage::Binary(data) => String::from_utf8(data.to_vec()).ok().map(Self::Text),
			TungsteniteMessage::Ping(data) => Some(Self::Ping(data.to_vec())),
			TungsteniteMessage::Pong(data) => Some(Self::Pong(data.to_vec())),
			TungsteniteMessage::Close(_) => Some(Self::Close),
			TungsteniteMessage::Frame(_) => None,
		}
	}
}

impl From<WireMessage> for TungsteniteMessage {
	fn from(message: WireMessage) -> Self {
		match message {
			WireMessage::Text(text) => Self::Text(text.into()),
			WireMessage::Ping(data) => Self::Ping(data.into()),
			WireMessage::Pong(data) => Self::Pong(data.into()),
			WireMessage::Close => Self::Close(None),
		}
	}
}
