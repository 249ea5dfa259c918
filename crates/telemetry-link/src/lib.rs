// telemetry-link
//
// Client core for talking to a telemetry backend over one reconnecting
// connection: correlated request/response calls, deduplicated push
// subscriptions that survive reconnects, and coalescing of bursts of
// related requests into single backend calls.

pub mod actor;
pub mod coalesce;
pub mod config;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod subscription;
pub mod transport;

pub use actor::{CallHandle, LinkBuilder, LinkStats, Subscription, TelemetryLink};
pub use coalesce::{BatchQuery, BatchStrategy, HousekeepingBatch, KeyedBatch};
pub use config::LinkConfig;
pub use error::{LinkError, Result};
pub use subscription::{ReplayMode, SubscriptionKey, SubscriptionToken};
pub use transport::{Connector, Duplex, QueuePolicy, ReconnectConfig, SessionState, TransportError, WireMessage, WsConnector};
