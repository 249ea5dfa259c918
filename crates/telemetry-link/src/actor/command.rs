use super::stats::LinkStats;
use crate::coalesce::{BatchQuery, Participant};
use crate::correlation::CallResult;
use crate::subscription::{Consumer, SubscriptionKey, SubscriptionToken};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages handled by the link actor
#[derive(Debug)]
pub enum LinkCommand {
	Call {
		service: String,
		method: String,
		params: Value,
		/// `None` uses the configured default
		timeout: Option<Duration>,
		reply: oneshot::Sender<CallResult>,
	},

	Subscribe {
		key: SubscriptionKey,
		consumer: Consumer,
		reply: oneshot::Sender<SubscriptionToken>,
	},

	Unsubscribe { token: SubscriptionToken },

	Request { query: BatchQuery, participant: Participant },

	Stats { reply: oneshot::Sender<LinkStats> },

	Shutdown,
}
