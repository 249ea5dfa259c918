//! Wire frames exchanged with the backend.
//!
//! Outbound: `{service, method, params, id}`.
//! Inbound: `{id, result}`, `{id, error: {code, message}}` or
//! `{subscription: {service, subsystem | key, ...}}`. Housekeeping pushes
//! carry id-tagged samples instead of a key:
//! `{subscription: {service, data: [{id: "fs1.eps.temp", ...}]}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// Service assumed for pushes that name a subsystem but no service (log pushes).
pub const SYSTEM_SERVICE: &str = "system";

/// Correlation id of one call. Unique among outstanding calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
	pub service: String,
	pub method: String,
	pub params: Value,
	pub id: CallId,
}

impl OutboundFrame {
	pub fn encode(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}
}

/// Params carried by subscribe/unsubscribe frames.
#[must_use]
pub fn subscription_params(keys: &[String]) -> Value {
	json!({ "fields": keys })
}

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame is not valid JSON: {0}")]
	Malformed(#[from] serde_json::Error),

	#[error("frame is not a JSON object")]
	NotAnObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
	Response { id: CallId, result: Value },
	Failure { id: CallId, code: i64, message: String },
	/// One push, already split per subscription key it concerns.
	Push { service: String, items: Vec<PushItem> },
	/// Valid JSON that is neither RPC nor push traffic.
	Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushItem {
	pub key: String,
	pub payload: Value,
}

#[derive(Deserialize)]
struct RawInbound {
	#[serde(default)]
	id: Value,
	#[serde(default)]
	result: Value,
	error: Option<RawError>,
	subscription: Option<Value>,
}

#[derive(Deserialize)]
struct RawError {
	#[serde(default)]
	code: i64,
	#[serde(default)]
	message: String,
}

impl InboundFrame {
	pub fn parse(text: &str) -> Result<Self, FrameError> {
		let value: Value = serde_json::from_str(text)?;
		if !value.is_object() {
			return Err(FrameError::NotAnObject);
		}
		let raw: RawInbound = serde_json::from_value(value)?;

		if let Some(id) = parse_id(&raw.id) {
			return Ok(match raw.error {
				Some(error) => Self::Failure {
					id,
					code: error.code,
					message: error.message,
				},
				None => Self::Response { id, result: raw.result },
			});
		}

		Ok(raw.subscription.and_then(push_from).unwrap_or(Self::Other))
	}
}

fn parse_id(id: &Value) -> Option<CallId> {
	match id {
		Value::Number(n) => n.as_u64().map(CallId),
		Value::String(s) => s.parse().ok().map(CallId),
		_ => None,
	}
}

fn push_from(payload: Value) -> Option<InboundFrame> {
	let object = payload.as_object()?;
	let keyed = object.get("subsystem").or_else(|| object.get("key")).and_then(Value::as_str).map(str::to_owned);

	let service = match object.get("service") {
		Some(service) => service.as_str()?.to_owned(),
		None if keyed.is_some() => SYSTEM_SERVICE.to_owned(),
		None => return None,
	};

	if let Some(key) = keyed {
		return Some(InboundFrame::Push {
			service,
			items: vec![PushItem { key, payload }],
		});
	}

	let items = route_samples(&service, object.get("data")?.as_array()?);
	(!items.is_empty()).then_some(InboundFrame::Push { service, items })
}

/// Route `{id: "sat.subsystem.field", ...}` samples to both the field id and
/// its `sat.subsystem` prefix. Each key gets a payload holding only its samples.
fn route_samples(service: &str, samples: &[Value]) -> Vec<PushItem> {
	let mut routes: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
	for sample in samples {
		let Some(id) = sample.get("id").and_then(Value::as_str) else {
			continue;
		};
		routes.entry(id).or_default().push(sample.clone());
		if let Some((prefix, _)) = id.rsplit_once('.') {
			routes.entry(prefix).or_default().push(sample.clone());
		}
	}

	routes
		.into_iter()
		.map(|(key, data)| PushItem {
			key: key.to_owned(),
			payload: json!({ "service": service, "data": data }),
		})
		.collect()
}
