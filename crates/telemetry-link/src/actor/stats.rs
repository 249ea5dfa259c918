use serde::Serialize;

/// Counters kept by the link actor. Gauges are sampled when the snapshot is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
	pub connections: u64,
	pub calls_sent: u64,
	pub responses: u64,
	pub remote_errors: u64,
	pub timeouts: u64,
	pub unknown_responses: u64,
	pub malformed_frames: u64,
	pub ignored_frames: u64,
	pub pushes_delivered: u64,
	pub pushes_dropped: u64,
	pub requests: u64,
	pub requests_coalesced: u64,
	pub batches_flushed: u64,

	pub pending_calls: usize,
	pub subscribed_keys: usize,
	pub open_groups: usize,
}
