use super::BatchQuery;
use serde_json::{json, Map, Value};

/// How one service merges participant keys into a call and splits the answer.
pub trait BatchStrategy: Send + Sync + 'static {
	/// Params for the single outbound call. `keys` is the de-duplicated union.
	fn params(&self, query: &BatchQuery, keys: &[String]) -> Value;

	/// The part of `result` that belongs to `participant`.
	fn partition(&self, participant: &str, result: &Value) -> Value;
}

/// Housekeeping history: `{key: ["sat.subsystem.field", ...], options}` in,
/// `{subsystem, housekeeping: [row, ...]}` out. The query target is the
/// `sat.subsystem` prefix and participants name bare fields.
///
/// Rows come either as id-tagged samples (`{id: "fs1.eps.temp", timestamp, value}`)
/// or keyed by field (`{timestamp, temp: ..., volt: ...}`).
#[derive(Debug, Default, Clone, Copy)]
pub struct HousekeepingBatch;

impl BatchStrategy for HousekeepingBatch {
	fn params(&self, query: &BatchQuery, keys: &[String]) -> Value {
		let ids: Vec<String> = keys.iter().map(|field| format!("{}.{}", query.target, field)).collect();
		json!({
			"key": ids,
			"options": query.options,
		})
	}

	fn partition(&self, participant: &str, result: &Value) -> Value {
		let rows: Vec<Value> = result
			.get("housekeeping")
			.and_then(Value::as_array)
			.into_iter()
			.flatten()
			.filter_map(|row| slice_row(row, participant))
			.collect();

		json!({
			"subsystem": result.get("subsystem").cloned().unwrap_or(Value::Null),
			"housekeeping": rows,
		})
	}
}

fn slice_row(row: &Value, field: &str) -> Option<Value> {
	let row = row.as_object()?;

	if let Some(id) = row.get("id").and_then(Value::as_str) {
		return (id.rsplit('.').next() == Some(field)).then(|| Value::Object(row.clone()));
	}

	let value = row.get(field)?;
	let mut slice = Map::new();
	if let Some(timestamp) = row.get("timestamp") {
		slice.insert("timestamp".to_owned(), timestamp.clone());
	}
	slice.insert(field.to_owned(), value.clone());
	Some(Value::Object(slice))
}

/// Generic shape: `{target, keys, options}` in, an object keyed by participant out.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyedBatch;

impl BatchStrategy for KeyedBatch {
	fn params(&self, query: &BatchQuery, keys: &[String]) -> Value {
		json!({
			"target": query.target,
			"keys": keys,
			"options": query.options,
		})
	}

	fn partition(&self, participant: &str, result: &Value) -> Value {
		result.get(participant).cloned().unwrap_or(Value::Null)
	}
}
