//! Semi-structured payloads delivered by the form server.
//!
//! Nested groups of a submission are kept as they arrived. Readers go through the typed
//! accessors below instead of indexing raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Value);

impl Default for Document {
	fn default() -> Self {
		Self(Value::Object(Map::new()))
	}
}

impl Document {
	#[must_use]
	pub const fn new(value: Value) -> Self {
		Self(value)
	}

	/// Builds a document from a submission field. Forms sometimes deliver groups as JSON
	/// encoded strings; those are decoded, anything undecodable is kept as the raw string.
	#[must_use]
	pub fn from_field(value: Option<&Value>) -> Self {
		match value {
			None | Some(Value::Null) => Self::default(),
			Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
				.ok()
				.filter(|parsed| parsed.is_object() || parsed.is_array())
				.map_or_else(|| Self(Value::String(raw.clone())), Self),
			Some(other) => Self(other.clone()),
		}
	}

	/// Looks up a dotted path, numeric segments index into arrays: `"coordinates.1"`.
	#[must_use]
	pub fn get(&self, path: &str) -> Option<&Value> {
		lookup(&self.0, path)
	}

	/// Trimmed, non-empty textual value. Numbers and booleans are rendered as text.
	#[must_use]
	pub fn text(&self, path: &str) -> Option<String> {
		self.get(path).and_then(value_text)
	}

	/// Numeric value, accepting numbers and numeric strings.
	#[must_use]
	pub fn number(&self, path: &str) -> Option<f64> {
		self.get(path).and_then(value_number)
	}

	#[must_use]
	pub const fn as_value(&self) -> &Value {
		&self.0
	}

	#[must_use]
	pub fn into_value(self) -> Value {
		self.0
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		match &self.0 {
			Value::Null => true,
			Value::Object(map) => map.is_empty(),
			Value::Array(items) => items.is_empty(),
			Value::String(s) => s.is_empty(),
			Value::Bool(_) | Value::Number(_) => false,
		}
	}
}

impl From<Document> for Value {
	fn from(doc: Document) -> Self {
		doc.0
	}
}

impl From<Value> for Document {
	fn from(value: Value) -> Self {
		Self(value)
	}
}

pub(crate) fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
	path.split('.')
		.filter(|segment| !segment.is_empty())
		.try_fold(value, |current, segment| match current {
			Value::Object(map) => map.get(segment),
			Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
			_ => None,
		})
		.filter(|found| !found.is_null())
}

pub(crate) fn value_text(value: &Value) -> Option<String> {
	match value {
		Value::String(s) => {
			let trimmed = s.trim();
			(!trimmed.is_empty()).then(|| trimmed.to_string())
		}
		Value::Number(n) => Some(n.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		Value::Null | Value::Array(_) | Value::Object(_) => None,
	}
}

pub(crate) fn value_number(value: &Value) -> Option<f64> {
	match value {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.trim().parse::<f64>().ok(),
		_ => None,
	}
	.filter(|n| n.is_finite())
}
