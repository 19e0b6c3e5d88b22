//! Turns raw OData records into typed rows.
//!
//! Nothing in here touches the network or the database, every function is a pure mapping
//! from a JSON record to a row or a [`Rejection`].

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::document::{lookup, value_text, Document};

/// Fields the main table stores in dedicated columns, everything else lands in `extra`.
const MAIN_KNOWN_FIELDS: &[&str] = &[
	"UUID",
	"__id",
	"__system",
	"meta",
	"property_location",
	"property_description",
	"End",
	"start",
	"end",
	"survey_start",
	"survey_end",
	"today",
	"survey_date",
];

const CHILD_KNOWN_FIELDS: &[&str] = &[
	"UUID",
	"__id",
	"__Submissions-id",
	"meta",
	"person_type",
	"occupancy",
];

const PARENT_FIELD: &str = "__Submissions-id";
const NAVIGATION_LINK_SUFFIX: &str = "@odata.navigationLink";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
	#[error("record is not a JSON object")]
	NotAnObject,
	#[error("record has none of UUID, __id or meta.instanceID")]
	MissingKey,
	#[error("child record has no parent submission <key='{0}'>")]
	MissingParent(String),
}

/// Where a submission's image can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
	/// Already hosted somewhere, downloaded as is
	Absolute(Url),
	/// Attachment of the submission, resolved against the form server
	Filename(String),
}

impl ImageReference {
	/// `None` for blank values and for `http(s)` strings that aren't valid URLs.
	#[must_use]
	pub fn parse(raw: &str) -> Option<Self> {
		let raw = raw.trim();
		if raw.is_empty() {
			return None;
		}

		let lowered = raw.to_ascii_lowercase();
		if lowered.starts_with("http://") || lowered.starts_with("https://") {
			return Url::parse(raw).ok().map(Self::Absolute);
		}

		raw.rsplit('/')
			.next()
			.filter(|name| !name.is_empty())
			.map(|name| Self::Filename(name.to_string()))
	}

	/// Name of the file, used to build the destination key.
	#[must_use]
	pub fn filename(&self) -> Option<String> {
		match self {
			Self::Absolute(url) => url
				.path_segments()
				.and_then(|mut segments| segments.next_back())
				.filter(|name| !name.is_empty())
				.map(str::to_string),
			Self::Filename(name) => Some(name.clone()),
		}
	}

	/// The form persisted in the `*_reference` columns, [`ImageReference::parse`] reads it back.
	#[must_use]
	pub fn as_stored(&self) -> String {
		match self {
			Self::Absolute(url) => url.to_string(),
			Self::Filename(name) => name.clone(),
		}
	}
}

/// An image copied to object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
	pub key: String,
	pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MainRow {
	pub uuid: String,
	pub instance_id: Option<String>,
	pub submitted_at: Option<DateTime<Utc>>,
	pub survey_start: Option<DateTime<Utc>>,
	pub survey_end: Option<DateTime<Utc>>,
	pub survey_date: Option<NaiveDate>,
	pub location: Document,
	pub description: Document,
	pub system: Document,
	pub follow_up: Document,
	pub meta: Document,
	pub extra: Document,
	pub child_link: Option<String>,
	pub image_reference: Option<ImageReference>,
	pub image: Option<StoredImage>,
	pub plus_code_reference: Option<ImageReference>,
	pub plus_code: Option<StoredImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
	/// Always `{parent_uuid}_{child id}`
	pub uuid: String,
	pub parent_uuid: String,
	pub instance_id: Option<String>,
	pub position: Option<i32>,
	pub person_type: Document,
	pub occupancy: Document,
	pub attributes: Document,
}

pub fn normalize_main(raw: &Value) -> Result<MainRow, Rejection> {
	let record = raw.as_object().ok_or(Rejection::NotAnObject)?;
	let uuid = natural_key(raw).ok_or(Rejection::MissingKey)?;

	let location = Document::from_field(record.get("property_location"));
	let description = Document::from_field(record.get("property_description"));
	let system = Document::from_field(record.get("__system"));
	let meta = Document::from_field(record.get("meta"));

	let image_reference = description
		.text("building_image")
		.or_else(|| building_image_field(record))
		.as_deref()
		.and_then(ImageReference::parse);

	let plus_code_reference = location
		.text("address_plus_code_image")
		.as_deref()
		.and_then(ImageReference::parse);

	let child_link = record
		.iter()
		.find(|(name, _)| name.ends_with(NAVIGATION_LINK_SUFFIX))
		.and_then(|(_, link)| value_text(link));

	Ok(MainRow {
		instance_id: meta.text("instanceID").or_else(|| text_field(record, "__id")),
		submitted_at: system.get("submissionDate").and_then(parse_timestamp),
		survey_start: first_field(record, &["start", "survey_start"]).and_then(parse_timestamp),
		survey_end: first_field(record, &["end", "survey_end"]).and_then(parse_timestamp),
		survey_date: first_field(record, &["today", "survey_date"]).and_then(parse_date),
		follow_up: Document::from_field(record.get("End")),
		extra: extra_fields(record, MAIN_KNOWN_FIELDS),
		uuid,
		location,
		description,
		system,
		meta,
		child_link,
		image_reference,
		image: None,
		plus_code_reference,
		plus_code: None,
	})
}

pub fn normalize_child(raw: &Value) -> Result<ChildRow, Rejection> {
	let record = raw.as_object().ok_or(Rejection::NotAnObject)?;
	let key = natural_key(raw).ok_or(Rejection::MissingKey)?;
	let explicit_parent = text_field(record, PARENT_FIELD);

	let (uuid, parent_uuid) = canonical_child_key(&key, explicit_parent.as_deref())?;

	let position = uuid
		.split_once('_')
		.and_then(|(_, suffix)| suffix.parse::<i32>().ok());

	Ok(ChildRow {
		instance_id: lookup(raw, "meta.instanceID").and_then(value_text),
		person_type: Document::from_field(record.get("person_type")),
		occupancy: Document::from_field(record.get("occupancy")),
		attributes: extra_fields(record, CHILD_KNOWN_FIELDS),
		uuid,
		parent_uuid,
		position,
	})
}

/// `UUID`, then `__id`, then `meta.instanceID`.
#[must_use]
pub fn natural_key(raw: &Value) -> Option<String> {
	["UUID", "__id", "meta.instanceID"]
		.into_iter()
		.find_map(|path| lookup(raw, path).and_then(value_text))
}

/// Child keys are `{parent}_{child}` and the prefix always names the parent. `__Submissions-id`
/// is the parent's server side `__id`, not its `UUID`, so it only completes keys lacking the
/// separator.
fn canonical_child_key(key: &str, explicit: Option<&str>) -> Result<(String, String), Rejection> {
	match (key.split_once('_'), explicit) {
		(Some((prefix, _)), _) if !prefix.is_empty() => Ok((key.to_string(), prefix.to_string())),
		(None, Some(explicit)) if !explicit.contains('_') => {
			Ok((format!("{explicit}_{key}"), explicit.to_string()))
		}
		_ => Err(Rejection::MissingParent(key.to_string())),
	}
}

fn building_image_field(record: &Map<String, Value>) -> Option<String> {
	record
		.iter()
		.filter(|(name, _)| {
			let name = name.to_ascii_lowercase();
			name.contains("building") && name.contains("image")
		})
		.find_map(|(_, value)| value_text(value))
}

fn extra_fields(record: &Map<String, Value>, known: &[&str]) -> Document {
	Document::new(Value::Object(
		record
			.iter()
			.filter(|(name, _)| !known.contains(&name.as_str()) && !name.contains("@odata."))
			.map(|(name, value)| (name.clone(), value.clone()))
			.collect(),
	))
}

fn text_field(record: &Map<String, Value>, name: &str) -> Option<String> {
	record.get(name).and_then(value_text)
}

fn first_field<'r>(record: &'r Map<String, Value>, names: &[&str]) -> Option<&'r Value> {
	names
		.iter()
		.find_map(|name| record.get(*name).filter(|value| !value.is_null()))
}

/// RFC 3339 timestamp, normalized to UTC.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value.as_str()?.trim())
		.ok()
		.map(|parsed| parsed.with_timezone(&Utc))
}

/// Strict ISO `YYYY-MM-DD`.
#[must_use]
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
	let raw = value.as_str()?.trim();
	if raw.len() != 10 {
		return None;
	}
	NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}
