use chrono::{DateTime, Utc};

/// `{base}/{category}/{yyyy-mm}/{record}-{filename}`.
///
/// The month comes from the submission timestamp so the key of a record never changes between
/// cycles, records without one are filed under `unknown`.
#[must_use]
pub fn destination_key(
	base_folder: &str,
	category: &str,
	submitted_at: Option<DateTime<Utc>>,
	record_id: &str,
	filename: &str,
) -> String {
	let month = submitted_at.map_or_else(|| "unknown".to_string(), |at| at.format("%Y-%m").to_string());

	format!(
		"{}/{}/{month}/{}-{}",
		base_folder.trim_matches('/'),
		category.trim_matches('/'),
		sanitize(record_id),
		sanitize(filename),
	)
}

#[must_use]
pub fn content_type(filename: &str) -> &'static str {
	let extension = filename
		.rsplit_once('.')
		.map(|(_, ext)| ext.to_ascii_lowercase())
		.unwrap_or_default();

	match extension.as_str() {
		"jpg" | "jpeg" => "image/jpeg",
		"png" => "image/png",
		"gif" => "image/gif",
		"webp" => "image/webp",
		"heic" => "image/heic",
		_ => "application/octet-stream",
	}
}

fn sanitize(segment: &str) -> String {
	segment
		.chars()
		.map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
		.collect()
}
