use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::Url;

const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// When a pre-signed URL stops working.
///
/// SigV4 URLs carry `X-Amz-Date` plus `X-Amz-Expires` seconds, SigV2 URLs an absolute
/// `Expires` epoch. Anything else yields `None`.
#[must_use]
pub fn expires_at(url: &str) -> Option<DateTime<Utc>> {
	let url = Url::parse(url).ok()?;

	let mut signed_at = None;
	let mut lifetime = None;
	let mut legacy = None;

	for (name, value) in url.query_pairs() {
		match name.as_ref() {
			"X-Amz-Date" => {
				signed_at = NaiveDateTime::parse_from_str(&value, AMZ_DATE_FORMAT)
					.ok()
					.map(|naive| naive.and_utc());
			}
			"X-Amz-Expires" => lifetime = value.parse::<i64>().ok().map(Duration::seconds),
			"Expires" => legacy = value.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0)),
			_ => {}
		}
	}

	match (signed_at, lifetime) {
		(Some(signed_at), Some(lifetime)) => Some(signed_at + lifetime),
		_ => legacy,
	}
}

/// URLs without a readable expiry are refreshed too, they can't be trusted to still work.
#[must_use]
pub fn needs_refresh(url: &str, now: DateTime<Utc>, threshold: Duration) -> bool {
	expires_at(url).map_or(true, |expires_at| expires_at - now <= threshold)
}
