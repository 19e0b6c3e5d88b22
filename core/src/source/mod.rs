//! Access to the form collection server.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use thiserror::Error;

mod odk;

pub use odk::OdkClient;

/// Which entity set to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
	/// One row per form submission
	Main,
	/// The repeat group, one row per entry of every submission
	Child,
}

/// Raw records, requested page by page as the stream is consumed.
pub type RecordStream<'a> = BoxStream<'a, Result<Value, SourceError>>;

#[derive(Debug, Error)]
pub enum SourceError {
	#[error("request to form server failed: {0}")]
	Request(#[from] reqwest::Error),
	#[error("form server answered {status} <url='{url}'>")]
	Status { status: StatusCode, url: Url },
	#[error("form server rejected the session credentials")]
	Unauthorized,
	#[error("unexpected response from form server <url='{url}'>: {reason}")]
	Decode { url: Url, reason: String },
	#[error("invalid form server url: {0}")]
	InvalidUrl(String),
}

impl SourceError {
	/// Network hiccups and overloaded servers are worth retrying, everything else isn't.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
			Self::Status { status, .. } => {
				status.is_server_error()
					|| *status == StatusCode::TOO_MANY_REQUESTS
					|| *status == StatusCode::REQUEST_TIMEOUT
			}
			Self::Unauthorized | Self::Decode { .. } | Self::InvalidUrl(_) => false,
		}
	}
}

#[async_trait]
pub trait FormSource: Send + Sync {
	/// Records of `kind` submitted strictly after `watermark`, or all of them without one.
	fn fetch(&self, kind: RecordKind, watermark: Option<DateTime<Utc>>) -> RecordStream<'_>;

	/// Where the attachment `filename` of submission `instance_id` can be downloaded from.
	fn attachment_url(&self, instance_id: &str, filename: &str) -> Result<Url, SourceError>;

	/// Downloads an authenticated resource, `None` when the server doesn't have it.
	async fn download(&self, url: &Url) -> Result<Option<Bytes>, SourceError>;
}
