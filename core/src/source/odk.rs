use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode, Url};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::config::SourceConfig;

use super::{FormSource, RecordKind, RecordStream, SourceError};

/// Tokens are renewed this many minutes before the server would expire them.
const SESSION_RENEWAL_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
struct Session {
	token: String,
	expires_at: Option<DateTime<Utc>>,
}

impl Session {
	fn is_fresh(&self, now: DateTime<Utc>) -> bool {
		self.expires_at
			.map_or(true, |expires_at| {
				expires_at - chrono::Duration::minutes(SESSION_RENEWAL_MARGIN_MINUTES) > now
			})
	}
}

/// OData client for an ODK Central style form server.
///
/// Authenticates with an email/password session whose bearer token is reused until it expires
/// or the server answers 401, in which case it logs in again exactly once per request.
#[derive(Debug)]
pub struct OdkClient {
	http: reqwest::Client,
	base_url: Url,
	config: SourceConfig,
	session: Mutex<Option<Session>>,
}

impl OdkClient {
	pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
		let base_url = Url::parse(&config.base_url)
			.map_err(|e| SourceError::InvalidUrl(format!("{}: {e}", config.base_url)))?;

		if base_url.cannot_be_a_base() {
			return Err(SourceError::InvalidUrl(config.base_url));
		}

		let http = reqwest::Client::builder()
			.timeout(config.request_timeout())
			.connect_timeout(Duration::from_secs(10))
			.build()?;

		Ok(Self {
			http,
			base_url,
			config,
			session: Mutex::new(None),
		})
	}

	fn endpoint<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> Result<Url, SourceError> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|()| SourceError::InvalidUrl(self.base_url.to_string()))?
			.pop_if_empty()
			.extend(segments);

		Ok(url)
	}

	/// `.../forms/{form}.svc/Submissions` or `.../Submissions.{child_table}`
	pub fn entity_set_url(&self, kind: RecordKind) -> Result<Url, SourceError> {
		let service = format!("{}.svc", self.config.form_id);
		let entity_set = match kind {
			RecordKind::Main => "Submissions".to_string(),
			RecordKind::Child => format!("Submissions.{}", self.config.child_table),
		};

		self.endpoint([
			"v1",
			"projects",
			self.config.project_id.as_str(),
			"forms",
			service.as_str(),
			entity_set.as_str(),
		])
	}

	/// Query parameters of the page starting at `skip`. The filter is left out entirely
	/// without a watermark, fetching everything.
	#[must_use]
	pub fn page_query(
		&self,
		kind: RecordKind,
		watermark: Option<DateTime<Utc>>,
		skip: u64,
	) -> Vec<(&'static str, String)> {
		let mut query = vec![
			("$top", self.config.page_size.to_string()),
			("$skip", skip.to_string()),
			("$count", "true".to_string()),
		];

		if let Some(watermark) = watermark {
			query.push(("$filter", watermark_filter(kind, watermark)));
		}

		query
	}

	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(250))
			.with_max_interval(Duration::from_secs(10))
			.with_max_elapsed_time(Some(self.config.retry_max_elapsed()))
			.build()
	}

	async fn token(&self, force_login: bool) -> Result<String, SourceError> {
		let mut session = self.session.lock().await;

		if !force_login {
			if let Some(current) = session.as_ref().filter(|s| s.is_fresh(Utc::now())) {
				return Ok(current.token.clone());
			}
		}

		let fresh = self.login().await?;
		let token = fresh.token.clone();
		*session = Some(fresh);

		Ok(token)
	}

	#[instrument(skip(self), err)]
	async fn login(&self) -> Result<Session, SourceError> {
		let url = self.endpoint(["v1", "sessions"])?;

		let response = self
			.http
			.post(url.clone())
			.json(&json!({
				"email": self.config.email,
				"password": self.config.password,
			}))
			.send()
			.await?;

		match response.status() {
			status if status.is_success() => {}
			StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(SourceError::Unauthorized),
			status => return Err(SourceError::Status { status, url }),
		}

		let body = response.json::<Value>().await?;

		let token = body
			.get("token")
			.and_then(Value::as_str)
			.ok_or_else(|| SourceError::Decode {
				url: url.clone(),
				reason: "session response without token".to_string(),
			})?
			.to_string();

		let expires_at = body
			.get("expiresAt")
			.and_then(Value::as_str)
			.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
			.map(|at| at.with_timezone(&Utc));

		debug!(?expires_at, "Form server session created");

		Ok(Session { token, expires_at })
	}

	/// Only the form server itself gets the session token.
	fn is_form_server(&self, url: &Url) -> bool {
		url.origin() == self.base_url.origin()
	}

	/// One GET, re-authenticating once on 401 when talking to the form server. `None` on 404.
	async fn get_once(
		&self,
		url: &Url,
		query: &[(&'static str, String)],
	) -> Result<Option<Response>, SourceError> {
		let authorized = self.is_form_server(url);
		let mut force_login = false;

		loop {
			let mut request = self.http.get(url.clone()).query(query);
			if authorized {
				request = request.bearer_auth(self.token(force_login).await?);
			}

			let response = request.send().await?;

			match response.status() {
				status if status.is_success() => return Ok(Some(response)),
				StatusCode::NOT_FOUND => return Ok(None),
				StatusCode::UNAUTHORIZED if authorized && !force_login => {
					warn!(%url, "Session rejected by form server, logging in again");
					force_login = true;
				}
				StatusCode::UNAUTHORIZED if authorized => return Err(SourceError::Unauthorized),
				status => {
					return Err(SourceError::Status {
						status,
						url: url.clone(),
					})
				}
			}
		}
	}

	/// [`Self::get_once`] retried with exponential backoff while failures are transient.
	async fn get(
		&self,
		url: &Url,
		query: &[(&'static str, String)],
	) -> Result<Option<Response>, SourceError> {
		retry(self.backoff(), || async {
			self.get_once(url, query).await.map_err(|e| {
				if e.is_transient() {
					warn!(%url, ?e, "Transient form server failure, retrying");
					backoff::Error::transient(e)
				} else {
					backoff::Error::permanent(e)
				}
			})
		})
		.await
	}

	async fn get_page(
		&self,
		url: &Url,
		query: &[(&'static str, String)],
	) -> Result<Option<Vec<Value>>, SourceError> {
		let Some(response) = self.get(url, query).await? else {
			return Ok(None);
		};

		let page = response.json::<Value>().await?;

		page_records(url, page).map(Some)
	}
}

/// `gt` comparison on the server side submission date. Repeat group rows don't carry it
/// themselves, so they are filtered through their root submission.
#[must_use]
fn watermark_filter(kind: RecordKind, watermark: DateTime<Utc>) -> String {
	let field = match kind {
		RecordKind::Main => "__system/submissionDate",
		RecordKind::Child => "$root/Submissions/__system/submissionDate",
	};

	format!(
		"{field} gt {}",
		watermark.format("%Y-%m-%dT%H:%M:%S%.3fZ")
	)
}

fn page_records(url: &Url, page: Value) -> Result<Vec<Value>, SourceError> {
	match page {
		Value::Object(mut body) => match body.remove("value") {
			Some(Value::Array(records)) => Ok(records),
			_ => Err(SourceError::Decode {
				url: url.clone(),
				reason: "page without a `value` array".to_string(),
			}),
		},
		_ => Err(SourceError::Decode {
			url: url.clone(),
			reason: "page is not a JSON object".to_string(),
		}),
	}
}

#[async_trait]
impl FormSource for OdkClient {
	fn fetch(&self, kind: RecordKind, watermark: Option<DateTime<Utc>>) -> RecordStream<'_> {
		let page_size = u64::from(self.config.page_size);

		Box::pin(try_stream! {
			let url = self.entity_set_url(kind)?;
			let mut skip = 0;

			loop {
				let query = self.page_query(kind, watermark, skip);

				let records = match self.get_page(&url, &query).await? {
					Some(records) => records,
					None if kind == RecordKind::Child => {
						warn!(%url, "Repeat group entity set not found, form has no child records");
						break;
					}
					None => Err(SourceError::Status {
						status: StatusCode::NOT_FOUND,
						url: url.clone(),
					})?,
				};

				let count = records.len() as u64;
				trace!(%kind, skip, count, "Fetched page");

				for record in records {
					yield record;
				}

				if count < page_size {
					break;
				}

				skip += count;
			}
		})
	}

	fn attachment_url(&self, instance_id: &str, filename: &str) -> Result<Url, SourceError> {
		self.endpoint([
			"v1",
			"projects",
			self.config.project_id.as_str(),
			"forms",
			self.config.form_id.as_str(),
			"submissions",
			instance_id,
			"attachments",
			filename,
		])
	}

	#[instrument(skip(self, url), fields(%url), err)]
	async fn download(&self, url: &Url) -> Result<Option<Bytes>, SourceError> {
		match self.get(url, &[]).await? {
			Some(response) => Ok(Some(response.bytes().await?)),
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use chrono::TimeZone;
	use pretty_assertions::assert_eq;

	fn client(base_url: &str) -> OdkClient {
		OdkClient::new(SourceConfig {
			base_url: base_url.to_string(),
			project_id: "4".to_string(),
			form_id: "rental_survey".to_string(),
			page_size: 100,
			..SourceConfig::default()
		})
		.unwrap()
	}

	#[test]
	fn entity_set_urls() {
		let client = client("https://central.example.org/");

		assert_eq!(
			client.entity_set_url(RecordKind::Main).unwrap().as_str(),
			"https://central.example.org/v1/projects/4/forms/rental_survey.svc/Submissions"
		);
		assert_eq!(
			client.entity_set_url(RecordKind::Child).unwrap().as_str(),
			"https://central.example.org/v1/projects/4/forms/rental_survey.svc/Submissions.person_details"
		);
	}

	#[test]
	fn attachment_urls_are_escaped() {
		let client = client("https://central.example.org/odk");

		assert_eq!(
			client
				.attachment_url("uuid:1a2b", "front view 1.jpg")
				.unwrap()
				.as_str(),
			"https://central.example.org/odk/v1/projects/4/forms/rental_survey/submissions/uuid:1a2b/attachments/front%20view%201.jpg"
		);
	}

	#[test]
	fn filter_is_omitted_without_watermark() {
		let client = client("https://central.example.org");

		let query = client.page_query(RecordKind::Main, None, 0);
		assert!(query.iter().all(|(name, _)| *name != "$filter"));
		assert!(query.contains(&("$top", "100".to_string())));
		assert!(query.contains(&("$skip", "0".to_string())));
	}

	#[test]
	fn filters_are_strictly_greater_than() {
		let watermark = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
			+ chrono::Duration::milliseconds(120);

		assert_eq!(
			watermark_filter(RecordKind::Main, watermark),
			"__system/submissionDate gt 2024-05-06T07:08:09.120Z"
		);
		assert_eq!(
			watermark_filter(RecordKind::Child, watermark),
			"$root/Submissions/__system/submissionDate gt 2024-05-06T07:08:09.120Z"
		);
	}

	#[test]
	fn transient_errors() {
		let url = Url::parse("https://central.example.org").unwrap();

		assert!(SourceError::Status {
			status: StatusCode::BAD_GATEWAY,
			url: url.clone()
		}
		.is_transient());
		assert!(SourceError::Status {
			status: StatusCode::TOO_MANY_REQUESTS,
			url: url.clone()
		}
		.is_transient());
		assert!(!SourceError::Status {
			status: StatusCode::BAD_REQUEST,
			url
		}
		.is_transient());
		assert!(!SourceError::Unauthorized.is_transient());
	}

	#[test]
	fn pages_need_a_value_array() {
		let url = Url::parse("https://central.example.org").unwrap();

		assert_eq!(
			page_records(&url, json!({"value": [{"__id": "a"}], "@odata.count": 1})).unwrap(),
			vec![json!({"__id": "a"})]
		);
		assert!(matches!(
			page_records(&url, json!({"error": "nope"})),
			Err(SourceError::Decode { .. })
		));
	}
}
