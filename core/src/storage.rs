//! Object storage for submission images.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{
	layers::{RetryLayer, TimeoutLayer},
	services, ErrorKind, Operator,
};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("object storage operation failed <key='{key}'>: {source}")]
	Operation {
		key: String,
		source: opendal::Error,
	},
	#[error("failed to configure object storage: {0}")]
	Setup(opendal::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// Writes `bytes` under `key`, replacing any previous object.
	async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError>;

	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// A pre-signed GET URL valid for `ttl`.
	async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// S3 (or any S3 compatible endpoint) through opendal.
#[derive(Debug, Clone)]
pub struct OpendalStore {
	op: Operator,
}

impl OpendalStore {
	pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
		let mut builder = services::S3::default()
			.bucket(&config.bucket)
			.region(&config.region)
			.access_key_id(&config.access_key_id)
			.secret_access_key(&config.secret_access_key)
			.root("/");

		if let Some(endpoint) = &config.endpoint {
			builder = builder.endpoint(endpoint);
		}

		let op = Operator::new(builder)
			.map_err(StorageError::Setup)?
			.layer(RetryLayer::new())
			.layer(TimeoutLayer::new().with_timeout(Duration::from_secs(config.request_timeout_secs)))
			.finish();

		Ok(Self { op })
	}
}

#[async_trait]
impl ObjectStore for OpendalStore {
	#[instrument(skip(self, bytes), fields(size = bytes.len()), err)]
	async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError> {
		self.op
			.write_with(key, bytes)
			.content_type(content_type)
			.await
			.map_err(|source| StorageError::Operation {
				key: key.to_string(),
				source,
			})?;

		debug!(%key, %content_type, "Stored object");

		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		match self.op.stat(key).await {
			Ok(_) => Ok(true),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
			Err(source) => Err(StorageError::Operation {
				key: key.to_string(),
				source,
			}),
		}
	}

	async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
		self.op
			.presign_read(key, ttl)
			.await
			.map(|request| request.uri().to_string())
			.map_err(|source| StorageError::Operation {
				key: key.to_string(),
				source,
			})
	}
}
