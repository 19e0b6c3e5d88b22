//! Copies submission images to object storage and keeps their signed URLs fresh.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::{
	config::StorageConfig,
	processor::{ImageReference, StoredImage},
	source::{FormSource, SourceError},
	storage::{ObjectStore, StorageError},
};

mod batch;
mod key;
mod placeholder;
mod signed_url;

pub use batch::{run_batch, ImageTask};
pub use key::{content_type, destination_key};
pub use signed_url::{expires_at, needs_refresh};

#[derive(Debug, Error)]
pub enum ImageError {
	#[error(transparent)]
	Source(#[from] SourceError),
	#[error(transparent)]
	Storage(#[from] StorageError),
	#[error("failed to render placeholder image: {0}")]
	Placeholder(#[from] image::ImageError),
	#[error("submission has no instance id to resolve attachment '{0}' against")]
	NoInstance(String),
}

/// The two image columns of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ImageCategory {
	Building,
	PlusCode,
}

/// One image of one submission, as handed to a worker.
#[derive(Debug, Clone)]
pub struct ImageJob {
	pub record_id: String,
	pub instance_id: Option<String>,
	pub submitted_at: Option<DateTime<Utc>>,
	pub category: ImageCategory,
	pub reference: Option<ImageReference>,
	/// What the stored row currently points at
	pub previous: Option<StoredImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
	/// Freshly uploaded and signed
	Stored(StoredImage),
	/// The object behind the stored key is still there, key and URL are kept
	Reused(StoredImage),
	/// Missing or unusable image replaced by the shared placeholder
	Placeholder(StoredImage),
	/// Nothing to store for this column
	Skipped,
	/// Neither the image nor the placeholder could be stored, previous columns stay
	Failed(String),
}

impl ImageOutcome {
	#[must_use]
	pub const fn stored(&self) -> Option<&StoredImage> {
		match self {
			Self::Stored(image) | Self::Reused(image) | Self::Placeholder(image) => Some(image),
			Self::Skipped | Self::Failed(_) => None,
		}
	}
}

/// A persisted signed URL, the unit of the refresh pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedImage {
	pub record_id: String,
	pub category: ImageCategory,
	pub key: String,
	pub url: String,
}

pub struct ImagePipeline {
	source: Arc<dyn FormSource>,
	store: Arc<dyn ObjectStore>,
	config: StorageConfig,
	min_bytes: usize,
	ttl: Duration,
	placeholder_key: OnceCell<String>,
}

impl ImagePipeline {
	pub fn new(
		source: Arc<dyn FormSource>,
		store: Arc<dyn ObjectStore>,
		config: StorageConfig,
		min_bytes: usize,
		ttl: Duration,
	) -> Self {
		Self {
			source,
			store,
			config,
			min_bytes,
			ttl,
			placeholder_key: OnceCell::new(),
		}
	}

	fn folder(&self, category: ImageCategory) -> &str {
		match category {
			ImageCategory::Building => &self.config.building_folder,
			ImageCategory::PlusCode => &self.config.plus_code_folder,
		}
	}

	/// Downloads the referenced image, `None` when the server doesn't have it.
	pub async fn resolve(
		&self,
		reference: &ImageReference,
		instance_id: Option<&str>,
	) -> Result<Option<Bytes>, ImageError> {
		let url = match reference {
			ImageReference::Absolute(url) => url.clone(),
			ImageReference::Filename(filename) => {
				let instance_id =
					instance_id.ok_or_else(|| ImageError::NoInstance(filename.clone()))?;
				self.source.attachment_url(instance_id, filename)?
			}
		};

		self.download(&url).await
	}

	async fn download(&self, url: &Url) -> Result<Option<Bytes>, ImageError> {
		Ok(self.source.download(url).await?)
	}

	pub async fn upload(&self, bytes: Bytes, key: &str, content_type: &str) -> Result<String, ImageError> {
		self.store.put(key, bytes, content_type).await?;
		Ok(key.to_string())
	}

	pub async fn sign(&self, key: &str) -> Result<String, ImageError> {
		Ok(self.store.presign(key, self.ttl).await?)
	}

	/// Key of the placeholder image, uploaded the first time it's needed.
	async fn placeholder_key(&self) -> Result<&str, ImageError> {
		self.placeholder_key
			.get_or_try_init(|| async {
				let key = format!(
					"{}/{}/{}",
					self.config.base_folder.trim_matches('/'),
					self.config.placeholder_folder.trim_matches('/'),
					placeholder::PLACEHOLDER_FILENAME
				);

				if !self.store.exists(&key).await? {
					self.upload(placeholder::render()?, &key, "image/png").await?;
					debug!(%key, "Uploaded placeholder image");
				}

				Ok::<_, ImageError>(key)
			})
			.await
			.map(String::as_str)
	}

	/// Runs one job to completion, never failing: problems end up in the outcome.
	#[instrument(skip_all, fields(record_id = %job.record_id, category = %job.category))]
	pub async fn process(&self, job: &ImageJob) -> ImageOutcome {
		let Some((reference, filename)) = job
			.reference
			.as_ref()
			.and_then(|reference| reference.filename().map(|name| (reference, name)))
		else {
			return match job.category {
				ImageCategory::Building => self.fallback(job, "no building image").await,
				ImageCategory::PlusCode => ImageOutcome::Skipped,
			};
		};

		let key = destination_key(
			&self.config.base_folder,
			self.folder(job.category),
			job.submitted_at,
			&job.record_id,
			&filename,
		);

		if let Some(previous) = job.previous.as_ref().filter(|previous| previous.key == key) {
			match self.store.exists(&key).await {
				Ok(true) => return ImageOutcome::Reused(previous.clone()),
				Ok(false) => debug!(%key, "Stored object disappeared, uploading again"),
				Err(e) => warn!(?e, %key, "Failed to check stored object, uploading again"),
			}
		}

		let bytes = match self.resolve(reference, job.instance_id.as_deref()).await {
			Ok(Some(bytes)) if bytes.len() >= self.min_bytes => bytes,
			Ok(Some(bytes)) => {
				warn!(size = bytes.len(), "Image is too small to be valid");
				return self.fallback(job, "corrupt image").await;
			}
			Ok(None) => return self.fallback(job, "image not found on form server").await,
			Err(e) => {
				warn!(?e, "Failed to download image");
				return self.fallback(job, "download failed").await;
			}
		};

		let stored = async {
			let key = self.upload(bytes, &key, content_type(&filename)).await?;
			let url = self.sign(&key).await?;
			Ok::<_, ImageError>(StoredImage { key, url })
		}
		.await;

		match stored {
			Ok(stored) => ImageOutcome::Stored(stored),
			Err(e) => {
				warn!(?e, "Failed to store image");
				self.fallback(job, "upload failed").await
			}
		}
	}

	/// Placeholder outcome for `job`. A record already pointing at the placeholder keeps its
	/// URL, renewing it is left to the refresh pass.
	async fn fallback(&self, job: &ImageJob, reason: &str) -> ImageOutcome {
		let key = match self.placeholder_key().await {
			Ok(key) => key,
			Err(e) => return ImageOutcome::Failed(format!("{reason}, placeholder unavailable: {e}")),
		};

		if let Some(previous) = job.previous.as_ref().filter(|previous| previous.key == key) {
			debug!(%reason, "Keeping placeholder image");
			return ImageOutcome::Reused(previous.clone());
		}

		match self.sign(key).await {
			Ok(url) => {
				debug!(%reason, "Using placeholder image");
				ImageOutcome::Placeholder(StoredImage {
					key: key.to_string(),
					url,
				})
			}
			Err(e) => ImageOutcome::Failed(format!("{reason}, placeholder unavailable: {e}")),
		}
	}

	/// Re-signs every URL expiring within `threshold` of `now` from its stored key.
	///
	/// Returns the refreshed entries and how many couldn't be signed.
	#[instrument(skip_all, fields(candidates = images.len()))]
	pub async fn refresh_expiring(
		&self,
		images: Vec<SignedImage>,
		now: DateTime<Utc>,
		threshold: chrono::Duration,
	) -> (Vec<SignedImage>, usize) {
		let mut refreshed = Vec::new();
		let mut failed = 0;

		for image in images
			.into_iter()
			.filter(|image| needs_refresh(&image.url, now, threshold))
		{
			match self.sign(&image.key).await {
				Ok(url) => refreshed.push(SignedImage { url, ..image }),
				Err(e) => {
					warn!(?e, record_id = %image.record_id, key = %image.key, "Failed to refresh signed URL");
					failed += 1;
				}
			}
		}

		(refreshed, failed)
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	use std::{
		collections::HashMap,
		sync::{
			atomic::{AtomicBool, AtomicUsize, Ordering},
			Mutex,
		},
	};

	use async_trait::async_trait;
	use chrono::TimeZone;
	use pretty_assertions::assert_eq;

	use crate::source::{RecordKind, RecordStream};

	/// In-memory object store signing SigV4 looking URLs issued at a fixed instant. Like a real
	/// signer, every call yields a different signature.
	#[derive(Default)]
	pub(crate) struct MemoryStore {
		pub(crate) objects: Mutex<HashMap<String, (Bytes, String)>>,
		pub(crate) fail_puts: AtomicBool,
		pub(crate) signatures: AtomicUsize,
	}

	#[async_trait]
	impl ObjectStore for MemoryStore {
		async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError> {
			if self.fail_puts.load(Ordering::SeqCst) {
				return Err(StorageError::Setup(opendal::Error::new(
					opendal::ErrorKind::Unexpected,
					"writes disabled",
				)));
			}
			self.objects
				.lock()
				.unwrap()
				.insert(key.to_string(), (bytes, content_type.to_string()));
			Ok(())
		}

		async fn exists(&self, key: &str) -> Result<bool, StorageError> {
			Ok(self.objects.lock().unwrap().contains_key(key))
		}

		async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
			Ok(format!(
				"https://bucket.test/{key}?X-Amz-Date=20240501T100000Z&X-Amz-Expires={}&X-Amz-Signature={}",
				ttl.as_secs(),
				self.signatures.fetch_add(1, Ordering::SeqCst)
			))
		}
	}

	/// Serves attachments from a map keyed by URL.
	#[derive(Default)]
	pub(crate) struct AttachmentSource {
		pub(crate) files: HashMap<String, Bytes>,
	}

	#[async_trait]
	impl FormSource for AttachmentSource {
		fn fetch(&self, _: RecordKind, _: Option<DateTime<Utc>>) -> RecordStream<'_> {
			Box::pin(futures::stream::empty())
		}

		fn attachment_url(&self, instance_id: &str, filename: &str) -> Result<Url, SourceError> {
			Url::parse(&format!("https://odk.test/attachments/{instance_id}/{filename}"))
				.map_err(|e| SourceError::InvalidUrl(e.to_string()))
		}

		async fn download(&self, url: &Url) -> Result<Option<Bytes>, SourceError> {
			Ok(self.files.get(url.as_str()).cloned())
		}
	}

	pub(crate) fn pipeline(source: AttachmentSource, store: Arc<MemoryStore>) -> ImagePipeline {
		ImagePipeline::new(
			Arc::new(source),
			store,
			StorageConfig::default(),
			100,
			Duration::from_secs(86_400),
		)
	}

	fn job(reference: Option<&str>, previous: Option<StoredImage>) -> ImageJob {
		ImageJob {
			record_id: "sub-1".to_string(),
			instance_id: Some("uuid:1".to_string()),
			submitted_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
			category: ImageCategory::Building,
			reference: reference.and_then(ImageReference::parse),
			previous,
		}
	}

	const KEY: &str = "odk_images/building-images/2024-05/sub-1-front.jpg";
	const PLACEHOLDER_KEY: &str = "odk_images/placeholders/no-image.png";

	fn source_with(bytes: &[u8]) -> AttachmentSource {
		AttachmentSource {
			files: HashMap::from([(
				"https://odk.test/attachments/uuid:1/front.jpg".to_string(),
				Bytes::copy_from_slice(bytes),
			)]),
		}
	}

	#[tokio::test]
	async fn attachment_is_uploaded_and_signed() {
		let store = Arc::new(MemoryStore::default());
		let pipeline = pipeline(source_with(&[7; 512]), Arc::clone(&store));

		let outcome = pipeline.process(&job(Some("front.jpg"), None)).await;

		let ImageOutcome::Stored(stored) = outcome else {
			panic!("unexpected outcome: {outcome:?}");
		};
		assert_eq!(stored.key, KEY);
		assert!(stored.url.contains("X-Amz-Expires=86400"));
		assert_eq!(store.objects.lock().unwrap()[KEY].1, "image/jpeg");
	}

	#[tokio::test]
	async fn small_or_missing_images_get_the_placeholder() {
		let store = Arc::new(MemoryStore::default());
		let pipeline = pipeline(source_with(&[7; 10]), Arc::clone(&store));

		let corrupt = pipeline.process(&job(Some("front.jpg"), None)).await;
		let missing = pipeline.process(&job(None, None)).await;
		let not_found = pipeline.process(&job(Some("other.jpg"), None)).await;

		for outcome in [corrupt, missing, not_found] {
			assert_eq!(outcome.stored().map(|image| image.key.as_str()), Some(PLACEHOLDER_KEY));
		}
		let objects = store.objects.lock().unwrap();
		assert!(!objects.contains_key(KEY));
		assert!(objects[PLACEHOLDER_KEY].0.len() > 100);
	}

	#[tokio::test]
	async fn empty_download_gets_the_placeholder() {
		let store = Arc::new(MemoryStore::default());
		let pipeline = pipeline(source_with(&[]), Arc::clone(&store));

		let outcome = pipeline.process(&job(Some("front.jpg"), None)).await;

		let ImageOutcome::Placeholder(stored) = outcome else {
			panic!("unexpected outcome: {outcome:?}");
		};
		assert_eq!(stored.key, PLACEHOLDER_KEY);
		assert!(stored.url.contains("no-image.png"));
		assert!(!store.objects.lock().unwrap().contains_key(KEY));
	}

	#[tokio::test]
	async fn placeholder_rows_keep_their_signed_url() {
		let pipeline = pipeline(AttachmentSource::default(), Arc::new(MemoryStore::default()));

		let first = pipeline.process(&job(None, None)).await;
		let ImageOutcome::Placeholder(previous) = first else {
			panic!("unexpected outcome: {first:?}");
		};

		let missing = pipeline.process(&job(None, Some(previous.clone()))).await;
		let not_found = pipeline.process(&job(Some("front.jpg"), Some(previous.clone()))).await;

		assert_eq!(missing, ImageOutcome::Reused(previous.clone()));
		assert_eq!(not_found, ImageOutcome::Reused(previous.clone()));
		assert_ne!(pipeline.sign(PLACEHOLDER_KEY).await.unwrap(), previous.url);
	}

	#[tokio::test]
	async fn existing_object_is_reused() {
		let store = Arc::new(MemoryStore::default());
		store
			.objects
			.lock()
			.unwrap()
			.insert(KEY.to_string(), (Bytes::from_static(b"old"), "image/jpeg".to_string()));
		let pipeline = pipeline(AttachmentSource::default(), Arc::clone(&store));
		let previous = StoredImage {
			key: KEY.to_string(),
			url: "https://bucket.test/old".to_string(),
		};

		let outcome = pipeline.process(&job(Some("front.jpg"), Some(previous.clone()))).await;

		assert_eq!(outcome, ImageOutcome::Reused(previous));
	}

	#[tokio::test]
	async fn failing_storage_marks_the_job_failed() {
		let store = Arc::new(MemoryStore::default());
		store.fail_puts.store(true, Ordering::SeqCst);
		let pipeline = pipeline(source_with(&[7; 512]), Arc::clone(&store));

		let outcome = pipeline.process(&job(Some("front.jpg"), None)).await;

		assert!(matches!(outcome, ImageOutcome::Failed(_)), "{outcome:?}");
	}

	#[tokio::test]
	async fn plus_code_without_reference_is_skipped() {
		let pipeline = pipeline(AttachmentSource::default(), Arc::new(MemoryStore::default()));
		let mut job = job(None, None);
		job.category = ImageCategory::PlusCode;

		assert_eq!(pipeline.process(&job).await, ImageOutcome::Skipped);
	}

	#[tokio::test]
	async fn only_expiring_urls_are_refreshed() {
		let pipeline = pipeline(AttachmentSource::default(), Arc::new(MemoryStore::default()));
		let signed = |id: &str, url: &str| SignedImage {
			record_id: id.to_string(),
			category: ImageCategory::Building,
			key: format!("k/{id}"),
			url: url.to_string(),
		};
		let images = vec![
			signed("fresh", "https://b/k?X-Amz-Date=20240501T100000Z&X-Amz-Expires=86400"),
			signed("stale", "https://b/k?X-Amz-Date=20240430T100000Z&X-Amz-Expires=86400"),
		];
		let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

		let (refreshed, failed) = pipeline
			.refresh_expiring(images, now, chrono::Duration::hours(2))
			.await;

		assert_eq!(failed, 0);
		assert_eq!(refreshed.len(), 1);
		assert_eq!(refreshed[0].record_id, "stale");
		assert!(refreshed[0].url.starts_with("https://bucket.test/k/stale"));
	}
}
