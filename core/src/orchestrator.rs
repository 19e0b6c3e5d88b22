//! The sync cycle: main submissions, their images, signed URL refresh, repeat group entries
//! and finally the unified table.

use std::{
	collections::HashMap,
	num::NonZeroUsize,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use formsync_task_system::TaskPriority;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
	config::{AppConfig, SyncConfig},
	infra::db::{entities::SyncType, Database},
	media::{run_batch, ImageCategory, ImageJob, ImageOutcome, ImagePipeline},
	persistence::{PersistenceEngine, UpsertStats},
	processor::{self, MainRow},
	source::{FormSource, OdkClient, RecordKind, RecordStream, SourceError},
	storage::OpendalStore,
	tracker::{AttemptId, SyncTracker},
	Error,
};

const HISTORY_CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
	pub fetched: u64,
	pub rejected: u64,
	pub inserted: u64,
	pub updated: u64,
	pub unchanged: u64,
	pub succeeded: bool,
}

impl PhaseSummary {
	fn record(&mut self, stats: UpsertStats) {
		self.inserted = stats.inserted;
		self.updated = stats.updated;
		self.unchanged = stats.unchanged;
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
	pub stored: u64,
	pub reused: u64,
	pub placeholders: u64,
	pub skipped: u64,
	pub failed: u64,
}

impl ImageSummary {
	fn count(&mut self, outcome: &ImageOutcome) {
		match outcome {
			ImageOutcome::Stored(_) => self.stored += 1,
			ImageOutcome::Reused(_) => self.reused += 1,
			ImageOutcome::Placeholder(_) => self.placeholders += 1,
			ImageOutcome::Skipped => self.skipped += 1,
			ImageOutcome::Failed(_) => self.failed += 1,
		}
	}

	const fn total(&self) -> u64 {
		self.stored + self.reused + self.placeholders + self.skipped + self.failed
	}
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
	pub started_at: Option<DateTime<Utc>>,
	pub main: PhaseSummary,
	pub child: PhaseSummary,
	pub images: ImageSummary,
	pub refreshed_urls: u64,
	pub unified_rows: Option<u64>,
	pub errors: Vec<String>,
	pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleReport {
	Completed(CycleSummary),
	/// Another cycle was still running
	Skipped,
}

/// Clears the "cycle running" flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

/// An exclusive right to run the next cycle, released when dropped.
#[must_use = "the claim blocks every other cycle until it is run or dropped"]
pub struct CycleClaim(Arc<SyncOrchestrator>);

impl CycleClaim {
	pub async fn run(self) -> CycleReport {
		self.0.cycle().await
	}
}

impl Drop for CycleClaim {
	fn drop(&mut self) {
		self.0.running.store(false, Ordering::Release);
	}
}

pub struct SyncOrchestrator {
	source: Arc<dyn FormSource>,
	tracker: SyncTracker,
	persistence: PersistenceEngine,
	images: Option<Arc<ImagePipeline>>,
	config: SyncConfig,
	running: AtomicBool,
	last_report: RwLock<Option<CycleSummary>>,
}

impl SyncOrchestrator {
	#[must_use]
	pub fn new(
		source: Arc<dyn FormSource>,
		tracker: SyncTracker,
		persistence: PersistenceEngine,
		images: Option<Arc<ImagePipeline>>,
		config: SyncConfig,
	) -> Self {
		Self {
			source,
			tracker,
			persistence,
			images,
			config,
			running: AtomicBool::new(false),
			last_report: RwLock::new(None),
		}
	}

	/// Connects to the database, runs migrations and wires every component from `config`.
	/// Image handling is disabled when no storage is configured.
	pub async fn connect(config: &AppConfig) -> Result<Self, Error> {
		let db = Database::connect(&config.database.url, config.database.max_connections).await?;
		db.migrate().await?;

		let source: Arc<dyn FormSource> = Arc::new(OdkClient::new(config.source.clone())?);

		let images = match &config.storage {
			Some(storage) => Some(Arc::new(ImagePipeline::new(
				Arc::clone(&source),
				Arc::new(OpendalStore::new(storage)?),
				storage.clone(),
				config.sync.min_image_bytes,
				config.sync.signed_url_ttl(),
			))),
			None => {
				warn!("No object storage configured, images won't be synchronized");
				None
			}
		};

		Ok(Self::new(
			source,
			SyncTracker::new(db.conn().clone()),
			PersistenceEngine::new(db.conn().clone(), &config.unified)?,
			images,
			config.sync.clone(),
		))
	}

	#[must_use]
	pub const fn tracker(&self) -> &SyncTracker {
		&self.tracker
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	pub async fn last_report(&self) -> Option<CycleSummary> {
		self.last_report.read().await.clone()
	}

	/// Runs one full cycle, or returns [`CycleReport::Skipped`] right away when another one is
	/// still in progress. Failures of one phase are recorded and the following phases still run.
	#[instrument(skip(self))]
	pub async fn run_cycle(&self) -> CycleReport {
		if self
			.running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			warn!("Sync cycle already running, skipping");
			return CycleReport::Skipped;
		}
		let _guard = RunningGuard(&self.running);

		self.cycle().await
	}

	/// Claims the "cycle running" flag for a cycle to be started later, typically on another
	/// task. `None` while a cycle is in progress.
	#[must_use]
	pub fn try_claim(self: &Arc<Self>) -> Option<CycleClaim> {
		self.running
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()?;

		Some(CycleClaim(Arc::clone(self)))
	}

	async fn cycle(&self) -> CycleReport {
		let started = Instant::now();
		let mut summary = CycleSummary {
			started_at: Some(Utc::now()),
			..Default::default()
		};

		let main_cutoff = self.sync_main(&mut summary).await;

		if self.config.enable_url_refresh {
			if let Some(images) = &self.images {
				self.refresh_urls(images, &mut summary).await;
			}
		}

		self.sync_children(main_cutoff, &mut summary).await;

		match self.persistence.rebuild_unified(Utc::now()).await {
			Ok(rows) => summary.unified_rows = Some(rows),
			Err(e) => {
				error!(?e, "Failed to rebuild unified table");
				summary.errors.push(format!("unified: {e}"));
			}
		}

		summary.duration_secs = started.elapsed().as_secs_f64();

		info!(
			main_fetched = summary.main.fetched,
			child_fetched = summary.child.fetched,
			images = summary.images.total(),
			errors = summary.errors.len(),
			duration_secs = summary.duration_secs,
			"Sync cycle finished"
		);

		*self.last_report.write().await = Some(summary.clone());

		CycleReport::Completed(summary)
	}

	/// Returns the highest submission timestamp persisted by a successful main sync.
	async fn sync_main(&self, summary: &mut CycleSummary) -> Option<DateTime<Utc>> {
		let attempt = self.tracker.start_attempt(SyncType::Main).await;

		let watermark = match self.tracker.watermark(SyncType::Main).await {
			Ok(watermark) => watermark,
			Err(e) => {
				self.fail(attempt, SyncType::Main, &e.to_string(), summary).await;
				return None;
			}
		};

		let (records, fetch_error) = collect(self.source.fetch(RecordKind::Main, watermark)).await;
		summary.main.fetched = records.len() as u64;

		let mut rows = records
			.iter()
			.filter_map(|record| match processor::normalize_main(record) {
				Ok(row) => Some(row),
				Err(rejection) => {
					warn!(%rejection, key = ?processor::natural_key(record), "Main record rejected");
					summary.main.rejected += 1;
					None
				}
			})
			.collect::<Vec<_>>();

		let keys = rows.iter().map(|row| row.uuid.clone()).collect::<Vec<_>>();
		let stored = match self.persistence.load_main(&keys).await {
			Ok(stored) => stored,
			Err(e) => {
				self.fail(attempt, SyncType::Main, &e.to_string(), summary).await;
				return None;
			}
		};

		for row in &mut rows {
			if let Some(previous) = stored.get(&row.uuid) {
				row.image = previous.image.clone();
				row.plus_code = previous.plus_code.clone();
			}
		}

		if let Some(images) = &self.images {
			self.process_images(images, &mut rows, &stored, summary).await;
		}

		let cutoff = rows.iter().filter_map(|row| row.submitted_at).max();

		let stats = match self.persistence.upsert_main(rows).await {
			Ok(stats) => stats,
			Err(e) => {
				self.fail(attempt, SyncType::Main, &e.to_string(), summary).await;
				return None;
			}
		};
		summary.main.record(stats);

		if let Some(e) = fetch_error {
			warn!(persisted = stats.total(), "Main fetch interrupted, keeping the watermark");
			self.fail(attempt, SyncType::Main, &e.to_string(), summary).await;
			return None;
		}

		let metadata = json!({
			"fetched": summary.main.fetched,
			"rejected": summary.main.rejected,
			"inserted": stats.inserted,
			"updated": stats.updated,
			"unchanged": stats.unchanged,
		});
		if let Err(e) = self
			.tracker
			.complete_attempt(attempt, SyncType::Main, stats.total(), cutoff, metadata)
			.await
		{
			error!(?e, "Failed to record main sync completion");
			summary.errors.push(format!("main: {e}"));
			return None;
		}
		summary.main.succeeded = true;

		cutoff
	}

	/// Fills the image columns of `rows`. Rows whose job failed keep what they had.
	async fn process_images(
		&self,
		images: &Arc<ImagePipeline>,
		rows: &mut [MainRow],
		stored: &HashMap<String, MainRow>,
		summary: &mut CycleSummary,
	) {
		let attempt = self.tracker.start_attempt(SyncType::Image).await;

		let jobs = rows
			.iter()
			.flat_map(|row| {
				let priority = if self.config.prioritize_new && !stored.contains_key(&row.uuid) {
					TaskPriority::High
				} else {
					TaskPriority::Normal
				};

				let building = ImageJob {
					record_id: row.uuid.clone(),
					instance_id: row.instance_id.clone(),
					submitted_at: row.submitted_at,
					category: ImageCategory::Building,
					reference: row.image_reference.clone(),
					previous: row.image.clone(),
				};

				let plus_code = row.plus_code_reference.as_ref().map(|reference| ImageJob {
					category: ImageCategory::PlusCode,
					reference: Some(reference.clone()),
					previous: row.plus_code.clone(),
					..building.clone()
				});

				std::iter::once(building)
					.chain(plus_code)
					.map(move |job| (job, priority))
			})
			.collect::<Vec<_>>();

		let outcomes = run_batch(
			Arc::clone(images),
			jobs,
			NonZeroUsize::new(self.config.max_workers).unwrap_or(NonZeroUsize::MIN),
			self.config.image_job_timeout(),
		)
		.await;

		for row in rows.iter_mut() {
			for category in [ImageCategory::Building, ImageCategory::PlusCode] {
				let Some(outcome) = outcomes.get(&(row.uuid.clone(), category)) else {
					continue;
				};

				summary.images.count(outcome);

				if let Some(image) = outcome.stored() {
					match category {
						ImageCategory::Building => row.image = Some(image.clone()),
						ImageCategory::PlusCode => row.plus_code = Some(image.clone()),
					}
				}
			}
		}

		let metadata = serde_json::to_value(summary.images).unwrap_or(Value::Null);
		if let Err(e) = self
			.tracker
			.complete_attempt(attempt, SyncType::Image, summary.images.total(), None, metadata)
			.await
		{
			error!(?e, "Failed to record image sync completion");
		}
	}

	async fn refresh_urls(&self, images: &ImagePipeline, summary: &mut CycleSummary) {
		let attempt = self.tracker.start_attempt(SyncType::UrlRefresh).await;

		let candidates = match self.persistence.signed_images().await {
			Ok(candidates) => candidates,
			Err(e) => {
				self.fail(attempt, SyncType::UrlRefresh, &e.to_string(), summary).await;
				return;
			}
		};
		let scanned = candidates.len();

		let (refreshed, failed) = images
			.refresh_expiring(candidates, Utc::now(), self.config.url_refresh_threshold())
			.await;

		match self.persistence.update_image_urls(&refreshed).await {
			Ok(written) => {
				summary.refreshed_urls = written;
				debug!(scanned, written, failed, "Signed URLs refreshed");

				if let Err(e) = self
					.tracker
					.complete_attempt(
						attempt,
						SyncType::UrlRefresh,
						written,
						None,
						json!({ "scanned": scanned, "refreshed": written, "failed": failed }),
					)
					.await
				{
					error!(?e, "Failed to record url refresh completion");
				}
			}
			Err(e) => self.fail(attempt, SyncType::UrlRefresh, &e.to_string(), summary).await,
		}
	}

	async fn sync_children(&self, main_cutoff: Option<DateTime<Utc>>, summary: &mut CycleSummary) {
		let attempt = self.tracker.start_attempt(SyncType::Child).await;

		let watermark = match self.tracker.watermark(SyncType::Child).await {
			Ok(watermark) => watermark,
			Err(e) => {
				self.fail(attempt, SyncType::Child, &e.to_string(), summary).await;
				return;
			}
		};

		let (records, fetch_error) = collect(self.source.fetch(RecordKind::Child, watermark)).await;
		summary.child.fetched = records.len() as u64;

		let rows = records
			.iter()
			.filter_map(|record| match processor::normalize_child(record) {
				Ok(row) => Some(row),
				Err(rejection) => {
					warn!(%rejection, "Child record rejected");
					summary.child.rejected += 1;
					None
				}
			})
			.collect::<Vec<_>>();

		let stats = match self.persistence.upsert_child(rows).await {
			Ok(stats) => stats,
			Err(e) => {
				self.fail(attempt, SyncType::Child, &e.to_string(), summary).await;
				return;
			}
		};
		summary.child.record(stats);

		if let Some(e) = fetch_error {
			self.fail(attempt, SyncType::Child, &e.to_string(), summary).await;
			return;
		}

		let metadata = json!({
			"fetched": summary.child.fetched,
			"rejected": summary.child.rejected,
			"inserted": stats.inserted,
			"updated": stats.updated,
			"unchanged": stats.unchanged,
		});
		match self
			.tracker
			.complete_attempt(attempt, SyncType::Child, stats.total(), main_cutoff, metadata)
			.await
		{
			Ok(()) => summary.child.succeeded = true,
			Err(e) => {
				error!(?e, "Failed to record child sync completion");
				summary.errors.push(format!("child: {e}"));
			}
		}
	}

	async fn fail(
		&self,
		attempt: AttemptId,
		sync_type: SyncType,
		message: &str,
		summary: &mut CycleSummary,
	) {
		error!(%sync_type, %message, "Sync phase failed");
		summary.errors.push(format!("{sync_type}: {message}"));

		if let Err(e) = self.tracker.fail_attempt(attempt, sync_type, message).await {
			error!(?e, %sync_type, "Failed to record sync failure");
		}
	}

	/// Runs cycles every `interval` until `shutdown` is cancelled. A cycle in progress is
	/// always finished before returning.
	pub async fn run(&self, shutdown: CancellationToken) {
		let interval = self.config.interval();
		let mut last_cleanup: Option<Instant> = None;

		info!(interval_secs = interval.as_secs(), "Sync loop started");

		while !shutdown.is_cancelled() {
			let started = Instant::now();

			if let CycleReport::Skipped = self.run_cycle().await {
				debug!("Scheduled cycle skipped");
			}

			let elapsed = started.elapsed();
			if elapsed > interval * 2 {
				warn!(
					elapsed_secs = elapsed.as_secs_f64(),
					interval_secs = interval.as_secs(),
					"Sync cycle took more than twice the interval"
				);
			}

			if last_cleanup.map_or(true, |at| at.elapsed() >= HISTORY_CLEANUP_EVERY) {
				match self
					.tracker
					.cleanup_history(self.config.history_retention(), Utc::now())
					.await
				{
					Ok(removed) => debug!(removed, "Sync history cleaned up"),
					Err(e) => error!(?e, "Failed to clean up sync history"),
				}
				last_cleanup = Some(Instant::now());
			}

			tokio::select! {
				() = shutdown.cancelled() => {}
				() = tokio::time::sleep(interval) => {}
			}
		}

		info!("Sync loop stopped");
	}
}

/// Consumes a record stream, keeping whatever arrived before an error.
async fn collect(mut stream: RecordStream<'_>) -> (Vec<Value>, Option<SourceError>) {
	let mut records = Vec::new();

	while let Some(item) = stream.next().await {
		match item {
			Ok(record) => records.push(record),
			Err(e) => return (records, Some(e)),
		}
	}

	(records, None)
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::Mutex;

	use async_trait::async_trait;
	use bytes::Bytes;
	use chrono::TimeZone;
	use pretty_assertions::assert_eq;
	use reqwest::{StatusCode, Url};
	use tracing_test::traced_test;

	use crate::{
		config::{StorageConfig, UnifiedConfig},
		infra::db::{entities::SyncStatus, test_database},
		media::tests::MemoryStore,
	};

	#[derive(Default)]
	struct ScriptedSource {
		main: Vec<Value>,
		child: Vec<Value>,
		/// Main fetch fails once this many records were delivered
		fail_main_after: Option<usize>,
		attachments: HashMap<String, Bytes>,
		requests: Mutex<Vec<(RecordKind, Option<DateTime<Utc>>)>>,
	}

	#[async_trait]
	impl FormSource for ScriptedSource {
		fn fetch(&self, kind: RecordKind, watermark: Option<DateTime<Utc>>) -> RecordStream<'_> {
			self.requests.lock().unwrap().push((kind, watermark));

			let mut items = match kind {
				RecordKind::Main => self
					.main
					.iter()
					.filter(|record| {
						let submitted = processor::parse_timestamp(&record["__system"]["submissionDate"]);
						watermark.map_or(true, |w| submitted.is_some_and(|s| s > w))
					})
					.cloned()
					.map(Ok)
					.collect::<Vec<_>>(),
				RecordKind::Child => self.child.iter().cloned().map(Ok).collect(),
			};

			if let (RecordKind::Main, Some(after)) = (kind, self.fail_main_after) {
				items.truncate(after);
				items.push(Err(SourceError::Status {
					status: StatusCode::BAD_GATEWAY,
					url: Url::parse("https://odk.test/v1/Submissions").unwrap(),
				}));
			}

			Box::pin(futures::stream::iter(items))
		}

		fn attachment_url(&self, instance_id: &str, filename: &str) -> Result<Url, SourceError> {
			Url::parse(&format!("https://odk.test/{instance_id}/{filename}"))
				.map_err(|e| SourceError::InvalidUrl(e.to_string()))
		}

		async fn download(&self, url: &Url) -> Result<Option<Bytes>, SourceError> {
			Ok(self.attachments.get(url.as_str()).cloned())
		}
	}

	fn submission(uuid: &str, hour: u32, image: Option<&str>) -> Value {
		json!({
			"UUID": uuid,
			"meta": {"instanceID": format!("uuid:{uuid}")},
			"__system": {"submissionDate": format!("2024-05-01T{hour:02}:00:00.000Z")},
			"property_location": {"street_label": "Kairaba Ave"},
			"property_description": {"building_image": image},
		})
	}

	fn person(uuid: &str) -> Value {
		json!({
			"UUID": uuid,
			"person_type": {"property_basis": "owner"},
			"occupancy": {"property_use": "residence", "rent_annual_amount": "1200"},
		})
	}

	fn hour(hour: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
	}

	async fn orchestrator(source: ScriptedSource, store: Option<Arc<MemoryStore>>) -> (SyncOrchestrator, tempfile::TempDir) {
		let (db, dir) = test_database().await;
		let source: Arc<dyn FormSource> = Arc::new(source);

		let images = store.map(|store| {
			Arc::new(ImagePipeline::new(
				Arc::clone(&source),
				store,
				StorageConfig::default(),
				100,
				Duration::from_secs(86_400),
			))
		});

		let config = SyncConfig {
			max_workers: 2,
			..Default::default()
		};

		let orchestrator = SyncOrchestrator::new(
			source,
			SyncTracker::new(db.conn().clone()),
			PersistenceEngine::new(db.conn().clone(), &UnifiedConfig::default()).unwrap(),
			images,
			config,
		);

		(orchestrator, dir)
	}

	fn completed(report: CycleReport) -> CycleSummary {
		match report {
			CycleReport::Completed(summary) => summary,
			CycleReport::Skipped => panic!("cycle was skipped"),
		}
	}

	#[tokio::test]
	#[traced_test]
	async fn full_cycle_then_idempotent_rerun() {
		let source = ScriptedSource {
			main: vec![
				submission("a", 9, Some("front.jpg")),
				submission("b", 11, None),
				json!({"no_key": true, "__system": {"submissionDate": "2024-05-01T23:00:00.000Z"}}),
			],
			child: vec![person("a_1"), person("a_2"), json!({"__id": "orphan"})],
			attachments: HashMap::from([(
				"https://odk.test/uuid:a/front.jpg".to_string(),
				Bytes::from(vec![3; 2048]),
			)]),
			..Default::default()
		};
		let store = Arc::new(MemoryStore::default());
		let (orchestrator, _dir) = orchestrator(source, Some(Arc::clone(&store))).await;

		let first = completed(orchestrator.run_cycle().await);

		assert_eq!(first.errors, Vec::<String>::new());
		assert_eq!((first.main.fetched, first.main.rejected, first.main.inserted), (3, 1, 2));
		assert_eq!((first.child.fetched, first.child.rejected, first.child.inserted), (3, 1, 2));
		assert_eq!((first.images.stored, first.images.placeholders), (1, 1));
		assert_eq!(first.unified_rows, Some(2));
		assert!(store
			.objects
			.lock()
			.unwrap()
			.contains_key("odk_images/building-images/2024-05/a-front.jpg"));

		let tracker = orchestrator.tracker();
		assert_eq!(tracker.watermark(SyncType::Main).await.unwrap(), Some(hour(11)));
		assert_eq!(tracker.watermark(SyncType::Child).await.unwrap(), Some(hour(11)));

		let second = completed(orchestrator.run_cycle().await);

		assert_eq!((second.main.fetched, second.main.rejected), (1, 1));
		assert_eq!((second.main.inserted, second.main.updated), (0, 0));
		assert_eq!((second.child.inserted, second.child.updated, second.child.unchanged), (0, 0, 2));
		assert_eq!(second.unified_rows, Some(2));
		assert_eq!(tracker.watermark(SyncType::Main).await.unwrap(), Some(hour(11)));

		let unified = orchestrator.persistence.unified_rows().await.unwrap();
		assert_eq!(unified[0].child_count, 2);
		assert!(unified[0]
			.image_url
			.as_deref()
			.is_some_and(|url| url.contains("a-front.jpg")));
		assert!(unified[1]
			.image_url
			.as_deref()
			.is_some_and(|url| url.contains("no-image.png")));
	}

	#[tokio::test]
	#[traced_test]
	async fn rerun_without_watermark_writes_nothing() {
		let source = ScriptedSource {
			main: vec![json!({
				"UUID": "undated",
				"meta": {"instanceID": "uuid:undated"},
				"property_description": {"building_image": "missing.jpg"},
			})],
			..Default::default()
		};
		let (orchestrator, _dir) = orchestrator(source, Some(Arc::new(MemoryStore::default()))).await;

		let first = completed(orchestrator.run_cycle().await);
		assert_eq!((first.main.inserted, first.images.placeholders), (1, 1));
		assert_eq!(orchestrator.tracker().watermark(SyncType::Main).await.unwrap(), None);

		let second = completed(orchestrator.run_cycle().await);
		assert_eq!(second.main.fetched, 1);
		assert_eq!((second.main.inserted, second.main.updated, second.main.unchanged), (0, 0, 1));
		assert_eq!(second.images.reused, 1);
	}

	#[tokio::test]
	#[traced_test]
	async fn interrupted_fetch_persists_partial_results() {
		let source = ScriptedSource {
			main: vec![submission("a", 9, None), submission("b", 10, None)],
			fail_main_after: Some(1),
			..Default::default()
		};
		let (orchestrator, _dir) = orchestrator(source, None).await;

		let summary = completed(orchestrator.run_cycle().await);

		assert_eq!(summary.main.inserted, 1);
		assert!(!summary.main.succeeded);
		assert!(summary.child.succeeded);
		assert_eq!(summary.unified_rows, Some(1));

		let tracker = orchestrator.tracker();
		assert_eq!(tracker.watermark(SyncType::Main).await.unwrap(), None);
		assert_eq!(tracker.watermark(SyncType::Child).await.unwrap(), None);

		let stats = tracker.statistics().await.unwrap();
		let main = stats
			.types
			.iter()
			.find(|state| state.sync_type == SyncType::Main)
			.unwrap();
		assert_eq!(main.last_sync_status, SyncStatus::Error);
		assert_eq!(main.failed_sync_count, 1);
	}

	#[tokio::test]
	async fn overlapping_cycles_are_skipped() {
		let (orchestrator, _dir) = orchestrator(ScriptedSource::default(), None).await;

		orchestrator.running.store(true, Ordering::Release);
		assert_eq!(orchestrator.run_cycle().await, CycleReport::Skipped);
		assert!(orchestrator.last_report().await.is_none());

		orchestrator.running.store(false, Ordering::Release);
		assert!(matches!(orchestrator.run_cycle().await, CycleReport::Completed(_)));
		assert!(!orchestrator.is_running());
	}

	#[tokio::test]
	async fn claims_are_exclusive() {
		let (orchestrator, _dir) = orchestrator(ScriptedSource::default(), None).await;
		let orchestrator = Arc::new(orchestrator);

		let claim = orchestrator.try_claim().unwrap();
		assert!(orchestrator.is_running());
		assert!(orchestrator.try_claim().is_none());
		assert_eq!(orchestrator.run_cycle().await, CycleReport::Skipped);

		assert!(matches!(claim.run().await, CycleReport::Completed(_)));
		assert!(!orchestrator.is_running());
		assert!(orchestrator.last_report().await.is_some());

		drop(orchestrator.try_claim().unwrap());
		assert!(!orchestrator.is_running());
	}

	#[tokio::test]
	async fn run_loop_stops_on_cancellation() {
		let (orchestrator, _dir) = orchestrator(ScriptedSource::default(), None).await;
		let shutdown = CancellationToken::new();
		shutdown.cancel();

		orchestrator.run(shutdown).await;

		assert!(orchestrator.last_report().await.is_none());
	}
}
