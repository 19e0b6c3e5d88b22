//! Sync state and attempt history.
//!
//! Every sync type owns a single `sync_status` row whose `last_sync_timestamp` is the
//! watermark used to filter the next fetch. Attempts are recorded in `sync_history`.
//! Starting an attempt never fails: a broken tracking store must not stop the sync itself.

use chrono::{DateTime, Utc};
use sea_orm::{
	sea_query::OnConflict, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait,
	DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
	TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::infra::db::entities::{sync_history, sync_status, SyncStatus, SyncType};

const MAX_ERROR_MESSAGE_CHARS: usize = 1000;
const RECENT_HISTORY_LIMIT: u64 = 10;

#[derive(Debug, Error)]
pub enum TrackerError {
	#[error("tracking store error: {0}")]
	Database(#[from] DbErr),
}

/// Identifies the history row of an attempt. Untracked attempts are the ones whose start
/// couldn't be recorded, they still get a history row when they finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptId {
	Tracked(i32),
	Untracked,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
	pub types: Vec<sync_status::Model>,
	pub recent_history: Vec<sync_history::Model>,
}

#[derive(Debug, Clone)]
pub struct SyncTracker {
	conn: DatabaseConnection,
	instance: String,
}

impl SyncTracker {
	#[must_use]
	pub fn new(conn: DatabaseConnection) -> Self {
		Self {
			conn,
			instance: service_instance(),
		}
	}

	/// `{hostname}-{pid}`, stored on every history row
	#[must_use]
	pub fn instance(&self) -> &str {
		&self.instance
	}

	/// Records an in progress attempt and marks the sync type as running.
	#[instrument(skip(self))]
	pub async fn start_attempt(&self, sync_type: SyncType) -> AttemptId {
		match self.try_start_attempt(sync_type, Utc::now()).await {
			Ok(id) => {
				debug!(attempt_id = id, "Sync attempt started");
				AttemptId::Tracked(id)
			}
			Err(e) => {
				error!(?e, "Failed to record sync attempt start, continuing untracked");
				AttemptId::Untracked
			}
		}
	}

	async fn try_start_attempt(&self, sync_type: SyncType, now: DateTime<Utc>) -> Result<i32, DbErr> {
		let txn = self.conn.begin().await?;

		let history = sync_history::ActiveModel {
			sync_type: Set(sync_type),
			sync_timestamp: Set(now),
			status: Set(SyncStatus::InProgress),
			records_processed: Set(0),
			duration_seconds: Set(None),
			error_message: Set(None),
			metadata: Set(None),
			service_instance: Set(self.instance.clone()),
			..Default::default()
		}
		.insert(&txn)
		.await?;

		let mut state = load_state(&txn, sync_type, now).await?;
		state.last_attempt_timestamp = Some(now);
		state.last_sync_status = SyncStatus::InProgress;
		state.updated_at = now;
		save_state(&txn, state).await?;

		txn.commit().await?;

		Ok(history.id)
	}

	/// Finishes an attempt successfully. The watermark only moves to `new_watermark`, and never
	/// backwards; `None` leaves it untouched.
	#[instrument(skip(self, metadata), err)]
	pub async fn complete_attempt(
		&self,
		attempt: AttemptId,
		sync_type: SyncType,
		records_processed: u64,
		new_watermark: Option<DateTime<Utc>>,
		metadata: Value,
	) -> Result<(), TrackerError> {
		let now = Utc::now();
		let records_processed = i64::try_from(records_processed).unwrap_or(i64::MAX);
		let txn = self.conn.begin().await?;

		let mut state = load_state(&txn, sync_type, now).await?;

		if let Some(watermark) = new_watermark {
			match state.last_sync_timestamp {
				Some(current) if watermark <= current => {
					debug!(%watermark, %current, "Keeping newer watermark");
				}
				_ => state.last_sync_timestamp = Some(watermark),
			}
		}

		state.last_sync_status = SyncStatus::Success;
		state.last_error_message = None;
		state.successful_sync_count += 1;
		state.last_records_processed = records_processed;
		state.updated_at = now;
		save_state(&txn, state).await?;

		self.finalize_history(
			&txn,
			attempt,
			sync_type,
			Finalized {
				status: SyncStatus::Success,
				records_processed,
				error_message: None,
				metadata: Some(metadata),
			},
			now,
		)
		.await?;

		txn.commit().await?;

		Ok(())
	}

	/// Finishes an attempt with an error. The watermark is left untouched so the next attempt
	/// fetches the same window again.
	#[instrument(skip(self), err)]
	pub async fn fail_attempt(
		&self,
		attempt: AttemptId,
		sync_type: SyncType,
		error_message: &str,
	) -> Result<(), TrackerError> {
		let now = Utc::now();
		let error_message = truncate(error_message);
		let txn = self.conn.begin().await?;

		let mut state = load_state(&txn, sync_type, now).await?;
		state.last_sync_status = SyncStatus::Error;
		state.last_error_message = Some(error_message.clone());
		state.failed_sync_count += 1;
		state.updated_at = now;
		save_state(&txn, state).await?;

		self.finalize_history(
			&txn,
			attempt,
			sync_type,
			Finalized {
				status: SyncStatus::Error,
				records_processed: 0,
				error_message: Some(error_message),
				metadata: None,
			},
			now,
		)
		.await?;

		txn.commit().await?;

		Ok(())
	}

	pub async fn watermark(&self, sync_type: SyncType) -> Result<Option<DateTime<Utc>>, TrackerError> {
		Ok(sync_status::Entity::find_by_id(sync_type)
			.one(&self.conn)
			.await?
			.and_then(|state| state.last_sync_timestamp))
	}

	pub async fn statistics(&self) -> Result<SyncStatistics, TrackerError> {
		let types = sync_status::Entity::find()
			.order_by_asc(sync_status::Column::SyncType)
			.all(&self.conn)
			.await?;

		let recent_history = sync_history::Entity::find()
			.order_by_desc(sync_history::Column::Id)
			.limit(RECENT_HISTORY_LIMIT)
			.all(&self.conn)
			.await?;

		Ok(SyncStatistics {
			types,
			recent_history,
		})
	}

	/// Deletes finished history rows older than `retention`.
	#[instrument(skip(self), err)]
	pub async fn cleanup_history(
		&self,
		retention: chrono::Duration,
		now: DateTime<Utc>,
	) -> Result<u64, TrackerError> {
		let res = sync_history::Entity::delete_many()
			.filter(sync_history::Column::SyncTimestamp.lt(now - retention))
			.filter(sync_history::Column::Status.ne(SyncStatus::InProgress))
			.exec(&self.conn)
			.await?;

		debug!(removed = res.rows_affected, "Old sync history removed");

		Ok(res.rows_affected)
	}

	async fn finalize_history(
		&self,
		txn: &impl ConnectionTrait,
		attempt: AttemptId,
		sync_type: SyncType,
		finalized: Finalized,
		now: DateTime<Utc>,
	) -> Result<(), DbErr> {
		let Finalized {
			status,
			records_processed,
			error_message,
			metadata,
		} = finalized;

		let AttemptId::Tracked(id) = attempt else {
			sync_history::ActiveModel {
				sync_type: Set(sync_type),
				sync_timestamp: Set(now),
				status: Set(status),
				records_processed: Set(records_processed),
				duration_seconds: Set(None),
				error_message: Set(error_message),
				metadata: Set(metadata),
				service_instance: Set(self.instance.clone()),
				..Default::default()
			}
			.insert(txn)
			.await?;

			return Ok(());
		};

		let Some(started) = sync_history::Entity::find_by_id(id).one(txn).await? else {
			warn!(attempt_id = id, "Sync attempt history row vanished");
			return Ok(());
		};

		if started.status != SyncStatus::InProgress {
			warn!(attempt_id = id, status = %started.status, "Sync attempt already finalized");
			return Ok(());
		}

		#[allow(clippy::cast_precision_loss)]
		let duration_seconds = (now - started.sync_timestamp).num_milliseconds().max(0) as f64 / 1000.0;

		sync_history::ActiveModel {
			id: sea_orm::ActiveValue::Unchanged(id),
			status: Set(status),
			records_processed: Set(records_processed),
			duration_seconds: Set(Some(duration_seconds)),
			error_message: Set(error_message),
			metadata: Set(metadata),
			..Default::default()
		}
		.update(txn)
		.await?;

		Ok(())
	}
}

struct Finalized {
	status: SyncStatus,
	records_processed: i64,
	error_message: Option<String>,
	metadata: Option<Value>,
}

async fn load_state(
	conn: &impl ConnectionTrait,
	sync_type: SyncType,
	now: DateTime<Utc>,
) -> Result<sync_status::Model, DbErr> {
	Ok(sync_status::Entity::find_by_id(sync_type)
		.one(conn)
		.await?
		.unwrap_or(sync_status::Model {
			sync_type,
			last_sync_timestamp: None,
			last_attempt_timestamp: None,
			last_sync_status: SyncStatus::Pending,
			last_error_message: None,
			successful_sync_count: 0,
			failed_sync_count: 0,
			last_records_processed: 0,
			created_at: now,
			updated_at: now,
		}))
}

async fn save_state(conn: &impl ConnectionTrait, state: sync_status::Model) -> Result<(), DbErr> {
	use sync_status::Column;

	sync_status::Entity::insert(sync_status::ActiveModel {
		sync_type: Set(state.sync_type),
		last_sync_timestamp: Set(state.last_sync_timestamp),
		last_attempt_timestamp: Set(state.last_attempt_timestamp),
		last_sync_status: Set(state.last_sync_status),
		last_error_message: Set(state.last_error_message),
		successful_sync_count: Set(state.successful_sync_count),
		failed_sync_count: Set(state.failed_sync_count),
		last_records_processed: Set(state.last_records_processed),
		created_at: Set(state.created_at),
		updated_at: Set(state.updated_at),
	})
	.on_conflict(
		OnConflict::column(Column::SyncType)
			.update_columns([
				Column::LastSyncTimestamp,
				Column::LastAttemptTimestamp,
				Column::LastSyncStatus,
				Column::LastErrorMessage,
				Column::SuccessfulSyncCount,
				Column::FailedSyncCount,
				Column::LastRecordsProcessed,
				Column::UpdatedAt,
			])
			.to_owned(),
	)
	.exec_without_returning(conn)
	.await?;

	Ok(())
}

fn truncate(message: &str) -> String {
	message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

fn service_instance() -> String {
	let host = hostname::get()
		.ok()
		.and_then(|name| name.into_string().ok())
		.unwrap_or_else(|| "unknown".to_string());

	format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
	use super::*;

	use chrono::TimeZone;
	use serde_json::json;

	use crate::infra::db::{test_database, Database};

	fn ts(hour: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
	}

	async fn state(tracker: &SyncTracker, sync_type: SyncType) -> sync_status::Model {
		sync_status::Entity::find_by_id(sync_type)
			.one(&tracker.conn)
			.await
			.unwrap()
			.unwrap()
	}

	#[tokio::test]
	async fn successful_attempt_advances_watermark() {
		let (db, _temp) = test_database().await;
		let tracker = SyncTracker::new(db.conn().clone());

		assert_eq!(tracker.watermark(SyncType::Main).await.unwrap(), None);

		let attempt = tracker.start_attempt(SyncType::Main).await;
		assert!(matches!(attempt, AttemptId::Tracked(_)));
		assert_eq!(
			state(&tracker, SyncType::Main).await.last_sync_status,
			SyncStatus::InProgress
		);

		tracker
			.complete_attempt(attempt, SyncType::Main, 12, Some(ts(10)), json!({"inserted": 12}))
			.await
			.unwrap();

		let main = state(&tracker, SyncType::Main).await;
		assert_eq!(main.successful_sync_count, 1);
		assert_eq!(main.failed_sync_count, 0);
		assert_eq!(main.last_records_processed, 12);
		assert_eq!(main.last_sync_status, SyncStatus::Success);
		assert_eq!(tracker.watermark(SyncType::Main).await.unwrap(), Some(ts(10)));
	}

	#[tokio::test]
	async fn failed_attempt_keeps_watermark() {
		let (db, _temp) = test_database().await;
		let tracker = SyncTracker::new(db.conn().clone());

		let attempt = tracker.start_attempt(SyncType::Main).await;
		tracker
			.complete_attempt(attempt, SyncType::Main, 1, Some(ts(8)), json!({}))
			.await
			.unwrap();

		let attempt = tracker.start_attempt(SyncType::Main).await;
		tracker
			.fail_attempt(attempt, SyncType::Main, &"x".repeat(5000))
			.await
			.unwrap();

		let main = state(&tracker, SyncType::Main).await;
		assert_eq!(main.failed_sync_count, 1);
		assert_eq!(main.successful_sync_count, 1);
		assert_eq!(main.last_sync_timestamp, Some(ts(8)));
		assert_eq!(main.last_sync_status, SyncStatus::Error);
		assert_eq!(
			main.last_error_message.map(|m| m.chars().count()),
			Some(MAX_ERROR_MESSAGE_CHARS)
		);
	}

	#[tokio::test]
	async fn watermark_only_moves_forward_and_only_when_given() {
		let (db, _temp) = test_database().await;
		let tracker = SyncTracker::new(db.conn().clone());

		for watermark in [Some(ts(9)), None, Some(ts(7))] {
			let attempt = tracker.start_attempt(SyncType::Child).await;
			tracker
				.complete_attempt(attempt, SyncType::Child, 0, watermark, json!({}))
				.await
				.unwrap();
		}

		assert_eq!(tracker.watermark(SyncType::Child).await.unwrap(), Some(ts(9)));
		assert_eq!(state(&tracker, SyncType::Child).await.successful_sync_count, 3);
		assert_eq!(tracker.watermark(SyncType::Main).await.unwrap(), None);
	}

	#[tokio::test]
	async fn history_rows_are_finalized_once() {
		let (db, _temp) = test_database().await;
		let tracker = SyncTracker::new(db.conn().clone());

		let attempt = tracker.start_attempt(SyncType::Image).await;
		tracker
			.complete_attempt(attempt, SyncType::Image, 3, None, json!({"uploaded": 3}))
			.await
			.unwrap();
		tracker
			.fail_attempt(attempt, SyncType::Image, "late failure")
			.await
			.unwrap();

		let AttemptId::Tracked(id) = attempt else {
			panic!("attempt should be tracked");
		};
		let row = sync_history::Entity::find_by_id(id)
			.one(db.conn())
			.await
			.unwrap()
			.unwrap();

		assert_eq!(row.status, SyncStatus::Success);
		assert_eq!(row.records_processed, 3);
		assert_eq!(row.metadata, Some(json!({"uploaded": 3})));
		assert!(row.duration_seconds.is_some());
		assert_eq!(row.service_instance, tracker.instance());
	}

	#[tokio::test]
	async fn broken_store_fails_open() {
		let temp = tempfile::TempDir::new().unwrap();
		let db = Database::connect(
			&format!("sqlite://{}?mode=rwc", temp.path().join("empty.db").display()),
			1,
		)
		.await
		.unwrap();
		let tracker = SyncTracker::new(db.conn().clone());

		assert_eq!(tracker.start_attempt(SyncType::Main).await, AttemptId::Untracked);
	}

	#[tokio::test]
	async fn statistics_and_cleanup() {
		let (db, _temp) = test_database().await;
		let tracker = SyncTracker::new(db.conn().clone());

		for _ in 0..12 {
			let attempt = tracker.start_attempt(SyncType::UrlRefresh).await;
			tracker
				.complete_attempt(attempt, SyncType::UrlRefresh, 0, None, json!({}))
				.await
				.unwrap();
		}
		let attempt = tracker.start_attempt(SyncType::Main).await;
		tracker
			.fail_attempt(attempt, SyncType::Main, "boom")
			.await
			.unwrap();

		let stats = tracker.statistics().await.unwrap();
		assert_eq!(stats.types.len(), 2);
		assert_eq!(stats.recent_history.len(), 10);
		assert_eq!(stats.recent_history[0].sync_type, SyncType::Main);

		let removed = tracker
			.cleanup_history(chrono::Duration::days(30), Utc::now() + chrono::Duration::days(31))
			.await
			.unwrap();
		assert_eq!(removed, 13);

		let removed = tracker
			.cleanup_history(chrono::Duration::days(30), Utc::now())
			.await
			.unwrap();
		assert_eq!(removed, 0);
	}
}
