//! Batched writes of synchronized rows and the unified table rebuild.

use std::collections::{hash_map::Entry, HashMap};

use chrono::{DateTime, Utc};
use sea_orm::{
	sea_query::{Alias, Expr, OnConflict, Table},
	ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityName, EntityTrait,
	Iterable, QueryFilter, QueryOrder, Schema, TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{
	config::UnifiedConfig,
	document::Document,
	infra::db::entities::{
		child_record, main_record, unified_record, ChildRecord, MainRecord, UnifiedRecord,
	},
	media::{ImageCategory, SignedImage},
	processor::{ChildRow, ImageReference, MainRow, StoredImage},
	unified::{self, Rules},
};

/// Rows per statement, keeps every backend below its bind parameter limit.
const INSERT_CHUNK_SIZE: usize = 50;
const LOOKUP_CHUNK_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
	#[error("invalid unified table rule: {0}")]
	Rules(#[from] regex::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
	pub inserted: u64,
	pub updated: u64,
	pub unchanged: u64,
}

impl UpsertStats {
	#[must_use]
	pub const fn written(&self) -> u64 {
		self.inserted + self.updated
	}

	#[must_use]
	pub const fn total(&self) -> u64 {
		self.inserted + self.updated + self.unchanged
	}
}

pub struct PersistenceEngine {
	conn: DatabaseConnection,
	rules: Rules,
}

impl PersistenceEngine {
	pub fn new(conn: DatabaseConnection, unified: &UnifiedConfig) -> Result<Self, PersistenceError> {
		Ok(Self {
			conn,
			rules: Rules::compile(unified)?,
		})
	}

	#[instrument(skip_all, fields(rows = rows.len()), err)]
	pub async fn upsert_main(&self, rows: Vec<MainRow>) -> Result<UpsertStats, PersistenceError> {
		let models = dedup(rows.into_iter().map(main_record::Model::from), |m| m.uuid.clone());
		if models.is_empty() {
			return Ok(UpsertStats::default());
		}

		let txn = self.conn.begin().await?;

		let keys = models.iter().map(|m| m.uuid.clone()).collect::<Vec<_>>();
		let mut stored = HashMap::with_capacity(keys.len());
		for chunk in keys.chunks(LOOKUP_CHUNK_SIZE) {
			for model in MainRecord::find()
				.filter(main_record::Column::Uuid.is_in(chunk.iter().cloned()))
				.all(&txn)
				.await?
			{
				stored.insert(model.uuid.clone(), model);
			}
		}

		let (changed, stats) = classify(models, |m| stored.get(&m.uuid));

		for chunk in changed.chunks(INSERT_CHUNK_SIZE) {
			MainRecord::insert_many(chunk.iter().cloned().map(main_record::ActiveModel::from))
				.on_conflict(
					OnConflict::column(main_record::Column::Uuid)
						.update_columns(
							main_record::Column::iter()
								.filter(|c| !matches!(c, main_record::Column::Uuid)),
						)
						.to_owned(),
				)
				.exec_without_returning(&txn)
				.await?;
		}

		txn.commit().await?;

		debug!(?stats, "Main rows persisted");

		Ok(stats)
	}

	#[instrument(skip_all, fields(rows = rows.len()), err)]
	pub async fn upsert_child(&self, rows: Vec<ChildRow>) -> Result<UpsertStats, PersistenceError> {
		let models = dedup(rows.into_iter().map(child_record::Model::from), |m| m.uuid.clone());
		if models.is_empty() {
			return Ok(UpsertStats::default());
		}

		let txn = self.conn.begin().await?;

		let keys = models.iter().map(|m| m.uuid.clone()).collect::<Vec<_>>();
		let mut stored = HashMap::with_capacity(keys.len());
		for chunk in keys.chunks(LOOKUP_CHUNK_SIZE) {
			for model in ChildRecord::find()
				.filter(child_record::Column::Uuid.is_in(chunk.iter().cloned()))
				.all(&txn)
				.await?
			{
				stored.insert(model.uuid.clone(), model);
			}
		}

		let (changed, stats) = classify(models, |m| stored.get(&m.uuid));

		for chunk in changed.chunks(INSERT_CHUNK_SIZE) {
			ChildRecord::insert_many(chunk.iter().cloned().map(child_record::ActiveModel::from))
				.on_conflict(
					OnConflict::column(child_record::Column::Uuid)
						.update_columns(
							child_record::Column::iter()
								.filter(|c| !matches!(c, child_record::Column::Uuid)),
						)
						.to_owned(),
				)
				.exec_without_returning(&txn)
				.await?;
		}

		txn.commit().await?;

		debug!(?stats, "Child rows persisted");

		Ok(stats)
	}

	/// Stored rows for `keys`, missing keys are simply absent from the map.
	pub async fn load_main(&self, keys: &[String]) -> Result<HashMap<String, MainRow>, PersistenceError> {
		let mut rows = HashMap::with_capacity(keys.len());

		for chunk in keys.chunks(LOOKUP_CHUNK_SIZE) {
			for model in MainRecord::find()
				.filter(main_record::Column::Uuid.is_in(chunk.iter().cloned()))
				.all(&self.conn)
				.await?
			{
				rows.insert(model.uuid.clone(), MainRow::from(model));
			}
		}

		Ok(rows)
	}

	/// Every persisted signed URL along with the key it was signed for.
	pub async fn signed_images(&self) -> Result<Vec<SignedImage>, PersistenceError> {
		let models = MainRecord::find()
			.filter(
				main_record::Column::ImageUrl
					.is_not_null()
					.or(main_record::Column::PlusCodeUrl.is_not_null()),
			)
			.order_by_asc(main_record::Column::Uuid)
			.all(&self.conn)
			.await?;

		Ok(models
			.into_iter()
			.flat_map(|model| {
				[
					(ImageCategory::Building, model.image_key.clone(), model.image_url.clone()),
					(ImageCategory::PlusCode, model.plus_code_key.clone(), model.plus_code_url.clone()),
				]
				.into_iter()
				.filter_map(move |(category, key, url)| {
					Some(SignedImage {
						record_id: model.uuid.clone(),
						category,
						key: key?,
						url: url?,
					})
				})
			})
			.collect())
	}

	/// Writes refreshed URLs in one transaction. A URL is only replaced while the row still
	/// points at the key it was signed for.
	#[instrument(skip_all, fields(updates = updates.len()), err)]
	pub async fn update_image_urls(&self, updates: &[SignedImage]) -> Result<u64, PersistenceError> {
		if updates.is_empty() {
			return Ok(0);
		}

		let txn = self.conn.begin().await?;
		let mut written = 0;

		for update in updates {
			let (key_column, url_column) = match update.category {
				ImageCategory::Building => {
					(main_record::Column::ImageKey, main_record::Column::ImageUrl)
				}
				ImageCategory::PlusCode => {
					(main_record::Column::PlusCodeKey, main_record::Column::PlusCodeUrl)
				}
			};

			written += MainRecord::update_many()
				.col_expr(url_column, Expr::value(update.url.clone()))
				.filter(main_record::Column::Uuid.eq(update.record_id.as_str()))
				.filter(key_column.eq(update.key.as_str()))
				.exec(&txn)
				.await?
				.rows_affected;
		}

		txn.commit().await?;

		Ok(written)
	}

	/// Replaces the unified table with one row per stored submission, computed at `now`.
	///
	/// Drop, create and inserts share one transaction so readers see either the previous table
	/// or the complete new one.
	#[instrument(skip(self), err)]
	pub async fn rebuild_unified(&self, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
		let mains = MainRecord::find()
			.order_by_asc(main_record::Column::Uuid)
			.all(&self.conn)
			.await?;

		let mut children = HashMap::<String, Vec<child_record::Model>>::new();
		for child in ChildRecord::find()
			.order_by_asc(child_record::Column::ParentUuid)
			.order_by_asc(child_record::Column::Uuid)
			.all(&self.conn)
			.await?
		{
			children.entry(child.parent_uuid.clone()).or_default().push(child);
		}

		let rows = mains
			.iter()
			.map(|main| {
				unified::build_row(
					main,
					children.get(&main.uuid).map_or(&[][..], Vec::as_slice),
					&self.rules,
					now,
				)
			})
			.collect::<Vec<_>>();

		let backend = self.conn.get_database_backend();
		let txn = self.conn.begin().await?;

		let drop = Table::drop()
			.table(Alias::new(UnifiedRecord.table_name().to_string()))
			.if_exists()
			.to_owned();
		txn.execute(backend.build(&drop)).await?;

		let create = Schema::new(backend).create_table_from_entity(UnifiedRecord);
		txn.execute(backend.build(&create)).await?;

		for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
			UnifiedRecord::insert_many(chunk.iter().cloned().map(unified_record::ActiveModel::from))
				.exec_without_returning(&txn)
				.await?;
		}

		txn.commit().await?;

		let count = rows.len() as u64;
		info!(rows = count, "Unified table rebuilt");

		Ok(count)
	}

	/// The current unified table, empty before the first rebuild.
	pub async fn unified_rows(&self) -> Result<Vec<unified_record::Model>, PersistenceError> {
		if !self.unified_table_exists().await? {
			return Ok(Vec::new());
		}

		Ok(UnifiedRecord::find()
			.order_by_asc(unified_record::Column::Uuid)
			.all(&self.conn)
			.await?)
	}

	async fn unified_table_exists(&self) -> Result<bool, PersistenceError> {
		let backend = self.conn.get_database_backend();
		let sql = match backend {
			sea_orm::DbBackend::Sqlite => {
				"SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'unified_records'"
			}
			sea_orm::DbBackend::Postgres | sea_orm::DbBackend::MySql => {
				"SELECT table_name FROM information_schema.tables WHERE table_name = 'unified_records'"
			}
		};

		Ok(self
			.conn
			.query_one(sea_orm::Statement::from_string(backend, sql))
			.await?
			.is_some())
	}
}

/// Keeps the last occurrence of every key, in first-seen order.
fn dedup<T>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> String) -> Vec<T> {
	let mut positions = HashMap::new();
	let mut unique = Vec::new();

	for item in items {
		match positions.entry(key(&item)) {
			Entry::Occupied(entry) => unique[*entry.get()] = item,
			Entry::Vacant(entry) => {
				entry.insert(unique.len());
				unique.push(item);
			}
		}
	}

	unique
}

fn classify<'s, T: PartialEq + 's>(
	models: Vec<T>,
	stored: impl Fn(&T) -> Option<&'s T>,
) -> (Vec<T>, UpsertStats) {
	let mut stats = UpsertStats::default();

	let changed = models
		.into_iter()
		.filter(|model| match stored(model) {
			None => {
				stats.inserted += 1;
				true
			}
			Some(existing) if existing == model => {
				stats.unchanged += 1;
				false
			}
			Some(_) => {
				stats.updated += 1;
				true
			}
		})
		.collect();

	(changed, stats)
}

impl From<MainRow> for main_record::Model {
	fn from(row: MainRow) -> Self {
		let (image_key, image_url) = split_stored(row.image);
		let (plus_code_key, plus_code_url) = split_stored(row.plus_code);

		Self {
			uuid: row.uuid,
			instance_id: row.instance_id,
			submitted_at: row.submitted_at,
			survey_start: row.survey_start,
			survey_end: row.survey_end,
			survey_date: row.survey_date,
			location: row.location.into(),
			description: row.description.into(),
			system: row.system.into(),
			follow_up: row.follow_up.into(),
			meta: row.meta.into(),
			extra: row.extra.into(),
			child_link: row.child_link,
			image_reference: row.image_reference.as_ref().map(ImageReference::as_stored),
			image_key,
			image_url,
			plus_code_reference: row.plus_code_reference.as_ref().map(ImageReference::as_stored),
			plus_code_key,
			plus_code_url,
		}
	}
}

impl From<main_record::Model> for MainRow {
	fn from(model: main_record::Model) -> Self {
		Self {
			uuid: model.uuid,
			instance_id: model.instance_id,
			submitted_at: model.submitted_at,
			survey_start: model.survey_start,
			survey_end: model.survey_end,
			survey_date: model.survey_date,
			location: Document::new(model.location),
			description: Document::new(model.description),
			system: Document::new(model.system),
			follow_up: Document::new(model.follow_up),
			meta: Document::new(model.meta),
			extra: Document::new(model.extra),
			child_link: model.child_link,
			image_reference: model.image_reference.as_deref().and_then(ImageReference::parse),
			image: join_stored(model.image_key, model.image_url),
			plus_code_reference: model
				.plus_code_reference
				.as_deref()
				.and_then(ImageReference::parse),
			plus_code: join_stored(model.plus_code_key, model.plus_code_url),
		}
	}
}

impl From<ChildRow> for child_record::Model {
	fn from(row: ChildRow) -> Self {
		Self {
			uuid: row.uuid,
			parent_uuid: row.parent_uuid,
			instance_id: row.instance_id,
			position: row.position,
			person_type: row.person_type.into(),
			occupancy: row.occupancy.into(),
			attributes: row.attributes.into(),
		}
	}
}

fn split_stored(image: Option<StoredImage>) -> (Option<String>, Option<String>) {
	image.map_or((None, None), |StoredImage { key, url }| (Some(key), Some(url)))
}

fn join_stored(key: Option<String>, url: Option<String>) -> Option<StoredImage> {
	Some(StoredImage { key: key?, url: url? })
}
