//! Per sync type state, one row per [`SyncType`]

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_status")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub sync_type: SyncType,

	/// Watermark, only moved forward by a successful attempt
	pub last_sync_timestamp: Option<DateTimeUtc>,
	pub last_attempt_timestamp: Option<DateTimeUtc>,
	pub last_sync_status: SyncStatus,
	pub last_error_message: Option<String>,
	pub successful_sync_count: i64,
	pub failed_sync_count: i64,
	pub last_records_processed: i64,
	pub created_at: DateTimeUtc,
	pub updated_at: DateTimeUtc,
}

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	EnumIter,
	DeriveActiveEnum,
	Serialize,
	Deserialize,
	strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncType {
	#[sea_orm(string_value = "main")]
	Main,
	#[sea_orm(string_value = "child")]
	Child,
	#[sea_orm(string_value = "image")]
	Image,
	#[sea_orm(string_value = "url_refresh")]
	UrlRefresh,
}

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	EnumIter,
	DeriveActiveEnum,
	Serialize,
	Deserialize,
	strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
	#[sea_orm(string_value = "pending")]
	Pending,
	#[sea_orm(string_value = "in_progress")]
	InProgress,
	#[sea_orm(string_value = "success")]
	Success,
	#[sea_orm(string_value = "error")]
	Error,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
