//! Append-only audit trail, one row per sync attempt

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::sync_status::{SyncStatus, SyncType};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_history")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,

	#[sea_orm(indexed)]
	pub sync_type: SyncType,

	/// When the attempt started
	#[sea_orm(indexed)]
	pub sync_timestamp: DateTimeUtc,

	pub status: SyncStatus,
	pub records_processed: i64,
	pub duration_seconds: Option<f64>,
	pub error_message: Option<String>,

	#[sea_orm(column_type = "Json", nullable)]
	pub metadata: Option<Json>,

	/// `{hostname}-{pid}` of the process that ran the attempt
	pub service_instance: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
