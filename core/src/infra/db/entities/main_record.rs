//! Main survey submissions

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "main_records")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub uuid: String,

	pub instance_id: Option<String>,

	#[sea_orm(indexed)]
	pub submitted_at: Option<DateTimeUtc>,
	pub survey_start: Option<DateTimeUtc>,
	pub survey_end: Option<DateTimeUtc>,
	pub survey_date: Option<Date>,

	#[sea_orm(column_type = "Json")]
	pub location: Json,
	#[sea_orm(column_type = "Json")]
	pub description: Json,
	#[sea_orm(column_type = "Json")]
	pub system: Json,
	#[sea_orm(column_type = "Json")]
	pub follow_up: Json,
	#[sea_orm(column_type = "Json")]
	pub meta: Json,
	/// Every other top level field of the submission
	#[sea_orm(column_type = "Json")]
	pub extra: Json,

	/// OData navigation link to the repeat group
	pub child_link: Option<String>,

	pub image_reference: Option<String>,
	pub image_key: Option<String>,
	pub image_url: Option<String>,

	pub plus_code_reference: Option<String>,
	pub plus_code_key: Option<String>,
	pub plus_code_url: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
