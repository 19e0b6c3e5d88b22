//! Repeat group entries (people living or working in the surveyed property)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "child_records")]
pub struct Model {
	/// Always `{parent_uuid}_{child id}`
	#[sea_orm(primary_key, auto_increment = false)]
	pub uuid: String,

	#[sea_orm(indexed)]
	pub parent_uuid: String,

	pub instance_id: Option<String>,
	pub position: Option<i32>,

	#[sea_orm(column_type = "Json")]
	pub person_type: Json,
	#[sea_orm(column_type = "Json")]
	pub occupancy: Json,
	#[sea_orm(column_type = "Json")]
	pub attributes: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
