//! Denormalized table read by the dashboards.
//!
//! Not managed by migrations: every rebuild drops it and recreates it from this definition.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "unified_records")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub uuid: String,

	pub submitted_at: Option<DateTimeUtc>,
	pub survey_date: Option<Date>,
	pub submitter_name: Option<String>,
	pub review_state: Option<String>,
	pub rejected: bool,

	pub address_plus_code: Option<String>,
	pub street: Option<String>,
	pub town: Option<String>,
	pub district: Option<String>,
	pub property_name: Option<String>,
	pub building_type: Option<String>,
	pub units: i32,
	pub latitude: Option<f64>,
	pub longitude: Option<f64>,

	#[sea_orm(column_type = "Json")]
	pub child_details: Json,
	pub child_count: i32,
	pub owner_present: bool,

	pub total_annual_rent: f64,
	pub commercial_income: f64,
	pub residential_income: f64,
	pub business_income: f64,
	pub commercial_tax: f64,
	pub residential_tax: f64,
	pub business_tax: f64,
	pub total_tax: f64,
	pub amount_paid: f64,
	pub outstanding_balance: f64,

	pub meeting_date: Option<Date>,
	pub follow_up_status: Option<String>,

	pub data_quality_score: i32,

	pub image_url: Option<String>,
	pub image_html: Option<String>,
	pub plus_code_url: Option<String>,
	pub plus_code_html: Option<String>,

	pub rebuilt_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
