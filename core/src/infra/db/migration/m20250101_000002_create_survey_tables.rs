//! Create the tables holding synchronized submissions
//!
//! - main_records: one row per form submission
//! - child_records: one row per repeat group entry, linked through `parent_uuid`

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(MainRecords::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(MainRecords::Uuid)
							.string()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(MainRecords::InstanceId).string())
					.col(ColumnDef::new(MainRecords::SubmittedAt).timestamp_with_time_zone())
					.col(ColumnDef::new(MainRecords::SurveyStart).timestamp_with_time_zone())
					.col(ColumnDef::new(MainRecords::SurveyEnd).timestamp_with_time_zone())
					.col(ColumnDef::new(MainRecords::SurveyDate).date())
					.col(ColumnDef::new(MainRecords::Location).json().not_null())
					.col(ColumnDef::new(MainRecords::Description).json().not_null())
					.col(ColumnDef::new(MainRecords::System).json().not_null())
					.col(ColumnDef::new(MainRecords::FollowUp).json().not_null())
					.col(ColumnDef::new(MainRecords::Meta).json().not_null())
					.col(ColumnDef::new(MainRecords::Extra).json().not_null())
					.col(ColumnDef::new(MainRecords::ChildLink).text())
					.col(ColumnDef::new(MainRecords::ImageReference).text())
					.col(ColumnDef::new(MainRecords::ImageKey).text())
					.col(ColumnDef::new(MainRecords::ImageUrl).text())
					.col(ColumnDef::new(MainRecords::PlusCodeReference).text())
					.col(ColumnDef::new(MainRecords::PlusCodeKey).text())
					.col(ColumnDef::new(MainRecords::PlusCodeUrl).text())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_main_records_submitted_at")
					.table(MainRecords::Table)
					.col(MainRecords::SubmittedAt)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ChildRecords::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ChildRecords::Uuid)
							.string()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(ChildRecords::ParentUuid).string().not_null())
					.col(ColumnDef::new(ChildRecords::InstanceId).string())
					.col(ColumnDef::new(ChildRecords::Position).integer())
					.col(ColumnDef::new(ChildRecords::PersonType).json().not_null())
					.col(ColumnDef::new(ChildRecords::Occupancy).json().not_null())
					.col(ColumnDef::new(ChildRecords::Attributes).json().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_child_records_parent_uuid")
					.table(ChildRecords::Table)
					.col(ChildRecords::ParentUuid)
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(ChildRecords::Table).to_owned())
			.await?;

		manager
			.drop_table(Table::drop().table(MainRecords::Table).to_owned())
			.await?;

		Ok(())
	}
}

#[derive(DeriveIden)]
enum MainRecords {
	Table,
	Uuid,
	InstanceId,
	SubmittedAt,
	SurveyStart,
	SurveyEnd,
	SurveyDate,
	Location,
	Description,
	System,
	FollowUp,
	Meta,
	Extra,
	ChildLink,
	ImageReference,
	ImageKey,
	ImageUrl,
	PlusCodeReference,
	PlusCodeKey,
	PlusCodeUrl,
}

#[derive(DeriveIden)]
enum ChildRecords {
	Table,
	Uuid,
	ParentUuid,
	InstanceId,
	Position,
	PersonType,
	Occupancy,
	Attributes,
}
