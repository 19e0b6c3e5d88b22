//! Create sync tracking tables
//!
//! - sync_status: one row per sync type, holding the watermark and counters
//! - sync_history: one row per sync attempt

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(SyncStatus::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(SyncStatus::SyncType)
							.string()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(SyncStatus::LastSyncTimestamp).timestamp_with_time_zone())
					.col(
						ColumnDef::new(SyncStatus::LastAttemptTimestamp)
							.timestamp_with_time_zone(),
					)
					.col(
						ColumnDef::new(SyncStatus::LastSyncStatus)
							.string()
							.not_null()
							.default("pending"),
					)
					.col(ColumnDef::new(SyncStatus::LastErrorMessage).text())
					.col(
						ColumnDef::new(SyncStatus::SuccessfulSyncCount)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(SyncStatus::FailedSyncCount)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(SyncStatus::LastRecordsProcessed)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(SyncStatus::CreatedAt)
							.timestamp_with_time_zone()
							.not_null()
							.default(Expr::current_timestamp()),
					)
					.col(
						ColumnDef::new(SyncStatus::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null()
							.default(Expr::current_timestamp()),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(SyncHistory::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(SyncHistory::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(SyncHistory::SyncType).string().not_null())
					.col(
						ColumnDef::new(SyncHistory::SyncTimestamp)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(SyncHistory::Status).string().not_null())
					.col(
						ColumnDef::new(SyncHistory::RecordsProcessed)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(ColumnDef::new(SyncHistory::DurationSeconds).double())
					.col(ColumnDef::new(SyncHistory::ErrorMessage).text())
					.col(ColumnDef::new(SyncHistory::Metadata).json())
					.col(ColumnDef::new(SyncHistory::ServiceInstance).string().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_sync_history_type_timestamp")
					.table(SyncHistory::Table)
					.col(SyncHistory::SyncType)
					.col(SyncHistory::SyncTimestamp)
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(SyncHistory::Table).to_owned())
			.await?;

		manager
			.drop_table(Table::drop().table(SyncStatus::Table).to_owned())
			.await?;

		Ok(())
	}
}

#[derive(DeriveIden)]
enum SyncStatus {
	Table,
	SyncType,
	LastSyncTimestamp,
	LastAttemptTimestamp,
	LastSyncStatus,
	LastErrorMessage,
	SuccessfulSyncCount,
	FailedSyncCount,
	LastRecordsProcessed,
	CreatedAt,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncHistory {
	Table,
	Id,
	SyncType,
	SyncTimestamp,
	Status,
	RecordsProcessed,
	DurationSeconds,
	ErrorMessage,
	Metadata,
	ServiceInstance,
}
