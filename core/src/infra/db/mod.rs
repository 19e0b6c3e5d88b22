//! Database infrastructure using SeaORM

use std::time::Duration;

use sea_orm::{
	ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr,
};
use sea_orm_migration::MigratorTrait;
use tracing::info;

pub mod entities;
pub mod migration;

/// Owns the connection pool shared by the tracker and the persistence engine
#[derive(Debug, Clone)]
pub struct Database {
	conn: DatabaseConnection,
}

impl Database {
	/// Connect to `url`, any sqlx url sea-orm understands (`sqlite://...`, `postgres://...`)
	pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DbErr> {
		// Every connection to an in memory SQLite database is a brand new database
		let max_connections = if url.contains(":memory:") {
			1
		} else {
			max_connections.max(1)
		};

		let mut opt = ConnectOptions::new(url.to_owned());
		opt.max_connections(max_connections)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.acquire_timeout(Duration::from_secs(30))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;

		info!(backend = ?conn.get_database_backend(), "Connected to database");

		Ok(Self { conn })
	}

	/// Run migrations
	pub async fn migrate(&self) -> Result<(), DbErr> {
		migration::Migrator::up(&self.conn, None).await?;
		info!("Database migrations completed successfully");
		Ok(())
	}

	/// Get the database connection
	#[must_use]
	pub const fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}
}

/// A migrated SQLite database living inside a temporary directory
#[cfg(test)]
pub(crate) async fn test_database() -> (Database, tempfile::TempDir) {
	let temp_dir = tempfile::TempDir::new().unwrap();
	let db_path = temp_dir.path().join("formsync_test.db");
	let db = Database::connect(&format!("sqlite://{}?mode=rwc", db_path.display()), 4)
		.await
		.unwrap();
	db.migrate().await.unwrap();

	(db, temp_dir)
}
