//! Unified error handling for the core

use thiserror::Error;

use crate::{
	config::ConfigError, logging::LoggingError, persistence::PersistenceError,
	source::SourceError, storage::StorageError, tracker::TrackerError,
};

/// Errors surfaced while setting the sync engine up. Failures during a cycle are recorded in the
/// sync history instead of being returned.
#[derive(Error, Debug)]
pub enum Error {
	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Logging error: {0}")]
	Logging(#[from] LoggingError),

	#[error("Database error: {0}")]
	Database(#[from] sea_orm::DbErr),

	#[error("Form server error: {0}")]
	Source(#[from] SourceError),

	#[error("Object storage error: {0}")]
	Storage(#[from] StorageError),

	#[error("Persistence error: {0}")]
	Persistence(#[from] PersistenceError),

	#[error("Sync tracking error: {0}")]
	Tracker(#[from] TrackerError),
}
