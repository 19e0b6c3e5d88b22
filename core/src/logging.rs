use std::{path::Path, sync::Once};

use thiserror::Error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
	#[error("failed to create logs directory <path='{}'>: {source}", .path.display())]
	LogsDir {
		path: std::path::PathBuf,
		source: std::io::Error,
	},
	#[error("failed to initialize tracing: {0}")]
	Init(String),
}

/// Initialize tracing with stdout output plus a daily rotated `{logs_dir}/formsync.log`.
///
/// `RUST_LOG` takes precedence over `default_level`. Only the first call has any effect.
pub fn init(logs_dir: &Path, default_level: &str) -> Result<(), LoggingError> {
	static INIT: Once = Once::new();
	let mut result = Ok(());

	INIT.call_once(|| {
		if let Err(source) = std::fs::create_dir_all(logs_dir) {
			result = Err(LoggingError::LogsDir {
				path: logs_dir.to_path_buf(),
				source,
			});
			return;
		}

		let default_filter = format!(
			"formsync_core={default_level},formsync_server={default_level},formsync_task_system={default_level},warn"
		);

		let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "formsync.log");

		if let Err(e) = tracing_subscriber::registry()
			.with(
				EnvFilter::try_from_default_env()
					.unwrap_or_else(|_| EnvFilter::new(default_filter)),
			)
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_writer(std::io::stdout),
			)
			.with(
				fmt::layer()
					.with_target(true)
					.with_thread_ids(true)
					.with_ansi(false)
					.with_writer(file_appender),
			)
			.try_init()
		{
			result = Err(LoggingError::Init(e.to_string()));
		}
	});

	result
}
