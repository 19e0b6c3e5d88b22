use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use formsync_core::{logging, AppConfig, CycleReport, SyncOrchestrator};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod routes;

#[derive(Parser, Debug)]
#[command(name = "formsync-server", about = "Survey submission sync service")]
struct Args {
	/// TOML configuration file, environment variables override its values
	#[arg(long, env = "FORMSYNC_CONFIG")]
	config: Option<PathBuf>,

	/// Run a single sync cycle and exit
	#[arg(long)]
	once: bool,

	/// Address of the status endpoints
	#[arg(long)]
	bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load config")?;
	if let Some(bind) = args.bind {
		config.server.bind = bind;
	}

	logging::init(&config.logs_dir(), &config.log_level)?;

	let orchestrator = Arc::new(
		SyncOrchestrator::connect(&config)
			.await
			.context("Failed to start sync engine")?,
	);

	if args.once {
		let report = orchestrator.run_cycle().await;
		println!("{}", serde_json::to_string_pretty(&report)?);

		if let CycleReport::Completed(summary) = report {
			if !summary.errors.is_empty() {
				bail!("Sync cycle finished with {} error(s)", summary.errors.len());
			}
		}
		return Ok(());
	}

	let shutdown = CancellationToken::new();

	let sync_loop = tokio::spawn({
		let orchestrator = Arc::clone(&orchestrator);
		let shutdown = shutdown.clone();
		async move { orchestrator.run(shutdown).await }
	});

	let listener = TcpListener::bind(&config.server.bind)
		.await
		.with_context(|| format!("Failed to bind {}", config.server.bind))?;
	info!("Listening on http://{}", listener.local_addr()?);

	tokio::spawn(shutdown_signal(shutdown.clone()));

	axum::serve(listener, routes::router(orchestrator))
		.with_graceful_shutdown({
			let shutdown = shutdown.clone();
			async move { shutdown.cancelled().await }
		})
		.await?;

	// A cycle in progress is finished before the loop returns
	if let Err(e) = sync_loop.await {
		error!(?e, "Sync loop panicked");
	}

	info!("Shutdown complete");

	Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			error!(?e, "Failed to listen for ctrl-c");
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(e) => {
				error!(?e, "Failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => info!("Received Ctrl+C, shutting down..."),
		() = terminate => info!("Received SIGTERM, shutting down..."),
	}

	shutdown.cancel();
}
