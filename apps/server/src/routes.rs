use std::sync::Arc;

use axum::{
	extract::State,
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use formsync_core::{tracker::SyncStatistics, CycleSummary, SyncOrchestrator};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

#[derive(Serialize)]
struct StatusResponse {
	running: bool,
	last_cycle: Option<CycleSummary>,
	#[serde(flatten)]
	statistics: SyncStatistics,
}

pub fn router(orchestrator: Arc<SyncOrchestrator>) -> Router {
	Router::new()
		.route("/", get(|| async { "formsync server" }))
		.route("/health", get(|| async { "OK" }))
		.route("/sync/status", get(status))
		.route("/sync/trigger", post(trigger))
		.with_state(orchestrator)
}

async fn status(State(orchestrator): State<Arc<SyncOrchestrator>>) -> Response {
	match orchestrator.tracker().statistics().await {
		Ok(statistics) => Json(StatusResponse {
			running: orchestrator.is_running(),
			last_cycle: orchestrator.last_report().await,
			statistics,
		})
		.into_response(),
		Err(e) => {
			error!(?e, "Failed to read sync statistics");
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(json!({ "error": e.to_string() })),
			)
				.into_response()
		}
	}
}

/// Starts a cycle in the background, the scheduled loop keeps its own pace.
async fn trigger(State(orchestrator): State<Arc<SyncOrchestrator>>) -> Response {
	let Some(claim) = orchestrator.try_claim() else {
		return (
			StatusCode::CONFLICT,
			Json(json!({ "status": "already_running" })),
		)
			.into_response();
	};

	info!("Manual sync cycle requested");
	tokio::spawn(async move {
		let report = claim.run().await;
		info!(?report, "Manual sync cycle finished");
	});

	(StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	use axum::{
		body::{to_bytes, Body},
		http::Request,
	};
	use formsync_core::AppConfig;
	use serde_json::Value;
	use tower::ServiceExt;

	async fn orchestrator() -> Arc<SyncOrchestrator> {
		let mut config = AppConfig::with_defaults();
		config.database.url = "sqlite::memory:".to_string();
		config.source.base_url = "http://127.0.0.1:9".to_string();
		config.source.project_id = "1".to_string();
		config.source.form_id = "survey".to_string();

		Arc::new(SyncOrchestrator::connect(&config).await.unwrap())
	}

	#[tokio::test]
	async fn health_answers_ok() {
		let response = router(orchestrator().await)
			.oneshot(Request::get("/health").body(Body::empty()).unwrap())
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		assert_eq!(&body[..], b"OK");
	}

	#[tokio::test]
	async fn trigger_conflicts_while_a_cycle_is_claimed() {
		let orchestrator = orchestrator().await;
		let claim = orchestrator.try_claim().unwrap();

		let response = router(Arc::clone(&orchestrator))
			.oneshot(Request::post("/sync/trigger").body(Body::empty()).unwrap())
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::CONFLICT);
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let body = serde_json::from_slice::<Value>(&body).unwrap();
		assert_eq!(body["status"], "already_running");

		drop(claim);
		assert!(!orchestrator.is_running());
	}

	#[tokio::test]
	async fn status_before_any_cycle() {
		let response = router(orchestrator().await)
			.oneshot(Request::get("/sync/status").body(Body::empty()).unwrap())
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let status = serde_json::from_slice::<Value>(&body).unwrap();

		assert_eq!(status["running"], Value::Bool(false));
		assert_eq!(status["last_cycle"], Value::Null);
		assert!(status["types"].is_array());
		assert!(status["recent_history"].as_array().unwrap().is_empty());
	}
}
