//! HTTP status API.
//!
//! Provides endpoints for:
//! - Liveness
//! - Progress of the running build and the outcome of the last one
//! - Prometheus metrics, when the recorder is installed in-process

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use wind_common::BuildTime;

use crate::progress::{BuildProgress, ProgressSnapshot};

// ============================================================================
// Status Board
// ============================================================================

struct RunningBuild {
    build_time: BuildTime,
    deadline: DateTime<Utc>,
    started_at: DateTime<Utc>,
    progress: Arc<BuildProgress>,
}

/// How the last build ended.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub build_time: String,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// What the status API reports. Updated by whoever runs builds.
#[derive(Default)]
pub struct StatusBoard {
    running: RwLock<Option<RunningBuild>>,
    last_outcome: RwLock<Option<BuildOutcome>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn build_started(
        &self,
        build_time: BuildTime,
        deadline: DateTime<Utc>,
        progress: Arc<BuildProgress>,
    ) {
        *self.running.write().await = Some(RunningBuild {
            build_time,
            deadline,
            started_at: Utc::now(),
            progress,
        });
    }

    pub async fn build_finished(&self, build_time: BuildTime, error: Option<String>) {
        *self.running.write().await = None;
        *self.last_outcome.write().await = Some(BuildOutcome {
            build_time: build_time.to_string(),
            finished_at: Utc::now(),
            succeeded: error.is_none(),
            error,
        });
    }

    pub async fn last_outcome(&self) -> Option<BuildOutcome> {
        self.last_outcome.read().await.clone()
    }

    pub async fn status(&self) -> StatusResponse {
        let current = self.running.read().await.as_ref().map(|build| CurrentBuild {
            build_time: build.build_time.to_string(),
            deadline: build.deadline.to_rfc3339(),
            started_at: build.started_at.to_rfc3339(),
            progress: build.progress.snapshot(),
        });
        StatusResponse {
            service: "downloader".to_string(),
            status: if current.is_some() { "downloading" } else { "idle" }.to_string(),
            current,
            last_outcome: self.last_outcome().await,
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub status: String,
    pub current: Option<CurrentBuild>,
    pub last_outcome: Option<BuildOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentBuild {
    pub build_time: String,
    pub deadline: String,
    pub started_at: String,
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
}

// ============================================================================
// Shared State
// ============================================================================

pub struct ServerState {
    pub board: Arc<StatusBoard>,
    /// Set when metrics are rendered by this server rather than by a
    /// dedicated exporter listener.
    pub metrics: Option<PrometheusHandle>,
}

// ============================================================================
// Router
// ============================================================================

/// Create the status API router.
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(Extension(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /status - Running build progress and last outcome
async fn status_handler(Extension(state): Extension<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.board.status().await)
}

/// GET /metrics - Prometheus text format
async fn metrics_handler(Extension(state): Extension<Arc<ServerState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "metrics are served by the exporter listener",
        )
            .into_response(),
    }
}

/// GET /health - Health check
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "downloader"
    }))
}

/// Run the status HTTP server.
pub async fn run_server(state: Arc<ServerState>, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    info!(port = port, "Starting download status server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve(state: Arc<ServerState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        format!("http://{}", address)
    }

    async fn get_json(url: &str) -> serde_json::Value {
        let body = reqwest::get(url).await.unwrap().text().await.unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_running_build() {
        let board = Arc::new(StatusBoard::new());
        let build_time = BuildTime::parse("2014060312").unwrap();
        let progress = Arc::new(BuildProgress::new(4));
        progress.file_complete();
        board
            .build_started(build_time, Utc::now(), progress.clone())
            .await;

        let base = serve(Arc::new(ServerState {
            board: board.clone(),
            metrics: None,
        }))
        .await;

        let status = get_json(&format!("{}/status", base)).await;
        assert_eq!(status["status"], "downloading");
        assert_eq!(status["current"]["build_time"], "2014060312");
        assert_eq!(status["current"]["files_complete"], 1);
        assert_eq!(status["current"]["percent"], 25.0);
        assert!(status["last_outcome"].is_null());

        board
            .build_finished(build_time, Some("deadline".to_string()))
            .await;
        let status = get_json(&format!("{}/status", base)).await;
        assert_eq!(status["status"], "idle");
        assert_eq!(status["last_outcome"]["succeeded"], false);
        assert_eq!(status["last_outcome"]["error"], "deadline");
    }

    #[tokio::test]
    async fn test_health_and_metrics_without_recorder() {
        let base = serve(Arc::new(ServerState {
            board: Arc::new(StatusBoard::new()),
            metrics: None,
        }))
        .await;

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let metrics = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert_eq!(metrics.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
